//! Directory enumeration state and wildcard name matching.
//!
//! The guest starts an enumeration with `files` and walks it with
//! `nfiles`, both keyed by the opaque FILBUF address. Matching happens in
//! a flat 21-byte key space: 18 bytes of main name followed by 3 bytes of
//! extension, compared byte-wise with `?` wildcards and ASCII case
//! folding that must not touch the second byte of a two-byte guest
//! character.

use std::collections::HashMap;

use crate::names::is_lead_byte;
use crate::proto::{FilesInfo, Namebuf};

/// Bytes that may not appear anywhere in a guest file name.
const FORBIDDEN: &[u8] = b"/\\,;<=>[]|";

/// Flattened, lower-cased search pattern from a `Namebuf`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchKey {
    key: [u8; 21],
}

impl SearchKey {
    /// Build the key from the split name fields.
    ///
    /// When name1 ends in `?` and name2 starts with a zero byte, name2 is
    /// filled with `?`: the guest's shell expands `*` into eight `?`
    /// without touching the extended name field, and the fill keeps such
    /// patterns matching long names. (`1234567?` and `1234567*` become
    /// indistinguishable, which matches the guest's own behavior.)
    pub fn from_namebuf(ns: &Namebuf) -> Self {
        let mut w = [0u8; 21];
        w[..8].copy_from_slice(&ns.name1);
        if ns.name1[7] == b'?' && ns.name2[0] == 0 {
            w[8..18].fill(b'?');
        } else {
            w[8..18].copy_from_slice(&ns.name2);
        }
        let mut i = 17;
        loop {
            if w[i] != 0 && w[i] != 0x20 {
                break;
            }
            w[i] = 0;
            if i == 0 {
                break;
            }
            i -= 1;
        }
        w[18..21].copy_from_slice(&ns.ext);
        for i in (18..21).rev() {
            if w[i] != 0x20 {
                break;
            }
            w[i] = 0;
        }

        // Lower-case, skipping the byte after a two-byte lead.
        let mut i = 0;
        while i < 21 {
            if is_lead_byte(w[i]) {
                i += 2;
            } else {
                w[i] = w[i].to_ascii_lowercase();
                i += 1;
            }
        }
        Self { key: w }
    }

    /// True for the `*.*` pattern after the fill above.
    pub fn is_all_wildcards(&self) -> bool {
        self.key[0] == b'?' && self.key[18] == b'?'
    }

    /// Match a candidate in the same 21-byte shape.
    ///
    /// `?` matches any byte. Other positions compare after lower-casing
    /// the candidate byte, except when the previous byte was a two-byte
    /// lead: the continuation byte is compared raw.
    pub fn matches(&self, candidate: &[u8; 21]) -> bool {
        let mut fold = 0x20u8;
        for i in 0..21 {
            let c = candidate[i];
            let d = self.key[i];
            let lowered = if c.is_ascii_uppercase() { c | fold } else { c };
            if d != b'?' && lowered != d {
                return false;
            }
            fold = if fold != 0 && is_lead_byte(c) { 0x00 } else { 0x20 };
        }
        true
    }
}

/// Check a guest-encoded candidate name for bytes a guest file name may
/// not contain. Two-byte sequences are skipped whole.
pub fn name_allowed(name: &[u8]) -> bool {
    let mut i = 0;
    while i < name.len() {
        let c = name[i];
        if is_lead_byte(c) {
            i += 2;
            continue;
        }
        if c <= 0x1f || (c == b'-' && i == 0) || FORBIDDEN.contains(&c) {
            return false;
        }
        i += 1;
    }
    true
}

/// Split a guest-encoded name into the 21-byte match shape.
///
/// The extension starts at the last `.` that leaves at most three bytes
/// after it; a trailing `.` belongs to the main name. `None` when the
/// main part exceeds 18 bytes.
pub fn split_dos_name(name: &[u8]) -> Option<[u8; 21]> {
    let k = name.len();
    if k == 0 || k > 22 {
        return None;
    }
    let m = if name[k - 1] == b'.' {
        k
    } else if k >= 3 && name[k - 2] == b'.' {
        k - 2
    } else if k >= 4 && name[k - 3] == b'.' {
        k - 3
    } else if k >= 5 && name[k - 4] == b'.' {
        k - 4
    } else {
        k
    };
    if m > 18 {
        return None;
    }
    let mut w = [0u8; 21];
    w[..m].copy_from_slice(&name[..m]);
    if m < k && name[m] == b'.' {
        let ext = &name[m + 1..];
        let n = ext.len().min(3);
        w[18..18 + n].copy_from_slice(&ext[..n]);
    }
    Some(w)
}

/// One active enumeration: the match snapshot and a cursor into it.
pub struct DirList {
    entries: Vec<FilesInfo>,
    cursor: usize,
}

/// FILBUF-key → active enumeration.
#[derive(Default)]
pub struct DirTable {
    lists: HashMap<u32, DirList>,
}

impl DirTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a fresh match list under `filep`, replacing any prior one.
    pub fn insert(&mut self, filep: u32, entries: Vec<FilesInfo>) {
        self.lists.insert(filep, DirList { entries, cursor: 0 });
    }

    /// Drop the enumeration under `filep`, if any.
    pub fn remove(&mut self, filep: u32) {
        self.lists.remove(&filep);
    }

    /// Take up to `num` entries from the enumeration under `filep`. The
    /// entry is freed the moment the snapshot is drained, so a finished
    /// enumeration leaves no state behind.
    pub fn next_batch(&mut self, filep: u32, num: usize) -> Vec<FilesInfo> {
        let Some(dl) = self.lists.get_mut(&filep) else {
            return Vec::new();
        };
        let end = (dl.cursor + num.max(1)).min(dl.entries.len());
        let batch = dl.entries[dl.cursor..end].to_vec();
        dl.cursor = end;
        if dl.cursor >= dl.entries.len() {
            self.lists.remove(&filep);
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }
}
