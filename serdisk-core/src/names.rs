//! Guest path translation and text re-encoding.
//!
//! Guest names travel as CP932 bytes. Path components inside a `Namebuf`
//! are separated by 0x09 runs and zero-terminated; the split 8.3 name is
//! appended for the "full" form. The assembled guest path is re-encoded
//! to UTF-8 and prefixed with the served root directory.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use encoding_rs::SHIFT_JIS;

use crate::error::DosError;
use crate::proto::Namebuf;

/// First byte of a two-byte CP932 sequence.
pub fn is_lead_byte(b: u8) -> bool {
    (0x81..=0x9f).contains(&b) || (0xe0..=0xef).contains(&b)
}

/// Assemble the guest-encoded host-relative path from a `Namebuf`.
///
/// Replaces 0x09 runs with single `/` separators. With `full`, appends
/// `/` + main name (name1+name2, trailing zeros then trailing blanks
/// stripped) + `.` + extension (trailing blanks stripped), and drops a
/// trailing `.` left by an empty extension.
pub fn guest_path_bytes(ns: &Namebuf, full: bool) -> Vec<u8> {
    let mut bb = Vec::with_capacity(88);

    let mut i = 0;
    while i < 65 {
        while i < 65 && ns.path[i] == 0x09 {
            i += 1;
        }
        if i >= 65 || ns.path[i] == 0x00 {
            break;
        }
        bb.push(b'/');
        while i < 65 && ns.path[i] != 0x00 && ns.path[i] != 0x09 {
            bb.push(ns.path[i]);
            i += 1;
        }
    }

    if full {
        bb.push(b'/');
        bb.extend_from_slice(&ns.name1);
        bb.extend_from_slice(&ns.name2);
        while bb.last() == Some(&0x00) {
            bb.pop();
        }
        while bb.last() == Some(&0x20) {
            bb.pop();
        }
        bb.push(b'.');
        bb.extend_from_slice(&ns.ext);
        while bb.last() == Some(&0x20) {
            bb.pop();
        }
        while bb.last() == Some(&b'.') {
            bb.pop();
        }
    }

    bb
}

/// Translate a `Namebuf` into a host path under `root`.
///
/// Any byte sequence the guest encoding cannot represent in UTF-8 fails
/// with `DirNotFound`, which is what the guest expects for unreachable
/// paths.
pub fn host_path(root: &Path, ns: &Namebuf, full: bool) -> Result<PathBuf, DosError> {
    let bb = guest_path_bytes(ns, full);
    let rel = guest_to_host(&bb).ok_or(DosError::DirNotFound)?;
    let mut os = OsString::from(root.as_os_str());
    os.push(&rel);
    Ok(PathBuf::from(os))
}

/// CP932 bytes to host text. `None` when the sequence is malformed.
pub fn guest_to_host(bytes: &[u8]) -> Option<String> {
    let (text, had_errors) = SHIFT_JIS.decode_without_bom_handling(bytes);
    if had_errors {
        None
    } else {
        Some(text.into_owned())
    }
}

/// Host text to CP932 bytes. `None` when a character has no mapping.
pub fn host_to_guest(text: &str) -> Option<Vec<u8>> {
    let (bytes, _, had_errors) = SHIFT_JIS.encode(text);
    if had_errors {
        None
    } else {
        Some(bytes.into_owned())
    }
}
