//! Guest path and directory-entry records.
//!
//! `Namebuf` is the guest's structured path block as it crosses the wire
//! (88 bytes):
//! - Byte 0: flag
//! - Byte 1: drive number (0 = A:)
//! - Bytes 2-66: path, components separated by 0x09, zero-terminated
//! - Bytes 67-74: main name part 1 (8 bytes, space-padded)
//! - Bytes 75-77: extension (3 bytes, space-padded)
//! - Bytes 78-87: main name part 2 (10 bytes, zero-padded)
//!
//! `FilesInfo` is the 32-byte guest-facing directory entry returned by the
//! enumeration commands.

use crate::error::{RemoteError, RemoteResult};

/// Size of a packed `Namebuf` on the wire.
pub const NAMEBUF_SIZE: usize = 88;

/// Size of a packed `FilesInfo` on the wire.
pub const FILESINFO_SIZE: usize = 32;

/// Guest path block: drive, 0x09-separated path, split 8.3 name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namebuf {
    pub flag: u8,
    pub drive: u8,
    pub path: [u8; 65],
    pub name1: [u8; 8],
    pub ext: [u8; 3],
    pub name2: [u8; 10],
}

impl Default for Namebuf {
    fn default() -> Self {
        Self {
            flag: 0,
            drive: 0,
            path: [0; 65],
            name1: [0x20; 8],
            ext: [0x20; 3],
            name2: [0; 10],
        }
    }
}

impl Namebuf {
    /// Build a path block from raw components and an 8.3-style name.
    /// `name` fills name1 then name2 (up to 18 bytes), `ext` up to 3.
    /// An empty component list addresses the drive root.
    pub fn with_name(components: &[&[u8]], name: &[u8], ext: &[u8]) -> Self {
        let mut nb = Self::default();
        let mut k = 0;
        if components.is_empty() {
            nb.path[0] = 0x09; // root marker
        } else {
            for comp in components {
                nb.path[k] = 0x09;
                k += 1;
                nb.path[k..k + comp.len()].copy_from_slice(comp);
                k += comp.len();
            }
        }
        for (i, &b) in name.iter().take(8).enumerate() {
            nb.name1[i] = b;
        }
        if name.len() > 8 {
            for (i, &b) in name[8..].iter().take(10).enumerate() {
                nb.name2[i] = b;
            }
        }
        for (i, &b) in ext.iter().take(3).enumerate() {
            nb.ext[i] = b;
        }
        nb
    }

    /// Path block addressing a directory (no file name part).
    pub fn with_dir(components: &[&[u8]]) -> Self {
        Self::with_name(components, b"", b"")
    }

    /// True when the path addresses the drive root (a lone 0x09).
    pub fn is_root(&self) -> bool {
        self.path[0] == 0x09 && self.path[1] == 0x00
    }

    /// Pack into the 88-byte wire layout.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.flag);
        out.push(self.drive);
        out.extend_from_slice(&self.path);
        out.extend_from_slice(&self.name1);
        out.extend_from_slice(&self.ext);
        out.extend_from_slice(&self.name2);
    }

    /// Unpack from the 88-byte wire layout.
    pub fn decode(buf: &[u8]) -> RemoteResult<Self> {
        if buf.len() < NAMEBUF_SIZE {
            return Err(RemoteError::Truncated);
        }
        let mut nb = Self::default();
        nb.flag = buf[0];
        nb.drive = buf[1];
        nb.path.copy_from_slice(&buf[2..67]);
        nb.name1.copy_from_slice(&buf[67..75]);
        nb.ext.copy_from_slice(&buf[75..78]);
        nb.name2.copy_from_slice(&buf[78..88]);
        Ok(nb)
    }

    /// Render the guest view of the path for diagnostics: drive letter,
    /// backslash separators, 8.3 name.
    pub fn display(&self) -> String {
        let mut s = String::new();
        s.push((b'A' + self.drive) as char);
        s.push(':');
        for &b in self.path.iter() {
            if b == 0 {
                break;
            }
            s.push(if b == 0x09 { '\\' } else { b as char });
        }
        let name: Vec<u8> = self
            .name1
            .iter()
            .chain(self.name2.iter())
            .copied()
            .take_while(|&b| b != 0 && b != 0x20)
            .collect();
        s.push_str(&String::from_utf8_lossy(&name));
        let ext: Vec<u8> = self
            .ext
            .iter()
            .copied()
            .take_while(|&b| b != 0 && b != 0x20)
            .collect();
        if !ext.is_empty() {
            s.push('.');
            s.push_str(&String::from_utf8_lossy(&ext));
        }
        s
    }
}

/// Guest-facing directory entry: attribute, packed time/date, length, name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesInfo {
    pub atr: u8,
    pub time: u16,
    pub date: u16,
    pub filelen: u32,
    pub name: [u8; 23],
}

impl Default for FilesInfo {
    fn default() -> Self {
        Self {
            atr: 0,
            time: 0,
            date: 0,
            filelen: 0,
            name: [0; 23],
        }
    }
}

impl FilesInfo {
    /// Name bytes up to the terminating zero.
    pub fn name_bytes(&self) -> &[u8] {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(23);
        &self.name[..end]
    }

    /// Store a guest-encoded name, truncated to 22 bytes plus terminator.
    pub fn set_name(&mut self, name: &[u8]) {
        self.name = [0; 23];
        let n = name.len().min(22);
        self.name[..n].copy_from_slice(&name[..n]);
    }

    /// Pack into the 32-byte wire layout (big-endian fields).
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.atr);
        out.extend_from_slice(&self.time.to_be_bytes());
        out.extend_from_slice(&self.date.to_be_bytes());
        out.extend_from_slice(&self.filelen.to_be_bytes());
        out.extend_from_slice(&self.name);
    }

    /// Unpack from the 32-byte wire layout.
    pub fn decode(buf: &[u8]) -> RemoteResult<Self> {
        if buf.len() < FILESINFO_SIZE {
            return Err(RemoteError::Truncated);
        }
        let mut fi = Self {
            atr: buf[0],
            time: u16::from_be_bytes([buf[1], buf[2]]),
            date: u16::from_be_bytes([buf[3], buf[4]]),
            filelen: u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]),
            name: [0; 23],
        };
        fi.name.copy_from_slice(&buf[9..32]);
        Ok(fi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namebuf_round_trip() {
        let nb = Namebuf::with_name(&[b"SUB", b"DIR2"], b"HELLO", b"TXT");
        let mut buf = Vec::new();
        nb.encode(&mut buf);
        assert_eq!(buf.len(), NAMEBUF_SIZE);
        assert_eq!(Namebuf::decode(&buf).unwrap(), nb);
    }

    #[test]
    fn test_namebuf_root() {
        let root = Namebuf::with_dir(&[]);
        assert!(root.is_root());

        let sub = Namebuf::with_dir(&[b"SUB"]);
        assert!(!sub.is_root());
    }

    #[test]
    fn test_namebuf_long_name_spills_into_name2() {
        let nb = Namebuf::with_name(&[], b"LONGFILENAME", b"TXT");
        assert_eq!(&nb.name1, b"LONGFILE");
        assert_eq!(&nb.name2[..4], b"NAME");
        assert_eq!(nb.name2[4], 0);
    }

    #[test]
    fn test_namebuf_display() {
        let nb = Namebuf::with_name(&[b"GAMES"], b"START", b"BAT");
        assert_eq!(nb.display(), "A:\\GAMES\\START.BAT");
    }

    #[test]
    fn test_filesinfo_layout() {
        let mut fi = FilesInfo {
            atr: 0x20,
            time: 0x1234,
            date: 0x5678,
            filelen: 0x0102_0304,
            ..Default::default()
        };
        fi.set_name(b"HELLO.TXT");

        let mut buf = Vec::new();
        fi.encode(&mut buf);
        assert_eq!(buf.len(), FILESINFO_SIZE);
        // Big-endian wire discipline
        assert_eq!(&buf[..9], &[0x20, 0x12, 0x34, 0x56, 0x78, 1, 2, 3, 4]);
        assert_eq!(FilesInfo::decode(&buf).unwrap(), fi);
    }

    #[test]
    fn test_decode_short_buffer() {
        assert!(Namebuf::decode(&[0; 40]).is_err());
        assert!(FilesInfo::decode(&[0; 10]).is_err());
    }
}
