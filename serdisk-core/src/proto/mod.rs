//! Wire protocol: command codes, request/response layouts and codecs.
//!
//! The command set is defined once and shared by both endpoints. Every
//! multi-byte integer on the wire is big-endian and the layouts are packed
//! with no padding, so the encoded size of each command is fixed except
//! for the read/write bulk data.

pub mod name;

pub use name::{FilesInfo, Namebuf, FILESINFO_SIZE, NAMEBUF_SIZE};

use crate::error::{DosError, RemoteError, RemoteResult};

/// Command codes.
pub mod cmd {
    pub const CHECK: u8 = 0x40;
    pub const CHDIR: u8 = 0x41;
    pub const MKDIR: u8 = 0x42;
    pub const RMDIR: u8 = 0x43;
    pub const RENAME: u8 = 0x44;
    pub const DELETE: u8 = 0x45;
    pub const CHMOD: u8 = 0x46;
    pub const FILES: u8 = 0x47;
    pub const NFILES: u8 = 0x48;
    pub const CREATE: u8 = 0x49;
    pub const OPEN: u8 = 0x4a;
    pub const CLOSE: u8 = 0x4b;
    pub const READ: u8 = 0x4c;
    pub const WRITE: u8 = 0x4d;
    pub const FILEDATE: u8 = 0x4f;
    pub const DSKFRE: u8 = 0x50;
}

/// Largest read/write data chunk carried in one exchange.
pub const DATA_CHUNK: usize = 1024;

/// Upper bound on a single frame payload. Covers the largest command
/// (write: 11-byte header plus a full data chunk).
pub const PAYLOAD_MAX: usize = 1040;

/// Most directory entries a single files/nfiles response may carry.
pub const FILES_BATCH_MAX: usize = 8;

/// A decoded driver-to-server request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Check,
    Chdir { path: Namebuf },
    Mkdir { path: Namebuf },
    Rmdir { path: Namebuf },
    Rename { old: Namebuf, new: Namebuf },
    Delete { path: Namebuf },
    Chmod { attr: u8, path: Namebuf },
    Files { attr: u8, num: u8, filep: u32, path: Namebuf },
    Nfiles { num: u8, filep: u32 },
    Create { attr: u8, mode: u8, fcb: u32, path: Namebuf },
    Open { mode: u8, fcb: u32, path: Namebuf },
    Close { fcb: u32 },
    Read { fcb: u32, pos: u32, len: u16 },
    /// Empty data means truncate-at-`pos`.
    Write { fcb: u32, pos: u32, data: Vec<u8> },
    Filedate { fcb: u32, time: u16, date: u16 },
    DiskFree,
}

impl Request {
    /// Command code of this request.
    pub fn command(&self) -> u8 {
        use Request::*;
        match self {
            Check => cmd::CHECK,
            Chdir { .. } => cmd::CHDIR,
            Mkdir { .. } => cmd::MKDIR,
            Rmdir { .. } => cmd::RMDIR,
            Rename { .. } => cmd::RENAME,
            Delete { .. } => cmd::DELETE,
            Chmod { .. } => cmd::CHMOD,
            Files { .. } => cmd::FILES,
            Nfiles { .. } => cmd::NFILES,
            Create { .. } => cmd::CREATE,
            Open { .. } => cmd::OPEN,
            Close { .. } => cmd::CLOSE,
            Read { .. } => cmd::READ,
            Write { .. } => cmd::WRITE,
            Filedate { .. } => cmd::FILEDATE,
            DiskFree => cmd::DSKFRE,
        }
    }

    /// Encode into a frame payload.
    pub fn encode(&self, out: &mut Vec<u8>) {
        use Request::*;
        out.clear();
        out.push(self.command());
        match self {
            Check | DiskFree => {}
            Chdir { path } | Mkdir { path } | Rmdir { path } | Delete { path } => {
                path.encode(out);
            }
            Rename { old, new } => {
                old.encode(out);
                new.encode(out);
            }
            Chmod { attr, path } => {
                out.push(*attr);
                path.encode(out);
            }
            Files { attr, num, filep, path } => {
                out.push(*attr);
                out.push(*num);
                out.extend_from_slice(&filep.to_be_bytes());
                path.encode(out);
            }
            Nfiles { num, filep } => {
                out.push(*num);
                out.extend_from_slice(&filep.to_be_bytes());
            }
            Create { attr, mode, fcb, path } => {
                out.push(*attr);
                out.push(*mode);
                out.extend_from_slice(&fcb.to_be_bytes());
                path.encode(out);
            }
            Open { mode, fcb, path } => {
                out.push(*mode);
                out.extend_from_slice(&fcb.to_be_bytes());
                path.encode(out);
            }
            Close { fcb } => {
                out.extend_from_slice(&fcb.to_be_bytes());
            }
            Read { fcb, pos, len } => {
                out.extend_from_slice(&fcb.to_be_bytes());
                out.extend_from_slice(&pos.to_be_bytes());
                out.extend_from_slice(&len.to_be_bytes());
            }
            Write { fcb, pos, data } => {
                out.extend_from_slice(&fcb.to_be_bytes());
                out.extend_from_slice(&pos.to_be_bytes());
                out.extend_from_slice(&(data.len() as u16).to_be_bytes());
                out.extend_from_slice(data);
            }
            Filedate { fcb, time, date } => {
                out.extend_from_slice(&fcb.to_be_bytes());
                out.extend_from_slice(&time.to_be_bytes());
                out.extend_from_slice(&date.to_be_bytes());
            }
        }
    }

    /// Decode a frame payload. The first byte selects the command.
    pub fn decode(payload: &[u8]) -> RemoteResult<Request> {
        let mut r = Reader::new(payload);
        let code = r.u8()?;
        let req = match code {
            cmd::CHECK => Request::Check,
            cmd::CHDIR => Request::Chdir { path: r.namebuf()? },
            cmd::MKDIR => Request::Mkdir { path: r.namebuf()? },
            cmd::RMDIR => Request::Rmdir { path: r.namebuf()? },
            cmd::RENAME => Request::Rename {
                old: r.namebuf()?,
                new: r.namebuf()?,
            },
            cmd::DELETE => Request::Delete { path: r.namebuf()? },
            cmd::CHMOD => Request::Chmod {
                attr: r.u8()?,
                path: r.namebuf()?,
            },
            cmd::FILES => Request::Files {
                attr: r.u8()?,
                num: r.u8()?,
                filep: r.u32()?,
                path: r.namebuf()?,
            },
            cmd::NFILES => Request::Nfiles {
                num: r.u8()?,
                filep: r.u32()?,
            },
            cmd::CREATE => Request::Create {
                attr: r.u8()?,
                mode: r.u8()?,
                fcb: r.u32()?,
                path: r.namebuf()?,
            },
            cmd::OPEN => Request::Open {
                mode: r.u8()?,
                fcb: r.u32()?,
                path: r.namebuf()?,
            },
            cmd::CLOSE => Request::Close { fcb: r.u32()? },
            cmd::READ => Request::Read {
                fcb: r.u32()?,
                pos: r.u32()?,
                len: r.u16()?,
            },
            cmd::WRITE => {
                let fcb = r.u32()?;
                let pos = r.u32()?;
                let len = r.u16()? as usize;
                Request::Write {
                    fcb,
                    pos,
                    data: r.bytes(len)?.to_vec(),
                }
            }
            cmd::FILEDATE => Request::Filedate {
                fcb: r.u32()?,
                time: r.u16()?,
                date: r.u16()?,
            },
            cmd::DSKFRE => Request::DiskFree,
            other => return Err(RemoteError::UnknownCommand(other)),
        };
        Ok(req)
    }
}

/// Single result-byte response (check, dirops, chmod, create, close).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultResponse {
    pub res: i8,
}

impl ResultResponse {
    pub fn ok() -> Self {
        Self { res: 0 }
    }

    pub fn err(e: DosError) -> Self {
        Self { res: e.code() }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.clear();
        out.push(self.res as u8);
    }

    pub fn decode(payload: &[u8]) -> RemoteResult<Self> {
        let mut r = Reader::new(payload);
        Ok(Self { res: r.u8()? as i8 })
    }

    /// Interpret a negative result byte as an error.
    pub fn check(&self) -> RemoteResult<i8> {
        if self.res < 0 {
            Err(dos_from_code(self.res))
        } else {
            Ok(self.res)
        }
    }
}

/// files/nfiles response: result byte plus a batch of directory entries.
#[derive(Debug, Clone, PartialEq)]
pub struct FilesResponse {
    pub res: i8,
    pub entries: Vec<FilesInfo>,
}

impl FilesResponse {
    pub fn err(e: DosError) -> Self {
        Self {
            res: e.code(),
            entries: Vec::new(),
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.clear();
        out.push(self.res as u8);
        out.push(self.entries.len() as u8);
        for e in &self.entries {
            e.encode(out);
        }
    }

    pub fn decode(payload: &[u8]) -> RemoteResult<Self> {
        let mut r = Reader::new(payload);
        let res = r.u8()? as i8;
        let num = r.u8()? as usize;
        if num > FILES_BATCH_MAX {
            return Err(RemoteError::Truncated);
        }
        let mut entries = Vec::with_capacity(num);
        for _ in 0..num {
            entries.push(FilesInfo::decode(r.bytes(FILESINFO_SIZE)?)?);
        }
        Ok(Self { res, entries })
    }
}

/// open response: result byte plus file size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenResponse {
    pub res: i8,
    pub size: u32,
}

impl OpenResponse {
    pub fn err(e: DosError) -> Self {
        Self {
            res: e.code(),
            size: 0,
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.clear();
        out.push(self.res as u8);
        out.extend_from_slice(&self.size.to_be_bytes());
    }

    pub fn decode(payload: &[u8]) -> RemoteResult<Self> {
        let mut r = Reader::new(payload);
        Ok(Self {
            res: r.u8()? as i8,
            size: r.u32()?,
        })
    }
}

/// read response: signed length (negative = error, 0 = end of file)
/// followed by that many data bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadResponse {
    pub result: i16,
    pub data: Vec<u8>,
}

impl ReadResponse {
    pub fn err(e: DosError) -> Self {
        Self {
            result: e.code() as i16,
            data: Vec::new(),
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.clear();
        out.extend_from_slice(&self.result.to_be_bytes());
        out.extend_from_slice(&self.data);
    }

    pub fn decode(payload: &[u8]) -> RemoteResult<Self> {
        let mut r = Reader::new(payload);
        let result = r.u16()? as i16;
        let data = if result > 0 {
            r.bytes(result as usize)?.to_vec()
        } else {
            Vec::new()
        };
        Ok(Self { result, data })
    }
}

/// write response: signed byte count (negative = error).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResponse {
    pub result: i16,
}

impl WriteResponse {
    pub fn err(e: DosError) -> Self {
        Self {
            result: e.code() as i16,
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.clear();
        out.extend_from_slice(&self.result.to_be_bytes());
    }

    pub fn decode(payload: &[u8]) -> RemoteResult<Self> {
        let mut r = Reader::new(payload);
        Ok(Self {
            result: r.u16()? as i16,
        })
    }
}

/// filedate response. A `date` of 0xFFFF marks an error, with the code in
/// `time`; on a successful set both fields are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiledateResponse {
    pub time: u16,
    pub date: u16,
}

impl FiledateResponse {
    pub fn err(e: DosError) -> Self {
        Self {
            time: e.code() as i16 as u16,
            date: 0xffff,
        }
    }

    pub fn is_err(&self) -> bool {
        self.date == 0xffff
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.clear();
        out.extend_from_slice(&self.time.to_be_bytes());
        out.extend_from_slice(&self.date.to_be_bytes());
    }

    pub fn decode(payload: &[u8]) -> RemoteResult<Self> {
        let mut r = Reader::new(payload);
        Ok(Self {
            time: r.u16()?,
            date: r.u16()?,
        })
    }
}

/// dskfre response: free bytes plus the synthetic geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskFreeResponse {
    pub res: i32,
    pub free_clusters: u16,
    pub total_clusters: u16,
    pub sectors_per_cluster: u16,
    pub sector_size: u16,
}

impl DiskFreeResponse {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.clear();
        out.extend_from_slice(&self.res.to_be_bytes());
        out.extend_from_slice(&self.free_clusters.to_be_bytes());
        out.extend_from_slice(&self.total_clusters.to_be_bytes());
        out.extend_from_slice(&self.sectors_per_cluster.to_be_bytes());
        out.extend_from_slice(&self.sector_size.to_be_bytes());
    }

    pub fn decode(payload: &[u8]) -> RemoteResult<Self> {
        let mut r = Reader::new(payload);
        Ok(Self {
            res: r.u32()? as i32,
            free_clusters: r.u16()?,
            total_clusters: r.u16()?,
            sectors_per_cluster: r.u16()?,
            sector_size: r.u16()?,
        })
    }
}

fn dos_from_code(code: i8) -> RemoteError {
    match DosError::from_code(code) {
        Some(e) => RemoteError::Dos(e),
        None => RemoteError::Dos(DosError::BadParameter),
    }
}

/// Interpret a signed 16-bit read/write result as byte count or error.
pub fn check_len(result: i16) -> RemoteResult<usize> {
    if result < 0 {
        Err(dos_from_code(result as i8))
    } else {
        Ok(result as usize)
    }
}

/// Sequential payload reader with underrun checking.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> RemoteResult<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(RemoteError::Truncated);
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> RemoteResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> RemoteResult<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> RemoteResult<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn namebuf(&mut self) -> RemoteResult<Namebuf> {
        Namebuf::decode(self.bytes(NAMEBUF_SIZE)?)
    }
}
