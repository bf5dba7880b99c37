//! Error types for the remote drive.
//!
//! Two layers: `DosError` is the guest-facing error code set carried on
//! the wire as negative result bytes, `RemoteError` is the host-side
//! error enum for everything that can go wrong in the core.

use std::fmt;
use std::io;

use thiserror::Error;

/// Guest-facing error codes, carried on the wire as negative values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum DosError {
    /// File not found
    FileNotFound = -2,
    /// Directory not found
    DirNotFound = -3,
    /// Too many open files
    TooManyHandles = -4,
    /// Tried to access a directory or volume label as a file
    NotAFile = -5,
    /// Handle is not opened
    BadHandle = -6,
    /// Out of memory
    NoMemory = -8,
    /// Invalid memory pointer
    BadPointer = -9,
    /// Executable format error
    BadFormat = -11,
    /// Invalid open access mode
    BadAccessMode = -12,
    /// Malformed filename
    BadFileName = -13,
    /// Invalid parameter
    BadParameter = -14,
    /// Invalid drive
    BadDrive = -15,
    /// Tried to remove the current directory
    CurrentDir = -16,
    /// Device does not support ioctl
    CantIoctl = -17,
    /// No more matching files
    NoMoreFiles = -18,
    /// Write to a read-only file
    ReadOnly = -19,
    /// Directory already exists
    DirExists = -20,
    /// Directory is not empty
    DirNotEmpty = -21,
    /// Cannot rename over a non-empty directory
    CantRename = -22,
    /// Disk full
    DiskFull = -23,
    /// Directory full
    DirFull = -24,
    /// Seek past end of file
    SeekOverEof = -25,
    /// File already exists
    FileExists = -80,
}

impl DosError {
    /// Wire representation.
    pub fn code(self) -> i8 {
        self as i8
    }

    /// Decode a negative wire byte back into an error.
    pub fn from_code(code: i8) -> Option<Self> {
        use DosError::*;
        Some(match code {
            -2 => FileNotFound,
            -3 => DirNotFound,
            -4 => TooManyHandles,
            -5 => NotAFile,
            -6 => BadHandle,
            -8 => NoMemory,
            -9 => BadPointer,
            -11 => BadFormat,
            -12 => BadAccessMode,
            -13 => BadFileName,
            -14 => BadParameter,
            -15 => BadDrive,
            -16 => CurrentDir,
            -17 => CantIoctl,
            -18 => NoMoreFiles,
            -19 => ReadOnly,
            -20 => DirExists,
            -21 => DirNotEmpty,
            -22 => CantRename,
            -23 => DiskFull,
            -24 => DirFull,
            -25 => SeekOverEof,
            -80 => FileExists,
            _ => return None,
        })
    }

    /// Default host-errno translation. Per-operation overrides are applied
    /// at the call site before falling back to this table.
    pub fn from_io(err: &io::Error) -> Self {
        use DosError::*;
        match err.raw_os_error() {
            Some(libc::ENOENT) => FileNotFound,
            Some(libc::ENOTDIR) => DirNotFound,
            Some(libc::EMFILE) => TooManyHandles,
            Some(libc::EISDIR) => NotAFile,
            Some(libc::EBADF) => BadHandle,
            Some(libc::ENOMEM) => NoMemory,
            Some(libc::EFAULT) => BadPointer,
            Some(libc::ENOEXEC) => BadFormat,
            Some(libc::ENAMETOOLONG) => BadFileName,
            Some(libc::EINVAL) => BadParameter,
            Some(libc::EXDEV) => BadDrive,
            Some(libc::EACCES) | Some(libc::EPERM) | Some(libc::EROFS) => ReadOnly,
            Some(libc::ENOTEMPTY) => DirNotEmpty,
            Some(libc::ENOSPC) => DiskFull,
            Some(libc::EOVERFLOW) => SeekOverEof,
            Some(libc::EEXIST) => FileExists,
            _ => BadParameter,
        }
    }
}

impl fmt::Display for DosError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

/// Errors produced by the transport, codecs, driver and server.
#[derive(Error, Debug)]
pub enum RemoteError {
    /// Frame preamble was not a `Z` run terminated by `X`.
    #[error("lost frame sync")]
    LostSync,

    /// Frame length field exceeds the receive buffer.
    #[error("frame payload of {0} bytes exceeds buffer")]
    FrameTooLarge(usize),

    /// Payload ended before the command layout was complete.
    #[error("truncated packet")]
    Truncated,

    /// Command byte outside the known set.
    #[error("unknown command 0x{0:02x}")]
    UnknownCommand(u8),

    /// No response within the configured window.
    #[error("response timed out")]
    Timeout,

    /// The peer answered with a guest error code.
    #[error("remote error: {0}")]
    Dos(DosError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<DosError> for RemoteError {
    fn from(e: DosError) -> Self {
        RemoteError::Dos(e)
    }
}

impl RemoteError {
    /// Error word for the guest request header when the exchange itself
    /// failed (timeout or unrecoverable framing); `None` for errors that
    /// are reported in-band as a status value.
    pub fn guest_error_word(&self) -> Option<u16> {
        match self {
            RemoteError::Timeout
            | RemoteError::LostSync
            | RemoteError::FrameTooLarge(_)
            | RemoteError::Truncated => Some(0x1002),
            _ => None,
        }
    }
}

/// Result type for remote drive operations.
pub type RemoteResult<T> = Result<T, RemoteError>;
