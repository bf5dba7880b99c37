//! Host filesystem helpers: DOS attribute mapping, write-permission
//! toggling and the free-space query.

use std::ffi::CString;
use std::fs::Metadata;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Read-only attribute bit.
pub const ATTR_READONLY: u8 = 0x01;
/// Volume label attribute bit.
pub const ATTR_VOLUME: u8 = 0x08;
/// Directory attribute bit.
pub const ATTR_DIRECTORY: u8 = 0x10;
/// Regular file attribute bit.
pub const ATTR_REGULAR: u8 = 0x20;

/// DOS attribute byte for a host file.
pub fn attr_of(md: &Metadata) -> u8 {
    let mut atr = if md.is_dir() {
        ATTR_DIRECTORY
    } else {
        ATTR_REGULAR
    };
    if md.permissions().readonly() {
        atr |= ATTR_READONLY;
    }
    atr
}

/// Apply the read-only bit to the host write permission bits.
pub fn apply_readonly(path: &Path, read_only: bool) -> io::Result<()> {
    let md = std::fs::metadata(path)?;
    let mut mode = md.permissions().mode();
    if read_only {
        mode &= !0o222;
    } else {
        mode |= 0o200;
    }
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

/// Total and free bytes of the filesystem holding `path`.
pub fn disk_space(path: &Path) -> io::Result<(u64, u64)> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(cpath.as_ptr(), &mut st) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let frsize = st.f_frsize as u64;
    Ok((st.f_blocks as u64 * frsize, st.f_bfree as u64 * frsize))
}
