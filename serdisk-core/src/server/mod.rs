//! Server core: executes guest commands against the served root.
//!
//! One `Server` owns the session tables and a root directory. The serve
//! loop is strictly sequential: receive one request frame, execute it,
//! send one response frame. Malformed frames are dropped without a
//! response; the driver's timeout and sync flood bring both ends back in
//! step.

mod dirlist;
mod fdtable;

pub use dirlist::{name_allowed, split_dos_name, DirTable, SearchKey};
pub use fdtable::{FdTable, OpenFile};

use std::fs::{FileTimes, Metadata, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::dostime;
use crate::error::{DosError, RemoteError};
use crate::hostfs;
use crate::names::{host_path, host_to_guest};
use crate::proto::{
    DiskFreeResponse, FiledateResponse, FilesInfo, FilesResponse, Namebuf, OpenResponse,
    ReadResponse, Request, ResultResponse, WriteResponse, DATA_CHUNK, FILES_BATCH_MAX,
    PAYLOAD_MAX,
};
use crate::transport::{recv_frame, send_frame, SerialLink};

macro_rules! dprint {
    ($srv:expr, $lvl:expr, $($arg:tt)*) => {
        if $srv.debug >= $lvl {
            eprintln!($($arg)*);
        }
    };
}

/// Remote drive server: session tables plus the served root directory.
pub struct Server {
    root: PathBuf,
    files: FdTable,
    dirs: DirTable,
    /// Diagnostic verbosity (0 = quiet).
    pub debug: u8,
}

impl Server {
    /// Serve `root` to the guest.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            files: FdTable::new(),
            dirs: DirTable::new(),
            debug: 0,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of live open-file entries.
    pub fn open_file_count(&self) -> usize {
        self.files.len()
    }

    /// Number of active directory enumerations.
    pub fn enumeration_count(&self) -> usize {
        self.dirs.len()
    }

    /// Run the request loop until the link fails.
    ///
    /// Sync loss and oversize frames drop the partial frame and resume
    /// scanning; a read timeout just keeps waiting for the next request.
    pub fn serve<L: SerialLink + ?Sized>(&mut self, link: &mut L) -> io::Result<()> {
        let mut buf = vec![0u8; PAYLOAD_MAX];
        let mut out = Vec::with_capacity(PAYLOAD_MAX);
        loop {
            let n = match recv_frame(link, &mut buf) {
                Ok(n) => n,
                Err(RemoteError::LostSync) => {
                    dprint!(self, 2, "sync lost, rescanning");
                    continue;
                }
                Err(RemoteError::FrameTooLarge(len)) => {
                    dprint!(self, 2, "oversize frame ({} bytes) dropped", len);
                    continue;
                }
                Err(RemoteError::Io(e)) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(RemoteError::Io(e)) => return Err(e),
                Err(_) => continue,
            };
            if self.debug >= 3 {
                hex_dump("recv", &buf[..n]);
            }
            if self.handle(&buf[..n], &mut out) {
                if self.debug >= 3 {
                    hex_dump("send", &out);
                }
                send_frame(link, &out)?;
            }
        }
    }

    /// Execute one request payload. Returns false when no response is to
    /// be sent (unknown or malformed command).
    pub fn handle(&mut self, payload: &[u8], out: &mut Vec<u8>) -> bool {
        let req = match Request::decode(payload) {
            Ok(req) => req,
            Err(RemoteError::UnknownCommand(code)) => {
                dprint!(self, 1, "unknown command 0x{:02x}", code);
                return false;
            }
            Err(e) => {
                dprint!(self, 1, "bad request dropped: {}", e);
                return false;
            }
        };

        match req {
            Request::Check => self.op_check().encode(out),
            Request::Chdir { path } => self.op_chdir(&path).encode(out),
            Request::Mkdir { path } => self.op_mkdir(&path).encode(out),
            Request::Rmdir { path } => self.op_rmdir(&path).encode(out),
            Request::Rename { old, new } => self.op_rename(&old, &new).encode(out),
            Request::Delete { path } => self.op_delete(&path).encode(out),
            Request::Chmod { attr, path } => self.op_chmod(attr, &path).encode(out),
            Request::Files { attr, num, filep, path } => {
                self.op_files(attr, num, filep, &path).encode(out)
            }
            Request::Nfiles { num, filep } => self.op_nfiles(num, filep).encode(out),
            Request::Create { attr, mode, fcb, path } => {
                self.op_create(attr, mode, fcb, &path).encode(out)
            }
            Request::Open { mode, fcb, path } => self.op_open(mode, fcb, &path).encode(out),
            Request::Close { fcb } => self.op_close(fcb).encode(out),
            Request::Read { fcb, pos, len } => self.op_read(fcb, pos, len).encode(out),
            Request::Write { fcb, pos, data } => self.op_write(fcb, pos, &data).encode(out),
            Request::Filedate { fcb, time, date } => {
                self.op_filedate(fcb, time, date).encode(out)
            }
            Request::DiskFree => self.op_disk_free().encode(out),
        }
        true
    }

    fn op_check(&mut self) -> ResultResponse {
        dprint!(self, 1, "CHECK:");
        ResultResponse::ok()
    }

    fn op_chdir(&mut self, path: &Namebuf) -> ResultResponse {
        let res = match host_path(&self.root, path, false) {
            Ok(p) => match std::fs::metadata(&p) {
                Ok(md) if md.is_dir() => ResultResponse::ok(),
                _ => ResultResponse::err(DosError::DirNotFound),
            },
            Err(e) => ResultResponse::err(e),
        };
        dprint!(self, 1, "CHDIR: {} -> {}", path.display(), res.res);
        res
    }

    fn op_mkdir(&mut self, path: &Namebuf) -> ResultResponse {
        let res = match host_path(&self.root, path, true) {
            Ok(p) => match std::fs::create_dir(&p) {
                Ok(()) => ResultResponse::ok(),
                Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                    ResultResponse::err(DosError::DirExists)
                }
                Err(e) => ResultResponse::err(DosError::from_io(&e)),
            },
            Err(e) => ResultResponse::err(e),
        };
        dprint!(self, 1, "MKDIR: {} -> {}", path.display(), res.res);
        res
    }

    fn op_rmdir(&mut self, path: &Namebuf) -> ResultResponse {
        let res = match host_path(&self.root, path, true) {
            Ok(p) => match std::fs::remove_dir(&p) {
                Ok(()) => ResultResponse::ok(),
                Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                    ResultResponse::err(DosError::CurrentDir)
                }
                Err(e) => ResultResponse::err(DosError::from_io(&e)),
            },
            Err(e) => ResultResponse::err(e),
        };
        dprint!(self, 1, "RMDIR: {} -> {}", path.display(), res.res);
        res
    }

    fn op_rename(&mut self, old: &Namebuf, new: &Namebuf) -> ResultResponse {
        let res = match (
            host_path(&self.root, old, true),
            host_path(&self.root, new, true),
        ) {
            (Ok(from), Ok(to)) => match std::fs::rename(&from, &to) {
                Ok(()) => ResultResponse::ok(),
                Err(e) if e.raw_os_error() == Some(libc::ENOTEMPTY) => {
                    ResultResponse::err(DosError::CantRename)
                }
                Err(e) => ResultResponse::err(DosError::from_io(&e)),
            },
            (Err(e), _) | (_, Err(e)) => ResultResponse::err(e),
        };
        dprint!(
            self,
            1,
            "RENAME: {} to {} -> {}",
            old.display(),
            new.display(),
            res.res
        );
        res
    }

    fn op_delete(&mut self, path: &Namebuf) -> ResultResponse {
        let res = match host_path(&self.root, path, true) {
            Ok(p) => match std::fs::remove_file(&p) {
                Ok(()) => ResultResponse::ok(),
                Err(e) => ResultResponse::err(DosError::from_io(&e)),
            },
            Err(e) => ResultResponse::err(e),
        };
        dprint!(self, 1, "DELETE: {} -> {}", path.display(), res.res);
        res
    }

    /// 0xFF queries the attribute byte; any other value applies the
    /// read-only bit to the host write permission.
    fn op_chmod(&mut self, attr: u8, path: &Namebuf) -> ResultResponse {
        let res = match host_path(&self.root, path, true) {
            Ok(p) => match std::fs::metadata(&p) {
                Ok(md) => {
                    if attr == 0xff {
                        ResultResponse {
                            res: hostfs::attr_of(&md) as i8,
                        }
                    } else {
                        match hostfs::apply_readonly(&p, attr & hostfs::ATTR_READONLY != 0) {
                            Ok(()) => ResultResponse::ok(),
                            Err(e) => ResultResponse::err(DosError::from_io(&e)),
                        }
                    }
                }
                Err(e) => ResultResponse::err(DosError::from_io(&e)),
            },
            Err(e) => ResultResponse::err(e),
        };
        dprint!(
            self,
            1,
            "CHMOD: {} 0x{:02x} -> {}",
            path.display(),
            attr,
            res.res
        );
        res
    }

    fn op_files(&mut self, attr: u8, num: u8, filep: u32, path: &Namebuf) -> FilesResponse {
        // A fresh enumeration under a live key replaces the old one.
        self.dirs.remove(filep);

        let dirpath = match host_path(&self.root, path, false) {
            Ok(p) => p,
            Err(e) => return self.files_fail(filep, path, e),
        };
        let key = SearchKey::from_namebuf(path);

        let read = match std::fs::read_dir(&dirpath) {
            Ok(read) => read,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // A missing directory must report NODIR, not NOENT, or
                // guest shells misbehave.
                return self.files_fail(filep, path, DosError::DirNotFound);
            }
            Err(e) => return self.files_fail(filep, path, DosError::from_io(&e)),
        };

        let mut entries = Vec::new();

        // Root listing with the volume bit and an all-wildcard pattern
        // gets a synthetic volume label naming the served directory.
        if path.is_root() && attr & hostfs::ATTR_VOLUME != 0 && key.is_all_wildcards() {
            if let Some(label) = host_to_guest(&self.root.to_string_lossy()) {
                let mut fi = FilesInfo {
                    atr: hostfs::ATTR_VOLUME,
                    ..Default::default()
                };
                fi.set_name(&label);
                entries.push(fi);
            }
        }

        let mut names: Vec<String> = read
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().map(str::to_owned))
            .collect();
        names.sort();

        for child in &names {
            let Some(guest) = host_to_guest(child) else {
                continue;
            };
            if !name_allowed(&guest) {
                continue;
            }
            let Some(candidate) = split_dos_name(&guest) else {
                continue;
            };
            if !key.matches(&candidate) {
                continue;
            }
            let Ok(md) = std::fs::metadata(dirpath.join(child)) else {
                continue;
            };
            if md.len() > u32::MAX as u64 {
                continue;
            }
            let fi = file_info(&md, &guest);
            if fi.atr & attr == 0 {
                continue;
            }
            entries.push(fi);
        }

        if entries.is_empty() {
            return self.files_fail(filep, path, DosError::NoMoreFiles);
        }

        let total = entries.len();
        self.dirs.insert(filep, entries);
        let batch = self
            .dirs
            .next_batch(filep, (num.max(1) as usize).min(FILES_BATCH_MAX));
        dprint!(
            self,
            1,
            "FILES: 0x{:08x} 0x{:02x} {} -> ({}/{})",
            filep,
            attr,
            path.display(),
            batch.len(),
            total
        );
        FilesResponse { res: 0, entries: batch }
    }

    fn files_fail(&mut self, filep: u32, path: &Namebuf, e: DosError) -> FilesResponse {
        dprint!(
            self,
            1,
            "FILES: 0x{:08x} {} -> {}",
            filep,
            path.display(),
            e.code()
        );
        FilesResponse::err(e)
    }

    fn op_nfiles(&mut self, num: u8, filep: u32) -> FilesResponse {
        let batch = self
            .dirs
            .next_batch(filep, (num.max(1) as usize).min(FILES_BATCH_MAX));
        if batch.is_empty() {
            dprint!(self, 1, "NFILES: 0x{:08x} -> no more", filep);
            return FilesResponse::err(DosError::NoMoreFiles);
        }
        dprint!(self, 1, "NFILES: 0x{:08x} -> {} entries", filep, batch.len());
        FilesResponse { res: 0, entries: batch }
    }

    fn op_create(&mut self, attr: u8, mode: u8, fcb: u32, path: &Namebuf) -> ResultResponse {
        let res = match host_path(&self.root, path, true) {
            Ok(p) => {
                let mut opts = OpenOptions::new();
                opts.read(true).write(true);
                if mode == 0 {
                    opts.create_new(true);
                } else {
                    opts.create(true).truncate(true);
                }
                match opts.open(&p) {
                    Ok(file) => {
                        self.files.insert(fcb, file);
                        ResultResponse::ok()
                    }
                    Err(e) if e.raw_os_error() == Some(libc::ENOSPC) => {
                        ResultResponse::err(DosError::DirFull)
                    }
                    Err(e) => ResultResponse::err(DosError::from_io(&e)),
                }
            }
            Err(e) => ResultResponse::err(e),
        };
        dprint!(
            self,
            1,
            "CREATE: fcb=0x{:08x} attr=0x{:02x} mode={} {} -> {}",
            fcb,
            attr,
            mode,
            path.display(),
            res.res
        );
        res
    }

    fn op_open(&mut self, mode: u8, fcb: u32, path: &Namebuf) -> OpenResponse {
        let res = match host_path(&self.root, path, true) {
            Ok(p) => {
                let mut opts = OpenOptions::new();
                match mode {
                    0 => opts.read(true),
                    1 => opts.write(true),
                    2 => opts.read(true).write(true),
                    _ => {
                        return self.open_fail(fcb, mode, path, DosError::BadAccessMode);
                    }
                };
                match opts.open(&p) {
                    Ok(file) => {
                        let size = file
                            .metadata()
                            .map(|md| md.len().min(u32::MAX as u64) as u32)
                            .unwrap_or(0);
                        self.files.insert(fcb, file);
                        OpenResponse { res: 0, size }
                    }
                    Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                        OpenResponse::err(DosError::BadAccessMode)
                    }
                    Err(e) => OpenResponse::err(DosError::from_io(&e)),
                }
            }
            Err(e) => OpenResponse::err(e),
        };
        dprint!(
            self,
            1,
            "OPEN: fcb=0x{:08x} mode={} {} -> {} {}",
            fcb,
            mode,
            path.display(),
            res.res,
            res.size
        );
        res
    }

    fn open_fail(&mut self, fcb: u32, mode: u8, path: &Namebuf, e: DosError) -> OpenResponse {
        dprint!(
            self,
            1,
            "OPEN: fcb=0x{:08x} mode={} {} -> {}",
            fcb,
            mode,
            path.display(),
            e.code()
        );
        OpenResponse::err(e)
    }

    fn op_close(&mut self, fcb: u32) -> ResultResponse {
        let res = match self.files.remove(fcb) {
            Some(_) => ResultResponse::ok(),
            None => ResultResponse::err(DosError::BadHandle),
        };
        dprint!(self, 1, "CLOSE: fcb=0x{:08x} -> {}", fcb, res.res);
        res
    }

    fn op_read(&mut self, fcb: u32, pos: u32, len: u16) -> ReadResponse {
        let len = (len as usize).min(DATA_CHUNK);
        let Some(of) = self.files.get_mut(fcb) else {
            dprint!(self, 1, "READ: fcb=0x{:08x} -> bad handle", fcb);
            return ReadResponse::err(DosError::BadHandle);
        };

        if of.pos != pos as u64 {
            if let Err(e) = of.file.seek(SeekFrom::Start(pos as u64)) {
                return ReadResponse::err(DosError::from_io(&e));
            }
            of.pos = pos as u64;
        }

        let mut data = vec![0u8; len];
        let res = match of.file.read(&mut data) {
            Ok(n) => {
                data.truncate(n);
                of.pos += n as u64;
                ReadResponse {
                    result: n as i16,
                    data,
                }
            }
            Err(e) => ReadResponse::err(DosError::from_io(&e)),
        };
        dprint!(
            self,
            1,
            "READ: fcb=0x{:08x} {} {} -> {}",
            fcb,
            pos,
            len,
            res.result
        );
        res
    }

    /// A zero-length write truncates the file at `pos`.
    fn op_write(&mut self, fcb: u32, pos: u32, data: &[u8]) -> WriteResponse {
        let Some(of) = self.files.get_mut(fcb) else {
            dprint!(self, 1, "WRITE: fcb=0x{:08x} -> bad handle", fcb);
            return WriteResponse::err(DosError::BadHandle);
        };

        let res = if data.is_empty() {
            match of.file.set_len(pos as u64) {
                Ok(()) => WriteResponse { result: 0 },
                Err(e) => WriteResponse::err(DosError::from_io(&e)),
            }
        } else {
            if of.pos != pos as u64 {
                if let Err(e) = of.file.seek(SeekFrom::Start(pos as u64)) {
                    return WriteResponse::err(DosError::from_io(&e));
                }
                of.pos = pos as u64;
            }
            match of.file.write(data) {
                Ok(n) => {
                    of.pos += n as u64;
                    WriteResponse { result: n as i16 }
                }
                Err(e) => WriteResponse::err(DosError::from_io(&e)),
            }
        };
        dprint!(
            self,
            1,
            "WRITE: fcb=0x{:08x} {} {} -> {}",
            fcb,
            pos,
            data.len(),
            res.result
        );
        res
    }

    /// Zero time and date fetch the file's timestamp; anything else sets
    /// it.
    fn op_filedate(&mut self, fcb: u32, time: u16, date: u16) -> FiledateResponse {
        let Some(of) = self.files.get_mut(fcb) else {
            dprint!(self, 1, "FILEDATE: fcb=0x{:08x} -> bad handle", fcb);
            return FiledateResponse::err(DosError::BadHandle);
        };

        let res = if time == 0 && date == 0 {
            match of.file.metadata().and_then(|md| md.modified()) {
                Ok(mtime) => {
                    let (t, d) = dostime::to_dos(mtime);
                    FiledateResponse { time: t, date: d }
                }
                Err(e) => FiledateResponse::err(DosError::from_io(&e)),
            }
        } else {
            match dostime::from_dos(time, date) {
                Some(st) => {
                    let times = FileTimes::new().set_accessed(st).set_modified(st);
                    match of.file.set_times(times) {
                        Ok(()) => FiledateResponse { time: 0, date: 0 },
                        Err(e) => FiledateResponse::err(DosError::from_io(&e)),
                    }
                }
                None => FiledateResponse::err(DosError::BadParameter),
            }
        };
        dprint!(
            self,
            1,
            "FILEDATE: fcb=0x{:08x} 0x{:04x} 0x{:04x} -> 0x{:04x} 0x{:04x}",
            fcb,
            time,
            date,
            res.time,
            res.date
        );
        res
    }

    /// Free/total saturate to 2 GiB independently before the cluster
    /// arithmetic; large hosts can legitimately report more free than
    /// total clusters.
    fn op_disk_free(&mut self) -> DiskFreeResponse {
        let res = match hostfs::disk_space(&self.root) {
            Ok((total, free)) => {
                let total = total.min(0x7fff_ffff);
                let free = free.min(0x7fff_ffff);
                DiskFreeResponse {
                    res: free as i32,
                    free_clusters: (free / 32768) as u16,
                    total_clusters: (total / 32768) as u16,
                    sectors_per_cluster: 128,
                    sector_size: 1024,
                }
            }
            Err(_) => DiskFreeResponse {
                res: -1,
                free_clusters: 0,
                total_clusters: 0,
                sectors_per_cluster: 128,
                sector_size: 1024,
            },
        };
        dprint!(
            self,
            1,
            "DSKFRE: free={} total={} -> {}",
            res.free_clusters,
            res.total_clusters,
            res.res
        );
        res
    }
}

/// Directory entry for a host file, name already guest-encoded.
fn file_info(md: &Metadata, guest_name: &[u8]) -> FilesInfo {
    let (time, date) = md
        .modified()
        .map(dostime::to_dos)
        .unwrap_or((0, 0));
    let mut fi = FilesInfo {
        atr: hostfs::attr_of(md),
        time,
        date,
        filelen: md.len() as u32,
        ..Default::default()
    };
    fi.set_name(guest_name);
    fi
}

fn hex_dump(prefix: &str, bytes: &[u8]) {
    for (row, chunk) in bytes.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{:02X}", b)).collect();
        eprintln!("{} {:03X}: {}", prefix, row * 16, hex.join(" "));
    }
}
