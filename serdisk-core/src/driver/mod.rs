//! Driver core: the guest-side half of the protocol.
//!
//! The guest OS calls the driver once per filesystem request; each call
//! packages one command, runs the exchange, and splices the result back
//! into the guest's FCB. Small writes are coalesced in a local cache and
//! only hit the wire when the span stops being contiguous, on a
//! conflicting read, on seek, or on close. Seek itself never crosses the
//! wire: position and known size live in the FCB.
//!
//! A failed exchange flags recovery mode; the next send is preceded by a
//! sync-byte flood long enough to push the server out of any partial
//! frame it may be stuck in.
//!
//! The guest's drive-control requests (drvctrl, getdbp, diskred,
//! diskwrt, ioctl, abort, mediacheck, lock) are driver-local: each
//! completes with a fixed status and never touches the wire.

mod cache;
mod fcb;

pub use fcb::{Fcb, FCB_SIZE};

use cache::{DataCache, FilesCache};

use crate::error::{DosError, RemoteError, RemoteResult};
use crate::proto::{
    check_len, DiskFreeResponse, FiledateResponse, FilesInfo, FilesResponse, Namebuf,
    OpenResponse, ReadResponse, Request, ResultResponse, WriteResponse, DATA_CHUNK,
    FILES_BATCH_MAX, PAYLOAD_MAX,
};
use crate::transport::{send_frame, recv_frame, SerialLink, RECOVERY_FLOOD, SYNC_FILL};

macro_rules! dprint {
    ($drv:expr, $lvl:expr, $($arg:tt)*) => {
        if $drv.debug >= $lvl {
            eprintln!($($arg)*);
        }
    };
}

/// Tuning knobs for a `RemoteDrive`.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Write-coalescing cache slots (0 disables caching).
    pub data_cache_slots: usize,
    /// Directory entries requested per files/nfiles round (1 = no
    /// batching).
    pub files_batch: u8,
    /// Diagnostic verbosity (0 = quiet).
    pub debug: u8,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            data_cache_slots: 1,
            files_batch: 1,
            debug: 0,
        }
    }
}

/// Guest-side driver bound to a serial link.
///
/// The link is expected to enforce the response timeout: a blocking read
/// that gives up returns `ErrorKind::TimedOut`, which the driver reports
/// as `RemoteError::Timeout` and answers with recovery mode.
pub struct RemoteDrive<L: SerialLink> {
    link: L,
    recovery: bool,
    dcache: Vec<DataCache>,
    fcache: Vec<FilesCache>,
    batch: u8,
    debug: u8,
    wbuf: Vec<u8>,
    rbuf: Vec<u8>,
}

impl<L: SerialLink> RemoteDrive<L> {
    pub fn new(link: L) -> Self {
        Self::with_config(link, DriverConfig::default())
    }

    pub fn with_config(link: L, config: DriverConfig) -> Self {
        let batch = config.files_batch.clamp(1, FILES_BATCH_MAX as u8);
        Self {
            link,
            recovery: false,
            dcache: (0..config.data_cache_slots).map(|_| DataCache::new()).collect(),
            fcache: if batch > 1 {
                (0..4).map(|_| FilesCache::new()).collect()
            } else {
                Vec::new()
            },
            batch,
            debug: config.debug,
            wbuf: Vec::with_capacity(PAYLOAD_MAX),
            rbuf: vec![0u8; PAYLOAD_MAX],
        }
    }

    /// True after a failed exchange, until the next successful send.
    pub fn in_recovery(&self) -> bool {
        self.recovery
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    // ---- exchange machinery ----

    /// Flood sync bytes while discarding whatever the server is sending,
    /// then drain the residue. Returns the link to a known-idle state.
    fn flood(&mut self) -> RemoteResult<()> {
        dprint!(self, 1, "link recovery: flooding sync bytes");
        let chunk = [SYNC_FILL; 64];
        let mut left = RECOVERY_FLOOD;
        while left > 0 {
            let n = left.min(chunk.len());
            self.link.write_all(&chunk[..n])?;
            self.link.discard_input()?;
            left -= n;
        }
        self.link.flush()?;
        self.link.discard_input()?;
        Ok(())
    }

    /// One request/response round trip. Returns the response payload
    /// length in `self.rbuf`.
    fn exchange(&mut self, req: &Request) -> RemoteResult<usize> {
        req.encode(&mut self.wbuf);
        if self.recovery {
            self.flood()?;
        }
        if let Err(e) = send_frame(&mut self.link, &self.wbuf) {
            self.recovery = true;
            return Err(e.into());
        }
        self.recovery = false;
        match recv_frame(&mut self.link, &mut self.rbuf) {
            Ok(n) => Ok(n),
            Err(e) => {
                self.recovery = true;
                Err(promote_timeout(e))
            }
        }
    }

    /// Round trip for commands answered by a single result byte.
    fn simple(&mut self, req: Request) -> RemoteResult<i8> {
        let n = self.exchange(&req)?;
        ResultResponse::decode(&self.rbuf[..n])?.check()
    }

    // ---- commands ----

    /// Ask the server whether it is alive (used by registration mode 1
    /// before the drive is announced to the guest).
    pub fn probe(&mut self) -> RemoteResult<()> {
        self.simple(Request::Check)?;
        dprint!(self, 1, "CHECK: ok");
        Ok(())
    }

    pub fn chdir(&mut self, path: &Namebuf) -> RemoteResult<()> {
        let res = self.simple(Request::Chdir { path: path.clone() });
        dprint!(self, 1, "CHDIR: {} -> {:?}", path.display(), res);
        res.map(|_| ())
    }

    pub fn mkdir(&mut self, path: &Namebuf) -> RemoteResult<()> {
        let res = self.simple(Request::Mkdir { path: path.clone() });
        dprint!(self, 1, "MKDIR: {} -> {:?}", path.display(), res);
        res.map(|_| ())
    }

    pub fn rmdir(&mut self, path: &Namebuf) -> RemoteResult<()> {
        let res = self.simple(Request::Rmdir { path: path.clone() });
        dprint!(self, 1, "RMDIR: {} -> {:?}", path.display(), res);
        res.map(|_| ())
    }

    pub fn rename(&mut self, old: &Namebuf, new: &Namebuf) -> RemoteResult<()> {
        let res = self.simple(Request::Rename {
            old: old.clone(),
            new: new.clone(),
        });
        dprint!(
            self,
            1,
            "RENAME: {} to {} -> {:?}",
            old.display(),
            new.display(),
            res
        );
        res.map(|_| ())
    }

    pub fn delete(&mut self, path: &Namebuf) -> RemoteResult<()> {
        let res = self.simple(Request::Delete { path: path.clone() });
        dprint!(self, 1, "DELETE: {} -> {:?}", path.display(), res);
        res.map(|_| ())
    }

    /// Query (attr 0xFF) or set the attribute byte. Returns the current
    /// attribute on query, 0 on set.
    pub fn chmod(&mut self, attr: u8, path: &Namebuf) -> RemoteResult<u8> {
        let res = self.simple(Request::Chmod {
            attr,
            path: path.clone(),
        });
        dprint!(self, 1, "CHMOD: {} 0x{:02x} -> {:?}", path.display(), attr, res);
        res.map(|v| v as u8)
    }

    /// Start a directory enumeration under the FILBUF key.
    pub fn files(&mut self, attr: u8, filep: u32, path: &Namebuf) -> RemoteResult<FilesInfo> {
        self.drop_files_cache(filep);
        let num = self.batch;
        let n = self.exchange(&Request::Files {
            attr,
            num,
            filep,
            path: path.clone(),
        })?;
        let resp = FilesResponse::decode(&self.rbuf[..n])?;
        let res = self.finish_files(filep, resp);
        dprint!(
            self,
            1,
            "FILES: {} filep=0x{:08x} -> {:?}",
            path.display(),
            filep,
            res.as_ref().map(|fi| String::from_utf8_lossy(fi.name_bytes()).into_owned())
        );
        res
    }

    /// Continue an enumeration; served from the local batch buffer when
    /// one is still charged.
    pub fn nfiles(&mut self, filep: u32) -> RemoteResult<FilesInfo> {
        if let Some(i) = self.fcache.iter().position(|f| f.filep == filep) {
            if let Some(fi) = self.fcache[i].take() {
                dprint!(self, 1, "NFILES: filep=0x{:08x} (buffered)", filep);
                return Ok(fi);
            }
        }
        let num = self.batch;
        let n = self.exchange(&Request::Nfiles { num, filep })?;
        let resp = FilesResponse::decode(&self.rbuf[..n])?;
        let res = self.finish_files(filep, resp);
        dprint!(self, 1, "NFILES: filep=0x{:08x} -> {:?}", filep, res.is_ok());
        res
    }

    fn finish_files(&mut self, filep: u32, resp: FilesResponse) -> RemoteResult<FilesInfo> {
        if resp.res < 0 {
            return Err(dos(resp.res));
        }
        let mut entries = resp.entries;
        if entries.is_empty() {
            return Err(RemoteError::Dos(DosError::NoMoreFiles));
        }
        let first = entries.remove(0);
        if !entries.is_empty() {
            if let Some(slot) = self.alloc_files_slot(filep) {
                slot.filep = filep;
                slot.next = 0;
                slot.entries = entries;
            }
        }
        Ok(first)
    }

    fn alloc_files_slot(&mut self, filep: u32) -> Option<&mut FilesCache> {
        if let Some(i) = self.fcache.iter().position(|f| f.filep == filep) {
            return Some(&mut self.fcache[i]);
        }
        let i = self.fcache.iter().position(|f| f.is_free())?;
        Some(&mut self.fcache[i])
    }

    fn drop_files_cache(&mut self, filep: u32) {
        if let Some(i) = self.fcache.iter().position(|f| f.filep == filep) {
            self.fcache[i].clear();
        }
    }

    /// Create a file. Mode 0 refuses to replace an existing file.
    pub fn create(
        &mut self,
        fcb_key: u32,
        fcb: &mut Fcb,
        attr: u8,
        mode: u8,
        path: &Namebuf,
    ) -> RemoteResult<()> {
        self.simple(Request::Create {
            attr,
            mode,
            fcb: fcb_key,
            path: path.clone(),
        })?;
        fcb.set_size(0);
        dprint!(
            self,
            1,
            "CREATE: fcb=0x{:08x} attr=0x{:02x} mode={} {}",
            fcb_key,
            attr,
            mode,
            path.display()
        );
        Ok(())
    }

    /// Open a file with the mode stored in the FCB; the known size is
    /// spliced back into the FCB. Returns the size.
    pub fn open(&mut self, fcb_key: u32, fcb: &mut Fcb, path: &Namebuf) -> RemoteResult<u32> {
        let mode = fcb.mode();
        let n = self.exchange(&Request::Open {
            mode,
            fcb: fcb_key,
            path: path.clone(),
        })?;
        let resp = OpenResponse::decode(&self.rbuf[..n])?;
        dprint!(
            self,
            1,
            "OPEN: fcb=0x{:08x} mode={} {} -> {} {}",
            fcb_key,
            mode,
            path.display(),
            resp.res,
            resp.size
        );
        if resp.res < 0 {
            return Err(dos(resp.res));
        }
        fcb.set_size(resp.size);
        Ok(resp.size)
    }

    /// Flush cached writes, then close the server-side file.
    pub fn close(&mut self, fcb_key: u32) -> RemoteResult<()> {
        let flushed = self.flush(fcb_key, true);
        let res = self.simple(Request::Close { fcb: fcb_key });
        dprint!(self, 1, "CLOSE: fcb=0x{:08x} -> {:?}", fcb_key, res);
        flushed?;
        res.map(|_| ())
    }

    /// Read at the FCB cursor into `buf`, advancing the cursor. Short
    /// reads mean end of file.
    pub fn read(&mut self, fcb_key: u32, fcb: &mut Fcb, buf: &mut [u8]) -> RemoteResult<usize> {
        // Dirty cached data is the authoritative content; push it to the
        // server before reading the same file.
        self.flush(fcb_key, false)?;

        let mut done = 0usize;
        if let Some(i) = self.read_slot(fcb_key) {
            loop {
                if self.dcache[i].fcb == fcb_key {
                    let n = self.dcache[i].copy_at(fcb.pos(), &mut buf[done..]);
                    if n > 0 {
                        done += n;
                        fcb.set_pos(fcb.pos() + n as u32);
                    }
                }
                let rest = buf.len() - done;
                if rest == 0 || rest >= DATA_CHUNK {
                    break;
                }
                // The residual request is smaller than a slot: refill the
                // cache with a full chunk and serve from it.
                self.flush(fcb_key, true)?;
                let pos = fcb.pos();
                let mut tmp = [0u8; DATA_CHUNK];
                let got = self.send_read(fcb_key, pos, &mut tmp)?;
                let slot = &mut self.dcache[i];
                slot.fcb = fcb_key;
                slot.offset = pos;
                slot.len = got;
                slot.dirty = false;
                slot.data[..got].copy_from_slice(&tmp[..got]);
                if got == 0 {
                    break;
                }
            }
        }

        let rest = buf.len() - done;
        if rest > 0 {
            let pos = fcb.pos();
            let got = self.send_read(fcb_key, pos, &mut buf[done..])?;
            done += got;
            fcb.set_pos(pos + got as u32);
        }
        dprint!(
            self,
            1,
            "READ: fcb=0x{:08x} {} -> {}",
            fcb_key,
            buf.len(),
            done
        );
        Ok(done)
    }

    /// Write at the FCB cursor, advancing cursor and known size. An empty
    /// `data` truncates the file at the cursor. Small writes land in the
    /// cache and reach the server on flush.
    pub fn write(&mut self, fcb_key: u32, fcb: &mut Fcb, data: &[u8]) -> RemoteResult<usize> {
        let pos = fcb.pos();

        if !data.is_empty() && data.len() < DATA_CHUNK {
            if let Some(i) = self.dcache.iter().position(|s| s.fcb == fcb_key) {
                if self.dcache[i].dirty && self.dcache[i].try_append(pos, data) {
                    fcb.advance(data.len() as u32);
                    dprint!(self, 2, "WRITE: fcb=0x{:08x} {} (cached)", fcb_key, data.len());
                    return Ok(data.len());
                }
                // Stale read window or a non-contiguous span: write it
                // back and free the slot before starting a new one.
                self.flush(fcb_key, true)?;
            }
            if let Some(i) = self.dcache.iter().position(|s| s.is_free()) {
                self.dcache[i].install(fcb_key, pos, data);
                fcb.advance(data.len() as u32);
                dprint!(self, 2, "WRITE: fcb=0x{:08x} {} (cached)", fcb_key, data.len());
                return Ok(data.len());
            }
        }

        self.flush(fcb_key, false)?;
        let n = self.send_write(fcb_key, pos, data)?;
        if data.is_empty() {
            // Truncation: the cursor becomes the file size.
            fcb.set_size(pos);
            dprint!(self, 1, "WRITE: fcb=0x{:08x} truncate at {}", fcb_key, pos);
            return Ok(0);
        }
        fcb.advance(n as u32);
        dprint!(self, 1, "WRITE: fcb=0x{:08x} {} -> {}", fcb_key, data.len(), n);
        Ok(n)
    }

    /// Seek is resolved locally against the FCB. Positions beyond the
    /// known size fail without a wire exchange.
    pub fn seek(
        &mut self,
        fcb_key: u32,
        fcb: &mut Fcb,
        whence: u8,
        offset: i32,
    ) -> RemoteResult<u32> {
        self.flush(fcb_key, false)?;
        let base = match whence {
            0 => 0,
            1 => fcb.pos(),
            2 => fcb.size(),
            _ => return Err(RemoteError::Dos(DosError::BadParameter)),
        };
        let newpos = base as i64 + offset as i64;
        if newpos < 0 || newpos > fcb.size() as i64 {
            dprint!(
                self,
                1,
                "SEEK: fcb=0x{:08x} {}+{} -> over eof",
                fcb_key,
                whence,
                offset
            );
            return Err(RemoteError::Dos(DosError::SeekOverEof));
        }
        fcb.set_pos(newpos as u32);
        dprint!(self, 1, "SEEK: fcb=0x{:08x} -> {}", fcb_key, newpos);
        Ok(newpos as u32)
    }

    /// Get (both zero) or set the file timestamp.
    pub fn filedate(&mut self, fcb_key: u32, time: u16, date: u16) -> RemoteResult<(u16, u16)> {
        let n = self.exchange(&Request::Filedate {
            fcb: fcb_key,
            time,
            date,
        })?;
        let resp = FiledateResponse::decode(&self.rbuf[..n])?;
        dprint!(
            self,
            1,
            "FILEDATE: fcb=0x{:08x} 0x{:04x} 0x{:04x} -> 0x{:04x} 0x{:04x}",
            fcb_key,
            time,
            date,
            resp.time,
            resp.date
        );
        if resp.is_err() {
            return Err(dos(resp.time as i16 as i8));
        }
        Ok((resp.time, resp.date))
    }

    /// Free-space query for the guest's DSKFRE call.
    pub fn disk_free(&mut self) -> RemoteResult<DiskFreeResponse> {
        let n = self.exchange(&Request::DiskFree)?;
        let resp = DiskFreeResponse::decode(&self.rbuf[..n])?;
        dprint!(
            self,
            1,
            "DSKFRE: free={} total={} -> {}",
            resp.free_clusters,
            resp.total_clusters,
            resp.res
        );
        Ok(resp)
    }

    // ---- drive control ----
    //
    // These requests have no remote side; each completes locally.

    /// Drive control: drive status byte and result.
    pub fn drvctrl(&self) -> (u8, i32) {
        dprint!(self, 1, "DRVCTRL:");
        (2, 0)
    }

    /// Fill the guest's 16-byte drive parameter stub. Some applications
    /// refuse a drive whose sector length reads zero.
    pub fn fill_dpb(buf: &mut [u8]) {
        for b in buf.iter_mut().take(16) {
            *b = 0;
        }
        buf[..2].copy_from_slice(&512u16.to_be_bytes());
        buf[2] = 1;
    }

    /// Raw sector read: no sectors on a remote drive.
    pub fn diskred(&self) -> i32 {
        dprint!(self, 1, "DISKRED:");
        0
    }

    /// Raw sector write: no sectors on a remote drive.
    pub fn diskwrt(&self) -> i32 {
        dprint!(self, 1, "DISKWRT:");
        0
    }

    /// ioctl: no device-specific controls.
    pub fn ioctl(&self) -> i32 {
        dprint!(self, 1, "IOCTL:");
        0
    }

    /// Abort: nothing is in flight between exchanges.
    pub fn abort(&self) -> i32 {
        dprint!(self, 1, "ABORT:");
        0
    }

    /// Media check: the served directory never changes identity.
    pub fn mediacheck(&self) -> i32 {
        dprint!(self, 1, "MEDIACHECK:");
        0
    }

    /// Lock: always granted on a single-client line.
    pub fn lock(&self) -> i32 {
        dprint!(self, 1, "LOCK:");
        0
    }

    // ---- cache plumbing ----

    /// Write back dirty spans for `fcb`; optionally free the slots.
    fn flush(&mut self, fcb: u32, free_slot: bool) -> RemoteResult<()> {
        let mut result = Ok(());
        for i in 0..self.dcache.len() {
            if self.dcache[i].fcb != fcb {
                continue;
            }
            if self.dcache[i].dirty {
                let offset = self.dcache[i].offset;
                let len = self.dcache[i].len;
                let data = self.dcache[i].data[..len].to_vec();
                match self.send_write(fcb, offset, &data) {
                    Ok(_) => self.dcache[i].dirty = false,
                    Err(e) => {
                        // The span cannot be retried; report the failure
                        // but do not keep resending it.
                        self.dcache[i].dirty = false;
                        result = Err(e);
                    }
                }
            }
            if free_slot {
                self.dcache[i].clear();
            }
        }
        result
    }

    fn read_slot(&self, fcb: u32) -> Option<usize> {
        self.dcache
            .iter()
            .position(|s| s.fcb == fcb)
            .or_else(|| self.dcache.iter().position(|s| s.is_free()))
    }

    /// Chunked read starting at `pos`. Stops at end of file.
    fn send_read(&mut self, fcb: u32, pos: u32, buf: &mut [u8]) -> RemoteResult<usize> {
        let mut total = 0usize;
        while total < buf.len() {
            let want = (buf.len() - total).min(DATA_CHUNK) as u16;
            let n = self.exchange(&Request::Read {
                fcb,
                pos: pos + total as u32,
                len: want,
            })?;
            let resp = ReadResponse::decode(&self.rbuf[..n])?;
            let got = check_len(resp.result)?;
            if got == 0 {
                break;
            }
            buf[total..total + got].copy_from_slice(&resp.data);
            total += got;
        }
        Ok(total)
    }

    /// Chunked write starting at `pos`. An empty `data` still performs
    /// one exchange (truncation).
    fn send_write(&mut self, fcb: u32, pos: u32, data: &[u8]) -> RemoteResult<usize> {
        let mut total = 0usize;
        loop {
            let end = (total + DATA_CHUNK).min(data.len());
            let n = self.exchange(&Request::Write {
                fcb,
                pos: pos + total as u32,
                data: data[total..end].to_vec(),
            })?;
            let resp = WriteResponse::decode(&self.rbuf[..n])?;
            let wrote = check_len(resp.result)?;
            total += wrote;
            if total >= data.len() || wrote == 0 {
                break;
            }
        }
        Ok(total)
    }
}

fn dos(code: i8) -> RemoteError {
    RemoteError::Dos(DosError::from_code(code).unwrap_or(DosError::BadParameter))
}

fn promote_timeout(e: RemoteError) -> RemoteError {
    match e {
        RemoteError::Io(ref io) if io.kind() == std::io::ErrorKind::TimedOut => {
            RemoteError::Timeout
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackLink;
    use crate::server::Server;

    fn drive(root: &std::path::Path) -> RemoteDrive<LoopbackLink> {
        RemoteDrive::new(LoopbackLink::new(Server::new(root)))
    }

    fn fcb_mem() -> [u8; FCB_SIZE] {
        [0u8; FCB_SIZE]
    }

    #[test]
    fn test_probe() {
        let dir = tempfile::tempdir().unwrap();
        let mut drv = drive(dir.path());
        drv.probe().unwrap();
    }

    #[test]
    fn test_open_sets_fcb_size() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("HELLO.TXT"), b"Hello").unwrap();
        let mut drv = drive(dir.path());

        let mut mem = fcb_mem();
        let mut fcb = Fcb::new(&mut mem);
        let size = drv
            .open(0x100, &mut fcb, &Namebuf::with_name(&[], b"HELLO", b"TXT"))
            .unwrap();
        assert_eq!(size, 5);
        assert_eq!(fcb.size(), 5);
        drv.close(0x100).unwrap();
    }

    #[test]
    fn test_open_missing_is_dos_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut drv = drive(dir.path());
        let mut mem = fcb_mem();
        let mut fcb = Fcb::new(&mut mem);
        let err = drv
            .open(0x100, &mut fcb, &Namebuf::with_name(&[], b"NONE", b"TXT"))
            .unwrap_err();
        assert!(matches!(err, RemoteError::Dos(DosError::FileNotFound)));
        // An in-band error is not a link failure
        assert!(!drv.in_recovery());
    }

    #[test]
    fn test_read_advances_cursor() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("SEQ"), b"abcdefgh").unwrap();
        let mut drv = drive(dir.path());

        let mut mem = fcb_mem();
        let mut fcb = Fcb::new(&mut mem);
        drv.open(0x100, &mut fcb, &Namebuf::with_name(&[], b"SEQ", b""))
            .unwrap();

        let mut buf = [0u8; 3];
        assert_eq!(drv.read(0x100, &mut fcb, &mut buf).unwrap(), 3);
        assert_eq!(&buf, b"abc");
        assert_eq!(fcb.pos(), 3);

        assert_eq!(drv.read(0x100, &mut fcb, &mut buf).unwrap(), 3);
        assert_eq!(&buf, b"def");

        // Past the data: short read, then zero
        let mut big = [0u8; 16];
        assert_eq!(drv.read(0x100, &mut fcb, &mut big).unwrap(), 2);
        assert_eq!(&big[..2], b"gh");
        assert_eq!(drv.read(0x100, &mut fcb, &mut big).unwrap(), 0);
        drv.close(0x100).unwrap();
    }

    #[test]
    fn test_small_writes_coalesce() {
        let dir = tempfile::tempdir().unwrap();
        let mut drv = drive(dir.path());

        let mut mem = fcb_mem();
        let mut fcb = Fcb::new(&mut mem);
        drv.create(0x200, &mut fcb, 0x20, 1, &Namebuf::with_name(&[], b"OUT", b"BIN"))
            .unwrap();

        let before = drv.link_mut().exchanges();
        drv.write(0x200, &mut fcb, b"aa").unwrap();
        drv.write(0x200, &mut fcb, b"bb").unwrap();
        drv.write(0x200, &mut fcb, b"cc").unwrap();
        // All three landed in the cache: no wire traffic yet.
        assert_eq!(drv.link_mut().exchanges(), before);
        assert_eq!(fcb.pos(), 6);
        assert_eq!(fcb.size(), 6);

        drv.close(0x200).unwrap();
        assert_eq!(
            std::fs::read(dir.path().join("OUT.BIN")).unwrap(),
            b"aabbcc"
        );
    }

    #[test]
    fn test_write_content_equals_request_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut drv = drive(dir.path());

        let mut mem = fcb_mem();
        let mut fcb = Fcb::new(&mut mem);
        drv.create(0x200, &mut fcb, 0x20, 1, &Namebuf::with_name(&[], b"MIX", b""))
            .unwrap();

        // Mix of cached small writes and a chunk-sized direct write
        drv.write(0x200, &mut fcb, b"head-").unwrap();
        let big = vec![b'X'; DATA_CHUNK];
        drv.write(0x200, &mut fcb, &big).unwrap();
        drv.write(0x200, &mut fcb, b"-tail").unwrap();
        drv.close(0x200).unwrap();

        let mut expect = b"head-".to_vec();
        expect.extend_from_slice(&big);
        expect.extend_from_slice(b"-tail");
        assert_eq!(std::fs::read(dir.path().join("MIX")).unwrap(), expect);
    }

    #[test]
    fn test_read_sees_cached_writes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("RW"), b"0123456789").unwrap();
        let mut drv = drive(dir.path());

        let mut mem = fcb_mem();
        let mut fcb = Fcb::new(&mut mem);
        fcb.set_mode(2);
        drv.open(0x300, &mut fcb, &Namebuf::with_name(&[], b"RW", b""))
            .unwrap();

        drv.write(0x300, &mut fcb, b"AB").unwrap(); // cached
        drv.seek(0x300, &mut fcb, 0, 0).unwrap(); // flushes
        let mut buf = [0u8; 10];
        assert_eq!(drv.read(0x300, &mut fcb, &mut buf).unwrap(), 10);
        assert_eq!(&buf, b"AB23456789");
        drv.close(0x300).unwrap();
    }

    #[test]
    fn test_truncating_write() {
        let dir = tempfile::tempdir().unwrap();
        let mut drv = drive(dir.path());

        let mut mem = fcb_mem();
        let mut fcb = Fcb::new(&mut mem);
        drv.create(0x200, &mut fcb, 0x20, 1, &Namebuf::with_name(&[], b"NEW", b"BIN"))
            .unwrap();
        drv.write(0x200, &mut fcb, &[1, 2, 3]).unwrap();
        assert_eq!(drv.write(0x200, &mut fcb, &[]).unwrap(), 0);
        assert_eq!(fcb.size(), 3);
        drv.close(0x200).unwrap();

        assert_eq!(std::fs::read(dir.path().join("NEW.BIN")).unwrap(), [1, 2, 3]);
    }

    #[test]
    fn test_seek_bounds() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("S"), b"0123456789").unwrap();
        let mut drv = drive(dir.path());

        let mut mem = fcb_mem();
        let mut fcb = Fcb::new(&mut mem);
        drv.open(0x400, &mut fcb, &Namebuf::with_name(&[], b"S", b""))
            .unwrap();

        let wire_before = drv.link_mut().exchanges();
        assert_eq!(drv.seek(0x400, &mut fcb, 0, 4).unwrap(), 4);
        assert_eq!(drv.seek(0x400, &mut fcb, 1, 3).unwrap(), 7);
        assert_eq!(drv.seek(0x400, &mut fcb, 2, -10).unwrap(), 0);
        assert_eq!(drv.seek(0x400, &mut fcb, 2, 0).unwrap(), 10);
        // Bounds: one past either end fails, position is unchanged
        assert!(matches!(
            drv.seek(0x400, &mut fcb, 2, 1),
            Err(RemoteError::Dos(DosError::SeekOverEof))
        ));
        assert!(matches!(
            drv.seek(0x400, &mut fcb, 0, -1),
            Err(RemoteError::Dos(DosError::SeekOverEof))
        ));
        assert_eq!(fcb.pos(), 10);
        // Seek never crossed the wire
        assert_eq!(drv.link_mut().exchanges(), wire_before);
        drv.close(0x400).unwrap();
    }

    #[test]
    fn test_files_nfiles_with_batching() {
        let dir = tempfile::tempdir().unwrap();
        for n in ["A.TXT", "B.TXT", "C.TXT", "D.TXT"] {
            std::fs::write(dir.path().join(n), b"x").unwrap();
        }
        let mut drv = RemoteDrive::with_config(
            LoopbackLink::new(Server::new(dir.path())),
            DriverConfig {
                files_batch: 8,
                ..Default::default()
            },
        );

        let pattern = Namebuf::with_name(&[], b"????????", b"???");
        let first = drv.files(0x20, 0x300, &pattern).unwrap();
        assert_eq!(first.name_bytes(), b"A.TXT");

        let wire_before = drv.link_mut().exchanges();
        assert_eq!(drv.nfiles(0x300).unwrap().name_bytes(), b"B.TXT");
        assert_eq!(drv.nfiles(0x300).unwrap().name_bytes(), b"C.TXT");
        assert_eq!(drv.nfiles(0x300).unwrap().name_bytes(), b"D.TXT");
        // All served from the local batch buffer.
        assert_eq!(drv.link_mut().exchanges(), wire_before);

        assert!(matches!(
            drv.nfiles(0x300),
            Err(RemoteError::Dos(DosError::NoMoreFiles))
        ));
    }

    #[test]
    fn test_files_unbatched() {
        let dir = tempfile::tempdir().unwrap();
        for n in ["A.TXT", "B.TXT"] {
            std::fs::write(dir.path().join(n), b"x").unwrap();
        }
        let mut drv = drive(dir.path());

        let pattern = Namebuf::with_name(&[], b"????????", b"???");
        assert_eq!(drv.files(0x20, 0x300, &pattern).unwrap().name_bytes(), b"A.TXT");
        assert_eq!(drv.nfiles(0x300).unwrap().name_bytes(), b"B.TXT");
        assert!(matches!(
            drv.nfiles(0x300),
            Err(RemoteError::Dos(DosError::NoMoreFiles))
        ));
    }

    #[test]
    fn test_disk_free() {
        let dir = tempfile::tempdir().unwrap();
        let mut drv = drive(dir.path());
        let df = drv.disk_free().unwrap();
        assert_eq!(df.sector_size, 1024);
        assert_eq!(df.sectors_per_cluster, 128);
    }

    #[test]
    fn test_filedate_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("T"), b"x").unwrap();
        let mut drv = drive(dir.path());

        let mut mem = fcb_mem();
        let mut fcb = Fcb::new(&mut mem);
        fcb.set_mode(2);
        drv.open(0x500, &mut fcb, &Namebuf::with_name(&[], b"T", b""))
            .unwrap();

        let time = (9u16) << 11 | 30 << 5;
        let date = ((2001 - 1980) as u16) << 9 | 3 << 5 | 7;
        assert_eq!(drv.filedate(0x500, time, date).unwrap(), (0, 0));
        assert_eq!(drv.filedate(0x500, 0, 0).unwrap(), (time, date));
        drv.close(0x500).unwrap();
    }

    #[test]
    fn test_fill_dpb() {
        let mut buf = [0xffu8; 16];
        RemoteDrive::<LoopbackLink>::fill_dpb(&mut buf);
        assert_eq!(&buf[..3], &[0x02, 0x00, 1]);
        assert!(buf[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_drive_control_group_is_local() {
        let dir = tempfile::tempdir().unwrap();
        let mut drv = drive(dir.path());

        assert_eq!(drv.drvctrl(), (2, 0));
        assert_eq!(drv.diskred(), 0);
        assert_eq!(drv.diskwrt(), 0);
        assert_eq!(drv.ioctl(), 0);
        assert_eq!(drv.abort(), 0);
        assert_eq!(drv.mediacheck(), 0);
        assert_eq!(drv.lock(), 0);
        // None of these cross the wire.
        assert_eq!(drv.link_mut().exchanges(), 0);
    }

    #[test]
    fn test_timeout_sets_recovery_and_flood_clears_it() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("F"), b"data").unwrap();
        let mut drv = drive(dir.path());

        drv.link_mut().pause();
        let mut mem = fcb_mem();
        let mut fcb = Fcb::new(&mut mem);
        let err = drv
            .open(0x100, &mut fcb, &Namebuf::with_name(&[], b"F", b""))
            .unwrap_err();
        assert!(matches!(err, RemoteError::Timeout));
        assert_eq!(err.guest_error_word(), Some(0x1002));
        assert!(drv.in_recovery());

        drv.link_mut().resume();
        let written_before = drv.link_mut().bytes_from_driver();
        drv.open(0x100, &mut fcb, &Namebuf::with_name(&[], b"F", b""))
            .unwrap();
        assert!(!drv.in_recovery());
        // The retry was preceded by a sync flood longer than any frame.
        assert!(drv.link_mut().bytes_from_driver() - written_before >= RECOVERY_FLOOD);
        drv.close(0x100).unwrap();
    }
}
