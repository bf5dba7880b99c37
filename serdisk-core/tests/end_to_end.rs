//! End-to-end scenarios: driver and server joined by the in-process link.

use serdisk_core::driver::{DriverConfig, Fcb, RemoteDrive, FCB_SIZE};
use serdisk_core::{
    DosError, LoopbackLink, Namebuf, RemoteError, Server, DATA_CHUNK, RECOVERY_FLOOD,
};

fn setup(root: &std::path::Path) -> RemoteDrive<LoopbackLink> {
    RemoteDrive::new(LoopbackLink::new(Server::new(root)))
}

fn name(n: &[u8], e: &[u8]) -> Namebuf {
    Namebuf::with_name(&[], n, e)
}

#[test]
fn test_open_read_close() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("HELLO.TXT"), b"Hello").unwrap();
    let mut drv = setup(dir.path());

    let mut mem = [0u8; FCB_SIZE];
    let mut fcb = Fcb::new(&mut mem);
    let size = drv.open(0x100, &mut fcb, &name(b"HELLO", b"TXT")).unwrap();
    assert_eq!(size, 5);

    let mut buf = [0u8; 64];
    let n = drv.read(0x100, &mut fcb, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"Hello");

    drv.close(0x100).unwrap();
    // No session state survives the close.
    assert_eq!(drv.link_mut().server().open_file_count(), 0);
    assert_eq!(drv.link_mut().server().enumeration_count(), 0);
}

#[test]
fn test_create_write_truncate_stat() {
    let dir = tempfile::tempdir().unwrap();
    let mut drv = setup(dir.path());

    let mut mem = [0u8; FCB_SIZE];
    let mut fcb = Fcb::new(&mut mem);
    drv.create(0x200, &mut fcb, 0x20, 1, &name(b"NEW", b"BIN"))
        .unwrap();
    assert_eq!(drv.write(0x200, &mut fcb, &[1, 2, 3]).unwrap(), 3);
    // A zero-length write truncates at the cursor.
    assert_eq!(drv.write(0x200, &mut fcb, &[]).unwrap(), 0);
    drv.close(0x200).unwrap();

    assert_eq!(std::fs::read(dir.path().join("NEW.BIN")).unwrap(), [1, 2, 3]);
}

#[test]
fn test_wildcard_listing() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("A.TXT"), b"1").unwrap();
    std::fs::write(dir.path().join("AB.TXT"), b"22").unwrap();
    std::fs::write(dir.path().join("README"), b"333").unwrap();
    let mut drv = setup(dir.path());

    let pattern = name(b"A???????", b"???");
    assert_eq!(drv.files(0x20, 0x300, &pattern).unwrap().name_bytes(), b"A.TXT");
    assert_eq!(drv.nfiles(0x300).unwrap().name_bytes(), b"AB.TXT");
    assert!(matches!(
        drv.nfiles(0x300),
        Err(RemoteError::Dos(DosError::NoMoreFiles))
    ));
    assert_eq!(drv.link_mut().server().enumeration_count(), 0);
}

#[test]
fn test_volume_name_synthesis() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("F.TXT"), b"x").unwrap();
    let mut drv = setup(dir.path());

    let first = drv
        .files(0x08, 0x300, &name(b"????????", b"???"))
        .unwrap();
    assert_eq!(first.atr, 0x08);
    assert_eq!(first.filelen, 0);
    assert_eq!(first.time, 0);
    assert_eq!(first.date, 0);
    let label = String::from_utf8_lossy(first.name_bytes()).into_owned();
    assert!(dir.path().to_string_lossy().starts_with(&label));
}

#[test]
fn test_timeout_then_recovery() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("HELLO.TXT"), b"Hello").unwrap();
    let mut drv = setup(dir.path());

    // Server stops answering: the driver gives up and flags recovery.
    drv.link_mut().pause();
    let mut mem = [0u8; FCB_SIZE];
    let mut fcb = Fcb::new(&mut mem);
    let err = drv
        .open(0x100, &mut fcb, &name(b"HELLO", b"TXT"))
        .unwrap_err();
    assert!(matches!(err, RemoteError::Timeout));
    assert_eq!(err.guest_error_word(), Some(0x1002));
    assert!(drv.in_recovery());

    // Server resumes: the retry is preceded by a sync flood at least as
    // long as any frame the server could be stuck inside.
    drv.link_mut().resume();
    let before = drv.link_mut().bytes_from_driver();
    let size = drv.open(0x100, &mut fcb, &name(b"HELLO", b"TXT")).unwrap();
    assert_eq!(size, 5);
    assert!(drv.link_mut().bytes_from_driver() - before >= RECOVERY_FLOOD);
    assert!(!drv.in_recovery());

    let mut buf = [0u8; 16];
    let n = drv.read(0x100, &mut fcb, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"Hello");
    drv.close(0x100).unwrap();
}

#[test]
fn test_rename_over_nonempty_dir_fails() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("A")).unwrap();
    std::fs::create_dir(dir.path().join("B")).unwrap();
    std::fs::write(dir.path().join("B/F"), b"x").unwrap();
    let mut drv = setup(dir.path());

    assert!(matches!(
        drv.rename(&name(b"A", b""), &name(b"B", b"")),
        Err(RemoteError::Dos(DosError::CantRename))
    ));
}

#[test]
fn test_write_cache_flush_preserves_order() {
    // After close, the server-side file equals the concatenation of all
    // writes in request order, however they were cached.
    let dir = tempfile::tempdir().unwrap();
    let mut drv = setup(dir.path());

    let mut mem = [0u8; FCB_SIZE];
    let mut fcb = Fcb::new(&mut mem);
    drv.create(0x200, &mut fcb, 0x20, 1, &name(b"LOG", b"DAT"))
        .unwrap();

    let mut expect = Vec::new();
    let pieces: &[&[u8]] = &[
        b"one",
        b"two-two",
        &[9u8; 600],
        &[7u8; 600], // second slotful forces a flush
        b"tail",
    ];
    for piece in pieces {
        assert_eq!(drv.write(0x200, &mut fcb, piece).unwrap(), piece.len());
        expect.extend_from_slice(piece);
    }
    drv.close(0x200).unwrap();

    assert_eq!(std::fs::read(dir.path().join("LOG.DAT")).unwrap(), expect);
}

#[test]
fn test_read_equals_direct_read_after_mixed_io() {
    let dir = tempfile::tempdir().unwrap();
    let content: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(dir.path().join("MIX.DAT"), &content).unwrap();
    let mut drv = setup(dir.path());

    let mut mem = [0u8; FCB_SIZE];
    let mut fcb = Fcb::new(&mut mem);
    fcb.set_mode(2);
    drv.open(0x600, &mut fcb, &name(b"MIX", b"DAT")).unwrap();

    // Interleave cached reads, seeks, and a write; the view must match
    // the file at every step.
    let mut buf = vec![0u8; 100];
    drv.read(0x600, &mut fcb, &mut buf).unwrap();
    assert_eq!(buf, content[..100]);

    drv.seek(0x600, &mut fcb, 0, 2500).unwrap();
    drv.read(0x600, &mut fcb, &mut buf).unwrap();
    assert_eq!(buf, content[2500..2600]);

    drv.seek(0x600, &mut fcb, 0, 2550).unwrap();
    drv.write(0x600, &mut fcb, b"OVERWRITE").unwrap();
    drv.seek(0x600, &mut fcb, 0, 2545).unwrap();
    let mut peek = vec![0u8; 20];
    drv.read(0x600, &mut fcb, &mut peek).unwrap();
    let mut expect = content[2545..2565].to_vec();
    expect[5..14].copy_from_slice(b"OVERWRITE");
    assert_eq!(peek, expect);

    // Large read straddling chunk boundaries bypasses the cache.
    drv.seek(0x600, &mut fcb, 0, 0).unwrap();
    let mut big = vec![0u8; DATA_CHUNK * 2 + 100];
    let n = drv.read(0x600, &mut fcb, &mut big).unwrap();
    assert_eq!(n, big.len());
    // The overwrite sits at 2550, past this read's end.
    assert_eq!(big, &content[..big.len()]);

    drv.close(0x600).unwrap();
}

#[test]
fn test_subdirectory_operations() {
    let dir = tempfile::tempdir().unwrap();
    let mut drv = setup(dir.path());

    drv.mkdir(&name(b"GAMES", b"")).unwrap();
    assert!(dir.path().join("GAMES").is_dir());
    drv.chdir(&Namebuf::with_dir(&[b"GAMES"])).unwrap();

    // Create a file inside the new directory.
    let mut mem = [0u8; FCB_SIZE];
    let mut fcb = Fcb::new(&mut mem);
    let path = Namebuf::with_name(&[b"GAMES"], b"SAVE", b"DAT");
    drv.create(0x700, &mut fcb, 0x20, 1, &path).unwrap();
    drv.write(0x700, &mut fcb, b"state").unwrap();
    drv.close(0x700).unwrap();
    assert_eq!(
        std::fs::read(dir.path().join("GAMES/SAVE.DAT")).unwrap(),
        b"state"
    );

    drv.delete(&path).unwrap();
    drv.rmdir(&name(b"GAMES", b"")).unwrap();
    assert!(!dir.path().join("GAMES").exists());
}

#[test]
fn test_chmod_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("RO.TXT"), b"x").unwrap();
    let mut drv = setup(dir.path());

    assert_eq!(drv.chmod(0xff, &name(b"RO", b"TXT")).unwrap(), 0x20);
    assert_eq!(drv.chmod(0x21, &name(b"RO", b"TXT")).unwrap(), 0);
    assert_eq!(drv.chmod(0xff, &name(b"RO", b"TXT")).unwrap(), 0x21);
    // Clear it again so the tempdir can be removed.
    assert_eq!(drv.chmod(0x20, &name(b"RO", b"TXT")).unwrap(), 0);
}

#[test]
fn test_batched_enumeration_matches_unbatched() {
    let dir = tempfile::tempdir().unwrap();
    let mut expected = Vec::new();
    for i in 0..20 {
        let n = format!("F{:02}.DAT", i);
        std::fs::write(dir.path().join(&n), b"x").unwrap();
        expected.push(n);
    }

    let pattern = name(b"????????", b"???");
    let mut collect = |batch: u8| -> Vec<String> {
        let mut drv = RemoteDrive::with_config(
            LoopbackLink::new(Server::new(dir.path())),
            DriverConfig {
                files_batch: batch,
                ..Default::default()
            },
        );
        let mut out = Vec::new();
        let mut entry = drv.files(0x20, 0x300, &pattern);
        while let Ok(fi) = entry {
            out.push(String::from_utf8_lossy(fi.name_bytes()).into_owned());
            entry = drv.nfiles(0x300);
        }
        assert_eq!(drv.link_mut().server().enumeration_count(), 0);
        out
    };

    let unbatched = collect(1);
    let batched = collect(8);
    assert_eq!(unbatched, expected);
    assert_eq!(batched, expected);
}
