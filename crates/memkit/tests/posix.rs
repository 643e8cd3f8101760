//! End-to-end POSIX semantics over a single volume.

use std::io::SeekFrom;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use pretty_assertions::assert_eq;

use memkit::{
    makedev, Access, CharDevice, Errno, FileContent, FsLimits, MemoryFs, NodeInit, OpenFlags,
    Result,
};

#[test]
fn mkdir_write_read_listdir() {
    let fs = MemoryFs::new();
    fs.mkdir("/d", 0o755).unwrap();
    fs.write_file("/d/f.txt", b"hi").unwrap();

    assert_eq!(fs.read_file("/d/f.txt").unwrap(), b"hi");
    let names: Vec<String> = fs.readdir("/d").unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["f.txt".to_string()]);
}

#[test]
fn symlink_follows_on_stat_not_on_lstat() {
    let fs = MemoryFs::new();
    fs.mkdir("/d", 0o755).unwrap();
    fs.symlink("/d", "/link").unwrap();

    assert_eq!(fs.readlink("/link").unwrap(), "/d");
    let followed = fs.stat("/link").unwrap();
    assert!(followed.is_dir());
    assert_eq!(followed.ino, fs.stat("/d").unwrap().ino);
    assert!(fs.lstat("/link").unwrap().is_symlink());
}

#[test]
fn symlink_cycle_fails_with_eloop() {
    let fs = MemoryFs::new();
    fs.symlink("/b", "/a").unwrap();
    fs.symlink("/a", "/b").unwrap();

    let e = fs.open("/a", OpenFlags::RDONLY, 0).unwrap_err();
    assert_eq!(e.errno, Errno::ELOOP);
}

#[test]
fn exclusive_create_conflicts_until_unlink() {
    let fs = MemoryFs::new();
    let wx: OpenFlags = "wx".parse().unwrap();

    let fd = fs.open("/f", wx, 0o644).unwrap();
    fs.close(fd).unwrap();
    assert_eq!(fs.open("/f", wx, 0o644).unwrap_err().errno, Errno::EEXIST);

    fs.unlink("/f").unwrap();
    let fd = fs.open("/f", wx, 0o644).unwrap();
    fs.close(fd).unwrap();
}

#[test]
fn rmdir_enotempty_then_success_then_enoent() {
    let fs = MemoryFs::new();
    fs.mkdir("/d", 0o755).unwrap();
    fs.write_file("/d/entry", b"x").unwrap();

    assert_eq!(fs.rmdir("/d").unwrap_err().errno, Errno::ENOTEMPTY);
    fs.unlink("/d/entry").unwrap();
    fs.rmdir("/d").unwrap();
    assert_eq!(fs.stat("/d").unwrap_err().errno, Errno::ENOENT);
}

#[test]
fn link_count_invariant_for_directories() {
    let fs = MemoryFs::new();
    // A directory's nlink is one (its own name) plus one per subdirectory.
    fs.mkdir("/p", 0o755).unwrap();
    assert_eq!(fs.stat("/p").unwrap().nlink, 1);

    fs.mkdir("/p/a", 0o755).unwrap();
    fs.mkdir("/p/b", 0o755).unwrap();
    fs.write_file("/p/file", b"not a dir").unwrap();
    assert_eq!(fs.stat("/p").unwrap().nlink, 3);

    fs.rmdir("/p/a").unwrap();
    assert_eq!(fs.stat("/p").unwrap().nlink, 2);

    // The root self-counts through its own `..`.
    let root = fs.stat("/").unwrap();
    assert_eq!(root.nlink, 3); // itself + /p
}

#[test]
fn link_count_invariant_for_files() {
    let fs = MemoryFs::new();
    fs.write_file("/a", b"x").unwrap();
    assert_eq!(fs.stat("/a").unwrap().nlink, 1);
    fs.link("/a", "/b").unwrap();
    fs.link("/a", "/c").unwrap();
    assert_eq!(fs.stat("/c").unwrap().nlink, 3);
    fs.unlink("/b").unwrap();
    assert_eq!(fs.stat("/a").unwrap().nlink, 2);
}

#[test]
fn inode_numbers_are_recycled_after_collection() {
    let fs = MemoryFs::new();
    fs.write_file("/f", b"x").unwrap();
    let ino = fs.stat("/f").unwrap().ino;
    fs.unlink("/f").unwrap();
    fs.write_file("/g", b"y").unwrap();
    assert_eq!(fs.stat("/g").unwrap().ino, ino);
}

#[test]
fn descriptors_share_one_buffer() {
    let fs = MemoryFs::new();
    fs.write_file("/f", b"aaaa").unwrap();
    let a = fs.open("/f", "r+".parse().unwrap(), 0).unwrap();
    let b = fs.dup(a).unwrap();

    fs.write(a, b"zz", Some(0)).unwrap();
    let mut buf = [0u8; 4];
    fs.read(b, &mut buf, None).unwrap();
    assert_eq!(&buf, b"zzaa");

    fs.close(a).unwrap();
    fs.close(b).unwrap();
}

#[test]
fn seek_set_cur_end() {
    let fs = MemoryFs::new();
    fs.write_file("/f", b"0123456789").unwrap();
    let fd = fs.open("/f", OpenFlags::RDONLY, 0).unwrap();

    assert_eq!(fs.seek(fd, SeekFrom::Start(4)).unwrap(), 4);
    assert_eq!(fs.seek(fd, SeekFrom::Current(2)).unwrap(), 6);
    assert_eq!(fs.seek(fd, SeekFrom::End(-1)).unwrap(), 9);

    let mut buf = [0u8; 1];
    fs.read(fd, &mut buf, None).unwrap();
    assert_eq!(&buf, b"9");
    fs.close(fd).unwrap();
}

#[test]
fn permission_checks_cover_each_class() {
    let fs = MemoryFs::new();
    fs.write_file("/f", b"x").unwrap();
    fs.chown("/f", 1000, 100).unwrap();
    fs.chmod("/f", 0o640).unwrap();

    fs.set_caller(1000, 100);
    assert!(fs.access("/f", Access::READ | Access::WRITE).is_ok());

    fs.set_caller(2000, 100);
    assert!(fs.access("/f", Access::READ).is_ok());
    assert_eq!(fs.access("/f", Access::WRITE).unwrap_err().errno, Errno::EACCES);

    fs.set_caller(2000, 200);
    assert_eq!(fs.access("/f", Access::READ).unwrap_err().errno, Errno::EACCES);

    // uid 0 bypasses everything.
    fs.set_caller(0, 0);
    assert!(fs.access("/f", Access::READ | Access::WRITE).is_ok());
}

#[test]
fn open_creation_needs_parent_write_permission() {
    let fs = MemoryFs::new();
    fs.mkdir("/ro", 0o555).unwrap();
    fs.set_caller(1000, 1000);
    let e = fs.write_file("/ro/f", b"x").unwrap_err();
    assert_eq!(e.errno, Errno::EACCES);
}

/// A device that records its hook calls.
struct Recorder {
    opens: AtomicU32,
    closes: AtomicU32,
}

impl CharDevice for Recorder {
    fn open(&self, _fd: u32) -> Result<()> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self, _fd: u32) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read(&self, _fd: u32, buf: &mut [u8], _pos: Option<u64>) -> Result<usize> {
        buf.fill(b'r');
        Ok(buf.len())
    }

    fn write(&self, _fd: u32, buf: &[u8], _pos: Option<u64>) -> Result<usize> {
        Ok(buf.len())
    }
}

#[test]
fn character_device_dispatches_hooks() {
    let fs = MemoryFs::new();
    let dev = Arc::new(Recorder {
        opens: AtomicU32::new(0),
        closes: AtomicU32::new(0),
    });
    let (major_no, minor_no) = fs.register_device(dev.clone(), None, None).unwrap();
    fs.mknod("/dev_r", 0o666, makedev(major_no, minor_no)).unwrap();

    assert!(fs.stat("/dev_r").unwrap().is_char_device());

    let fd = fs.open("/dev_r", "r+".parse().unwrap(), 0).unwrap();
    assert_eq!(dev.opens.load(Ordering::SeqCst), 1);

    let mut buf = [0u8; 3];
    assert_eq!(fs.read(fd, &mut buf, None).unwrap(), 3);
    assert_eq!(&buf, b"rrr");
    assert_eq!(fs.write(fd, b"ignored", None).unwrap(), 7);

    // The recorder has no seek hook.
    assert_eq!(fs.seek(fd, SeekFrom::Start(1)).unwrap_err().errno, Errno::ESPIPE);

    fs.close(fd).unwrap();
    assert_eq!(dev.closes.load(Ordering::SeqCst), 1);
}

#[test]
fn unregistered_device_fails_enxio() {
    let fs = MemoryFs::new();
    fs.mknod("/dev_phantom", 0o666, makedev(42, 0)).unwrap();
    let e = fs.open("/dev_phantom", OpenFlags::RDONLY, 0).unwrap_err();
    assert_eq!(e.errno, Errno::ENXIO);
}

#[test]
fn archive_population_builds_a_lazy_tree() {
    // The seam an archive decoder uses: unlinked inodes attached by hand,
    // file bytes deferred behind loaders.
    let fs = MemoryFs::new();
    let root = fs.stat("/").unwrap().ino;

    let dir = fs.create_inode(NodeInit::Directory, 0o755, None, None).unwrap();
    fs.add_entry(root, "bundle", dir).unwrap();

    let file = fs
        .create_inode(
            NodeInit::File(FileContent::Lazy {
                load: Arc::new(|| b"inflated bytes".to_vec()),
                size: 14,
            }),
            0o644,
            Some(1000),
            Some(1000),
        )
        .unwrap();
    fs.add_entry(dir, "payload.bin", file).unwrap();

    let stat = fs.stat("/bundle/payload.bin").unwrap();
    assert_eq!(stat.size, 14);
    assert_eq!(stat.uid, 1000);
    assert_eq!(fs.read_file("/bundle/payload.bin").unwrap(), b"inflated bytes");
}

#[test]
fn error_objects_carry_code_syscall_and_paths() {
    let fs = MemoryFs::new();

    let e = fs.read_file("/missing").unwrap_err();
    assert_eq!(e.errno, Errno::ENOENT);
    assert_eq!(e.syscall, "open");
    assert_eq!(e.path.as_deref(), Some("/missing"));
    assert_eq!(e.to_string(), "ENOENT: no such file or directory, open '/missing'");

    // readdir reports as scandir.
    let e = fs.readdir("/missing").unwrap_err();
    assert_eq!(e.syscall, "scandir");

    fs.mkdir("/a", 0o755).unwrap();
    fs.mkdir("/b", 0o755).unwrap();
    fs.write_file("/b/f", b"x").unwrap();
    let e = fs.rename("/a", "/b").unwrap_err();
    assert_eq!(e.errno, Errno::ENOTEMPTY);
    assert_eq!(e.path.as_deref(), Some("/a"));
    assert_eq!(e.dest.as_deref(), Some("/b"));
}

#[test]
fn write_past_limits_reports_efbig() {
    let fs = MemoryFs::builder()
        .limits(FsLimits::new().max_file_size(8).max_total_bytes(12))
        .build();

    fs.write_file("/a", b"12345678").unwrap();
    assert_eq!(fs.write_file("/b", b"123456789").unwrap_err().errno, Errno::EFBIG);

    // Within the file limit but past the volume budget.
    assert_eq!(fs.write_file("/c", b"12345678").unwrap_err().errno, Errno::EFBIG);
    fs.write_file("/d", b"1234").unwrap();
}

#[test]
fn deep_paths_resolve_and_collapse() {
    let fs = MemoryFs::new();
    fs.mkdir("/a", 0o755).unwrap();
    fs.mkdir("/a/b", 0o755).unwrap();
    fs.mkdir("/a/b/c", 0o755).unwrap();
    fs.write_file("/a/b/c/f", b"deep").unwrap();

    assert_eq!(fs.read_file("/a/./b/../b/c/f").unwrap(), b"deep");
    assert_eq!(fs.realpath("/a/b/../b/./c").unwrap(), "/a/b/c");
    assert_eq!(fs.realpath("/../../a").unwrap(), "/a");
}

#[test]
fn dangling_symlink_stat_vs_create_through_it() {
    let fs = MemoryFs::new();
    fs.symlink("/target", "/link").unwrap();

    assert_eq!(fs.stat("/link").unwrap_err().errno, Errno::ENOENT);
    assert!(fs.lstat("/link").unwrap().is_symlink());

    // O_CREAT through a dangling symlink creates the target.
    fs.write_file("/link", b"created").unwrap();
    assert_eq!(fs.read_file("/target").unwrap(), b"created");
}
