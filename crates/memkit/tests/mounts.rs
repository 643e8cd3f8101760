//! Union/mount behavior across engine instances.

use std::sync::Arc;

use pretty_assertions::assert_eq;

use memkit::{Errno, FileSystem, MemoryFs, MountableFs, OpenFlags};

fn union_with_mount() -> (MountableFs, Arc<MemoryFs>, Arc<MemoryFs>) {
    let root = Arc::new(MemoryFs::new());
    let mounted = Arc::new(MemoryFs::new());
    let union = MountableFs::new(root.clone());
    union.mount(mounted.clone(), "/mnt").unwrap();
    (union, root, mounted)
}

#[test]
fn mounted_instance_is_listed_but_isolated() {
    let (union, root, mounted) = union_with_mount();
    root.write_file("/own.txt", b"root data").unwrap();

    let names: Vec<String> = union.readdir("/").unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["mnt".to_string(), "own.txt".to_string()]);

    union.write_file("/mnt/x", b"y").unwrap();
    // The write landed in the mounted instance only.
    assert_eq!(mounted.read_file("/x").unwrap(), b"y");
    assert!(root.stat("/x").is_err());
    assert!(root.stat("/mnt").is_err());
}

#[test]
fn three_level_union() {
    let root = Arc::new(MemoryFs::new());
    let middle = Arc::new(MemoryFs::new());
    let deep = Arc::new(MemoryFs::new());
    root.write_file("/at-root", b"0").unwrap();
    middle.write_file("/at-middle", b"1").unwrap();
    deep.write_file("/at-deep", b"2").unwrap();

    let union = MountableFs::new(root);
    union.mount(middle, "/m").unwrap();
    union.mount(deep, "/m/d").unwrap();

    assert_eq!(union.read_file("/at-root").unwrap(), b"0");
    assert_eq!(union.read_file("/m/at-middle").unwrap(), b"1");
    assert_eq!(union.read_file("/m/d/at-deep").unwrap(), b"2");

    // The middle instance lists the deep mount point.
    let names: Vec<String> = union.readdir("/m").unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["at-middle".to_string(), "d".to_string()]);
}

#[test]
fn deep_mount_point_creates_intermediate_segments() {
    let root = Arc::new(MemoryFs::new());
    let data = Arc::new(MemoryFs::new());
    data.write_file("/f", b"deep").unwrap();

    let union = MountableFs::new(root.clone());
    union.mount(data, "/srv/app/data").unwrap();

    // Intermediate segments belong to the parent instance; the final one is
    // the mounted fs.
    assert_eq!(union.read_file("/srv/app/data/f").unwrap(), b"deep");
    let names: Vec<String> = union.readdir("/").unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["srv".to_string()]);
    let names: Vec<String> = union.readdir("/srv/app").unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["data".to_string()]);
}

#[test]
fn fd_operations_follow_their_instance() {
    let (union, _root, mounted) = union_with_mount();
    mounted.write_file("/f", b"0123456789").unwrap();

    let fd = union.open("/mnt/f", "r+".parse().unwrap(), 0).unwrap();
    let mut buf = [0u8; 4];
    union.read(fd, &mut buf, None).unwrap();
    assert_eq!(&buf, b"0123");

    union.write(fd, b"XX", Some(8)).unwrap();
    union.ftruncate(fd, 9).unwrap();
    assert_eq!(union.fstat(fd).unwrap().size, 9);
    union.close(fd).unwrap();

    assert_eq!(mounted.read_file("/f").unwrap(), b"01234567X");
}

#[test]
fn closing_invalidates_the_router_fd() {
    let (union, _, _) = union_with_mount();
    let fd = union.open("/f", "w".parse().unwrap(), 0o644).unwrap();
    union.close(fd).unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(union.read(fd, &mut buf, None).unwrap_err().errno, Errno::EBADF);
    assert_eq!(union.close(fd).unwrap_err().errno, Errno::EBADF);
}

#[test]
fn dup_through_the_router() {
    let (union, _, _) = union_with_mount();
    union.write_file("/mnt/f", b"abcd").unwrap();

    let fd = union.open("/mnt/f", OpenFlags::RDONLY, 0).unwrap();
    let dup = union.dup(fd).unwrap();

    let mut buf = [0u8; 2];
    union.read(fd, &mut buf, None).unwrap();
    assert_eq!(&buf, b"ab");
    // The duplicate starts from the same offset it was duplicated at.
    union.read(dup, &mut buf, None).unwrap();
    assert_eq!(&buf, b"cd");

    union.close(fd).unwrap();
    union.close(dup).unwrap();
}

#[test]
fn cross_instance_copy_and_same_instance_rename() {
    let (union, _root, mounted) = union_with_mount();
    union.write_file("/src", b"bytes").unwrap();

    union.copy_file("/src", "/mnt/dst").unwrap();
    assert_eq!(mounted.read_file("/dst").unwrap(), b"bytes");

    union.rename("/mnt/dst", "/mnt/renamed").unwrap();
    assert_eq!(union.read_file("/mnt/renamed").unwrap(), b"bytes");
    assert_eq!(union.rename("/src", "/mnt/back").unwrap_err().errno, Errno::EBUSY);
}

#[test]
fn symlinks_resolve_inside_their_instance() {
    let (union, _, mounted) = union_with_mount();
    mounted.mkdir("/real", 0o755).unwrap();
    mounted.write_file("/real/f", b"via mount").unwrap();
    mounted.symlink("/real", "/alias").unwrap();

    assert_eq!(union.read_file("/mnt/alias/f").unwrap(), b"via mount");
    assert_eq!(union.realpath("/mnt/alias/f").unwrap(), "/mnt/real/f");
}

#[test]
fn dotdot_walks_out_of_nested_mounts() {
    let root = Arc::new(MemoryFs::new());
    let inner = Arc::new(MemoryFs::new());
    root.write_file("/escape.txt", b"out").unwrap();

    let union = MountableFs::new(root);
    union.mount(inner, "/a/b").unwrap();

    assert_eq!(union.read_file("/a/b/../../escape.txt").unwrap(), b"out");
}

#[test]
fn redirect_then_mount_resolution() {
    let (union, root, mounted) = union_with_mount();
    root.write_file("/plain", b"root").unwrap();
    mounted.write_file("/cfg", b"mounted cfg").unwrap();

    union.add_redirect("/config", "/mnt").unwrap();
    assert_eq!(union.read_file("/config/cfg").unwrap(), b"mounted cfg");
    // Unrelated paths are untouched.
    assert_eq!(union.read_file("/plain").unwrap(), b"root");
}

#[tokio::test]
async fn union_behind_the_async_trait() {
    let (union, _, _) = union_with_mount();
    let fs: Arc<dyn FileSystem> = Arc::new(union);

    fs.write_file("/mnt/async.txt", b"scheduled").await.unwrap();
    assert_eq!(fs.read_file("/mnt/async.txt").await.unwrap(), b"scheduled");
    let entries = fs.readdir("/mnt").await.unwrap();
    assert_eq!(entries.len(), 1);
}
