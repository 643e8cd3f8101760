//! Union/mount router.
//!
//! [`MountableFs`] composes multiple [`MemoryFs`] instances into one
//! namespace. Mount points live in an arena-backed segment tree; each node
//! records the instance owning its subtree and its depth below that
//! instance's mount point (`level` 0 = a mount boundary). Resolution walks
//! the tree while collapsing `.`/`..`; a `..` above a mount boundary
//! switches back to the parent instance. Any `.`/`..` left in the
//! sub-instance portion is then settled against that instance (only it
//! knows its own directories and symlinks), restarting from the outer tree
//! when a `..` escapes the mount.
//!
//! The router namespace has no cwd of its own: paths are interpreted as
//! absolute.

// RwLock.read()/write().unwrap() only panics on lock poisoning (prior panic
// while holding lock). This is intentional - corrupted state should not propagate.
#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::io::SeekFrom;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use crate::bitmap::IdPool;
use crate::error::{err, Errno, Result};
use crate::flags::{Access, OpenFlags};
use crate::limits::FsUsage;
use crate::memory::MemoryFs;
use crate::navigate::split_path;
use crate::node::{DirEntry, Stat};

struct MountNode {
    parent: usize,
    children: HashMap<String, usize>,
    fs: Arc<MemoryFs>,
    /// Depth below the node where `fs` was mounted; 0 = mount boundary.
    level: u32,
}

struct Router {
    /// Arena; index 0 is the namespace root.
    nodes: Vec<MountNode>,
    /// Normalized prefix rewrites, applied before mount resolution in
    /// insertion order (first match wins).
    redirects: Vec<(String, String)>,
    fds: HashMap<u32, RoutedFd>,
    fd_ids: IdPool,
}

#[derive(Clone)]
struct RoutedFd {
    fs: Arc<MemoryFs>,
    inner: u32,
}

/// Where a logical path landed: the owning instance, the outer path of that
/// instance's mount point, and the instance-relative path.
struct Target {
    fs: Arc<MemoryFs>,
    mount_path: Vec<String>,
    sub: String,
}

/// A union filesystem dispatching over mounted [`MemoryFs`] instances.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use memkit::{MemoryFs, MountableFs};
///
/// fn main() -> memkit::Result<()> {
///     let root = Arc::new(MemoryFs::new());
///     let data = Arc::new(MemoryFs::new());
///     data.write_file("/users.json", br#"["alice"]"#)?;
///
///     let union = MountableFs::new(root);
///     union.mount(data, "/mnt/data")?;
///
///     assert_eq!(union.read_file("/mnt/data/users.json")?, br#"["alice"]"#);
///     Ok(())
/// }
/// ```
pub struct MountableFs {
    state: RwLock<Router>,
}

impl MountableFs {
    /// Create a router over a root instance.
    pub fn new(root: Arc<MemoryFs>) -> Self {
        Self {
            state: RwLock::new(Router {
                nodes: vec![MountNode {
                    parent: 0,
                    children: HashMap::new(),
                    fs: root,
                    level: 0,
                }],
                redirects: Vec::new(),
                fds: HashMap::new(),
                fd_ids: IdPool::new(0).with_shrink(true),
            }),
        }
    }

    /// Mount an instance at an absolute path. Mounting the same prefix again
    /// replaces the backing instance for that subtree.
    pub fn mount(&self, fs: Arc<MemoryFs>, path: &str) -> Result<()> {
        let segs = mount_segments(path)?;
        fs_trace!(path, "mount");
        let mut st = self.state.write().unwrap();
        let mut node = 0usize;
        for seg in &segs {
            if let Some(&child) = st.nodes[node].children.get(seg) {
                node = child;
                continue;
            }
            let inherited_fs = st.nodes[node].fs.clone();
            let inherited_level = st.nodes[node].level + 1;
            let idx = st.nodes.len();
            st.nodes.push(MountNode {
                parent: node,
                children: HashMap::new(),
                fs: inherited_fs,
                level: inherited_level,
            });
            st.nodes[node].children.insert(seg.clone(), idx);
            node = idx;
        }
        st.nodes[node].fs = fs;
        st.nodes[node].level = 0;
        fixup_subtree(&mut st.nodes, node);
        Ok(())
    }

    /// Detach the instance mounted at `path`; the subtree falls back to the
    /// parent instance.
    pub fn unmount(&self, path: &str) -> Result<()> {
        let segs = mount_segments(path)?;
        let mut st = self.state.write().unwrap();
        let Some(node) = find_node(&st.nodes, &segs) else {
            return Err(err(Errno::EINVAL, "umount").with_path(path));
        };
        if node == 0 || st.nodes[node].level != 0 {
            return Err(err(Errno::EINVAL, "umount").with_path(path));
        }
        let parent = st.nodes[node].parent;
        let fs = st.nodes[parent].fs.clone();
        let level = st.nodes[parent].level + 1;
        st.nodes[node].fs = fs;
        st.nodes[node].level = level;
        fixup_subtree(&mut st.nodes, node);
        Ok(())
    }

    /// Install a path-prefix rewrite, evaluated before mount resolution.
    /// Redirects apply in insertion order; the first matching prefix wins.
    pub fn add_redirect(&self, from: &str, to: &str) -> Result<()> {
        if !from.starts_with('/') || !to.starts_with('/') {
            return Err(err(Errno::EINVAL, "mount").with_path(from).with_dest(to));
        }
        let from = normalize(from);
        let to = normalize(to);
        self.state.write().unwrap().redirects.push((from, to));
        Ok(())
    }

    fn redirect(&self, path: &str) -> String {
        let path = normalize(path);
        let st = self.state.read().unwrap();
        for (from, to) in &st.redirects {
            if path == *from {
                return to.clone();
            }
            let prefix = if from == "/" {
                "/".to_string()
            } else {
                format!("{from}/")
            };
            if let Some(rest) = path.strip_prefix(&prefix) {
                return if to == "/" {
                    format!("/{rest}")
                } else {
                    format!("{to}/{rest}")
                };
            }
        }
        path
    }

    /// Map a logical path to the backing instance that owns it and the path
    /// relative to that instance's root.
    fn resolve(&self, path: &str, syscall: &'static str) -> Result<Target> {
        let mut segs = split_path(&self.redirect(path));
        let st = self.state.read().unwrap();

        for _hop in 0..32 {
            // Walk the mount tree, collapsing ./.. against it; a `..` above
            // a boundary switches instances via the parent node.
            let mut node = 0usize;
            let mut canon: Vec<String> = Vec::new();
            let mut i = 0;
            while i < segs.len() {
                let s = &segs[i];
                if s == "." {
                    i += 1;
                    continue;
                }
                if s == ".." {
                    if !canon.is_empty() {
                        node = st.nodes[node].parent;
                        canon.pop();
                    }
                    i += 1;
                    continue;
                }
                match st.nodes[node].children.get(s) {
                    Some(&child) => {
                        node = child;
                        canon.push(s.clone());
                        i += 1;
                    }
                    None => break,
                }
            }
            let rest = &segs[i..];
            let level = st.nodes[node].level as usize;
            let mount_path: Vec<String> = canon[..canon.len() - level].to_vec();
            let mut pending: Vec<String> = canon[canon.len() - level..].to_vec();
            pending.extend(rest.iter().cloned());
            let fs = st.nodes[node].fs.clone();

            // Settle the sub-instance portion: only that instance can say
            // what `x/..` means when `x` might be a symlink.
            let mut resolved: Vec<String> = Vec::new();
            let mut j = 0;
            let mut escaped = false;
            let mut expansions = 0;
            while j < pending.len() {
                let s = pending[j].clone();
                if s == "." {
                    j += 1;
                    continue;
                }
                if s != ".." {
                    resolved.push(s);
                    j += 1;
                    continue;
                }
                if resolved.is_empty() {
                    // Crosses back out of this instance: restart above the
                    // mount point.
                    let mut outer = mount_path.clone();
                    outer.pop();
                    outer.extend(pending[j + 1..].iter().cloned());
                    segs = outer;
                    escaped = true;
                    break;
                }
                let link_path = format!("/{}", resolved.join("/"));
                match fs.readlink(&link_path) {
                    Ok(target) => {
                        expansions += 1;
                        if expansions > 32 {
                            return Err(err(Errno::ELOOP, syscall).with_path(path));
                        }
                        resolved.pop();
                        if target.starts_with('/') {
                            resolved.clear();
                        }
                        let mut spliced = split_path(&target);
                        spliced.push("..".to_string());
                        spliced.extend(pending[j + 1..].iter().cloned());
                        pending = spliced;
                        j = 0;
                    }
                    // Not a symlink: the pair collapses to nothing.
                    Err(e) if e.errno == Errno::EINVAL => {
                        resolved.pop();
                        j += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
            if escaped {
                continue;
            }
            return Ok(Target {
                fs,
                mount_path,
                sub: format!("/{}", resolved.join("/")),
            });
        }
        Err(err(Errno::ELOOP, syscall).with_path(path))
    }

    fn routed(&self, fd: u32, syscall: &'static str) -> Result<RoutedFd> {
        self.state
            .read()
            .unwrap()
            .fds
            .get(&fd)
            .cloned()
            .ok_or(err(Errno::EBADF, syscall))
    }

    /// Open through the union, recording which instance produced the
    /// descriptor so fd-indexed calls dispatch without re-resolving.
    pub fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> Result<u32> {
        let t = self.resolve(path, "open")?;
        let inner = t.fs.open(&t.sub, flags, mode)?;
        let mut st = self.state.write().unwrap();
        let fd = match st.fd_ids.allocate() {
            Ok(fd) => fd as u32,
            Err(_) => {
                drop(st);
                let _ = t.fs.close(inner);
                return Err(err(Errno::EFBIG, "open").with_path(path));
            }
        };
        st.fds.insert(
            fd,
            RoutedFd {
                fs: t.fs,
                inner,
            },
        );
        Ok(fd)
    }

    /// Close a routed descriptor.
    pub fn close(&self, fd: u32) -> Result<()> {
        let routed = {
            let mut st = self.state.write().unwrap();
            let routed = st.fds.remove(&fd).ok_or(err(Errno::EBADF, "close"))?;
            let _ = st.fd_ids.deallocate(fd as u64);
            routed
        };
        routed.fs.close(routed.inner)
    }

    /// Duplicate a routed descriptor.
    pub fn dup(&self, fd: u32) -> Result<u32> {
        let routed = self.routed(fd, "dup")?;
        let inner = routed.fs.dup(routed.inner)?;
        let mut st = self.state.write().unwrap();
        let new_fd = match st.fd_ids.allocate() {
            Ok(fd) => fd as u32,
            Err(_) => {
                drop(st);
                let _ = routed.fs.close(inner);
                return Err(err(Errno::EFBIG, "dup"));
            }
        };
        st.fds.insert(
            new_fd,
            RoutedFd {
                fs: routed.fs,
                inner,
            },
        );
        Ok(new_fd)
    }

    /// Read from a routed descriptor.
    pub fn read(&self, fd: u32, buf: &mut [u8], pos: Option<u64>) -> Result<usize> {
        let routed = self.routed(fd, "read")?;
        routed.fs.read(routed.inner, buf, pos)
    }

    /// Write to a routed descriptor.
    pub fn write(&self, fd: u32, data: &[u8], pos: Option<u64>) -> Result<usize> {
        let routed = self.routed(fd, "write")?;
        routed.fs.write(routed.inner, data, pos)
    }

    /// Reposition a routed descriptor.
    pub fn seek(&self, fd: u32, from: SeekFrom) -> Result<u64> {
        let routed = self.routed(fd, "lseek")?;
        routed.fs.seek(routed.inner, from)
    }

    /// Stat a routed descriptor.
    pub fn fstat(&self, fd: u32) -> Result<Stat> {
        let routed = self.routed(fd, "fstat")?;
        routed.fs.fstat(routed.inner)
    }

    /// Truncate a routed descriptor.
    pub fn ftruncate(&self, fd: u32, len: u64) -> Result<()> {
        let routed = self.routed(fd, "ftruncate")?;
        routed.fs.ftruncate(routed.inner, len)
    }

    /// Change permission bits on a routed descriptor.
    pub fn fchmod(&self, fd: u32, mode: u32) -> Result<()> {
        let routed = self.routed(fd, "fchmod")?;
        routed.fs.fchmod(routed.inner, mode)
    }

    /// Change ownership on a routed descriptor.
    pub fn fchown(&self, fd: u32, uid: u32, gid: u32) -> Result<()> {
        let routed = self.routed(fd, "fchown")?;
        routed.fs.fchown(routed.inner, uid, gid)
    }

    /// Stat a path, following symlinks.
    pub fn stat(&self, path: &str) -> Result<Stat> {
        let t = self.resolve(path, "stat")?;
        t.fs.stat(&t.sub)
    }

    /// Stat a path without following a final symlink.
    pub fn lstat(&self, path: &str) -> Result<Stat> {
        let t = self.resolve(path, "lstat")?;
        t.fs.lstat(&t.sub)
    }

    /// Check the caller's permissions on a path.
    pub fn access(&self, path: &str, mode: Access) -> Result<()> {
        let t = self.resolve(path, "access")?;
        t.fs.access(&t.sub, mode)
    }

    /// Whether a path resolves to anything.
    pub fn exists(&self, path: &str) -> bool {
        self.access(path, Access::EXISTS).is_ok()
    }

    /// List a directory, merging in the names of any mount points rooted
    /// exactly there (deduplicated, sorted).
    pub fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let t = self.resolve(path, "scandir")?;
        let mut logical = t.mount_path.clone();
        logical.extend(split_path(&t.sub));
        let mounted: Vec<(String, Arc<MemoryFs>)> = {
            let st = self.state.read().unwrap();
            match find_node(&st.nodes, &logical) {
                Some(node) => st.nodes[node]
                    .children
                    .iter()
                    .map(|(name, &child)| (name.clone(), st.nodes[child].fs.clone()))
                    .collect(),
                None => Vec::new(),
            }
        };
        let mut entries = match t.fs.readdir(&t.sub) {
            Ok(entries) => entries,
            // A mount point does not need a backing directory.
            Err(e) if e.errno == Errno::ENOENT && !mounted.is_empty() => Vec::new(),
            Err(e) => return Err(e),
        };
        for (name, child_fs) in mounted {
            if !entries.iter().any(|e| e.name == name) {
                entries.push(DirEntry {
                    name,
                    stat: child_fs.stat("/")?,
                });
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Create a directory.
    pub fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        let t = self.resolve(path, "mkdir")?;
        t.fs.mkdir(&t.sub, mode)
    }

    /// Remove an empty directory. The root of a mounted instance reports
    /// `EBUSY`.
    pub fn rmdir(&self, path: &str) -> Result<()> {
        let t = self.resolve(path, "rmdir")?;
        t.fs.rmdir(&t.sub)
    }

    /// Remove a file or symlink.
    pub fn unlink(&self, path: &str) -> Result<()> {
        let t = self.resolve(path, "unlink")?;
        t.fs.unlink(&t.sub)
    }

    /// Create a hardlink. Both names must land in the same instance.
    pub fn link(&self, existing: &str, new: &str) -> Result<()> {
        let a = self.resolve(existing, "link")?;
        let b = self.resolve(new, "link")?;
        if !Arc::ptr_eq(&a.fs, &b.fs) {
            return Err(err(Errno::EBUSY, "link").with_path(existing).with_dest(new));
        }
        a.fs.link(&a.sub, &b.sub)
    }

    /// Create a symlink at `link`. The target text is stored verbatim.
    pub fn symlink(&self, target: &str, link: &str) -> Result<()> {
        let t = self.resolve(link, "symlink")?;
        t.fs.symlink(target, &t.sub)
    }

    /// Read a symlink's target.
    pub fn readlink(&self, path: &str) -> Result<String> {
        let t = self.resolve(path, "readlink")?;
        t.fs.readlink(&t.sub)
    }

    /// Rename within one instance; crossing a mount boundary fails `EBUSY`.
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let a = self.resolve(from, "rename")?;
        let b = self.resolve(to, "rename")?;
        if !Arc::ptr_eq(&a.fs, &b.fs) {
            return Err(err(Errno::EBUSY, "rename").with_path(from).with_dest(to));
        }
        a.fs.rename(&a.sub, &b.sub)
    }

    /// Copy a file. Across instances the copy streams through read/write; a
    /// destination that did not previously exist is removed again if the
    /// copy fails partway.
    pub fn copy_file(&self, from: &str, to: &str) -> Result<()> {
        let a = self.resolve(from, "copyfile")?;
        let b = self.resolve(to, "copyfile")?;
        if Arc::ptr_eq(&a.fs, &b.fs) {
            return a.fs.copy_file(&a.sub, &b.sub);
        }
        let existed = b.fs.lstat(&b.sub).is_ok();
        let data = a.fs.read_file(&a.sub)?;
        let mode = a.fs.stat(&a.sub)?.perms();
        let result = (|| {
            let flags = OpenFlags::WRONLY | OpenFlags::CREAT | OpenFlags::TRUNC;
            let fd = b.fs.open(&b.sub, flags, mode)?;
            let written = b.fs.write(fd, &data, None);
            let _ = b.fs.close(fd);
            written.map(drop)
        })();
        if result.is_err() && !existed {
            let _ = b.fs.unlink(&b.sub);
        }
        result
    }

    /// Truncate a file to `len` bytes.
    pub fn truncate(&self, path: &str, len: u64) -> Result<()> {
        let t = self.resolve(path, "truncate")?;
        t.fs.truncate(&t.sub, len)
    }

    /// Change permission bits, following symlinks.
    pub fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        let t = self.resolve(path, "chmod")?;
        t.fs.chmod(&t.sub, mode)
    }

    /// Change permission bits without following a final symlink.
    pub fn lchmod(&self, path: &str, mode: u32) -> Result<()> {
        let t = self.resolve(path, "lchmod")?;
        t.fs.lchmod(&t.sub, mode)
    }

    /// Change ownership, following symlinks.
    pub fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        let t = self.resolve(path, "chown")?;
        t.fs.chown(&t.sub, uid, gid)
    }

    /// Change ownership without following a final symlink.
    pub fn lchown(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        let t = self.resolve(path, "lchown")?;
        t.fs.lchown(&t.sub, uid, gid)
    }

    /// Set access and modification times.
    pub fn utimes(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> Result<()> {
        let t = self.resolve(path, "utime")?;
        t.fs.utimes(&t.sub, atime, mtime)
    }

    /// Canonicalize a path, re-prefixed with the mount point it landed in.
    pub fn realpath(&self, path: &str) -> Result<String> {
        let t = self.resolve(path, "realpath")?;
        let sub_real = t.fs.realpath(&t.sub)?;
        let mut full = t.mount_path;
        full.extend(split_path(&sub_real));
        Ok(format!("/{}", full.join("/")))
    }

    /// Read a whole file.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let t = self.resolve(path, "open")?;
        t.fs.read_file(&t.sub)
    }

    /// Create or replace a whole file.
    pub fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let t = self.resolve(path, "open")?;
        t.fs.write_file(&t.sub, data)
    }

    /// Append to a file, creating it if missing.
    pub fn append_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let t = self.resolve(path, "open")?;
        t.fs.append_file(&t.sub, data)
    }

    /// Aggregate usage across the root and every mounted instance.
    pub fn usage(&self) -> FsUsage {
        let st = self.state.read().unwrap();
        let mut seen: Vec<*const MemoryFs> = Vec::new();
        let mut total = FsUsage::default();
        for node in &st.nodes {
            let ptr = Arc::as_ptr(&node.fs);
            if seen.contains(&ptr) {
                continue;
            }
            seen.push(ptr);
            let usage = node.fs.usage();
            total.total_bytes += usage.total_bytes;
            total.file_count += usage.file_count;
            total.dir_count += usage.dir_count;
            total.symlink_count += usage.symlink_count;
        }
        total
    }
}

/// Validate and split a mount path: absolute, no `.`/`..` segments.
fn mount_segments(path: &str) -> Result<Vec<String>> {
    if !path.starts_with('/') {
        return Err(err(Errno::EINVAL, "mount").with_path(path));
    }
    let segs = split_path(path);
    if segs.iter().any(|s| s == "." || s == "..") {
        return Err(err(Errno::EINVAL, "mount").with_path(path));
    }
    Ok(segs)
}

fn normalize(path: &str) -> String {
    format!("/{}", split_path(path).join("/"))
}

/// Exact tree lookup (no instance dispatch).
fn find_node(nodes: &[MountNode], segs: &[String]) -> Option<usize> {
    let mut node = 0usize;
    for seg in segs {
        node = *nodes[node].children.get(seg)?;
    }
    Some(node)
}

/// After a mount or unmount, re-derive the instance and level of every
/// descendant that is not itself a mount boundary.
fn fixup_subtree(nodes: &mut Vec<MountNode>, from: usize) {
    let mut work: Vec<usize> = nodes[from].children.values().copied().collect();
    while let Some(idx) = work.pop() {
        if nodes[idx].level == 0 {
            continue;
        }
        let parent = nodes[idx].parent;
        let fs = nodes[parent].fs.clone();
        let level = nodes[parent].level + 1;
        nodes[idx].fs = fs;
        nodes[idx].level = level;
        work.extend(nodes[idx].children.values().copied());
    }
}
