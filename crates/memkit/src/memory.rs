//! In-memory filesystem facade.
//!
//! [`MemoryFs`] owns one volume: an inode table, a descriptor table, a
//! device registry, and the caller's identity and cwd. Every syscall locks
//! the volume, runs to completion, and unlocks, so each call is atomic with
//! respect to every other call on the same instance; there are no internal
//! suspension points.

// RwLock.read()/write().unwrap() only panics on lock poisoning (prior panic
// while holding lock). This is intentional - corrupted state should not propagate.
#![allow(clippy::unwrap_used)]

use std::io::SeekFrom;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use crate::device::{CharDevice, DeviceRegistry};
use crate::error::{err, Errno, Result};
use crate::fd::{read_from_content, seek_pos, write_to_content, FdTable};
use crate::flags::{Access, OpenFlags};
use crate::inodes::{replace_content, InodeTable};
use crate::limits::{FsLimits, FsUsage};
use crate::navigate::{navigate, NavCtx, Resolved};
use crate::node::{DirEntry, FileContent, Ino, NodeInit, NodeKind, Stat};

pub(crate) struct Volume {
    pub inodes: InodeTable,
    pub fds: FdTable,
    pub devices: DeviceRegistry,
    pub root: Ino,
    pub cwd: Ino,
    pub cwd_stack: Vec<String>,
    pub uid: u32,
    pub gid: u32,
    pub limits: FsLimits,
}

/// An in-memory POSIX filesystem.
///
/// # Example
///
/// ```rust
/// use memkit::MemoryFs;
///
/// fn main() -> memkit::Result<()> {
///     let fs = MemoryFs::new();
///     fs.mkdir("/d", 0o755)?;
///     fs.write_file("/d/f.txt", b"hi")?;
///     assert_eq!(fs.read_file("/d/f.txt")?, b"hi");
///     Ok(())
/// }
/// ```
pub struct MemoryFs {
    vol: RwLock<Volume>,
}

/// Builder for a customized [`MemoryFs`].
#[derive(Default)]
pub struct MemoryFsBuilder {
    uid: u32,
    gid: u32,
    limits: Option<FsLimits>,
}

impl MemoryFsBuilder {
    /// Set the caller's effective user id (default 0).
    pub fn uid(mut self, uid: u32) -> Self {
        self.uid = uid;
        self
    }

    /// Set the caller's effective group id (default 0).
    pub fn gid(mut self, gid: u32) -> Self {
        self.gid = gid;
        self
    }

    /// Set the volume's resource limits.
    pub fn limits(mut self, limits: FsLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    /// Build the filesystem: a root directory owned by the configured ids,
    /// with the cwd at `/`.
    pub fn build(self) -> MemoryFs {
        let mut inodes = InodeTable::new();
        let root = inodes.init_root(0o755, self.uid, self.gid);
        // The cwd pointer holds one private reference for its lifetime.
        inodes.ref_node(root);
        MemoryFs {
            vol: RwLock::new(Volume {
                inodes,
                fds: FdTable::new(),
                devices: DeviceRegistry::new(),
                root,
                cwd: root,
                cwd_stack: Vec::new(),
                uid: self.uid,
                gid: self.gid,
                limits: self.limits.unwrap_or_default(),
            }),
        }
    }
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

enum Probe {
    File { size: u64 },
    Directory,
    Symlink,
    Device { rdev: u64 },
}

impl Volume {
    fn nav(&self, path: &str, resolve_last: bool, syscall: &'static str) -> Result<Resolved> {
        let ctx = NavCtx {
            table: &self.inodes,
            root: self.root,
            cwd: self.cwd,
            cwd_stack: &self.cwd_stack,
            uid: self.uid,
            gid: self.gid,
        };
        navigate(&ctx, path, resolve_last, syscall)
    }

    fn require(&self, res: &Resolved, path: &str, syscall: &'static str) -> Result<Ino> {
        res.target
            .ok_or_else(|| err(Errno::ENOENT, syscall).with_path(path))
    }

    fn check_access(&self, ino: Ino, want: Access, path: &str, syscall: &'static str) -> Result<()> {
        if self.uid == 0 {
            return Ok(());
        }
        let node = self
            .inodes
            .get(ino)
            .ok_or_else(|| err(Errno::ENOENT, syscall).with_path(path))?;
        if !node.allows(self.uid, self.gid, want) {
            return Err(err(Errno::EACCES, syscall).with_path(path));
        }
        Ok(())
    }

    fn check_owner(&self, ino: Ino, path: &str, syscall: &'static str) -> Result<()> {
        if self.uid == 0 {
            return Ok(());
        }
        let node = self
            .inodes
            .get(ino)
            .ok_or_else(|| err(Errno::ENOENT, syscall).with_path(path))?;
        if node.uid != self.uid {
            return Err(err(Errno::EPERM, syscall).with_path(path));
        }
        Ok(())
    }

    /// A directory that has lost its last name entry cannot take new
    /// children.
    fn check_parent_linked(&self, dir: Ino, path: &str, syscall: &'static str) -> Result<()> {
        let node = self
            .inodes
            .get(dir)
            .ok_or_else(|| err(Errno::ENOENT, syscall).with_path(path))?;
        if dir != self.root && node.nlink == 0 {
            return Err(err(Errno::ENOENT, syscall).with_path(path));
        }
        Ok(())
    }

    fn probe(&self, ino: Ino, syscall: &'static str) -> Result<Probe> {
        let node = self.inodes.get(ino).ok_or(err(Errno::EBADF, syscall))?;
        Ok(match &node.kind {
            NodeKind::File { content } => Probe::File {
                size: content.size(),
            },
            NodeKind::Directory { .. } => Probe::Directory,
            NodeKind::Symlink { .. } => Probe::Symlink,
            NodeKind::CharDevice { rdev } => Probe::Device { rdev: *rdev },
        })
    }

    fn open_inner(&mut self, path: &str, flags: OpenFlags, mode: u32) -> Result<u32> {
        let syscall = "open";
        let follow = !flags.contains(OpenFlags::NOFOLLOW);
        let res = self.nav(path, follow, syscall)?;

        let ino = match res.target {
            None => {
                if !res.remaining.is_empty() || !flags.contains(OpenFlags::CREAT) {
                    return Err(err(Errno::ENOENT, syscall).with_path(path));
                }
                self.check_parent_linked(res.dir, path, syscall)?;
                self.check_access(res.dir, Access::WRITE, path, syscall)?;
                let ino = self.inodes.create(
                    NodeInit::File(FileContent::empty()),
                    mode,
                    self.uid,
                    self.gid,
                    syscall,
                )?;
                self.inodes.add_link(res.dir, &res.name, ino);
                ino
            }
            Some(ino) => {
                if flags.contains(OpenFlags::CREAT | OpenFlags::EXCL) {
                    return Err(err(Errno::EEXIST, syscall).with_path(path));
                }
                match self.probe(ino, syscall)? {
                    Probe::Symlink => {
                        // Only reachable with O_NOFOLLOW.
                        return Err(err(Errno::ELOOP, syscall).with_path(path));
                    }
                    Probe::Directory => {
                        if flags.writable() {
                            return Err(err(Errno::EISDIR, syscall).with_path(path));
                        }
                    }
                    Probe::File { .. } | Probe::Device { .. } => {
                        if flags.contains(OpenFlags::DIRECTORY) {
                            return Err(err(Errno::ENOTDIR, syscall).with_path(path));
                        }
                    }
                }
                if flags.readable() {
                    self.check_access(ino, Access::READ, path, syscall)?;
                }
                if flags.writable() {
                    self.check_access(ino, Access::WRITE, path, syscall)?;
                }
                if flags.contains(OpenFlags::TRUNC) && flags.writable() {
                    if let Probe::File { .. } = self.probe(ino, syscall)? {
                        replace_content(&mut self.inodes, ino, Vec::new(), &self.limits, syscall)?;
                    }
                }
                ino
            }
        };

        let fd = self.fds.create(ino, flags, syscall)?;
        self.inodes.ref_node(ino);

        if let Probe::Device { rdev } = self.probe(ino, syscall)? {
            let hook = match self.devices.driver(rdev) {
                Some(driver) => driver.open(fd),
                None => Err(err(Errno::ENXIO, syscall).with_path(path)),
            };
            if let Err(e) = hook {
                self.fds.remove(fd);
                self.inodes.unref_node(ino);
                return Err(e);
            }
        }
        Ok(fd)
    }

    fn close_inner(&mut self, fd: u32) -> Result<()> {
        let handle = self.fds.remove(fd).ok_or(err(Errno::EBADF, "close"))?;
        let hook = match self.probe(handle.ino, "close")? {
            Probe::Device { rdev } => match self.devices.driver(rdev) {
                Some(driver) => driver.close(fd),
                None => Ok(()),
            },
            _ => Ok(()),
        };
        self.inodes.unref_node(handle.ino);
        hook
    }

    fn read_inner(&mut self, fd: u32, buf: &mut [u8], pos: Option<u64>) -> Result<usize> {
        let syscall = "read";
        let handle = self
            .fds
            .get(fd)
            .cloned()
            .ok_or(err(Errno::EBADF, syscall))?;
        if !handle.flags.readable() {
            return Err(err(Errno::EBADF, syscall));
        }
        match self.probe(handle.ino, syscall)? {
            Probe::Directory => Err(err(Errno::EISDIR, syscall)),
            Probe::Symlink => Err(err(Errno::EINVAL, syscall)),
            Probe::Device { rdev } => {
                let driver = self
                    .devices
                    .driver(rdev)
                    .ok_or(err(Errno::ENXIO, syscall))?;
                driver.read(fd, buf, pos)
            }
            Probe::File { .. } => {
                let at = pos.unwrap_or(handle.pos);
                let node = self.inodes.get_mut(handle.ino).expect("probed above");
                let NodeKind::File { content } = &mut node.kind else {
                    unreachable!("probed as file");
                };
                let n = read_from_content(content.materialize(), at, buf);
                node.atime = SystemTime::now();
                if pos.is_none() {
                    self.fds.get_mut(fd).expect("held above").pos = at + n as u64;
                }
                Ok(n)
            }
        }
    }

    fn write_inner(&mut self, fd: u32, data: &[u8], pos: Option<u64>) -> Result<usize> {
        let syscall = "write";
        let handle = self
            .fds
            .get(fd)
            .cloned()
            .ok_or(err(Errno::EBADF, syscall))?;
        if !handle.flags.writable() {
            return Err(err(Errno::EBADF, syscall));
        }
        match self.probe(handle.ino, syscall)? {
            Probe::Directory | Probe::Symlink => Err(err(Errno::EBADF, syscall)),
            Probe::Device { rdev } => {
                let driver = self
                    .devices
                    .driver(rdev)
                    .ok_or(err(Errno::ENXIO, syscall))?;
                driver.write(fd, data, pos)
            }
            Probe::File { size } => {
                // O_APPEND forces end-of-data even for positioned writes.
                let at = if handle.flags.contains(OpenFlags::APPEND) {
                    size
                } else {
                    pos.unwrap_or(handle.pos)
                };
                let end = at + data.len() as u64;
                let new_size = end.max(size);
                self.inodes.check_growth(size, new_size, &self.limits, syscall)?;
                let node = self.inodes.get_mut(handle.ino).expect("probed above");
                let NodeKind::File { content } = &mut node.kind else {
                    unreachable!("probed as file");
                };
                let n = write_to_content(content.materialize(), at, data);
                node.touch_mtime();
                self.inodes.charge(size, new_size);
                if pos.is_none() || handle.flags.contains(OpenFlags::APPEND) {
                    self.fds.get_mut(fd).expect("held above").pos = at + n as u64;
                }
                Ok(n)
            }
        }
    }

    fn seek_inner(&mut self, fd: u32, from: SeekFrom) -> Result<u64> {
        let syscall = "lseek";
        let handle = self
            .fds
            .get(fd)
            .cloned()
            .ok_or(err(Errno::EBADF, syscall))?;
        match self.probe(handle.ino, syscall)? {
            Probe::Device { rdev } => {
                let driver = self
                    .devices
                    .driver(rdev)
                    .ok_or(err(Errno::ENXIO, syscall))?;
                let new = driver.seek(fd, from)?;
                self.fds.get_mut(fd).expect("held above").pos = new;
                Ok(new)
            }
            Probe::File { size } => {
                let new = seek_pos(handle.pos, size, from)?;
                self.fds.get_mut(fd).expect("held above").pos = new;
                Ok(new)
            }
            Probe::Directory => {
                let new = seek_pos(handle.pos, 0, from)?;
                self.fds.get_mut(fd).expect("held above").pos = new;
                Ok(new)
            }
            Probe::Symlink => Err(err(Errno::EBADF, syscall)),
        }
    }

    fn readdir_inner(&mut self, path: &str) -> Result<Vec<DirEntry>> {
        let syscall = "scandir";
        let res = self.nav(path, true, syscall)?;
        let ino = self.require(&res, path, syscall)?;
        let node = self
            .inodes
            .get(ino)
            .ok_or_else(|| err(Errno::ENOENT, syscall).with_path(path))?;
        let Some(entries) = node.entries() else {
            return Err(err(Errno::ENOTDIR, syscall).with_path(path));
        };
        self.check_access(ino, Access::READ, path, syscall)?;
        let pairs: Vec<(String, Ino)> = entries.iter().map(|(n, i)| (n.clone(), *i)).collect();
        let mut out = Vec::with_capacity(pairs.len());
        for (name, child) in pairs {
            if let Some(node) = self.inodes.get(child) {
                out.push(DirEntry {
                    name,
                    stat: node.stat(),
                });
            }
        }
        self.inodes.get_mut(ino).expect("listed above").atime = SystemTime::now();
        Ok(out)
    }

    fn mkdir_inner(&mut self, path: &str, mode: u32) -> Result<()> {
        let syscall = "mkdir";
        let res = self.nav(path, false, syscall)?;
        if res.target.is_some() {
            return Err(err(Errno::EEXIST, syscall).with_path(path));
        }
        if !res.remaining.is_empty() {
            return Err(err(Errno::ENOENT, syscall).with_path(path));
        }
        self.check_parent_linked(res.dir, path, syscall)?;
        self.check_access(res.dir, Access::WRITE, path, syscall)?;
        let ino = self
            .inodes
            .create(NodeInit::Directory, mode, self.uid, self.gid, syscall)?;
        self.inodes.add_link(res.dir, &res.name, ino);
        Ok(())
    }

    fn rmdir_inner(&mut self, path: &str) -> Result<()> {
        let syscall = "rmdir";
        match final_component(path) {
            Some(".") | Some("..") => {
                return Err(err(Errno::EINVAL, syscall).with_path(path));
            }
            _ => {}
        }
        let res = self.nav(path, false, syscall)?;
        let ino = self.require(&res, path, syscall)?;
        if ino == self.root {
            return Err(err(Errno::EBUSY, syscall).with_path(path));
        }
        let node = self
            .inodes
            .get(ino)
            .ok_or_else(|| err(Errno::ENOENT, syscall).with_path(path))?;
        let Some(entries) = node.entries() else {
            return Err(err(Errno::ENOTDIR, syscall).with_path(path));
        };
        if !entries.is_empty() {
            return Err(err(Errno::ENOTEMPTY, syscall).with_path(path));
        }
        self.check_access(res.dir, Access::WRITE, path, syscall)?;
        self.inodes.remove_link(res.dir, &res.name);
        Ok(())
    }

    fn unlink_inner(&mut self, path: &str) -> Result<()> {
        let syscall = "unlink";
        let res = self.nav(path, false, syscall)?;
        let ino = self.require(&res, path, syscall)?;
        let node = self
            .inodes
            .get(ino)
            .ok_or_else(|| err(Errno::ENOENT, syscall).with_path(path))?;
        if node.is_dir() {
            return Err(err(Errno::EISDIR, syscall).with_path(path));
        }
        self.check_access(res.dir, Access::WRITE, path, syscall)?;
        self.inodes.remove_link(res.dir, &res.name);
        Ok(())
    }

    fn link_inner(&mut self, existing: &str, new: &str) -> Result<()> {
        let syscall = "link";
        let res_old = self.nav(existing, false, syscall)?;
        let ino = self
            .require(&res_old, existing, syscall)
            .map_err(|e| e.with_dest(new))?;
        if self.inodes.get(ino).is_some_and(|n| n.is_dir()) {
            return Err(err(Errno::EPERM, syscall).with_path(existing).with_dest(new));
        }
        let res_new = self.nav(new, false, syscall)?;
        if res_new.target.is_some() {
            return Err(err(Errno::EEXIST, syscall).with_path(existing).with_dest(new));
        }
        if !res_new.remaining.is_empty() {
            return Err(err(Errno::ENOENT, syscall).with_path(existing).with_dest(new));
        }
        self.check_parent_linked(res_new.dir, new, syscall)?;
        self.check_access(res_new.dir, Access::WRITE, new, syscall)?;
        self.inodes.add_link(res_new.dir, &res_new.name, ino);
        Ok(())
    }

    fn symlink_inner(&mut self, target: &str, link: &str) -> Result<()> {
        let syscall = "symlink";
        let res = self.nav(link, false, syscall)?;
        if res.target.is_some() {
            return Err(err(Errno::EEXIST, syscall).with_path(target).with_dest(link));
        }
        if !res.remaining.is_empty() {
            return Err(err(Errno::ENOENT, syscall).with_path(target).with_dest(link));
        }
        self.check_parent_linked(res.dir, link, syscall)?;
        self.check_access(res.dir, Access::WRITE, link, syscall)?;
        let ino = self.inodes.create(
            NodeInit::Symlink(target.to_string()),
            0o777,
            self.uid,
            self.gid,
            syscall,
        )?;
        self.inodes.add_link(res.dir, &res.name, ino);
        Ok(())
    }

    fn readlink_inner(&self, path: &str) -> Result<String> {
        let syscall = "readlink";
        let res = self.nav(path, false, syscall)?;
        let ino = self.require(&res, path, syscall)?;
        let node = self
            .inodes
            .get(ino)
            .ok_or_else(|| err(Errno::ENOENT, syscall).with_path(path))?;
        match &node.kind {
            NodeKind::Symlink { target } => Ok(target.clone()),
            _ => Err(err(Errno::EINVAL, syscall).with_path(path)),
        }
    }

    fn rename_inner(&mut self, from: &str, to: &str) -> Result<()> {
        let syscall = "rename";
        for p in [from, to] {
            if matches!(final_component(p), Some(".") | Some("..")) {
                return Err(err(Errno::EINVAL, syscall).with_path(from).with_dest(to));
            }
        }
        let res_old = self.nav(from, false, syscall)?;
        let ino = self
            .require(&res_old, from, syscall)
            .map_err(|e| e.with_dest(to))?;
        if ino == self.root {
            return Err(err(Errno::EBUSY, syscall).with_path(from).with_dest(to));
        }
        let res_new = self.nav(to, false, syscall)?;
        if res_new.target == Some(ino) {
            // Same file: rename is a no-op.
            return Ok(());
        }
        let moving_dir = self.inodes.get(ino).is_some_and(|n| n.is_dir());
        if moving_dir
            && res_new.stack.len() >= res_old.stack.len()
            && res_new.stack[..res_old.stack.len()] == res_old.stack[..]
        {
            // Cannot move a directory underneath itself.
            return Err(err(Errno::EINVAL, syscall).with_path(from).with_dest(to));
        }
        self.check_access(res_old.dir, Access::WRITE, from, syscall)?;
        self.check_access(res_new.dir, Access::WRITE, to, syscall)?;
        match res_new.target {
            Some(existing) => {
                if existing == self.root {
                    return Err(err(Errno::EBUSY, syscall).with_path(from).with_dest(to));
                }
                let target = self
                    .inodes
                    .get(existing)
                    .ok_or_else(|| err(Errno::ENOENT, syscall).with_path(to))?;
                if moving_dir {
                    match target.entries() {
                        None => {
                            return Err(err(Errno::ENOTDIR, syscall).with_path(from).with_dest(to));
                        }
                        Some(entries) if !entries.is_empty() => {
                            return Err(err(Errno::ENOTEMPTY, syscall)
                                .with_path(from)
                                .with_dest(to));
                        }
                        Some(_) => {}
                    }
                } else if target.is_dir() {
                    return Err(err(Errno::EISDIR, syscall).with_path(from).with_dest(to));
                }
                self.inodes.remove_link(res_new.dir, &res_new.name);
            }
            None => {
                if !res_new.remaining.is_empty() {
                    return Err(err(Errno::ENOENT, syscall).with_path(from).with_dest(to));
                }
                self.check_parent_linked(res_new.dir, to, syscall)?;
            }
        }
        self.inodes
            .rename_link(res_old.dir, &res_old.name, res_new.dir, &res_new.name);
        Ok(())
    }

    fn truncate_node(&mut self, ino: Ino, len: u64, syscall: &'static str) -> Result<()> {
        let size = match self.probe(ino, syscall)? {
            Probe::File { size } => size,
            Probe::Directory => return Err(err(Errno::EISDIR, syscall)),
            _ => return Err(err(Errno::EINVAL, syscall)),
        };
        self.inodes.check_growth(size, len, &self.limits, syscall)?;
        let node = self.inodes.get_mut(ino).expect("probed above");
        let NodeKind::File { content } = &mut node.kind else {
            unreachable!("probed as file");
        };
        content.materialize().resize(len as usize, 0);
        node.touch_mtime();
        self.inodes.charge(size, len);
        Ok(())
    }

    fn chmod_node(&mut self, ino: Ino, mode: u32, path: &str, syscall: &'static str) -> Result<()> {
        self.check_owner(ino, path, syscall)?;
        let node = self
            .inodes
            .get_mut(ino)
            .ok_or_else(|| err(Errno::ENOENT, syscall).with_path(path))?;
        node.mode = mode & 0o7777;
        node.touch_ctime();
        Ok(())
    }

    fn chown_node(
        &mut self,
        ino: Ino,
        uid: u32,
        gid: u32,
        path: &str,
        syscall: &'static str,
    ) -> Result<()> {
        let owner = self
            .inodes
            .get(ino)
            .ok_or_else(|| err(Errno::ENOENT, syscall).with_path(path))?
            .uid;
        if self.uid != 0 {
            // Non-root callers may touch only their own files, and may not
            // give a file away.
            if owner != self.uid || uid != owner {
                return Err(err(Errno::EPERM, syscall).with_path(path));
            }
        }
        let node = self.inodes.get_mut(ino).expect("checked above");
        node.uid = uid;
        node.gid = gid;
        node.touch_ctime();
        Ok(())
    }

    fn cwd_string(&self) -> String {
        format!("/{}", self.cwd_stack.join("/"))
    }
}

/// The last non-empty path component, if any.
fn final_component(path: &str) -> Option<&str> {
    path.rsplit('/').find(|s| !s.is_empty())
}

impl MemoryFs {
    /// Create a filesystem with default settings (caller uid/gid 0, default
    /// limits).
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a [`MemoryFsBuilder`] for customized configuration.
    pub fn builder() -> MemoryFsBuilder {
        MemoryFsBuilder::default()
    }

    /// Change the caller identity used for permission and ownership checks.
    pub fn set_caller(&self, uid: u32, gid: u32) {
        let mut vol = self.vol.write().unwrap();
        vol.uid = uid;
        vol.gid = gid;
    }

    /// Check the caller's permissions on a path (`access(2)`).
    pub fn access(&self, path: &str, mode: Access) -> Result<()> {
        let vol = self.vol.read().unwrap();
        let res = vol.nav(path, true, "access")?;
        let ino = vol.require(&res, path, "access")?;
        if mode == Access::EXISTS {
            return Ok(());
        }
        vol.check_access(ino, mode, path, "access")
    }

    /// Whether a path resolves to anything.
    pub fn exists(&self, path: &str) -> bool {
        self.access(path, Access::EXISTS).is_ok()
    }

    /// Stat a path, following symlinks.
    pub fn stat(&self, path: &str) -> Result<Stat> {
        let vol = self.vol.read().unwrap();
        let res = vol.nav(path, true, "stat")?;
        let ino = vol.require(&res, path, "stat")?;
        Ok(vol.inodes.get(ino).expect("resolved above").stat())
    }

    /// Stat a path without following a final symlink.
    pub fn lstat(&self, path: &str) -> Result<Stat> {
        let vol = self.vol.read().unwrap();
        let res = vol.nav(path, false, "lstat")?;
        let ino = vol.require(&res, path, "lstat")?;
        Ok(vol.inodes.get(ino).expect("resolved above").stat())
    }

    /// Stat an open descriptor.
    pub fn fstat(&self, fd: u32) -> Result<Stat> {
        let vol = self.vol.read().unwrap();
        let handle = vol.fds.get(fd).ok_or(err(Errno::EBADF, "fstat"))?;
        Ok(vol
            .inodes
            .get(handle.ino)
            .ok_or(err(Errno::EBADF, "fstat"))?
            .stat())
    }

    /// Open a file, returning a descriptor.
    pub fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> Result<u32> {
        fs_trace!(path, ?flags, "open");
        self.vol.write().unwrap().open_inner(path, flags, mode)
    }

    /// Close a descriptor.
    pub fn close(&self, fd: u32) -> Result<()> {
        self.vol.write().unwrap().close_inner(fd)
    }

    /// Duplicate a descriptor.
    pub fn dup(&self, fd: u32) -> Result<u32> {
        let mut vol = self.vol.write().unwrap();
        let new_fd = vol.fds.dup(fd, "dup")?;
        let ino = vol.fds.get(new_fd).expect("just created").ino;
        vol.inodes.ref_node(ino);
        Ok(new_fd)
    }

    /// Read from a descriptor at the cursor, or at `pos` without moving the
    /// cursor.
    pub fn read(&self, fd: u32, buf: &mut [u8], pos: Option<u64>) -> Result<usize> {
        self.vol.write().unwrap().read_inner(fd, buf, pos)
    }

    /// Write to a descriptor at the cursor, or at `pos` without moving the
    /// cursor. `O_APPEND` descriptors always write at end-of-data.
    pub fn write(&self, fd: u32, data: &[u8], pos: Option<u64>) -> Result<usize> {
        self.vol.write().unwrap().write_inner(fd, data, pos)
    }

    /// Reposition a descriptor's cursor.
    pub fn seek(&self, fd: u32, from: SeekFrom) -> Result<u64> {
        self.vol.write().unwrap().seek_inner(fd, from)
    }

    /// List a directory. Entries are sorted by name; `.`/`..` are not
    /// reported.
    pub fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        self.vol.write().unwrap().readdir_inner(path)
    }

    /// Create a directory.
    pub fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        self.vol.write().unwrap().mkdir_inner(path, mode)
    }

    /// Remove an empty directory.
    pub fn rmdir(&self, path: &str) -> Result<()> {
        self.vol.write().unwrap().rmdir_inner(path)
    }

    /// Remove a file or symlink.
    pub fn unlink(&self, path: &str) -> Result<()> {
        self.vol.write().unwrap().unlink_inner(path)
    }

    /// Create a hardlink. Directories cannot be hardlinked.
    pub fn link(&self, existing: &str, new: &str) -> Result<()> {
        self.vol.write().unwrap().link_inner(existing, new)
    }

    /// Create a symlink at `link` pointing to `target`.
    pub fn symlink(&self, target: &str, link: &str) -> Result<()> {
        self.vol.write().unwrap().symlink_inner(target, link)
    }

    /// Read a symlink's target.
    pub fn readlink(&self, path: &str) -> Result<String> {
        self.vol.read().unwrap().readlink_inner(path)
    }

    /// Rename a file or directory.
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        fs_trace!(from, to, "rename");
        self.vol.write().unwrap().rename_inner(from, to)
    }

    /// Truncate a file to `len` bytes, zero-filling growth.
    pub fn truncate(&self, path: &str, len: u64) -> Result<()> {
        let mut vol = self.vol.write().unwrap();
        let syscall = "truncate";
        let res = vol.nav(path, true, syscall)?;
        let ino = vol.require(&res, path, syscall)?;
        vol.check_access(ino, Access::WRITE, path, syscall)?;
        vol.truncate_node(ino, len, syscall)
            .map_err(|e| e.with_path(path))
    }

    /// Truncate an open descriptor.
    pub fn ftruncate(&self, fd: u32, len: u64) -> Result<()> {
        let mut vol = self.vol.write().unwrap();
        let syscall = "ftruncate";
        let handle = vol.fds.get(fd).cloned().ok_or(err(Errno::EBADF, syscall))?;
        if !handle.flags.writable() {
            return Err(err(Errno::EBADF, syscall));
        }
        vol.truncate_node(handle.ino, len, syscall)
    }

    /// Change permission bits on a path, following symlinks.
    pub fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        let mut vol = self.vol.write().unwrap();
        let res = vol.nav(path, true, "chmod")?;
        let ino = vol.require(&res, path, "chmod")?;
        vol.chmod_node(ino, mode, path, "chmod")
    }

    /// Change permission bits without following a final symlink.
    pub fn lchmod(&self, path: &str, mode: u32) -> Result<()> {
        let mut vol = self.vol.write().unwrap();
        let res = vol.nav(path, false, "lchmod")?;
        let ino = vol.require(&res, path, "lchmod")?;
        vol.chmod_node(ino, mode, path, "lchmod")
    }

    /// Change permission bits on an open descriptor.
    pub fn fchmod(&self, fd: u32, mode: u32) -> Result<()> {
        let mut vol = self.vol.write().unwrap();
        let ino = vol
            .fds
            .get(fd)
            .ok_or(err(Errno::EBADF, "fchmod"))?
            .ino;
        vol.chmod_node(ino, mode, "", "fchmod")
    }

    /// Change ownership on a path, following symlinks.
    pub fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        let mut vol = self.vol.write().unwrap();
        let res = vol.nav(path, true, "chown")?;
        let ino = vol.require(&res, path, "chown")?;
        vol.chown_node(ino, uid, gid, path, "chown")
    }

    /// Change ownership without following a final symlink.
    pub fn lchown(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        let mut vol = self.vol.write().unwrap();
        let res = vol.nav(path, false, "lchown")?;
        let ino = vol.require(&res, path, "lchown")?;
        vol.chown_node(ino, uid, gid, path, "lchown")
    }

    /// Change ownership on an open descriptor.
    pub fn fchown(&self, fd: u32, uid: u32, gid: u32) -> Result<()> {
        let mut vol = self.vol.write().unwrap();
        let ino = vol
            .fds
            .get(fd)
            .ok_or(err(Errno::EBADF, "fchown"))?
            .ino;
        vol.chown_node(ino, uid, gid, "", "fchown")
    }

    /// Set access and modification times.
    pub fn utimes(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> Result<()> {
        let mut vol = self.vol.write().unwrap();
        let syscall = "utime";
        let res = vol.nav(path, true, syscall)?;
        let ino = vol.require(&res, path, syscall)?;
        if vol.check_owner(ino, path, syscall).is_err() {
            vol.check_access(ino, Access::WRITE, path, syscall)?;
        }
        let node = vol.inodes.get_mut(ino).expect("resolved above");
        node.atime = atime;
        node.mtime = mtime;
        node.touch_ctime();
        Ok(())
    }

    /// Canonicalize a path: all symlinks expanded, `.`/`..` collapsed.
    pub fn realpath(&self, path: &str) -> Result<String> {
        let vol = self.vol.read().unwrap();
        let res = vol.nav(path, true, "realpath")?;
        vol.require(&res, path, "realpath")?;
        Ok(format!("/{}", res.stack.join("/")))
    }

    /// Change the current working directory. The cwd holds one private
    /// reference on its inode.
    pub fn chdir(&self, path: &str) -> Result<()> {
        let mut vol = self.vol.write().unwrap();
        let syscall = "chdir";
        let res = vol.nav(path, true, syscall)?;
        let ino = vol.require(&res, path, syscall)?;
        if !vol.inodes.get(ino).is_some_and(|n| n.is_dir()) {
            return Err(err(Errno::ENOTDIR, syscall).with_path(path));
        }
        vol.check_access(ino, Access::EXEC, path, syscall)?;
        let old = vol.cwd;
        vol.inodes.ref_node(ino);
        vol.cwd = ino;
        vol.cwd_stack = res.stack;
        vol.inodes.unref_node(old);
        Ok(())
    }

    /// The current working directory as a canonical path.
    pub fn cwd(&self) -> String {
        self.vol.read().unwrap().cwd_string()
    }

    /// Create a character-device node.
    pub fn mknod(&self, path: &str, mode: u32, rdev: u64) -> Result<()> {
        let mut vol = self.vol.write().unwrap();
        let syscall = "mknod";
        let res = vol.nav(path, false, syscall)?;
        if res.target.is_some() {
            return Err(err(Errno::EEXIST, syscall).with_path(path));
        }
        if !res.remaining.is_empty() {
            return Err(err(Errno::ENOENT, syscall).with_path(path));
        }
        vol.check_parent_linked(res.dir, path, syscall)?;
        vol.check_access(res.dir, Access::WRITE, path, syscall)?;
        let (uid, gid) = (vol.uid, vol.gid);
        let ino = vol
            .inodes
            .create(NodeInit::CharDevice(rdev), mode, uid, gid, syscall)?;
        vol.inodes.add_link(res.dir, &res.name, ino);
        Ok(())
    }

    /// Register a character-device driver, allocating major/minor numbers
    /// when not given.
    pub fn register_device(
        &self,
        driver: Arc<dyn CharDevice>,
        major: Option<u32>,
        minor: Option<u32>,
    ) -> Result<(u32, u32)> {
        self.vol.write().unwrap().devices.register(driver, major, minor)
    }

    /// Remove a registered driver.
    pub fn unregister_device(&self, major: u32, minor: u32) -> Result<()> {
        self.vol.write().unwrap().devices.unregister(major, minor)
    }

    /// Create an unlinked inode. This is the population seam used by
    /// external decoders (e.g. an archive reader): create nodes with
    /// [`FileContent::Lazy`] content, then attach them with
    /// [`MemoryFs::add_entry`].
    pub fn create_inode(
        &self,
        init: NodeInit,
        mode: u32,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> Result<Ino> {
        let mut vol = self.vol.write().unwrap();
        let uid = uid.unwrap_or(vol.uid);
        let gid = gid.unwrap_or(vol.gid);
        vol.inodes.create(init, mode, uid, gid, "mknod")
    }

    /// Attach an inode created with [`MemoryFs::create_inode`] under a
    /// resolved parent directory.
    pub fn add_entry(&self, parent: Ino, name: &str, ino: Ino) -> Result<()> {
        let mut vol = self.vol.write().unwrap();
        let syscall = "link";
        let Some(parent_node) = vol.inodes.get(parent) else {
            return Err(err(Errno::ENOENT, syscall).with_path(name));
        };
        let Some(entries) = parent_node.entries() else {
            return Err(err(Errno::ENOTDIR, syscall).with_path(name));
        };
        if entries.contains_key(name) {
            return Err(err(Errno::EEXIST, syscall).with_path(name));
        }
        if vol.inodes.get(ino).is_none() {
            return Err(err(Errno::ENOENT, syscall).with_path(name));
        }
        vol.inodes.add_link(parent, name, ino);
        Ok(())
    }

    /// Read a whole file.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let fd = self.open(path, OpenFlags::RDONLY, 0)?;
        let size = self.fstat(fd)?.size;
        let mut buf = vec![0; size as usize];
        let result = self.read(fd, &mut buf, None);
        let _ = self.close(fd);
        let n = result?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Create or replace a whole file.
    pub fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let flags = OpenFlags::WRONLY | OpenFlags::CREAT | OpenFlags::TRUNC;
        let fd = self.open(path, flags, 0o666)?;
        let result = self.write(fd, data, None);
        let _ = self.close(fd);
        result.map(drop)
    }

    /// Append to a file, creating it if missing.
    pub fn append_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let flags = OpenFlags::WRONLY | OpenFlags::CREAT | OpenFlags::APPEND;
        let fd = self.open(path, flags, 0o666)?;
        let result = self.write(fd, data, None);
        let _ = self.close(fd);
        result.map(drop)
    }

    /// Copy a file within this volume. A fresh destination inherits the
    /// source's permission bits.
    pub fn copy_file(&self, from: &str, to: &str) -> Result<()> {
        let data = self.read_file(from)?;
        let mode = self.stat(from)?.perms();
        let flags = OpenFlags::WRONLY | OpenFlags::CREAT | OpenFlags::TRUNC;
        let fd = self.open(to, flags, mode)?;
        let result = self.write(fd, &data, None);
        let _ = self.close(fd);
        result.map(drop)
    }

    /// Map `len` bytes of an open file starting at `offset`, sharing the
    /// backing storage: reads and writes through the mapping observe and
    /// produce the same bytes as every descriptor on the file. The mapping
    /// holds a private reference on the inode for its lifetime.
    pub fn map_shared(self: &Arc<Self>, fd: u32, offset: u64, len: u64) -> Result<SharedMap> {
        let mut vol = self.vol.write().unwrap();
        let syscall = "mmap";
        let handle = vol.fds.get(fd).cloned().ok_or(err(Errno::EBADF, syscall))?;
        match vol.probe(handle.ino, syscall)? {
            Probe::File { .. } => {}
            _ => return Err(err(Errno::ENODEV, syscall)),
        }
        vol.inodes.ref_node(handle.ino);
        Ok(SharedMap {
            fs: Arc::clone(self),
            ino: handle.ino,
            offset,
            len,
        })
    }

    /// Copy `len` bytes of an open file starting at `offset` (a private
    /// mapping). Bytes past end-of-file read as zero.
    pub fn map_private(&self, fd: u32, offset: u64, len: u64) -> Result<Vec<u8>> {
        let mut vol = self.vol.write().unwrap();
        let syscall = "mmap";
        let handle = vol.fds.get(fd).cloned().ok_or(err(Errno::EBADF, syscall))?;
        match vol.probe(handle.ino, syscall)? {
            Probe::File { .. } => {}
            _ => return Err(err(Errno::ENODEV, syscall)),
        }
        let node = vol.inodes.get_mut(handle.ino).expect("probed above");
        let NodeKind::File { content } = &mut node.kind else {
            unreachable!("probed as file");
        };
        let mut buf = vec![0; len as usize];
        read_from_content(content.materialize(), offset, &mut buf);
        Ok(buf)
    }

    /// Storage usage statistics.
    pub fn usage(&self) -> FsUsage {
        self.vol.read().unwrap().inodes.usage()
    }

    /// The volume's resource limits.
    pub fn limits(&self) -> FsLimits {
        self.vol.read().unwrap().limits.clone()
    }
}

/// A live, shared view into `len` bytes of a file starting at `offset`.
///
/// Reads and writes go through the engine, so every mapping and descriptor
/// over the file observes the same bytes immediately. If the file is
/// truncated below the mapped range, reads observe a zero-filled tail;
/// writes re-grow the file.
pub struct SharedMap {
    fs: Arc<MemoryFs>,
    ino: Ino,
    offset: u64,
    len: u64,
}

impl SharedMap {
    /// Mapping length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read from the mapping at `off`. Bytes past the file's current size
    /// read as zero; the call never reads outside the mapped range.
    pub fn read_at(&self, off: u64, buf: &mut [u8]) -> Result<usize> {
        if off > self.len {
            return Err(err(Errno::EINVAL, "mmap"));
        }
        let n = (buf.len() as u64).min(self.len - off) as usize;
        let mut vol = self.fs.vol.write().unwrap();
        let node = vol
            .inodes
            .get_mut(self.ino)
            .ok_or(err(Errno::EBADF, "mmap"))?;
        let NodeKind::File { content } = &mut node.kind else {
            return Err(err(Errno::ENODEV, "mmap"));
        };
        let copied = read_from_content(content.materialize(), self.offset + off, &mut buf[..n]);
        buf[copied..n].fill(0);
        Ok(n)
    }

    /// Write through the mapping at `off`. The write must stay inside the
    /// mapped range; the file grows (zero-filled) if the range extends past
    /// its current size.
    pub fn write_at(&self, off: u64, data: &[u8]) -> Result<usize> {
        let end = off + data.len() as u64;
        if end > self.len {
            return Err(err(Errno::EINVAL, "mmap"));
        }
        let mut vol = self.fs.vol.write().unwrap();
        let at = self.offset + off;
        let old_size = match vol.probe(self.ino, "mmap")? {
            Probe::File { size } => size,
            _ => return Err(err(Errno::ENODEV, "mmap")),
        };
        let new_size = (at + data.len() as u64).max(old_size);
        let limits = vol.limits.clone();
        vol.inodes.check_growth(old_size, new_size, &limits, "mmap")?;
        let node = vol.inodes.get_mut(self.ino).expect("probed above");
        let NodeKind::File { content } = &mut node.kind else {
            unreachable!("probed as file");
        };
        let n = write_to_content(content.materialize(), at, data);
        node.touch_mtime();
        vol.inodes.charge(old_size, new_size);
        Ok(n)
    }
}

impl Drop for SharedMap {
    fn drop(&mut self) {
        if let Ok(mut vol) = self.fs.vol.write() {
            vol.inodes.unref_node(self.ino);
        }
    }
}
