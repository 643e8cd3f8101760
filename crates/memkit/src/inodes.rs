//! Inode table: creation, hardlink bookkeeping, and reference-counted
//! garbage collection.
//!
//! Ids come from an [`IdPool`] beginning at 1 (0 is reserved). An inode is
//! destroyed when both its hardlink count and its private-reference count
//! (open descriptors, the cwd pointer, live mappings) reach zero; the
//! directory destructor gives the parent back the `..` it was holding.

use std::collections::HashMap;

use crate::bitmap::IdPool;
use crate::error::{err, Errno, Result};
use crate::limits::{FsLimits, FsUsage};
use crate::node::{FileContent, Ino, Inode, NodeInit, NodeKind};

pub(crate) struct InodeTable {
    ids: IdPool,
    nodes: HashMap<Ino, Inode>,
    total_bytes: u64,
}

impl InodeTable {
    pub fn new() -> Self {
        Self {
            // 0 is reserved so that "no inode" is representable.
            ids: IdPool::new(1).with_shrink(true),
            nodes: HashMap::new(),
            total_bytes: 0,
        }
    }

    /// Create the root directory: self-parented, nlink 2 (own name + own `..`).
    pub fn init_root(&mut self, mode: u32, uid: u32, gid: u32) -> Ino {
        let ino = self.ids.allocate().expect("fresh pool cannot be exhausted");
        let mut root = Inode::new(ino, NodeInit::Directory, mode, uid, gid);
        root.nlink = 2;
        if let NodeKind::Directory { parent, .. } = &mut root.kind {
            *parent = ino;
        }
        self.nodes.insert(ino, root);
        ino
    }

    /// Create an unlinked inode (`nlink` and `refs` both zero).
    ///
    /// The caller is expected to link it promptly; nothing collects it in
    /// the meantime because collection checks only run on unlink/unref.
    pub fn create(
        &mut self,
        init: NodeInit,
        mode: u32,
        uid: u32,
        gid: u32,
        syscall: &'static str,
    ) -> Result<Ino> {
        let ino = self
            .ids
            .allocate()
            .map_err(|_| err(Errno::EFBIG, syscall))?;
        let node = Inode::new(ino, init, mode, uid, gid);
        if let NodeKind::File { content } = &node.kind {
            self.total_bytes += content.size();
        }
        self.nodes.insert(ino, node);
        Ok(ino)
    }

    pub fn get(&self, ino: Ino) -> Option<&Inode> {
        self.nodes.get(&ino)
    }

    pub fn get_mut(&mut self, ino: Ino) -> Option<&mut Inode> {
        self.nodes.get_mut(&ino)
    }

    /// Whether `name` exists in directory `parent`.
    pub fn lookup(&self, parent: Ino, name: &str) -> Option<Ino> {
        self.get(parent)?.entries()?.get(name).copied()
    }

    /// Add a directory entry `parent/name -> ino` and adjust link counts.
    ///
    /// A directory gains its parent's entry like any other inode, and its
    /// `..` adds one link to the parent.
    pub fn add_link(&mut self, parent: Ino, name: &str, ino: Ino) {
        let child_is_dir = self.nodes[&ino].is_dir();
        {
            let p = self.nodes.get_mut(&parent).expect("parent inode exists");
            if let NodeKind::Directory { entries, .. } = &mut p.kind {
                entries.insert(name.to_string(), ino);
            }
            if child_is_dir {
                p.nlink += 1;
            }
            p.touch_mtime();
        }
        let child = self.nodes.get_mut(&ino).expect("linked inode exists");
        child.nlink += 1;
        child.touch_ctime();
        if let NodeKind::Directory { parent: pp, .. } = &mut child.kind {
            *pp = parent;
        }
    }

    /// Remove the entry `parent/name`, decrement the target's link count,
    /// and collect it if nothing references it anymore.
    pub fn remove_link(&mut self, parent: Ino, name: &str) -> Option<Ino> {
        let ino = {
            let p = self.nodes.get_mut(&parent)?;
            let removed = match &mut p.kind {
                NodeKind::Directory { entries, .. } => entries.remove(name)?,
                _ => return None,
            };
            p.touch_mtime();
            removed
        };
        let child = self.nodes.get_mut(&ino).expect("entry target exists");
        child.nlink = child.nlink.saturating_sub(1);
        child.touch_ctime();
        // A removed directory keeps contributing its `..` to the parent
        // until it is actually destroyed (it may be held open or be the
        // cwd); the destructor settles that account.
        self.collect(ino);
        Some(ino)
    }

    /// Move an entry between directories without touching the target's own
    /// link count. Used by rename: the name count is unchanged, only a
    /// directory's `..` migrates.
    pub fn rename_link(&mut self, old_parent: Ino, old_name: &str, new_parent: Ino, new_name: &str) {
        let ino = {
            let p = self.nodes.get_mut(&old_parent).expect("source parent exists");
            let removed = match &mut p.kind {
                NodeKind::Directory { entries, .. } => {
                    entries.remove(old_name).expect("source entry exists")
                }
                _ => unreachable!("rename source parent is a directory"),
            };
            p.touch_mtime();
            removed
        };
        let is_dir = self.nodes[&ino].is_dir();
        if is_dir && old_parent != new_parent {
            self.nodes.get_mut(&old_parent).expect("source parent exists").nlink -= 1;
            self.nodes.get_mut(&new_parent).expect("target parent exists").nlink += 1;
        }
        {
            let p = self.nodes.get_mut(&new_parent).expect("target parent exists");
            if let NodeKind::Directory { entries, .. } = &mut p.kind {
                entries.insert(new_name.to_string(), ino);
            }
            p.touch_mtime();
        }
        let child = self.nodes.get_mut(&ino).expect("renamed inode exists");
        child.touch_ctime();
        if let NodeKind::Directory { parent, .. } = &mut child.kind {
            *parent = new_parent;
        }
    }

    /// Take a private reference (open descriptor, cwd, mapping).
    pub fn ref_node(&mut self, ino: Ino) {
        if let Some(node) = self.nodes.get_mut(&ino) {
            node.refs += 1;
        }
    }

    /// Release a private reference; collects the inode when it was the last
    /// thing keeping it alive.
    pub fn unref_node(&mut self, ino: Ino) {
        if let Some(node) = self.nodes.get_mut(&ino) {
            node.refs = node.refs.saturating_sub(1);
        }
        self.collect(ino);
    }

    /// Destroy `ino` if neither links nor private references remain.
    fn collect(&mut self, ino: Ino) {
        let Some(node) = self.nodes.get(&ino) else {
            return;
        };
        if node.nlink != 0 || node.refs != 0 {
            return;
        }
        let node = self.nodes.remove(&ino).expect("checked above");
        if let NodeKind::File { content } = &node.kind {
            self.total_bytes = self.total_bytes.saturating_sub(content.size());
        }
        let _ = self.ids.deallocate(ino);
        // Directory destructor: its `..` no longer pins the parent.
        if let NodeKind::Directory { parent, .. } = node.kind {
            if parent != ino && parent != 0 {
                if let Some(p) = self.nodes.get_mut(&parent) {
                    p.nlink = p.nlink.saturating_sub(1);
                }
                self.collect(parent);
            }
        }
    }

    /// Whether the inode is still present (used by tests and assertions).
    pub fn contains(&self, ino: Ino) -> bool {
        self.nodes.contains_key(&ino)
    }

    /// Charge a change in file-content size against the running total.
    pub fn charge(&mut self, old_size: u64, new_size: u64) {
        self.total_bytes = (self.total_bytes + new_size).saturating_sub(old_size);
    }

    /// Enforce the volume limits for a file growing to `new_size`.
    pub fn check_growth(
        &self,
        old_size: u64,
        new_size: u64,
        limits: &FsLimits,
        syscall: &'static str,
    ) -> Result<()> {
        if new_size > limits.max_file_size {
            return Err(err(Errno::EFBIG, syscall));
        }
        if new_size > old_size {
            let grown = self.total_bytes + (new_size - old_size);
            if grown > limits.max_total_bytes {
                return Err(err(Errno::EFBIG, syscall));
            }
        }
        Ok(())
    }

    pub fn usage(&self) -> FsUsage {
        let mut usage = FsUsage {
            total_bytes: self.total_bytes,
            ..FsUsage::default()
        };
        for node in self.nodes.values() {
            match &node.kind {
                NodeKind::File { .. } => usage.file_count += 1,
                NodeKind::Directory { .. } => usage.dir_count += 1,
                NodeKind::Symlink { .. } => usage.symlink_count += 1,
                NodeKind::CharDevice { .. } => {}
            }
        }
        usage
    }
}

/// Replace a file's content wholesale, with limit enforcement and usage
/// accounting. Shared by truncate and the whole-file write helpers.
pub(crate) fn replace_content(
    table: &mut InodeTable,
    ino: Ino,
    data: Vec<u8>,
    limits: &FsLimits,
    syscall: &'static str,
) -> Result<()> {
    let old_size = table
        .get(ino)
        .map(|n| n.size())
        .ok_or(err(Errno::ENOENT, syscall))?;
    table.check_growth(old_size, data.len() as u64, limits, syscall)?;
    let new_size = data.len() as u64;
    let node = table.get_mut(ino).expect("checked above");
    match &mut node.kind {
        NodeKind::File { content } => *content = FileContent::Bytes(data),
        _ => return Err(err(Errno::EISDIR, syscall)),
    }
    node.touch_mtime();
    table.charge(old_size, new_size);
    Ok(())
}
