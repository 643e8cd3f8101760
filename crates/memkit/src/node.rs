//! Inode types.
//!
//! An [`Inode`] is a common header (id, owner, mode, link and reference
//! counts, timestamps) plus a [`NodeKind`] tagged union over the four object
//! kinds. All cross-inode references are plain `ino` keys into the inode
//! table, never pointers, so the `.`/`..` cycles of a directory tree are just
//! repeated keys.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::flags::Access;

/// Inode number. 0 is reserved; the root directory is always 1.
pub type Ino = u64;

/// The four filesystem object kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
    /// Character device.
    CharDevice,
}

impl FileType {
    /// Check if this is a file.
    pub fn is_file(&self) -> bool {
        matches!(self, FileType::File)
    }

    /// Check if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, FileType::Directory)
    }

    /// Check if this is a symlink.
    pub fn is_symlink(&self) -> bool {
        matches!(self, FileType::Symlink)
    }

    /// Check if this is a character device.
    pub fn is_char_device(&self) -> bool {
        matches!(self, FileType::CharDevice)
    }

    /// The `S_IFMT` type bits for this kind.
    pub fn mode_bits(&self) -> u32 {
        match self {
            FileType::File => 0o100000,
            FileType::Directory => 0o040000,
            FileType::Symlink => 0o120000,
            FileType::CharDevice => 0o020000,
        }
    }
}

/// Regular-file contents: materialized bytes, or a loader installed by an
/// external populator (e.g. an archive reader) that is invoked on first
/// access.
#[derive(Clone)]
pub enum FileContent {
    /// In-memory bytes.
    Bytes(Vec<u8>),
    /// Deferred bytes with a declared size; `load` runs on first access.
    Lazy {
        /// Produces the file's bytes.
        load: Arc<dyn Fn() -> Vec<u8> + Send + Sync>,
        /// Size reported until the content is materialized.
        size: u64,
    },
}

impl FileContent {
    /// Empty file content.
    pub fn empty() -> Self {
        FileContent::Bytes(Vec::new())
    }

    /// Logical size in bytes without forcing materialization.
    pub fn size(&self) -> u64 {
        match self {
            FileContent::Bytes(data) => data.len() as u64,
            FileContent::Lazy { size, .. } => *size,
        }
    }

    /// Materialize and return the backing buffer.
    pub fn materialize(&mut self) -> &mut Vec<u8> {
        if let FileContent::Lazy { load, .. } = self {
            let data = load();
            *self = FileContent::Bytes(data);
        }
        match self {
            FileContent::Bytes(data) => data,
            FileContent::Lazy { .. } => unreachable!("materialized above"),
        }
    }
}

impl fmt::Debug for FileContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileContent::Bytes(data) => f.debug_tuple("Bytes").field(&data.len()).finish(),
            FileContent::Lazy { size, .. } => f.debug_struct("Lazy").field("size", size).finish(),
        }
    }
}

impl From<Vec<u8>> for FileContent {
    fn from(data: Vec<u8>) -> Self {
        FileContent::Bytes(data)
    }
}

impl From<&[u8]> for FileContent {
    fn from(data: &[u8]) -> Self {
        FileContent::Bytes(data.to_vec())
    }
}

/// Kind-specific inode payload.
#[derive(Debug, Clone)]
pub(crate) enum NodeKind {
    File {
        content: FileContent,
    },
    Directory {
        /// Name → ino. `.`/`..` are not materialized; `parent` is the `..`
        /// pointer and readdir never reports either.
        entries: BTreeMap<String, Ino>,
        /// Containing directory; the root is self-parented. 0 = not linked yet.
        parent: Ino,
    },
    Symlink {
        /// Link target, immutable after creation.
        target: String,
    },
    CharDevice {
        /// `(major << 20) | minor` device id.
        rdev: u64,
    },
}

/// Initializer for [`crate::MemoryFs::create_inode`] and internal creation.
pub enum NodeInit {
    /// A regular file with the given content.
    File(FileContent),
    /// An empty directory (parented when linked).
    Directory,
    /// A symlink to `target`.
    Symlink(String),
    /// A character device with the given `rdev`.
    CharDevice(u64),
}

/// An inode: common header plus kind-specific payload.
#[derive(Debug, Clone)]
pub(crate) struct Inode {
    pub ino: Ino,
    /// Permission bits (no type bits; those come from the kind).
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Hardlink count: name entries referencing this inode, plus one per
    /// child directory whose `..` points here.
    pub nlink: u32,
    /// Private references: open descriptors, the cwd pointer, live mappings.
    pub refs: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub birthtime: SystemTime,
    pub kind: NodeKind,
}

impl Inode {
    pub fn new(ino: Ino, init: NodeInit, mode: u32, uid: u32, gid: u32) -> Self {
        let now = SystemTime::now();
        let kind = match init {
            NodeInit::File(content) => NodeKind::File { content },
            NodeInit::Directory => NodeKind::Directory {
                entries: BTreeMap::new(),
                parent: 0,
            },
            NodeInit::Symlink(target) => NodeKind::Symlink { target },
            NodeInit::CharDevice(rdev) => NodeKind::CharDevice { rdev },
        };
        Self {
            ino,
            mode: mode & 0o7777,
            uid,
            gid,
            nlink: 0,
            refs: 0,
            atime: now,
            mtime: now,
            ctime: now,
            birthtime: now,
            kind,
        }
    }

    pub fn file_type(&self) -> FileType {
        match &self.kind {
            NodeKind::File { .. } => FileType::File,
            NodeKind::Directory { .. } => FileType::Directory,
            NodeKind::Symlink { .. } => FileType::Symlink,
            NodeKind::CharDevice { .. } => FileType::CharDevice,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory { .. })
    }

    pub fn size(&self) -> u64 {
        match &self.kind {
            NodeKind::File { content } => content.size(),
            NodeKind::Symlink { target } => target.len() as u64,
            NodeKind::Directory { .. } | NodeKind::CharDevice { .. } => 0,
        }
    }

    pub fn rdev(&self) -> u64 {
        match &self.kind {
            NodeKind::CharDevice { rdev } => *rdev,
            _ => 0,
        }
    }

    /// The `..` pointer of a directory; `None` for other kinds.
    pub fn dir_parent(&self) -> Option<Ino> {
        match &self.kind {
            NodeKind::Directory { parent, .. } => Some(*parent),
            _ => None,
        }
    }

    pub fn entries(&self) -> Option<&BTreeMap<String, Ino>> {
        match &self.kind {
            NodeKind::Directory { entries, .. } => Some(entries),
            _ => None,
        }
    }

    /// Whether `(uid, gid)` is granted `want` by the mode bits. Owner bits
    /// apply when the uid matches, group bits when the gid matches, other
    /// bits otherwise. uid 0 is handled by callers, not here.
    pub fn allows(&self, uid: u32, gid: u32, want: Access) -> bool {
        let shift = if uid == self.uid {
            6
        } else if gid == self.gid {
            3
        } else {
            0
        };
        let granted = (self.mode >> shift) & 0o7;
        granted & want.bits() == want.bits()
    }

    /// Snapshot the inode's metadata.
    pub fn stat(&self) -> Stat {
        Stat {
            ino: self.ino,
            file_type: self.file_type(),
            mode: self.file_type().mode_bits() | self.mode,
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: self.rdev(),
            size: self.size(),
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            birthtime: self.birthtime,
        }
    }

    pub fn touch_mtime(&mut self) {
        let now = SystemTime::now();
        self.mtime = now;
        self.ctime = now;
    }

    pub fn touch_ctime(&mut self) {
        self.ctime = SystemTime::now();
    }
}

/// File metadata snapshot, as returned by `stat`/`lstat`/`fstat`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stat {
    /// Inode number.
    pub ino: Ino,
    /// Object kind.
    pub file_type: FileType,
    /// Full mode: type bits plus permission bits.
    pub mode: u32,
    /// Hardlink count.
    pub nlink: u32,
    /// Owning user id.
    pub uid: u32,
    /// Owning group id.
    pub gid: u32,
    /// Device id for character devices, 0 otherwise.
    pub rdev: u64,
    /// Size in bytes.
    pub size: u64,
    /// Last access time.
    pub atime: SystemTime,
    /// Last modification time.
    pub mtime: SystemTime,
    /// Last status-change time.
    pub ctime: SystemTime,
    /// Creation time.
    pub birthtime: SystemTime,
}

impl Stat {
    /// Permission bits only.
    pub fn perms(&self) -> u32 {
        self.mode & 0o7777
    }

    /// Check if this is a file.
    pub fn is_file(&self) -> bool {
        self.file_type.is_file()
    }

    /// Check if this is a directory.
    pub fn is_dir(&self) -> bool {
        self.file_type.is_dir()
    }

    /// Check if this is a symlink.
    pub fn is_symlink(&self) -> bool {
        self.file_type.is_symlink()
    }

    /// Check if this is a character device.
    pub fn is_char_device(&self) -> bool {
        self.file_type.is_char_device()
    }
}

/// Directory entry, as returned by `readdir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirEntry {
    /// Entry name (not a full path).
    pub name: String,
    /// Entry metadata.
    pub stat: Stat,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_bits_select_owner_group_other() {
        let node = Inode::new(2, NodeInit::File(FileContent::empty()), 0o640, 1000, 100);
        assert!(node.allows(1000, 100, Access::READ | Access::WRITE));
        assert!(!node.allows(1000, 100, Access::EXEC));
        assert!(node.allows(2000, 100, Access::READ));
        assert!(!node.allows(2000, 100, Access::WRITE));
        assert!(!node.allows(2000, 200, Access::READ));
    }

    #[test]
    fn stat_composes_type_and_permission_bits() {
        let node = Inode::new(2, NodeInit::Directory, 0o755, 0, 0);
        let stat = node.stat();
        assert_eq!(stat.mode, 0o040755);
        assert_eq!(stat.perms(), 0o755);
        assert!(stat.is_dir());
    }

    #[test]
    fn lazy_content_reports_size_then_materializes() {
        let mut content = FileContent::Lazy {
            load: Arc::new(|| b"hello".to_vec()),
            size: 5,
        };
        assert_eq!(content.size(), 5);
        assert_eq!(content.materialize().as_slice(), b"hello");
        // Now materialized: size comes from the buffer.
        assert_eq!(content.size(), 5);
    }

    #[test]
    fn symlink_size_is_target_length() {
        let node = Inode::new(3, NodeInit::Symlink("/target".into()), 0o777, 0, 0);
        assert_eq!(node.size(), 7);
        assert!(node.stat().is_symlink());
    }
}
