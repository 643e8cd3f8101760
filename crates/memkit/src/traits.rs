//! Async filesystem trait.
//!
//! [`FileSystem`] is the path-level surface in `async fn` form, implemented
//! by [`MemoryFs`] and [`MountableFs`]. The engine core is synchronous and
//! runs each call to completion; these adapters just expose it where an
//! async trait object is the expected seam, with no internal suspension
//! points.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;

use crate::error::Result;
use crate::flags::Access;
use crate::memory::MemoryFs;
use crate::mount::MountableFs;
use crate::node::{DirEntry, Stat};

/// Async filesystem trait.
///
/// All filesystem implementations must implement this trait.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Read a file's contents.
    async fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    /// Create or replace a file.
    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Append to a file, creating it if missing.
    async fn append_file(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Create a directory.
    async fn mkdir(&self, path: &str, mode: u32) -> Result<()>;

    /// Remove an empty directory.
    async fn rmdir(&self, path: &str) -> Result<()>;

    /// Remove a file or symlink.
    async fn unlink(&self, path: &str) -> Result<()>;

    /// Get file metadata, following symlinks.
    async fn stat(&self, path: &str) -> Result<Stat>;

    /// Get file metadata without following a final symlink.
    async fn lstat(&self, path: &str) -> Result<Stat>;

    /// Read directory entries.
    async fn readdir(&self, path: &str) -> Result<Vec<DirEntry>>;

    /// Check if a path exists.
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Rename/move a file or directory.
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Copy a file.
    async fn copy_file(&self, from: &str, to: &str) -> Result<()>;

    /// Create a symbolic link.
    async fn symlink(&self, target: &str, link: &str) -> Result<()>;

    /// Read a symbolic link's target.
    async fn read_link(&self, path: &str) -> Result<String>;

    /// Change file permissions.
    async fn chmod(&self, path: &str, mode: u32) -> Result<()>;

    /// Change file ownership.
    async fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<()>;

    /// Truncate a file.
    async fn truncate(&self, path: &str, len: u64) -> Result<()>;

    /// Set access and modification times.
    async fn utimes(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> Result<()>;

    /// Check the caller's permissions.
    async fn access(&self, path: &str, mode: Access) -> Result<()>;

    /// Canonicalize a path.
    async fn realpath(&self, path: &str) -> Result<String>;
}

macro_rules! delegate_filesystem {
    ($ty:ty) => {
        #[async_trait]
        impl FileSystem for $ty {
            async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
                <$ty>::read_file(self, path)
            }

            async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
                <$ty>::write_file(self, path, data)
            }

            async fn append_file(&self, path: &str, data: &[u8]) -> Result<()> {
                <$ty>::append_file(self, path, data)
            }

            async fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
                <$ty>::mkdir(self, path, mode)
            }

            async fn rmdir(&self, path: &str) -> Result<()> {
                <$ty>::rmdir(self, path)
            }

            async fn unlink(&self, path: &str) -> Result<()> {
                <$ty>::unlink(self, path)
            }

            async fn stat(&self, path: &str) -> Result<Stat> {
                <$ty>::stat(self, path)
            }

            async fn lstat(&self, path: &str) -> Result<Stat> {
                <$ty>::lstat(self, path)
            }

            async fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
                <$ty>::readdir(self, path)
            }

            async fn exists(&self, path: &str) -> Result<bool> {
                Ok(<$ty>::exists(self, path))
            }

            async fn rename(&self, from: &str, to: &str) -> Result<()> {
                <$ty>::rename(self, from, to)
            }

            async fn copy_file(&self, from: &str, to: &str) -> Result<()> {
                <$ty>::copy_file(self, from, to)
            }

            async fn symlink(&self, target: &str, link: &str) -> Result<()> {
                <$ty>::symlink(self, target, link)
            }

            async fn read_link(&self, path: &str) -> Result<String> {
                <$ty>::readlink(self, path)
            }

            async fn chmod(&self, path: &str, mode: u32) -> Result<()> {
                <$ty>::chmod(self, path, mode)
            }

            async fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
                <$ty>::chown(self, path, uid, gid)
            }

            async fn truncate(&self, path: &str, len: u64) -> Result<()> {
                <$ty>::truncate(self, path, len)
            }

            async fn utimes(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> Result<()> {
                <$ty>::utimes(self, path, atime, mtime)
            }

            async fn access(&self, path: &str, mode: Access) -> Result<()> {
                <$ty>::access(self, path, mode)
            }

            async fn realpath(&self, path: &str) -> Result<String> {
                <$ty>::realpath(self, path)
            }
        }
    };
}

delegate_filesystem!(MemoryFs);
delegate_filesystem!(MountableFs);

// Allow owned instances to be used where Arc<dyn FileSystem> is expected.
impl From<MemoryFs> for Arc<dyn FileSystem> {
    fn from(fs: MemoryFs) -> Self {
        Arc::new(fs)
    }
}

impl From<MountableFs> for Arc<dyn FileSystem> {
    fn from(fs: MountableFs) -> Self {
        Arc::new(fs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(fs: Arc<dyn FileSystem>) {
        fs.mkdir("/d", 0o755).await.unwrap();
        fs.write_file("/d/f.txt", b"hi").await.unwrap();
        assert_eq!(fs.read_file("/d/f.txt").await.unwrap(), b"hi");
        assert!(fs.exists("/d/f.txt").await.unwrap());

        let entries = fs.readdir("/d").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "f.txt");

        fs.rename("/d/f.txt", "/d/g.txt").await.unwrap();
        assert!(!fs.exists("/d/f.txt").await.unwrap());
        assert_eq!(fs.stat("/d/g.txt").await.unwrap().size, 2);
    }

    #[tokio::test]
    async fn memory_fs_implements_the_trait() {
        exercise(Arc::new(MemoryFs::new())).await;
    }

    #[tokio::test]
    async fn mountable_fs_implements_the_trait() {
        let union = MountableFs::new(Arc::new(MemoryFs::new()));
        exercise(Arc::new(union)).await;
    }

    #[tokio::test]
    async fn symlinks_through_the_trait() {
        let fs: Arc<dyn FileSystem> = Arc::new(MemoryFs::new());
        fs.write_file("/f", b"x").await.unwrap();
        fs.symlink("/f", "/link").await.unwrap();
        assert_eq!(fs.read_link("/link").await.unwrap(), "/f");
        assert!(fs.lstat("/link").await.unwrap().is_symlink());
        assert_eq!(fs.realpath("/link").await.unwrap(), "/f");
    }
}
