//! File descriptors.
//!
//! A [`FileHandle`] is an open handle: the inode it refers to, the flags it
//! was opened with, and a seek cursor. Descriptor numbers come from their
//! own recycled [`IdPool`] starting at 0. Each live handle holds one private
//! reference on its inode; the facade takes and releases those references
//! around [`FdTable`] calls.

use std::collections::HashMap;
use std::io::SeekFrom;

use crate::bitmap::IdPool;
use crate::error::{err, Errno, Result};
use crate::flags::OpenFlags;
use crate::node::Ino;

#[derive(Debug, Clone)]
pub(crate) struct FileHandle {
    pub ino: Ino,
    pub flags: OpenFlags,
    pub pos: u64,
}

pub(crate) struct FdTable {
    ids: IdPool,
    fds: HashMap<u32, FileHandle>,
}

impl FdTable {
    pub fn new() -> Self {
        Self {
            ids: IdPool::new(0).with_shrink(true),
            fds: HashMap::new(),
        }
    }

    pub fn create(&mut self, ino: Ino, flags: OpenFlags, syscall: &'static str) -> Result<u32> {
        let fd = self.ids.allocate().map_err(|_| err(Errno::EFBIG, syscall))? as u32;
        self.fds.insert(
            fd,
            FileHandle {
                ino,
                flags,
                pos: 0,
            },
        );
        Ok(fd)
    }

    pub fn get(&self, fd: u32) -> Option<&FileHandle> {
        self.fds.get(&fd)
    }

    pub fn get_mut(&mut self, fd: u32) -> Option<&mut FileHandle> {
        self.fds.get_mut(&fd)
    }

    /// Remove a descriptor; the caller releases the inode reference.
    pub fn remove(&mut self, fd: u32) -> Option<FileHandle> {
        let handle = self.fds.remove(&fd)?;
        let _ = self.ids.deallocate(fd as u64);
        Some(handle)
    }

    /// Duplicate a descriptor: a second handle over the same inode, with its
    /// own cursor seeded from the original.
    pub fn dup(&mut self, fd: u32, syscall: &'static str) -> Result<u32> {
        let handle = self
            .fds
            .get(&fd)
            .cloned()
            .ok_or(err(Errno::EBADF, syscall))?;
        let new_fd = self.ids.allocate().map_err(|_| err(Errno::EFBIG, syscall))? as u32;
        self.fds.insert(new_fd, handle);
        Ok(new_fd)
    }
}

/// Compute a new cursor position. Negative results are `EINVAL`.
pub(crate) fn seek_pos(cur: u64, size: u64, from: SeekFrom) -> Result<u64> {
    let target = match from {
        SeekFrom::Start(p) => Some(p),
        SeekFrom::Current(d) => cur.checked_add_signed(d),
        SeekFrom::End(d) => size.checked_add_signed(d),
    };
    target.ok_or(err(Errno::EINVAL, "lseek"))
}

/// Copy out of `data` at `at`; short reads at end-of-data.
pub(crate) fn read_from_content(data: &[u8], at: u64, buf: &mut [u8]) -> usize {
    let at = at as usize;
    if at >= data.len() {
        return 0;
    }
    let n = buf.len().min(data.len() - at);
    buf[..n].copy_from_slice(&data[at..at + n]);
    n
}

/// Copy `data` into the buffer at `at`, zero-filling any gap between the
/// current end and `at`, growing to the exact new length.
pub(crate) fn write_to_content(content: &mut Vec<u8>, at: u64, data: &[u8]) -> usize {
    let at = at as usize;
    let end = at + data.len();
    if content.len() < at {
        content.resize(at, 0);
    }
    if content.len() < end {
        content.resize(end, 0);
    }
    content[at..end].copy_from_slice(data);
    data.len()
}
