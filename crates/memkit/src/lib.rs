//! Memkit - In-memory POSIX filesystem engine for virtual sandboxes
//!
//! Part of the Everruns ecosystem.
//!
//! A [`MemoryFs`] is a complete filesystem in memory: inodes with hardlink
//! counts, directories, symlinks, character devices, file descriptors, and
//! owner/group/other permission checks. A [`MountableFs`] composes several
//! instances into one namespace with Unix mount semantics and path
//! redirects.
//!
//! # Example
//!
//! ```rust
//! use memkit::MemoryFs;
//!
//! fn main() -> anyhow::Result<()> {
//!     let fs = MemoryFs::new();
//!     fs.mkdir("/tmp", 0o777)?;
//!     fs.write_file("/tmp/hello.txt", b"hello world")?;
//!     assert_eq!(fs.read_file("/tmp/hello.txt")?, b"hello world");
//!     assert!(fs.stat("/tmp").unwrap().is_dir());
//!     Ok(())
//! }
//! ```

// Structured logging is optional; without the `logging` feature these
// expand to nothing.
macro_rules! fs_trace {
    ($($arg:tt)*) => {{
        #[cfg(feature = "logging")]
        tracing::trace!($($arg)*);
    }};
}

mod bitmap;
mod device;
mod error;
mod fd;
mod flags;
mod inodes;
mod limits;
mod memory;
mod mount;
mod navigate;
mod node;
mod traits;

pub use bitmap::{IdPool, RangeError};
pub use device::{makedev, major, minor, CharDevice};
pub use error::{Errno, FsError, Result};
pub use flags::{Access, OpenFlags};
pub use limits::{FsLimits, FsUsage};
pub use memory::{MemoryFs, MemoryFsBuilder, SharedMap};
pub use mount::MountableFs;
pub use node::{DirEntry, FileContent, FileType, Ino, NodeInit, Stat};
pub use traits::FileSystem;
