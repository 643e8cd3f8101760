//! Error types for Memkit
//!
//! Every engine failure is a POSIX-style error: an errno mnemonic, the
//! originating syscall name, and the path(s) involved. Synchronous calls
//! return these directly; the async surface forwards them unchanged.

use serde::{Deserialize, Serialize};

/// Result type alias using Memkit's [`FsError`].
pub type Result<T> = std::result::Result<T, FsError>;

/// POSIX errno mnemonics surfaced by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum Errno {
    /// No such file or directory.
    ENOENT,
    /// File exists.
    EEXIST,
    /// Not a directory.
    ENOTDIR,
    /// Illegal operation on a directory.
    EISDIR,
    /// Directory not empty.
    ENOTEMPTY,
    /// Permission denied.
    EACCES,
    /// Operation not permitted.
    EPERM,
    /// Resource busy or locked.
    EBUSY,
    /// Invalid argument.
    EINVAL,
    /// Too many symbolic links encountered.
    ELOOP,
    /// Bad file descriptor.
    EBADF,
    /// No such device or address.
    ENXIO,
    /// Invalid seek.
    ESPIPE,
    /// File too large.
    EFBIG,
    /// No such device.
    ENODEV,
}

impl Errno {
    /// Human-readable description, matching the conventional errno strings.
    pub fn description(&self) -> &'static str {
        match self {
            Errno::ENOENT => "no such file or directory",
            Errno::EEXIST => "file already exists",
            Errno::ENOTDIR => "not a directory",
            Errno::EISDIR => "illegal operation on a directory",
            Errno::ENOTEMPTY => "directory not empty",
            Errno::EACCES => "permission denied",
            Errno::EPERM => "operation not permitted",
            Errno::EBUSY => "resource busy or locked",
            Errno::EINVAL => "invalid argument",
            Errno::ELOOP => "too many symbolic links encountered",
            Errno::EBADF => "bad file descriptor",
            Errno::ENXIO => "no such device or address",
            Errno::ESPIPE => "invalid seek",
            Errno::EFBIG => "file too large",
            Errno::ENODEV => "no such device",
        }
    }

    /// The mnemonic as a string (`"ENOENT"`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            Errno::ENOENT => "ENOENT",
            Errno::EEXIST => "EEXIST",
            Errno::ENOTDIR => "ENOTDIR",
            Errno::EISDIR => "EISDIR",
            Errno::ENOTEMPTY => "ENOTEMPTY",
            Errno::EACCES => "EACCES",
            Errno::EPERM => "EPERM",
            Errno::EBUSY => "EBUSY",
            Errno::EINVAL => "EINVAL",
            Errno::ELOOP => "ELOOP",
            Errno::EBADF => "EBADF",
            Errno::ENXIO => "ENXIO",
            Errno::ESPIPE => "ESPIPE",
            Errno::EFBIG => "EFBIG",
            Errno::ENODEV => "ENODEV",
        }
    }
}

impl std::fmt::Display for Errno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A filesystem error: errno plus syscall context.
///
/// Formats the way callers expect from a POSIX-flavored API:
///
/// ```text
/// ENOENT: no such file or directory, open '/missing'
/// ENOTEMPTY: directory not empty, rename '/a' -> '/b'
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsError {
    /// POSIX errno mnemonic.
    pub errno: Errno,
    /// Mapped syscall name (`readdir` reports as `scandir`).
    pub syscall: &'static str,
    /// Primary path, when the operation had one.
    pub path: Option<String>,
    /// Secondary path (rename/link/copy destination).
    pub dest: Option<String>,
}

impl FsError {
    /// Create an error with no path context.
    pub fn new(errno: Errno, syscall: &'static str) -> Self {
        Self {
            errno,
            syscall,
            path: None,
            dest: None,
        }
    }

    /// Attach the primary path.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Attach the secondary path (e.g. a rename target).
    pub fn with_dest(mut self, dest: impl Into<String>) -> Self {
        self.dest = Some(dest.into());
        self
    }

    /// The errno description string.
    pub fn description(&self) -> &'static str {
        self.errno.description()
    }
}

impl std::fmt::Display for FsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}, {}", self.errno, self.errno.description(), self.syscall)?;
        if let Some(path) = &self.path {
            write!(f, " '{path}'")?;
        }
        if let Some(dest) = &self.dest {
            write!(f, " -> '{dest}'")?;
        }
        Ok(())
    }
}

impl std::error::Error for FsError {}

/// Shorthand used throughout the engine.
pub(crate) fn err(errno: Errno, syscall: &'static str) -> FsError {
    FsError::new(errno, syscall)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code_description_and_path() {
        let e = FsError::new(Errno::ENOENT, "open").with_path("/missing");
        assert_eq!(e.to_string(), "ENOENT: no such file or directory, open '/missing'");
    }

    #[test]
    fn display_includes_dest_for_two_path_calls() {
        let e = FsError::new(Errno::ENOTEMPTY, "rename")
            .with_path("/a")
            .with_dest("/b");
        assert_eq!(e.to_string(), "ENOTEMPTY: directory not empty, rename '/a' -> '/b'");
    }

    #[test]
    fn errno_roundtrips_through_serde() {
        let json = serde_json::to_string(&Errno::ELOOP).unwrap();
        let back: Errno = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Errno::ELOOP);
    }
}
