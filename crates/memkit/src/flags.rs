//! Open flags and access modes.
//!
//! [`OpenFlags`] is the bitmask accepted by `open`; the node-style flag
//! strings (`"r"`, `"w+"`, `"ax"`, ...) parse into it via [`std::str::FromStr`].
//! Unknown strings are rejected with a typed `EINVAL` error rather than
//! guessed at.

use std::str::FromStr;

use bitflags::bitflags;

use crate::error::{err, Errno, FsError};

bitflags! {
    /// Flags controlling how a file is opened.
    ///
    /// The access mode lives in the low two bits (`O_RDONLY` is the empty
    /// set, like the POSIX constant zero); use [`OpenFlags::readable`] and
    /// [`OpenFlags::writable`] instead of testing those bits directly.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Open write-only.
        const WRONLY = 0o1;
        /// Open read-write.
        const RDWR = 0o2;
        /// Create the file if it does not exist.
        const CREAT = 0o100;
        /// With `CREAT`, fail if the file already exists.
        const EXCL = 0o200;
        /// Truncate an existing file to zero length.
        const TRUNC = 0o1000;
        /// All writes go to end-of-data.
        const APPEND = 0o2000;
        /// Fail unless the path names a directory.
        const DIRECTORY = 0o200000;
        /// Fail if the final path component is a symlink.
        const NOFOLLOW = 0o400000;
    }
}

impl OpenFlags {
    /// Open read-only (the empty flag set, like `O_RDONLY = 0`).
    pub const RDONLY: OpenFlags = OpenFlags::empty();

    /// Whether the descriptor permits reading.
    pub fn readable(self) -> bool {
        !self.contains(OpenFlags::WRONLY) || self.contains(OpenFlags::RDWR)
    }

    /// Whether the descriptor permits writing.
    pub fn writable(self) -> bool {
        self.intersects(OpenFlags::WRONLY | OpenFlags::RDWR)
    }
}

impl FromStr for OpenFlags {
    type Err = FsError;

    /// Parse a node-style flag string.
    ///
    /// Accepted: `r`, `rs`, `r+`, `rs+`, `w`, `wx`, `w+`, `wx+`, `a`, `ax`,
    /// `a+`, `ax+` (and the `x`/`s`-first spellings). The `s` (synchronous)
    /// modifier is accepted and ignored: every operation on an in-memory
    /// volume is already synchronous.
    fn from_str(s: &str) -> Result<Self, FsError> {
        let flags = match s {
            "r" | "rs" | "sr" => OpenFlags::RDONLY,
            "r+" | "rs+" | "sr+" => OpenFlags::RDWR,
            "w" => OpenFlags::WRONLY | OpenFlags::CREAT | OpenFlags::TRUNC,
            "wx" | "xw" => OpenFlags::WRONLY | OpenFlags::CREAT | OpenFlags::TRUNC | OpenFlags::EXCL,
            "w+" => OpenFlags::RDWR | OpenFlags::CREAT | OpenFlags::TRUNC,
            "wx+" | "xw+" => OpenFlags::RDWR | OpenFlags::CREAT | OpenFlags::TRUNC | OpenFlags::EXCL,
            "a" => OpenFlags::WRONLY | OpenFlags::CREAT | OpenFlags::APPEND,
            "ax" | "xa" => OpenFlags::WRONLY | OpenFlags::CREAT | OpenFlags::APPEND | OpenFlags::EXCL,
            "a+" => OpenFlags::RDWR | OpenFlags::CREAT | OpenFlags::APPEND,
            "ax+" | "xa+" => OpenFlags::RDWR | OpenFlags::CREAT | OpenFlags::APPEND | OpenFlags::EXCL,
            _ => return Err(err(Errno::EINVAL, "open").with_path(s)),
        };
        Ok(flags)
    }
}

bitflags! {
    /// Permission classes for `access` and internal permission checks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u32 {
        /// Read permission.
        const READ = 0o4;
        /// Write permission.
        const WRITE = 0o2;
        /// Execute/search permission.
        const EXEC = 0o1;
    }
}

impl Access {
    /// Existence check only (`F_OK`).
    pub const EXISTS: Access = Access::empty();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_flags() {
        let f: OpenFlags = "r".parse().unwrap();
        assert!(f.readable());
        assert!(!f.writable());

        let f: OpenFlags = "r+".parse().unwrap();
        assert!(f.readable());
        assert!(f.writable());
    }

    #[test]
    fn write_flags_create_and_truncate() {
        let f: OpenFlags = "w".parse().unwrap();
        assert!(f.writable());
        assert!(!f.readable());
        assert!(f.contains(OpenFlags::CREAT));
        assert!(f.contains(OpenFlags::TRUNC));
        assert!(!f.contains(OpenFlags::EXCL));
    }

    #[test]
    fn exclusive_spellings_are_equivalent() {
        let a: OpenFlags = "wx".parse().unwrap();
        let b: OpenFlags = "xw".parse().unwrap();
        assert_eq!(a, b);
        assert!(a.contains(OpenFlags::EXCL));
    }

    #[test]
    fn append_flags() {
        let f: OpenFlags = "a+".parse().unwrap();
        assert!(f.readable());
        assert!(f.writable());
        assert!(f.contains(OpenFlags::APPEND));
        assert!(!f.contains(OpenFlags::TRUNC));
    }

    #[test]
    fn unknown_flag_string_is_einval() {
        let e = "rw".parse::<OpenFlags>().unwrap_err();
        assert_eq!(e.errno, Errno::EINVAL);
    }
}
