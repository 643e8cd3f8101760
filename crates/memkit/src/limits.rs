//! Filesystem resource limits for virtual execution.
//!
//! These limits prevent callers from exhausting memory via filesystem
//! operations: a single oversized file, or many writes that together grow the
//! volume past its budget. Exceeding either limit surfaces as `EFBIG` from
//! the write/truncate paths.

use serde::{Deserialize, Serialize};

/// Default maximum total volume size: 100MB
pub const DEFAULT_MAX_TOTAL_BYTES: u64 = 100_000_000;

/// Default maximum single file size: 10MB
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10_000_000;

/// Resource limits for an in-memory volume.
///
/// # Example
///
/// ```rust
/// use memkit::{FsLimits, MemoryFs};
///
/// let limits = FsLimits::new()
///     .max_total_bytes(50_000_000) // 50MB total
///     .max_file_size(5_000_000);   // 5MB per file
///
/// let fs = MemoryFs::builder().limits(limits).build();
/// # let _ = fs;
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsLimits {
    /// Maximum total bytes across all files.
    /// Default: 100MB (100,000,000 bytes)
    pub max_total_bytes: u64,

    /// Maximum size of a single file in bytes.
    /// Default: 10MB (10,000,000 bytes)
    pub max_file_size: u64,
}

impl Default for FsLimits {
    fn default() -> Self {
        Self {
            max_total_bytes: DEFAULT_MAX_TOTAL_BYTES,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

impl FsLimits {
    /// Create new limits with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create unlimited limits (no restrictions).
    ///
    /// # Warning
    ///
    /// Removes protection against memory exhaustion. Only use in trusted
    /// environments.
    pub fn unlimited() -> Self {
        Self {
            max_total_bytes: u64::MAX,
            max_file_size: u64::MAX,
        }
    }

    /// Set maximum total volume size.
    pub fn max_total_bytes(mut self, bytes: u64) -> Self {
        self.max_total_bytes = bytes;
        self
    }

    /// Set maximum single file size.
    pub fn max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }
}

/// Storage usage statistics for a volume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsUsage {
    /// Total bytes held by file contents.
    pub total_bytes: u64,
    /// Number of regular files.
    pub file_count: u64,
    /// Number of directories.
    pub dir_count: u64,
    /// Number of symlinks.
    pub symlink_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let limits = FsLimits::new();
        assert_eq!(limits.max_total_bytes, DEFAULT_MAX_TOTAL_BYTES);
        assert_eq!(limits.max_file_size, DEFAULT_MAX_FILE_SIZE);
    }

    #[test]
    fn builder_overrides() {
        let limits = FsLimits::new().max_file_size(1024).max_total_bytes(4096);
        assert_eq!(limits.max_file_size, 1024);
        assert_eq!(limits.max_total_bytes, 4096);
    }

    #[test]
    fn unlimited_is_unbounded() {
        let limits = FsLimits::unlimited();
        assert_eq!(limits.max_total_bytes, u64::MAX);
        assert_eq!(limits.max_file_size, u64::MAX);
    }
}
