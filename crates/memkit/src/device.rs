//! Character devices.
//!
//! A device driver implements [`CharDevice`]; the hooks it does not provide
//! fall back to the POSIX failures a device without that capability would
//! produce (`ENXIO` for data transfer, `ESPIPE` for seeking). Drivers are
//! registered in a [`DeviceRegistry`] under a `(major, minor)` pair; majors
//! and per-major minors are recycled id pools like every other id space in
//! the engine.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::sync::Arc;

use crate::bitmap::IdPool;
use crate::error::{err, Errno, Result};

/// Bits reserved for the minor number in an `rdev` value.
const MINOR_BITS: u32 = 20;

/// Pack a `(major, minor)` pair into an `rdev` value.
pub fn makedev(major: u32, minor: u32) -> u64 {
    ((major as u64) << MINOR_BITS) | (minor as u64 & ((1 << MINOR_BITS) - 1))
}

/// The major number of an `rdev` value.
pub fn major(rdev: u64) -> u32 {
    (rdev >> MINOR_BITS) as u32
}

/// The minor number of an `rdev` value.
pub fn minor(rdev: u64) -> u32 {
    (rdev & ((1 << MINOR_BITS) - 1)) as u32
}

/// A pluggable character-device driver.
///
/// All hooks are optional; the defaults behave like a device that does not
/// support the operation. `fd` is the descriptor the operation arrived on,
/// so drivers can keep per-descriptor state.
///
/// # Example
///
/// ```rust
/// use memkit::{CharDevice, Result};
///
/// /// `/dev/zero`: reads fill the buffer, writes vanish.
/// struct Zero;
///
/// impl CharDevice for Zero {
///     fn read(&self, _fd: u32, buf: &mut [u8], _pos: Option<u64>) -> Result<usize> {
///         buf.fill(0);
///         Ok(buf.len())
///     }
///
///     fn write(&self, _fd: u32, buf: &[u8], _pos: Option<u64>) -> Result<usize> {
///         Ok(buf.len())
///     }
/// }
/// ```
pub trait CharDevice: Send + Sync {
    /// A descriptor was opened on this device.
    fn open(&self, fd: u32) -> Result<()> {
        let _ = fd;
        Ok(())
    }

    /// A descriptor on this device was closed.
    fn close(&self, fd: u32) -> Result<()> {
        let _ = fd;
        Ok(())
    }

    /// Read into `buf` at `pos` (or the device's own notion of position).
    fn read(&self, fd: u32, buf: &mut [u8], pos: Option<u64>) -> Result<usize> {
        let _ = (fd, buf, pos);
        Err(err(Errno::ENXIO, "read"))
    }

    /// Write `buf` at `pos` (or the device's own notion of position).
    fn write(&self, fd: u32, buf: &[u8], pos: Option<u64>) -> Result<usize> {
        let _ = (fd, buf, pos);
        Err(err(Errno::ENXIO, "write"))
    }

    /// Reposition the descriptor. Devices without positions cannot seek.
    fn seek(&self, fd: u32, pos: SeekFrom) -> Result<u64> {
        let _ = (fd, pos);
        Err(err(Errno::ESPIPE, "lseek"))
    }
}

/// Registered drivers, keyed by packed `rdev`.
pub(crate) struct DeviceRegistry {
    majors: IdPool,
    minors: HashMap<u32, IdPool>,
    drivers: HashMap<u64, Arc<dyn CharDevice>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            majors: IdPool::new(0),
            minors: HashMap::new(),
            drivers: HashMap::new(),
        }
    }

    /// Register a driver, allocating the major and/or minor when not given.
    ///
    /// Registering over an occupied `(major, minor)` slot fails `EBUSY`.
    pub fn register(
        &mut self,
        driver: Arc<dyn CharDevice>,
        major: Option<u32>,
        minor: Option<u32>,
    ) -> Result<(u32, u32)> {
        let major = match major {
            Some(m) => {
                // Marking an already-used major is fine: majors are shared
                // by all their minors.
                self.majors
                    .allocate_id(m as u64)
                    .map_err(|_| err(Errno::EINVAL, "mknod"))?;
                m
            }
            None => self
                .majors
                .allocate()
                .map_err(|_| err(Errno::ENODEV, "mknod"))? as u32,
        };
        let pool = self.minors.entry(major).or_insert_with(|| IdPool::new(0));
        let minor = match minor {
            Some(n) => {
                let changed = pool
                    .allocate_id(n as u64)
                    .map_err(|_| err(Errno::EINVAL, "mknod"))?;
                if !changed {
                    return Err(err(Errno::EBUSY, "mknod"));
                }
                n
            }
            None => pool.allocate().map_err(|_| err(Errno::ENODEV, "mknod"))? as u32,
        };
        self.drivers.insert(makedev(major, minor), driver);
        Ok((major, minor))
    }

    /// Remove a driver and recycle its minor number.
    pub fn unregister(&mut self, major: u32, minor_no: u32) -> Result<()> {
        let rdev = makedev(major, minor_no);
        if self.drivers.remove(&rdev).is_none() {
            return Err(err(Errno::ENODEV, "mknod"));
        }
        if let Some(pool) = self.minors.get_mut(&major) {
            let _ = pool.deallocate(minor_no as u64);
        }
        Ok(())
    }

    /// Look up the driver for a device inode's `rdev`.
    pub fn driver(&self, rdev: u64) -> Option<Arc<dyn CharDevice>> {
        self.drivers.get(&rdev).cloned()
    }
}
