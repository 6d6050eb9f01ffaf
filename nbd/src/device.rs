//! Linux kernel NBD device control.
//!
//! Wraps the ioctls `nbd-client` issues on `/dev/nbdX`. The kernel implements
//! only the transmission phase; whoever holds the other end of the socket
//! passed to [`NbdDevice::set_sock`] must answer its requests.
//!
//! # Example
//!
//! ```ignore
//! use nbd::{DeviceGeometry, NbdDevice};
//!
//! let device = NbdDevice::open("/dev/nbd0")?;
//! device.configure(&DeviceGeometry::with_size(4096, 1 << 30))?;
//! device.clear_sock()?;
//! device.set_sock(sock.as_raw_fd())?;
//! device.do_it()?; // blocks until disconnect
//! ```

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::libc;
use thiserror::Error;

use crate::protocol::{NBD_FLAG_HAS_FLAGS, NBD_FLAG_SEND_FLUSH, NBD_FLAG_SEND_TRIM};

// NBD ioctl numbers from linux/nbd.h (architecture-independent)
mod ioctl {
    use nix::libc;
    pub const NBD_SET_SOCK: libc::c_ulong = 0xab00;
    pub const NBD_SET_BLKSIZE: libc::c_ulong = 0xab01;
    pub const NBD_SET_SIZE: libc::c_ulong = 0xab02;
    pub const NBD_DO_IT: libc::c_ulong = 0xab03;
    pub const NBD_CLEAR_SOCK: libc::c_ulong = 0xab04;
    pub const NBD_CLEAR_QUE: libc::c_ulong = 0xab05;
    pub const NBD_SET_SIZE_BLOCKS: libc::c_ulong = 0xab07;
    pub const NBD_DISCONNECT: libc::c_ulong = 0xab08;
    pub const NBD_SET_FLAGS: libc::c_ulong = 0xab0a;
}
pub use ioctl::NBD_DISCONNECT;
use ioctl::*;

/// Kernel device control errors.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(
        "failed to open `{}`: {source}; is the `nbd` kernel module loaded and do you have \
         permission to access the device?",
        path.display()
    )]
    Open { path: PathBuf, source: io::Error },

    #[error("failed to reread partitions of `{}`: {source}", path.display())]
    PartitionScan { path: PathBuf, source: io::Error },

    #[error("ioctl {op} failed: {source}")]
    Ioctl { op: &'static str, source: Errno },
}

impl DeviceError {
    fn ioctl(op: &'static str) -> impl FnOnce(Errno) -> Self {
        move |source| Self::Ioctl { op, source }
    }
}

/// Transmission flags advertised to the kernel with `NBD_SET_FLAGS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransmissionFlags(pub u16);

impl TransmissionFlags {
    pub fn new(flush: bool, trim: bool) -> Self {
        let mut flags = 0;
        if flush {
            flags |= NBD_FLAG_SEND_FLUSH;
        }
        if trim {
            flags |= NBD_FLAG_SEND_TRIM;
        }
        if flags != 0 {
            flags |= NBD_FLAG_HAS_FLAGS;
        }
        Self(flags)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, flag: u16) -> bool {
        self.0 & flag == flag
    }
}

/// Geometry handed to the kernel before the socket is bound.
///
/// Each field is optional; unset fields are left at the kernel's defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceGeometry {
    pub block_size: Option<u64>,
    pub size_bytes: Option<u64>,
    pub size_blocks: Option<u64>,
}

impl DeviceGeometry {
    /// Geometry with a block size and a byte size, block count derived.
    pub fn with_size(block_size: u64, size_bytes: u64) -> Self {
        Self {
            block_size: Some(block_size),
            size_bytes: Some(size_bytes),
            size_blocks: Some(size_bytes / block_size),
        }
    }
}

/// An open NBD device special file.
#[derive(Debug)]
pub struct NbdDevice {
    path: PathBuf,
    file: File,
}

impl NbdDevice {
    /// Open an NBD device for read/write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DeviceError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| DeviceError::Open {
                path: path.clone(),
                source,
            })?;
        Ok(Self { path, file })
    }

    /// Get the device path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open and immediately close the device read-only.
    ///
    /// Makes the kernel publish the partition table of the now-bound device.
    pub fn reread_partitions(&self) -> Result<(), DeviceError> {
        File::open(&self.path)
            .map(drop)
            .map_err(|source| DeviceError::PartitionScan {
                path: self.path.clone(),
                source,
            })
    }

    /// Issue the geometry ioctls for whichever fields are set.
    pub fn configure(&self, geometry: &DeviceGeometry) -> Result<(), DeviceError> {
        if let Some(block_size) = geometry.block_size {
            self.ioctl_arg(NBD_SET_BLKSIZE, block_size)
                .map_err(DeviceError::ioctl("NBD_SET_BLKSIZE"))?;
        }
        if let Some(size_bytes) = geometry.size_bytes {
            self.ioctl_arg(NBD_SET_SIZE, size_bytes)
                .map_err(DeviceError::ioctl("NBD_SET_SIZE"))?;
        }
        if let Some(size_blocks) = geometry.size_blocks {
            self.ioctl_arg(NBD_SET_SIZE_BLOCKS, size_blocks)
                .map_err(DeviceError::ioctl("NBD_SET_SIZE_BLOCKS"))?;
        }
        Ok(())
    }

    /// Bind a connected socket to the device.
    pub fn set_sock(&self, sock: RawFd) -> Result<(), DeviceError> {
        self.ioctl_arg(NBD_SET_SOCK, sock as u64)
            .map_err(DeviceError::ioctl("NBD_SET_SOCK"))
    }

    /// Advertise transmission flags (trim, flush) to the kernel.
    pub fn set_flags(&self, flags: TransmissionFlags) -> Result<(), DeviceError> {
        self.ioctl_arg(NBD_SET_FLAGS, flags.0 as u64)
            .map_err(DeviceError::ioctl("NBD_SET_FLAGS"))
    }

    /// Run the device. Blocks until the socket is disconnected or fails.
    pub fn do_it(&self) -> Result<(), DeviceError> {
        self.ioctl_none(NBD_DO_IT)
            .map_err(DeviceError::ioctl("NBD_DO_IT"))
    }

    /// Clear the socket association (and pending requests).
    pub fn clear_sock(&self) -> Result<(), DeviceError> {
        self.ioctl_none(NBD_CLEAR_SOCK)
            .map_err(DeviceError::ioctl("NBD_CLEAR_SOCK"))
    }

    /// Clear the kernel request queue.
    pub fn clear_queue(&self) -> Result<(), DeviceError> {
        self.ioctl_none(NBD_CLEAR_QUE)
            .map_err(DeviceError::ioctl("NBD_CLEAR_QUE"))
    }

    /// Ask the kernel to send NBD_CMD_DISC and tear the device down.
    pub fn disconnect(&self) -> Result<(), DeviceError> {
        self.ioctl_none(NBD_DISCONNECT)
            .map_err(DeviceError::ioctl("NBD_DISCONNECT"))
    }

    fn ioctl_none(&self, request: libc::c_ulong) -> Result<(), Errno> {
        // SAFETY: NBD ioctls without an argument only act on the device fd.
        let res = unsafe { libc::ioctl(self.file.as_raw_fd(), request as _) };
        Errno::result(res).map(drop)
    }

    fn ioctl_arg(&self, request: libc::c_ulong, arg: u64) -> Result<(), Errno> {
        // SAFETY: NBD ioctls take their argument by value, never as a pointer.
        let res =
            unsafe { libc::ioctl(self.file.as_raw_fd(), request as _, arg as libc::c_ulong) };
        Errno::result(res).map(drop)
    }
}

impl AsRawFd for NbdDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Disconnect an NBD device by path.
///
/// Follows the same sequence as `nbd-client -d`:
/// 1. NBD_DISCONNECT - tells kernel to send NBD_CMD_DISC to server
/// 2. NBD_CLEAR_SOCK - clears socket and pending requests
pub fn disconnect_device(path: impl AsRef<Path>) -> Result<(), DeviceError> {
    let device = NbdDevice::open(path)?;
    device.disconnect()?;
    device.clear_sock()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_empty_without_features() {
        let flags = TransmissionFlags::new(false, false);
        assert!(flags.is_empty());
    }

    #[test]
    fn flags_include_has_flags() {
        let flags = TransmissionFlags::new(false, true);
        assert!(flags.contains(NBD_FLAG_HAS_FLAGS));
        assert!(flags.contains(NBD_FLAG_SEND_TRIM));
        assert!(!flags.contains(NBD_FLAG_SEND_FLUSH));
    }

    #[test]
    fn geometry_derives_block_count() {
        let geometry = DeviceGeometry::with_size(4096, 1 << 20);
        assert_eq!(geometry.size_blocks, Some(256));
    }

    #[test]
    fn open_missing_device_names_cause() {
        let err = NbdDevice::open("/nonexistent/nbd0").unwrap_err();
        assert!(matches!(err, DeviceError::Open { .. }));
        assert!(err.to_string().contains("nbd"));
    }

    #[test]
    fn reread_failure_is_not_an_open_error() {
        let path = std::env::temp_dir().join(format!("nbd-reread-{}", std::process::id()));
        File::create(&path).unwrap();
        let device = NbdDevice::open(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        let err = device.reread_partitions().unwrap_err();
        assert!(matches!(err, DeviceError::PartitionScan { .. }));
    }

    #[test]
    fn ioctl_on_regular_file_is_rejected() {
        let device = NbdDevice::open("/dev/null").unwrap();
        let err = device.clear_sock().unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Ioctl {
                op: "NBD_CLEAR_SOCK",
                ..
            }
        ));
    }
}
