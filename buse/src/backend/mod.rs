//! Reference backends.
//!
//! - [`MemoryBackend`] keeps the whole device in RAM
//! - [`FileBackend`] loops the device back onto a regular file

mod file;
mod memory;

pub use file::FileBackend;
pub use memory::MemoryBackend;

use nix::errno::Errno;

/// Byte range `[offset, offset + length)` as indices into a device of
/// `size_bytes`, or `None` if it does not fit.
pub(crate) fn checked_range(offset: u64, length: usize, size_bytes: u64) -> Option<(usize, usize)> {
    let end = offset.checked_add(length as u64)?;
    if end > size_bytes {
        return None;
    }
    Some((offset as usize, end as usize))
}

pub(crate) fn errno_of(err: &std::io::Error) -> Errno {
    err.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO)
}
