//! In-memory RAM disk.

use std::io;

use async_trait::async_trait;
use nix::errno::Errno;
use tokio::sync::RwLock;
use tracing::info;

use super::checked_range;
use crate::ops::{BlockOperations, Capabilities, OpResult};

/// A zero-initialized device held entirely in memory.
pub struct MemoryBackend {
    data: RwLock<Vec<u8>>,
    size_bytes: u64,
}

impl MemoryBackend {
    /// Allocate a zeroed device of `size_bytes`.
    ///
    /// Fails with `OutOfMemory` instead of aborting when the allocation
    /// cannot be satisfied.
    pub fn new(size_bytes: u64) -> io::Result<Self> {
        let len = usize::try_from(size_bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::OutOfMemory, e))?;
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|e| io::Error::new(io::ErrorKind::OutOfMemory, e))?;
        data.resize(len, 0);
        Ok(Self {
            data: RwLock::new(data),
            size_bytes,
        })
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }
}

#[async_trait]
impl BlockOperations for MemoryBackend {
    fn capabilities(&self) -> Capabilities {
        Capabilities::ALL
    }

    async fn read(&self, buf: &mut [u8], offset: u64) -> OpResult {
        let (start, end) = checked_range(offset, buf.len(), self.size_bytes).ok_or(Errno::EIO)?;
        let data = self.data.read().await;
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    async fn write(&self, buf: &[u8], offset: u64) -> OpResult {
        let (start, end) =
            checked_range(offset, buf.len(), self.size_bytes).ok_or(Errno::ENOSPC)?;
        let mut data = self.data.write().await;
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    async fn disc(&self) {
        info!(size_bytes = self.size_bytes, "memory device disconnected");
    }

    async fn trim(&self, offset: u64, length: u32) -> OpResult {
        let (start, end) =
            checked_range(offset, length as usize, self.size_bytes).ok_or(Errno::EINVAL)?;
        let mut data = self.data.write().await;
        data[start..end].fill(0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read() {
        let backend = MemoryBackend::new(4096).unwrap();
        backend.write(&[0xAB; 100], 50).await.unwrap();

        let mut buf = [0u8; 200];
        backend.read(&mut buf, 0).await.unwrap();
        assert_eq!(&buf[..50], &[0x00; 50]);
        assert_eq!(&buf[50..150], &[0xAB; 100]);
        assert_eq!(&buf[150..200], &[0x00; 50]);
    }

    #[tokio::test]
    async fn trim_zeroes_range() {
        let backend = MemoryBackend::new(1024).unwrap();
        backend.write(&[0xFF; 1024], 0).await.unwrap();
        backend.trim(512, 256).await.unwrap();

        let mut buf = [0u8; 1024];
        backend.read(&mut buf, 0).await.unwrap();
        assert!(buf[..512].iter().all(|&b| b == 0xFF));
        assert!(buf[512..768].iter().all(|&b| b == 0));
        assert!(buf[768..].iter().all(|&b| b == 0xFF));
    }

    #[tokio::test]
    async fn out_of_range_requests_fail() {
        let backend = MemoryBackend::new(1024).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(backend.read(&mut buf, 1020).await, Err(Errno::EIO));
        assert_eq!(backend.write(&buf, 1020).await, Err(Errno::ENOSPC));
        assert_eq!(backend.trim(u64::MAX, 1).await, Err(Errno::EINVAL));
    }

    #[test]
    fn oversized_device_is_an_error() {
        let err = MemoryBackend::new(u64::MAX).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::OutOfMemory);
    }
}
