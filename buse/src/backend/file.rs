//! Loopback onto a regular file.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use nix::errno::Errno;
use nix::libc;
use tracing::{debug, info};

use super::{checked_range, errno_of};
use crate::ops::{BlockOperations, Capabilities, OpResult};

/// A device backed by a regular file, accessed with positional I/O.
pub struct FileBackend {
    path: PathBuf,
    file: Arc<File>,
    size_bytes: u64,
}

impl FileBackend {
    /// Open `path` read/write. With `size_bytes`, a shorter file is extended
    /// to that size; otherwise the device size is the file length.
    pub fn open(path: impl AsRef<Path>, size_bytes: Option<u64>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(size_bytes.is_some())
            .truncate(false)
            .open(&path)?;

        let len = file.metadata()?.len();
        let size_bytes = match size_bytes {
            Some(size) if size > len => {
                file.set_len(size)?;
                size
            }
            Some(size) => size,
            None => len,
        };
        debug!(path = %path.display(), size_bytes, "opened backing file");

        Ok(Self {
            path,
            file: Arc::new(file),
            size_bytes,
        })
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, Errno>
    where
        F: FnOnce(&File) -> io::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || f(&*file))
            .await
            .map_err(|_| Errno::EIO)?
            .map_err(|e| errno_of(&e))
    }
}

#[async_trait]
impl BlockOperations for FileBackend {
    fn capabilities(&self) -> Capabilities {
        Capabilities::ALL
    }

    async fn read(&self, buf: &mut [u8], offset: u64) -> OpResult {
        checked_range(offset, buf.len(), self.size_bytes).ok_or(Errno::EIO)?;
        let len = buf.len();
        let data = self
            .blocking(move |file| {
                let mut data = vec![0u8; len];
                file.read_exact_at(&mut data, offset)?;
                Ok(data)
            })
            .await?;
        buf.copy_from_slice(&data);
        Ok(())
    }

    async fn write(&self, buf: &[u8], offset: u64) -> OpResult {
        checked_range(offset, buf.len(), self.size_bytes).ok_or(Errno::ENOSPC)?;
        let data = Bytes::copy_from_slice(buf);
        self.blocking(move |file| file.write_all_at(&data, offset))
            .await
    }

    async fn disc(&self) {
        info!(path = %self.path.display(), "file device disconnected");
    }

    async fn flush(&self) -> OpResult {
        self.blocking(|file| file.sync_data()).await
    }

    async fn trim(&self, offset: u64, length: u32) -> OpResult {
        checked_range(offset, length as usize, self.size_bytes).ok_or(Errno::EINVAL)?;
        self.blocking(move |file| {
            // SAFETY: fallocate only reads its integer arguments.
            let res = unsafe {
                libc::fallocate(
                    file.as_raw_fd(),
                    libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                    offset as libc::off_t,
                    length as libc::off_t,
                )
            };
            Errno::result(res).map(drop).map_err(io::Error::from)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn size_defaults_to_file_length() {
        let tmp = NamedTempFile::new().unwrap();
        tmp.as_file().set_len(8192).unwrap();
        let backend = FileBackend::open(tmp.path(), None).unwrap();
        assert_eq!(backend.size_bytes(), 8192);
    }

    #[tokio::test]
    async fn write_flush_read() {
        let tmp = NamedTempFile::new().unwrap();
        let backend = FileBackend::open(tmp.path(), Some(4096)).unwrap();

        backend.write(&[0x5A; 512], 1024).await.unwrap();
        backend.flush().await.unwrap();

        let mut buf = [0u8; 512];
        backend.read(&mut buf, 1024).await.unwrap();
        assert_eq!(buf, [0x5A; 512]);

        let on_disk = std::fs::read(tmp.path()).unwrap();
        assert_eq!(on_disk.len(), 4096);
        assert_eq!(&on_disk[1024..1536], &[0x5A; 512]);
    }

    #[tokio::test]
    async fn read_past_end_fails() {
        let tmp = NamedTempFile::new().unwrap();
        let backend = FileBackend::open(tmp.path(), Some(1024)).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(backend.read(&mut buf, 1016).await, Err(Errno::EIO));
    }
}
