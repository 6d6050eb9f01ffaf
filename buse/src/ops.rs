//! Backend capability set.
//!
//! A backend implements [`BlockOperations`] for whichever callbacks it
//! supports and declares them in [`BlockOperations::capabilities`]. The
//! server never calls a callback that is not declared; absence has a fixed
//! reply (see [`crate::server`]).
//!
//! # Example
//!
//! ```ignore
//! struct Zeroes;
//!
//! #[async_trait]
//! impl BlockOperations for Zeroes {
//!     fn capabilities(&self) -> Capabilities {
//!         Capabilities::READ
//!     }
//!
//!     async fn read(&self, buf: &mut [u8], _offset: u64) -> OpResult {
//!         buf.fill(0);
//!         Ok(())
//!     }
//! }
//! ```

use async_trait::async_trait;
use nix::errno::Errno;

/// Result of a backend callback. The errno is sent to the kernel verbatim.
pub type OpResult = std::result::Result<(), Errno>;

/// The set of callbacks a backend provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub read: bool,
    pub write: bool,
    pub disc: bool,
    pub flush: bool,
    pub trim: bool,
}

impl Capabilities {
    pub const NONE: Self = Self {
        read: false,
        write: false,
        disc: false,
        flush: false,
        trim: false,
    };
    pub const READ: Self = Self {
        read: true,
        ..Self::NONE
    };
    pub const ALL: Self = Self {
        read: true,
        write: true,
        disc: true,
        flush: true,
        trim: true,
    };
}

/// Storage callbacks invoked by the protocol server.
///
/// The implementing value is the user context shared by every callback.
/// Default bodies are only reached if a callback is called without being
/// declared in [`capabilities`](Self::capabilities).
#[async_trait]
pub trait BlockOperations: Send + Sync {
    /// Which of the callbacks below are implemented.
    fn capabilities(&self) -> Capabilities;

    /// Fill `buf` with `buf.len()` bytes starting at `offset`.
    async fn read(&self, _buf: &mut [u8], _offset: u64) -> OpResult {
        Err(Errno::EPERM)
    }

    /// Store `buf` at `offset`.
    async fn write(&self, _buf: &[u8], _offset: u64) -> OpResult {
        Err(Errno::EPERM)
    }

    /// The kernel is disconnecting; no reply follows.
    async fn disc(&self) {}

    /// Flush pending writes to stable storage.
    async fn flush(&self) -> OpResult {
        Ok(())
    }

    /// Discard `length` bytes starting at `offset`.
    async fn trim(&self, _offset: u64, _length: u32) -> OpResult {
        Ok(())
    }
}

/// Converts a callback result to the reply error field.
pub(crate) fn reply_code(result: OpResult) -> u32 {
    match result {
        Ok(()) => nbd::NBD_OK,
        // UnknownErrno is 0 and must not read as success.
        Err(Errno::UnknownErrno) => nbd::NBD_EIO,
        Err(errno) => errno as i32 as u32,
    }
}
