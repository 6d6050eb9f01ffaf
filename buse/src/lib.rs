//! buse: block devices whose storage lives in a userspace process.
//!
//! The Linux NBD driver exposes `/dev/nbdX` as an ordinary block device and
//! forwards its I/O as NBD requests over a socket. buse binds one end of a
//! local socket pair to the driver and answers the requests with a
//! [`BlockOperations`] backend.
//!
//! # Library Usage
//!
//! The primary API is the [`Session`] struct:
//!
//! ```ignore
//! use buse::{Session, backend::MemoryBackend};
//! use nbd::DeviceGeometry;
//!
//! let ops = Arc::new(MemoryBackend::new(128 << 20)?);
//! Session::new("/dev/nbd0", DeviceGeometry::with_size(4096, 128 << 20), ops)
//!     .run()
//!     .await?;
//! ```

pub mod backend;
pub mod config;
pub mod disconnect;
pub mod driver;
pub mod error;
pub mod ops;
pub mod server;
pub mod session;

pub use config::{BackendConfig, BackendKind, Config, DeviceConfig, ServerSection};
pub use disconnect::{DisconnectGuard, DisconnectSlot};
pub use error::{ConfigError, DeviceError, Error, NbdError, Result};
pub use ops::{BlockOperations, Capabilities, OpResult};
pub use server::{NbdServer, ServeOutcome, ServerConfig};
pub use session::{Session, SessionState};

pub use nbd;
