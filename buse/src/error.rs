//! Error types for buse.

use std::io;
use thiserror::Error;

// Re-export the error types of the nbd crate
pub use nbd::{DeviceError, NbdError};

pub type Result<T> = std::result::Result<T, Error>;

/// Exit status for a successful session.
pub const EXIT_SUCCESS: u8 = 0;
/// Exit status for any fatal failure other than opening the device.
pub const EXIT_FAILURE: u8 = 1;
/// Exit status when the device special file could not be opened.
pub const EXIT_DEVICE_OPEN: u8 = 2;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("nbd device error: {0}")]
    Device(#[from] DeviceError),

    #[error("nbd protocol error: {0}")]
    Nbd(#[from] NbdError),

    #[error("another nbd device is already armed for signal disconnect")]
    AlreadyArmed,

    #[error("failed to install signal handlers: {0}")]
    Signal(nix::errno::Errno),

    #[error("driver context panicked")]
    DriverPanicked,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Process exit status for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Device(DeviceError::Open { .. }) => EXIT_DEVICE_OPEN,
            _ => EXIT_FAILURE,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(io::Error),

    #[error("failed to parse config: {0}")]
    ParseError(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },

    #[error(
        "inconsistent geometry: {size_blocks} blocks of {block_size} bytes is not {size_bytes} bytes"
    )]
    InconsistentGeometry {
        block_size: u64,
        size_bytes: u64,
        size_blocks: u64,
    },
}
