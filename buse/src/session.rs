//! Device lifecycle: from opening `/dev/nbdX` to a cleaned-up device.
//!
//! ```text
//! Closed -> Opened -> Configured -> ChannelBound -> Running -> Disconnecting -> Cleaned
//! ```
//!
//! `Running` splits into two contexts. The driver context (a thread with all
//! signals masked) hands one end of a socket pair to the kernel and blocks in
//! `NBD_DO_IT`. The server context keeps the other end and answers requests
//! with the backend, with SIGINT/SIGTERM armed to disconnect the device. The
//! contexts never talk to each other directly; the kernel mediates every
//! shutdown.
//!
//! # Example
//!
//! ```ignore
//! use buse::{Session, backend::MemoryBackend};
//!
//! let ops = Arc::new(MemoryBackend::new(64 << 20)?);
//! let geometry = DeviceGeometry::with_size(4096, 64 << 20);
//! Session::new("/dev/nbd0", geometry, ops).run().await?;
//! ```

use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;

use nbd::{DeviceGeometry, NbdDevice, TransmissionFlags};
use tracing::{info, warn};

use crate::disconnect::DisconnectGuard;
use crate::driver::DriverContext;
use crate::error::{Error, Result};
use crate::ops::{BlockOperations, Capabilities};
use crate::server::{NbdServer, ServeOutcome, ServerConfig};

/// Lifecycle states, logged on each transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Opened,
    Configured,
    ChannelBound,
    Running,
    Disconnecting,
    Cleaned,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Opened => "opened",
            Self::Configured => "configured",
            Self::ChannelBound => "channel_bound",
            Self::Running => "running",
            Self::Disconnecting => "disconnecting",
            Self::Cleaned => "cleaned",
        }
    }
}

/// One run of a backend against one kernel device.
pub struct Session {
    device_path: PathBuf,
    geometry: DeviceGeometry,
    ops: Arc<dyn BlockOperations>,
    server_config: ServerConfig,
}

impl Session {
    pub fn new(
        device_path: impl Into<PathBuf>,
        geometry: DeviceGeometry,
        ops: Arc<dyn BlockOperations>,
    ) -> Self {
        Self {
            device_path: device_path.into(),
            geometry,
            ops,
            server_config: ServerConfig::default(),
        }
    }

    pub fn with_server_config(mut self, server_config: ServerConfig) -> Self {
        self.server_config = server_config;
        self
    }

    /// Transmission flags derived from the backend's capabilities.
    pub fn transmission_flags(&self) -> TransmissionFlags {
        flags_for(self.ops.capabilities())
    }

    /// Run the session until the device is disconnected.
    ///
    /// Must be called inside a tokio runtime. Succeeds only if serving ended
    /// cleanly and the kernel run and cleanup calls all succeeded.
    pub async fn run(self) -> Result<()> {
        let flags = self.transmission_flags();

        let device = NbdDevice::open(&self.device_path)?;
        transition(&device, SessionState::Opened);

        device.configure(&self.geometry)?;
        transition(&device, SessionState::Configured);

        device.clear_sock()?;
        let (server_end, driver_end) = UnixStream::pair()?;
        transition(&device, SessionState::ChannelBound);

        let device = Arc::new(device);
        let driver = DriverContext::new(Arc::clone(&device), driver_end, flags).spawn()?;
        transition(&device, SessionState::Running);

        let served = self.serve(&device, server_end).await;

        transition(&device, SessionState::Disconnecting);
        if served.is_err() {
            // The kernel is still in NBD_DO_IT; make it let go.
            if let Err(e) = device.disconnect() {
                warn!(error = %e, "disconnect after serving error failed");
            }
        }

        let driven = tokio::task::spawn_blocking(move || driver.join())
            .await
            .map_err(|_| Error::DriverPanicked)?
            .map_err(|_| Error::DriverPanicked)?;

        match (served, driven) {
            (Ok(outcome), Ok(())) => {
                transition(&device, SessionState::Cleaned);
                info!(?outcome, "session finished");
                Ok(())
            }
            (Err(e), driven) => {
                if let Err(driver_err) = driven {
                    warn!(error = %driver_err, "driver context failed");
                }
                Err(e)
            }
            (Ok(_), Err(e)) => Err(e.into()),
        }
    }

    /// Server context: arm the signal handler, refresh partitions, serve.
    async fn serve(&self, device: &NbdDevice, server_end: UnixStream) -> Result<ServeOutcome> {
        let guard = DisconnectGuard::arm(device)?;
        device.reread_partitions()?;

        server_end.set_nonblocking(true)?;
        let mut stream = tokio::net::UnixStream::from_std(server_end)?;
        let server = NbdServer::with_config(Arc::clone(&self.ops), self.server_config);
        let outcome = server.serve(&mut stream).await;

        if guard.disconnect_requested() {
            info!("disconnect requested by signal");
        }
        drop(guard);
        // Closing our end lets the kernel finish tearing the socket down.
        drop(stream);

        Ok(outcome?)
    }
}

/// Transmission flags advertised for a capability set.
pub fn flags_for(caps: Capabilities) -> TransmissionFlags {
    TransmissionFlags::new(caps.flush, caps.trim)
}

fn transition(device: &NbdDevice, state: SessionState) {
    info!(device = %device.path().display(), state = state.as_str(), "nbd session");
}

#[cfg(test)]
mod tests {
    use super::*;
    use nbd::{NBD_FLAG_SEND_FLUSH, NBD_FLAG_SEND_TRIM};

    use crate::backend::MemoryBackend;

    #[test]
    fn flags_follow_capabilities() {
        assert!(flags_for(Capabilities::READ).is_empty());
        let flags = flags_for(Capabilities::ALL);
        assert!(flags.contains(NBD_FLAG_SEND_TRIM));
        assert!(flags.contains(NBD_FLAG_SEND_FLUSH));
    }

    #[tokio::test]
    async fn missing_device_fails_before_touching_kernel() {
        let ops = Arc::new(MemoryBackend::new(4096).unwrap());
        let session = Session::new(
            "/nonexistent/nbd0",
            DeviceGeometry::with_size(512, 4096),
            ops,
        );
        let err = session.run().await.unwrap_err();
        assert_eq!(err.exit_code(), crate::error::EXIT_DEVICE_OPEN);
    }

    #[tokio::test]
    async fn rejected_geometry_is_fatal() {
        let ops = Arc::new(MemoryBackend::new(4096).unwrap());
        let session = Session::new("/dev/null", DeviceGeometry::with_size(512, 4096), ops);
        let err = session.run().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Device(nbd::DeviceError::Ioctl {
                op: "NBD_SET_BLKSIZE",
                ..
            })
        ));
    }
}
