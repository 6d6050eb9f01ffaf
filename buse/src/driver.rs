//! Driver context: the thread that lends its socket to the kernel.
//!
//! The thread binds its channel endpoint with `NBD_SET_SOCK`, advertises the
//! transmission flags, and then sits in `NBD_DO_IT` until the kernel tears
//! the device down. An interrupted `NBD_DO_IT` cannot be resumed, so the whole
//! thread runs with every signal masked.

use std::io;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use nbd::{DeviceError, NbdDevice, TransmissionFlags};
use nix::sys::signal::{SigSet, SigmaskHow, pthread_sigmask};
use tracing::{info, warn};

/// Runs `f` with all signals blocked for the calling thread.
///
/// The mask is not restored; call this at the top of a thread that is about to
/// block uninterruptibly for the rest of its life.
pub fn uninterruptible<T>(f: impl FnOnce() -> T) -> nix::Result<T> {
    pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::all()), None)?;
    Ok(f())
}

/// The kernel-facing half of a running session.
pub struct DriverContext {
    device: Arc<NbdDevice>,
    socket: UnixStream,
    flags: TransmissionFlags,
}

impl DriverContext {
    pub fn new(device: Arc<NbdDevice>, socket: UnixStream, flags: TransmissionFlags) -> Self {
        Self {
            device,
            socket,
            flags,
        }
    }

    /// Start the driver thread.
    pub fn spawn(self) -> io::Result<JoinHandle<Result<(), DeviceError>>> {
        thread::Builder::new()
            .name("nbd-driver".to_string())
            .spawn(move || {
                uninterruptible(|| self.run()).unwrap_or_else(|errno| {
                    Err(DeviceError::Ioctl {
                        op: "pthread_sigmask",
                        source: errno,
                    })
                })
            })
    }

    /// Bind, run and clean up. Blocks until the device is disconnected.
    fn run(self) -> Result<(), DeviceError> {
        self.device.set_sock(self.socket.as_raw_fd())?;

        if !self.flags.is_empty() {
            // Older kernels lack NBD_SET_FLAGS; serve without the extras.
            if let Err(e) = self.device.set_flags(self.flags) {
                warn!(error = %e, flags = self.flags.0, "kernel rejected transmission flags");
            }
        }

        let result = self.device.do_it();
        match &result {
            Ok(()) => info!(device = %self.device.path().display(), "nbd device terminated"),
            Err(e) => warn!(device = %self.device.path().display(), error = %e, "nbd device terminated"),
        }

        self.device.clear_queue()?;
        self.device.clear_sock()?;
        result
    }
}
