//! Signal-driven disconnect of the running device.
//!
//! While a [`DisconnectGuard`] is alive, SIGINT and SIGTERM ask the kernel to
//! disconnect the armed device instead of killing the process. The kernel
//! then unblocks `NBD_DO_IT` in the driver context and closes its end of the
//! channel, which ends the serving loop.
//!
//! The handler only touches the atomic slot and issues one ioctl: no
//! allocation, no locks, no logging.

use std::marker::PhantomData;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use nbd::{NBD_DISCONNECT, NbdDevice};
use nix::libc;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use tracing::warn;

use crate::error::Error;

const NO_DEVICE: RawFd = -1;

/// Signals that trigger a disconnect.
pub const DISCONNECT_SIGNALS: [Signal; 2] = [Signal::SIGINT, Signal::SIGTERM];

/// Single-writer slot holding the descriptor of the device to disconnect.
#[derive(Debug)]
pub struct DisconnectSlot {
    fd: AtomicI32,
    requested: AtomicBool,
}

impl DisconnectSlot {
    pub const fn new() -> Self {
        Self {
            fd: AtomicI32::new(NO_DEVICE),
            requested: AtomicBool::new(false),
        }
    }

    /// Make `fd` the active device. Fails if another device is active.
    pub fn arm(&self, fd: RawFd) -> bool {
        let armed = self
            .fd
            .compare_exchange(NO_DEVICE, fd, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if armed {
            self.requested.store(false, Ordering::Release);
        }
        armed
    }

    /// Clear the slot, returning the device that was active.
    pub fn disarm(&self) -> Option<RawFd> {
        match self.fd.swap(NO_DEVICE, Ordering::AcqRel) {
            NO_DEVICE => None,
            fd => Some(fd),
        }
    }

    pub fn is_armed(&self) -> bool {
        self.fd.load(Ordering::Acquire) != NO_DEVICE
    }

    /// Run `disconnect` on the active device, at most once per arm.
    ///
    /// Returns whether a device was active.
    pub fn fire(&self, disconnect: impl FnOnce(RawFd)) -> bool {
        match self.disarm() {
            Some(fd) => {
                disconnect(fd);
                self.requested.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Whether `fire` disconnected a device since the last `arm`.
    pub fn was_fired(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }
}

impl Default for DisconnectSlot {
    fn default() -> Self {
        Self::new()
    }
}

static ACTIVE: DisconnectSlot = DisconnectSlot::new();

extern "C" fn disconnect_on_signal(_signal: libc::c_int) {
    ACTIVE.fire(|fd| {
        // SAFETY: NBD_DISCONNECT takes no argument; ioctl is async-signal-safe.
        unsafe {
            libc::ioctl(fd, NBD_DISCONNECT as _);
        }
    });
}

/// Keeps a device armed for signal-driven disconnect.
///
/// Dropping the guard disarms the device and restores the previous signal
/// dispositions.
#[derive(Debug)]
pub struct DisconnectGuard<'a> {
    previous: Vec<(Signal, SigAction)>,
    _device: PhantomData<&'a NbdDevice>,
}

impl<'a> DisconnectGuard<'a> {
    /// Arm `device` and install the SIGINT/SIGTERM handlers.
    ///
    /// A non-default handler already installed for either signal is
    /// overridden, not chained.
    pub fn arm(device: &'a NbdDevice) -> Result<Self, Error> {
        if !ACTIVE.arm(device.as_raw_fd()) {
            return Err(Error::AlreadyArmed);
        }

        let mut mask = SigSet::empty();
        for signal in DISCONNECT_SIGNALS {
            mask.add(signal);
        }
        let action = SigAction::new(
            SigHandler::Handler(disconnect_on_signal),
            SaFlags::SA_RESTART,
            mask,
        );

        let mut guard = Self {
            previous: Vec::with_capacity(DISCONNECT_SIGNALS.len()),
            _device: PhantomData,
        };
        for signal in DISCONNECT_SIGNALS {
            // SAFETY: the handler only performs async-signal-safe operations.
            let previous = unsafe { sigaction(signal, &action) }.map_err(Error::Signal)?;
            if previous.handler() != SigHandler::SigDfl {
                warn!(%signal, "overriding non-default signal handler");
            }
            guard.previous.push((signal, previous));
        }
        Ok(guard)
    }

    /// Whether a signal has requested the disconnect.
    pub fn disconnect_requested(&self) -> bool {
        ACTIVE.was_fired()
    }
}

impl Drop for DisconnectGuard<'_> {
    fn drop(&mut self) {
        ACTIVE.disarm();
        for (signal, previous) in self.previous.drain(..).rev() {
            // SAFETY: restores a disposition previously returned by sigaction.
            if let Err(e) = unsafe { sigaction(signal, &previous) } {
                warn!(%signal, error = %e, "failed to restore signal handler");
            }
        }
    }
}
