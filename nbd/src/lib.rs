//! NBD (Network Block Device) kernel protocol implementation.
//!
//! This crate provides the transmission-phase wire format the Linux NBD
//! driver speaks over its socket, and the ioctls used to bind such a socket
//! to a `/dev/nbdX` device.
//!
//! Based on https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md
//!
//! # Features
//!
//! - `device` - Enable Linux kernel NBD device support (requires root)

mod protocol;

#[cfg(feature = "device")]
mod device;

pub use protocol::*;

#[cfg(feature = "device")]
pub use device::{
    DeviceError, DeviceGeometry, NBD_DISCONNECT, NbdDevice, TransmissionFlags, disconnect_device,
};
