//! NBD kernel transmission protocol: constants and header codecs.
//!
//! The Linux NBD driver speaks only the transmission phase of the protocol,
//! using simple (non-structured) replies. There is no handshake on the channel
//! handed to the kernel with `NBD_SET_SOCK`.
//!
//! Based on https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md

use std::io;

use thiserror::Error;

// Magic values
pub const NBD_REQUEST_MAGIC: u32 = 0x25609513;
pub const NBD_REPLY_MAGIC: u32 = 0x67446698;

// Commands
pub const NBD_CMD_READ: u32 = 0;
pub const NBD_CMD_WRITE: u32 = 1;
pub const NBD_CMD_DISC: u32 = 2;
pub const NBD_CMD_FLUSH: u32 = 3;
pub const NBD_CMD_TRIM: u32 = 4;

// Transmission flags, advertised to the kernel with NBD_SET_FLAGS.
pub const NBD_FLAG_HAS_FLAGS: u16 = 1 << 0;
pub const NBD_FLAG_SEND_FLUSH: u16 = 1 << 2;
pub const NBD_FLAG_SEND_TRIM: u16 = 1 << 5;

// Error codes carried in replies (POSIX values, independent of the host).
pub const NBD_OK: u32 = 0;
pub const NBD_EPERM: u32 = 1;
pub const NBD_EIO: u32 = 5;
pub const NBD_ENOSPC: u32 = 28;

/// Maximum READ/WRITE payload a portable peer is expected to send (32 MiB).
///
/// Bounds the buffer allocated per request. TRIM carries no payload and is
/// not subject to this limit.
pub const NBD_MAX_PAYLOAD_SIZE: u32 = 32 * 1024 * 1024;

/// Reverses the byte order of a 64-bit value.
///
/// Symmetric: applying it twice yields the original value.
#[inline]
pub const fn swap64(value: u64) -> u64 {
    let lo = (value & 0xffff_ffff) as u32;
    let hi = (value >> 32) as u32;
    ((lo.swap_bytes() as u64) << 32) | hi.swap_bytes() as u64
}

/// Converts a 64-bit value between host and network byte order.
#[inline]
pub const fn ntohll(value: u64) -> u64 {
    if cfg!(target_endian = "big") {
        value
    } else {
        swap64(value)
    }
}

/// Command carried in the `type` field of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Read,
    Write,
    Disconnect,
    Flush,
    Trim,
}

impl Command {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            NBD_CMD_READ => Some(Self::Read),
            NBD_CMD_WRITE => Some(Self::Write),
            NBD_CMD_DISC => Some(Self::Disconnect),
            NBD_CMD_FLUSH => Some(Self::Flush),
            NBD_CMD_TRIM => Some(Self::Trim),
            _ => None,
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            Self::Read => NBD_CMD_READ,
            Self::Write => NBD_CMD_WRITE,
            Self::Disconnect => NBD_CMD_DISC,
            Self::Flush => NBD_CMD_FLUSH,
            Self::Trim => NBD_CMD_TRIM,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Disconnect => "disc",
            Self::Flush => "flush",
            Self::Trim => "trim",
        }
    }
}

/// Opaque request cookie, echoed back byte-for-byte in the reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Handle(pub [u8; 8]);

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// NBD protocol and channel errors.
#[derive(Debug, Error)]
pub enum NbdError {
    #[error("invalid magic: expected 0x{expected:08x}, got 0x{actual:08x}")]
    InvalidMagic { expected: u32, actual: u32 },

    #[error("unsupported command: {command}")]
    UnsupportedCommand { command: u32 },

    #[error("channel closed mid-header after {read_bytes} of {expected_bytes} bytes")]
    TruncatedHeader {
        read_bytes: usize,
        expected_bytes: usize,
    },

    #[error("channel closed mid-payload after {read_bytes} of {expected_bytes} bytes")]
    TruncatedPayload {
        read_bytes: usize,
        expected_bytes: usize,
    },

    #[error("request too large: {length_bytes} bytes (max: {max_bytes})")]
    RequestTooLarge { length_bytes: u32, max_bytes: u32 },

    #[error("transmission error: {0}")]
    Io(#[from] io::Error),
}

impl NbdError {
    /// True when the peer violated the protocol, as opposed to the channel
    /// itself failing.
    pub fn is_protocol_violation(&self) -> bool {
        !matches!(self, Self::Io(_))
    }
}

/// NBD request header (28 bytes on wire).
///
/// `kind` holds the raw `type` field; decoding does not reject unknown
/// commands, see [`Request::command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub kind: u32,
    pub handle: Handle,
    pub offset: u64,
    pub length: u32,
}

impl Request {
    pub const SIZE_BYTES: usize = 28;

    pub fn new(command: Command, handle: Handle, offset: u64, length: u32) -> Self {
        Self {
            kind: command.to_u32(),
            handle,
            offset,
            length,
        }
    }

    pub fn command(&self) -> Option<Command> {
        Command::from_u32(self.kind)
    }

    /// Serialize a request to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..4].copy_from_slice(&NBD_REQUEST_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&self.kind.to_be_bytes());
        buf[8..16].copy_from_slice(&self.handle.0);
        buf[16..24].copy_from_slice(&ntohll(self.offset).to_ne_bytes());
        buf[24..28].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    /// Parse a request header.
    ///
    /// Fails only when the magic does not match; command and length checks
    /// belong to the server.
    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Result<Self, NbdError> {
        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != NBD_REQUEST_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: NBD_REQUEST_MAGIC,
                actual: magic,
            });
        }

        let kind = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let mut handle = [0u8; 8];
        handle.copy_from_slice(&buf[8..16]);
        let mut offset = [0u8; 8];
        offset.copy_from_slice(&buf[16..24]);
        let length = u32::from_be_bytes([buf[24], buf[25], buf[26], buf[27]]);

        Ok(Self {
            kind,
            handle: Handle(handle),
            offset: ntohll(u64::from_ne_bytes(offset)),
            length,
        })
    }
}

/// NBD simple reply header (16 bytes on wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub error: u32,
    pub handle: Handle,
}

impl Reply {
    pub const SIZE_BYTES: usize = 16;

    pub fn ok(handle: Handle) -> Self {
        Self {
            error: NBD_OK,
            handle,
        }
    }

    pub fn error(handle: Handle, error: u32) -> Self {
        Self { error, handle }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..4].copy_from_slice(&NBD_REPLY_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&self.error.to_be_bytes());
        buf[8..16].copy_from_slice(&self.handle.0);
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Result<Self, NbdError> {
        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != NBD_REPLY_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: NBD_REPLY_MAGIC,
                actual: magic,
            });
        }

        let error = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let mut handle = [0u8; 8];
        handle.copy_from_slice(&buf[8..16]);
        Ok(Self {
            error,
            handle: Handle(handle),
        })
    }
}

const _: () = {
    assert!(Request::SIZE_BYTES == 28);
    assert!(Reply::SIZE_BYTES == 16);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let req = Request::new(
            Command::Read,
            Handle(*b"cookie!!"),
            0x0102030405060708,
            512,
        );
        let buf = req.to_bytes();
        let parsed = Request::from_bytes(&buf).unwrap();
        assert_eq!(parsed.command(), Some(Command::Read));
        assert_eq!(parsed.handle, Handle(*b"cookie!!"));
        assert_eq!(parsed.offset, 0x0102030405060708);
        assert_eq!(parsed.length, 512);
    }

    #[test]
    fn offset_is_big_endian_on_wire() {
        let req = Request::new(Command::Write, Handle::default(), 0x0102030405060708, 0);
        let buf = req.to_bytes();
        assert_eq!(&buf[16..24], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn swap64_is_an_involution() {
        for v in [
            0u64,
            u64::MAX,
            1,
            0x0102030405060708,
            0x8000_0000_0000_0001,
        ] {
            assert_eq!(swap64(swap64(v)), v);
        }
        assert_eq!(swap64(0x0102030405060708), 0x0807060504030201);
        assert_eq!(swap64(0), 0);
        assert_eq!(swap64(u64::MAX), u64::MAX);
    }

    #[test]
    fn request_invalid_magic() {
        let mut buf = [0u8; 28];
        buf[0..4].copy_from_slice(&0xDEADBEEFu32.to_be_bytes());
        let result = Request::from_bytes(&buf);
        assert!(matches!(
            result,
            Err(NbdError::InvalidMagic {
                expected: NBD_REQUEST_MAGIC,
                actual: 0xDEADBEEF
            })
        ));
    }

    #[test]
    fn unknown_command_still_decodes() {
        let mut buf = [0u8; 28];
        buf[0..4].copy_from_slice(&NBD_REQUEST_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&99u32.to_be_bytes());
        let req = Request::from_bytes(&buf).unwrap();
        assert_eq!(req.kind, 99);
        assert_eq!(req.command(), None);
    }

    #[test]
    fn reply_layout() {
        let buf = Reply::error(Handle([1, 2, 3, 4, 5, 6, 7, 8]), NBD_EPERM).to_bytes();
        assert_eq!(&buf[0..4], &NBD_REPLY_MAGIC.to_be_bytes());
        assert_eq!(&buf[4..8], &[0, 0, 0, 1]);
        assert_eq!(&buf[8..16], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(Reply::from_bytes(&buf).unwrap().error, NBD_EPERM);
    }

    #[test]
    fn all_commands_parse() {
        for (cmd, expected) in [
            (Command::Read, NBD_CMD_READ),
            (Command::Write, NBD_CMD_WRITE),
            (Command::Disconnect, NBD_CMD_DISC),
            (Command::Flush, NBD_CMD_FLUSH),
            (Command::Trim, NBD_CMD_TRIM),
        ] {
            assert_eq!(cmd.to_u32(), expected);
            assert_eq!(Command::from_u32(expected), Some(cmd));
        }
    }

    #[test]
    fn protocol_violation_classification() {
        assert!(NbdError::UnsupportedCommand { command: 7 }.is_protocol_violation());
        assert!(!NbdError::Io(io::Error::other("boom")).is_protocol_violation());
    }
}
