//! Protocol server for the kernel side of an NBD socket.
//!
//! The server answers one request at a time over any async byte stream: the
//! `UnixStream` bound to the kernel in production, an in-memory duplex in
//! tests. Framing is preserved on every path: READ replies always carry
//! `length` payload bytes and WRITE payloads are always drained, whether or
//! not the backend implements the callback.

use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use nbd::*;

use crate::ops::{BlockOperations, Capabilities, reply_code};

/// Server tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerConfig {
    /// Largest READ/WRITE payload accepted before the peer is considered
    /// non-conformant.
    pub max_payload_bytes: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: NBD_MAX_PAYLOAD_SIZE,
        }
    }
}

/// How a serving loop ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    /// The channel reached end-of-stream at a frame boundary.
    Closed,
    /// The kernel sent NBD_CMD_DISC.
    Disconnected,
}

/// Serves the kernel transmission protocol over a single channel.
#[derive(Clone)]
pub struct NbdServer {
    ops: Arc<dyn BlockOperations>,
    config: ServerConfig,
}

impl NbdServer {
    /// Create a new server with the given backend.
    pub fn new(ops: Arc<dyn BlockOperations>) -> Self {
        Self::with_config(ops, ServerConfig::default())
    }

    pub fn with_config(ops: Arc<dyn BlockOperations>, config: ServerConfig) -> Self {
        Self { ops, config }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.ops.capabilities()
    }

    /// Serve requests until DISC, end-of-stream or an error.
    pub async fn serve<S>(&self, stream: &mut S) -> Result<ServeOutcome, NbdError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let caps = self.ops.capabilities();
        let mut req_buf = [0u8; Request::SIZE_BYTES];

        loop {
            if !read_header(stream, &mut req_buf).await? {
                return Ok(ServeOutcome::Closed);
            }

            let req = Request::from_bytes(&req_buf)?;
            let command = req.command().ok_or(NbdError::UnsupportedCommand {
                command: req.kind,
            })?;
            trace!(
                command = command.name(),
                handle = %req.handle,
                offset = req.offset,
                length = req.length,
                "request"
            );

            match command {
                Command::Read => {
                    self.check_payload(req.length)?;
                    let mut data = BytesMut::zeroed(req.length as usize);
                    let error = if caps.read {
                        reply_code(self.ops.read(&mut data, req.offset).await)
                    } else {
                        NBD_EPERM
                    };
                    log_failure(command, error);
                    write_all(stream, &Reply::error(req.handle, error).to_bytes()).await?;
                    write_all(stream, &data).await?;
                }
                Command::Write => {
                    self.check_payload(req.length)?;
                    let mut data = BytesMut::zeroed(req.length as usize);
                    read_payload(stream, &mut data).await?;
                    let error = if caps.write {
                        reply_code(self.ops.write(&data, req.offset).await)
                    } else {
                        NBD_EPERM
                    };
                    log_failure(command, error);
                    write_all(stream, &Reply::error(req.handle, error).to_bytes()).await?;
                }
                Command::Disconnect => {
                    if caps.disc {
                        self.ops.disc().await;
                    }
                    return Ok(ServeOutcome::Disconnected);
                }
                Command::Flush => {
                    let error = if caps.flush {
                        reply_code(self.ops.flush().await)
                    } else {
                        NBD_OK
                    };
                    log_failure(command, error);
                    write_all(stream, &Reply::error(req.handle, error).to_bytes()).await?;
                }
                Command::Trim => {
                    let error = if caps.trim {
                        reply_code(self.ops.trim(req.offset, req.length).await)
                    } else {
                        NBD_OK
                    };
                    log_failure(command, error);
                    write_all(stream, &Reply::error(req.handle, error).to_bytes()).await?;
                }
            }
            stream.flush().await?;
        }
    }

    fn check_payload(&self, length: u32) -> Result<(), NbdError> {
        if length > self.config.max_payload_bytes {
            return Err(NbdError::RequestTooLarge {
                length_bytes: length,
                max_bytes: self.config.max_payload_bytes,
            });
        }
        Ok(())
    }
}

fn log_failure(command: Command, error: u32) {
    if error != NBD_OK {
        debug!(command = command.name(), error, "request failed");
    }
}

/// Read one request header. Returns `false` on end-of-stream before the
/// first byte.
async fn read_header<S>(
    stream: &mut S,
    buf: &mut [u8; Request::SIZE_BYTES],
) -> Result<bool, NbdError>
where
    S: AsyncRead + Unpin,
{
    let read_bytes = read_full(stream, buf).await?;
    match read_bytes {
        0 => Ok(false),
        n if n == buf.len() => Ok(true),
        n => Err(NbdError::TruncatedHeader {
            read_bytes: n,
            expected_bytes: buf.len(),
        }),
    }
}

async fn read_payload<S>(stream: &mut S, buf: &mut [u8]) -> Result<(), NbdError>
where
    S: AsyncRead + Unpin,
{
    let read_bytes = read_full(stream, buf).await?;
    if read_bytes != buf.len() {
        return Err(NbdError::TruncatedPayload {
            read_bytes,
            expected_bytes: buf.len(),
        });
    }
    Ok(())
}

/// Fill `buf` unless end-of-stream comes first; returns the bytes read.
async fn read_full<S>(stream: &mut S, buf: &mut [u8]) -> io::Result<usize>
where
    S: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

async fn write_all<S>(stream: &mut S, mut buf: &[u8]) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    while !buf.is_empty() {
        match stream.write(buf).await {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use nix::errno::Errno;
    use tokio::io::duplex;

    use crate::ops::OpResult;

    struct Failing;

    #[async_trait]
    impl BlockOperations for Failing {
        fn capabilities(&self) -> Capabilities {
            Capabilities::ALL
        }

        async fn read(&self, _buf: &mut [u8], _offset: u64) -> OpResult {
            Err(Errno::EIO)
        }

        async fn flush(&self) -> OpResult {
            Err(Errno::ENOSPC)
        }
    }

    #[tokio::test]
    async fn read_error_still_sends_payload() {
        let server = NbdServer::new(Arc::new(Failing));
        let (mut client, mut server_end) = duplex(64 * 1024);

        let req = Request::new(Command::Read, Handle(*b"abcdefgh"), 0, 8);
        client.write_all(&req.to_bytes()).await.unwrap();
        drop_after_write(&mut client).await;

        let outcome = server.serve(&mut server_end).await.unwrap();
        assert_eq!(outcome, ServeOutcome::Closed);

        let mut reply = [0u8; Reply::SIZE_BYTES];
        client.read_exact(&mut reply).await.unwrap();
        let reply = Reply::from_bytes(&reply).unwrap();
        assert_eq!(reply.error, NBD_EIO);
        assert_eq!(reply.handle, Handle(*b"abcdefgh"));
        let mut payload = [0xffu8; 8];
        client.read_exact(&mut payload).await.unwrap();
    }

    #[tokio::test]
    async fn flush_error_is_transported() {
        let server = NbdServer::new(Arc::new(Failing));
        let (mut client, mut server_end) = duplex(4096);

        let req = Request::new(Command::Flush, Handle([7; 8]), 0, 0);
        client.write_all(&req.to_bytes()).await.unwrap();
        drop_after_write(&mut client).await;

        server.serve(&mut server_end).await.unwrap();
        let mut reply = [0u8; Reply::SIZE_BYTES];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(Reply::from_bytes(&reply).unwrap().error, NBD_ENOSPC);
    }

    #[tokio::test]
    async fn oversized_read_is_rejected() {
        let config = ServerConfig {
            max_payload_bytes: 1024,
        };
        let server = NbdServer::with_config(Arc::new(Failing), config);
        let (mut client, mut server_end) = duplex(4096);

        let req = Request::new(Command::Read, Handle::default(), 0, 1025);
        client.write_all(&req.to_bytes()).await.unwrap();

        let err = server.serve(&mut server_end).await.unwrap_err();
        assert!(matches!(err, NbdError::RequestTooLarge { .. }));
        assert!(err.is_protocol_violation());
    }

    #[tokio::test]
    async fn truncated_write_payload_is_protocol_error() {
        let server = NbdServer::new(Arc::new(Failing));
        let (mut client, mut server_end) = duplex(4096);

        let req = Request::new(Command::Write, Handle::default(), 0, 16);
        client.write_all(&req.to_bytes()).await.unwrap();
        client.write_all(&[1, 2, 3]).await.unwrap();
        drop(client);

        let err = server.serve(&mut server_end).await.unwrap_err();
        assert!(matches!(
            err,
            NbdError::TruncatedPayload {
                read_bytes: 3,
                expected_bytes: 16
            }
        ));
    }

    /// Half-close the client so the server sees end-of-stream after the
    /// queued requests.
    async fn drop_after_write(client: &mut tokio::io::DuplexStream) {
        client.shutdown().await.unwrap();
    }
}
