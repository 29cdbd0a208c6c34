//! TCP backend for the transport boundary.
//!
//! A redirector name may resolve to several addresses; each is tried in turn
//! within one connect budget. Frames are written whole and read as header
//! followed by exactly `payload_length` bytes. End of stream anywhere inside
//! a frame means the peer went away and maps to `ConnectionReset`.

use std::io;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::protocol::{Frame, FrameHeader, FRAME_HEADER_SIZE};
use crate::transport::{Connection, Transport};

/// TCP settings.
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Budget for resolving and connecting, across every resolved address.
    pub connect_timeout_ms: u64,
    /// Disable Nagle's algorithm; requests are small and latency bound.
    pub nodelay: bool,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            nodelay: true,
        }
    }
}

/// Opens TCP connections to cluster nodes.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: TcpTransportConfig,
}

impl TcpTransport {
    /// Transport with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport with explicit settings.
    pub fn with_config(config: TcpTransportConfig) -> Self {
        Self { config }
    }

    /// Current settings.
    pub fn config(&self) -> &TcpTransportConfig {
        &self.config
    }

    async fn open_stream(&self, addr: &str) -> Result<TcpStream> {
        let budget = Duration::from_millis(self.config.connect_timeout_ms);
        let started = Instant::now();
        let timed_out = || TransportError::ConnectionTimeout {
            addr: addr.to_string(),
            timeout_ms: self.config.connect_timeout_ms,
        };

        let candidates: Vec<_> = tokio::time::timeout(budget, tokio::net::lookup_host(addr))
            .await
            .map_err(|_| timed_out())?
            .map_err(|_| TransportError::InvalidAddress {
                addr: addr.to_string(),
            })?
            .collect();
        if candidates.is_empty() {
            return Err(TransportError::InvalidAddress {
                addr: addr.to_string(),
            });
        }

        let mut last_error = None;
        for candidate in candidates {
            let left = budget.saturating_sub(started.elapsed());
            if left.is_zero() {
                return Err(timed_out());
            }
            match tokio::time::timeout(left, TcpStream::connect(candidate)).await {
                Err(_) => return Err(timed_out()),
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => {
                    debug!(addr, candidate = %candidate, error = %e, "connect attempt failed");
                    last_error = Some(e);
                }
            }
        }
        Err(match last_error {
            Some(e) if e.kind() == io::ErrorKind::ConnectionRefused => TransportError::ConnectionRefused {
                addr: addr.to_string(),
            },
            Some(e) => TransportError::IoError(e),
            None => timed_out(),
        })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, addr: &str) -> Result<Box<dyn Connection>> {
        let stream = self.open_stream(addr).await?;
        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }
        debug!(addr, "tcp connected");
        Ok(Box::new(TcpConnection::from_stream(stream)?))
    }
}

fn read_error(e: io::Error) -> TransportError {
    match e.kind() {
        io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset => TransportError::ConnectionReset,
        _ => TransportError::IoError(e),
    }
}

/// One TCP connection. Reads and writes lock separate halves, so a reply
/// can be awaited while another task writes.
pub struct TcpConnection {
    read: Mutex<OwnedReadHalf>,
    write: Mutex<OwnedWriteHalf>,
    peer: String,
}

impl TcpConnection {
    pub(crate) fn from_stream(stream: TcpStream) -> Result<Self> {
        let peer = stream.peer_addr()?.to_string();
        let (read, write) = stream.into_split();
        Ok(Self {
            read: Mutex::new(read),
            write: Mutex::new(write),
            peer,
        })
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let encoded = frame.encode();
        let mut write = self.write.lock().await;
        write.write_all(&encoded).await.map_err(read_error)?;
        write.flush().await.map_err(read_error)?;
        Ok(())
    }

    async fn recv_frame(&self) -> Result<Frame> {
        let mut read = self.read.lock().await;
        let mut header = [0u8; FRAME_HEADER_SIZE];
        read.read_exact(&mut header).await.map_err(read_error)?;
        let header = FrameHeader::decode(&header)?;

        let mut payload = vec![0u8; header.payload_length as usize];
        read.read_exact(&mut payload).await.map_err(read_error)?;
        let frame = Frame { header, payload };
        frame.validate()?;
        Ok(frame)
    }

    fn peer_addr(&self) -> &str {
        &self.peer
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection").field("peer", &self.peer).finish()
    }
}
