//! Abstract transport boundary.
//!
//! The admin core only depends on `Transport` (open a channel to `host:port`)
//! and `Connection` (send one frame, receive one frame). The TCP backend lives
//! in `tcp`; in-process simulations implement the same traits.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::Frame;

/// Opens channels to cluster nodes by `host:port`.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Opens a channel to `addr`, e.g. `"mgr1.example.org:1094"`.
    async fn connect(&self, addr: &str) -> Result<Box<dyn Connection>>;
}

/// One open channel. A session keeps at most one request in flight on it.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Writes one whole frame.
    async fn send_frame(&self, frame: &Frame) -> Result<()>;

    /// Reads the next whole frame.
    async fn recv_frame(&self) -> Result<Frame>;

    /// The `host:port` this channel talks to.
    fn peer_addr(&self) -> &str;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn connect(&self, addr: &str) -> Result<Box<dyn Connection>> {
        (**self).connect(addr).await
    }
}
