//! Server side of the frame protocol: an accept loop that dispatches each
//! request frame to a handler and writes back the response frame.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::error::{Result, TransportError};
use crate::protocol::Frame;
use crate::tcp::TcpConnection;
use crate::transport::Connection;

/// Handles request frames received by a `FrameServer`.
pub trait FrameHandler: Send + Sync + 'static {
    /// Produces the response to `request`; `None` sends nothing back.
    fn handle(&self, request: Frame) -> Pin<Box<dyn Future<Output = Option<Frame>> + Send + '_>>;
}

/// Accept loop serving one `FrameHandler`.
pub struct FrameServer;

impl FrameServer {
    /// Accepts connections until `stop` is cancelled. Spawns a task per
    /// connection; requests on one connection are answered in order.
    pub async fn serve(
        listener: tokio::net::TcpListener,
        handler: Arc<dyn FrameHandler>,
        stop: CancelToken,
    ) -> Result<()> {
        loop {
            let (stream, peer) = tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted.map_err(TransportError::IoError)?,
            };
            debug!(peer = %peer, "accepted connection");
            let handler = handler.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                let conn = match TcpConnection::from_stream(stream) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(error = %e, "failed to set up connection");
                        return;
                    }
                };
                loop {
                    let frame = tokio::select! {
                        _ = stop.cancelled() => break,
                        frame = conn.recv_frame() => match frame {
                            Ok(f) => f,
                            Err(e) => {
                                debug!(error = %e, "connection closed");
                                break;
                            }
                        },
                    };
                    if frame.is_response() {
                        warn!(request_id = frame.request_id(), "dropping unsolicited response frame");
                        continue;
                    }
                    if let Some(response) = handler.handle(frame).await {
                        if let Err(e) = conn.send_frame(&response).await {
                            warn!(error = %e, "failed to send response");
                            break;
                        }
                    }
                }
            });
        }
    }
}
