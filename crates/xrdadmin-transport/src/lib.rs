#![warn(missing_docs)]

//! xrdadmin transport subsystem: framed request/response channel to cluster nodes,
//! protocol sessions, retry with backoff, and a session pool keyed by server address.

pub mod auth;
pub mod cancel;
pub mod deadline;
pub mod error;
pub mod health;
pub mod message;
pub mod metrics;
pub mod pool;
pub mod protocol;
pub mod retry;
pub mod rpc;
pub mod session;
pub mod tcp;
pub mod transport;

pub use auth::{CredentialProvider, Credentials, StaticCredentials};
pub use cancel::{CancelReason, CancelToken};
pub use deadline::{Deadline, DeadlineContext};
pub use error::{Result, TransportError};
pub use health::{Reachability, ReachabilityCache};
pub use metrics::{MetricsSnapshot, TransportMetrics};
pub use pool::{CallContext, PoolConfig, PoolStats, SessionPool};
pub use protocol::{Frame, FrameFlags, FrameHeader, Opcode, ReplyStatus};
pub use retry::{RetryConfig, RetryExecutor, RetryOutcome};
pub use rpc::{FrameHandler, FrameServer};
pub use session::{ProtocolSession, Reply, ServerAddr, SessionConfig};
pub use tcp::{TcpConnection, TcpTransport, TcpTransportConfig};
pub use transport::{Connection, Transport};
