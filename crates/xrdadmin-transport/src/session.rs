//! Protocol session: one logical connection to one server.
//!
//! A session carries at most one request at a time. `call` takes `&mut self`,
//! so the borrow checker enforces the single in-flight request; concurrent
//! callers obtain separate sessions from the `SessionPool`.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::auth::Credentials;
use crate::error::{Result, TransportError};
use crate::message::{
    deserialize_message, serialize_message, ErrorReply, LoginReply, LoginRequest, RedirectReply,
    WaitReply,
};
use crate::protocol::{Frame, Opcode, ReplyStatus};
use crate::transport::{Connection, Transport};

/// Network identity of a redirector or data server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerAddr {
    /// Host name or IP address (IPv6 without brackets).
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl ServerAddr {
    /// Creates an address from host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for ServerAddr {
    type Err = TransportError;

    /// Parses `host:port` or `[v6addr]:port`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || TransportError::InvalidAddress {
            addr: s.to_string(),
        };
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            let port = tail.strip_prefix(':').ok_or_else(invalid)?;
            (host, port)
        } else {
            s.rsplit_once(':').ok_or_else(invalid)?
        };
        if host.is_empty() || (host.contains(':') && !s.starts_with('[')) {
            return Err(invalid());
        }
        let port: u16 = port.parse().map_err(|_| invalid())?;
        Ok(ServerAddr::new(host, port))
    }
}

/// Decoded response to a request.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Success; payload is the typed reply body.
    Ok(Vec<u8>),
    /// Semantic failure reported by the server.
    Error(ErrorReply),
    /// Another server is authoritative.
    Redirect(RedirectReply),
    /// Server busy; resend after the given delay.
    Wait(WaitReply),
}

impl Reply {
    /// Decodes the reply carried by a response frame.
    pub fn from_frame(frame: Frame) -> Result<Self> {
        let reply = match frame.status() {
            ReplyStatus::Ok => Reply::Ok(frame.payload),
            ReplyStatus::Error => Reply::Error(deserialize_message(&frame.payload)?),
            ReplyStatus::Redirect => Reply::Redirect(deserialize_message(&frame.payload)?),
            ReplyStatus::Wait => Reply::Wait(deserialize_message(&frame.payload)?),
        };
        Ok(reply)
    }

    /// Decodes an `Ok` body as `T`. Any other reply kind is reported as
    /// `UnexpectedResponse`; callers that care about errors and redirects
    /// match on the reply first.
    pub fn decode<T: DeserializeOwned>(self) -> Result<T> {
        match self {
            Reply::Ok(payload) => deserialize_message(&payload),
            other => Err(TransportError::UnexpectedResponse {
                expected: "Ok".to_string(),
                got: other.kind().to_string(),
            }),
        }
    }

    /// Short name of the reply kind, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Reply::Ok(_) => "Ok",
            Reply::Error(_) => "Error",
            Reply::Redirect(_) => "Redirect",
            Reply::Wait(_) => "Wait",
        }
    }
}

/// Settings applied to each session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Client identification sent at login.
    pub client_name: String,
    /// Timeout for the login exchange.
    pub login_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_name: format!("xrdadmin/{}", env!("CARGO_PKG_VERSION")),
            login_timeout: Duration::from_secs(10),
        }
    }
}

/// One logged-in connection to one server.
pub struct ProtocolSession {
    server: ServerAddr,
    conn: Box<dyn Connection>,
    session_id: u64,
    next_request_id: u64,
    broken: bool,
    last_used: Instant,
}

impl ProtocolSession {
    /// Connects to `server` and logs in with `credentials`.
    pub async fn open(
        transport: &dyn Transport,
        server: ServerAddr,
        credentials: Option<Credentials>,
        config: &SessionConfig,
    ) -> Result<Self> {
        let addr = server.to_string();
        let conn = transport.connect(&addr).await?;
        let mut session = Self {
            server,
            conn,
            session_id: 0,
            next_request_id: 1,
            broken: false,
            last_used: Instant::now(),
        };

        let credentials = credentials.unwrap_or_default();
        let login = LoginRequest {
            client_name: config.client_name.clone(),
            user: credentials.user,
            token: credentials.token,
        };
        let payload = serialize_message(&login)?;
        match session.call(Opcode::Login, payload, config.login_timeout).await? {
            Reply::Ok(body) => {
                let reply: LoginReply = deserialize_message(&body)?;
                session.session_id = reply.session_id;
                tracing::debug!(server = %addr, session_id = reply.session_id, "session opened");
                Ok(session)
            }
            Reply::Error(err) => Err(TransportError::LoginRejected {
                addr,
                message: err.message,
            }),
            other => Err(TransportError::UnexpectedResponse {
                expected: "login reply".to_string(),
                got: other.kind().to_string(),
            }),
        }
    }

    /// Sends one request and waits for its reply.
    ///
    /// Any transport failure, timeout or correlation mismatch marks the session
    /// broken; a broken session must be discarded.
    pub async fn call(&mut self, opcode: Opcode, payload: Vec<u8>, timeout: Duration) -> Result<Reply> {
        if self.broken {
            return Err(TransportError::NotConnected);
        }
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        self.last_used = Instant::now();

        let result = self.exchange(opcode, request_id, payload, timeout).await;
        if result.is_err() {
            self.broken = true;
        }
        result
    }

    async fn exchange(
        &mut self,
        opcode: Opcode,
        request_id: u64,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Reply> {
        let frame = Frame::request(opcode, request_id, payload);
        let round_trip = async {
            self.conn.send_frame(&frame).await?;
            self.conn.recv_frame().await
        };
        let response = tokio::time::timeout(timeout, round_trip)
            .await
            .map_err(|_| TransportError::RequestTimeout {
                request_id,
                timeout_ms: timeout.as_millis() as u64,
            })??;

        if !response.is_response()
            || response.request_id() != request_id
            || response.opcode() != opcode
        {
            return Err(TransportError::UnexpectedResponse {
                expected: format!("{} #{}", opcode, request_id),
                got: format!("{} #{}", response.opcode(), response.request_id()),
            });
        }
        Reply::from_frame(response)
    }

    /// Server this session talks to.
    pub fn server(&self) -> &ServerAddr {
        &self.server
    }

    /// Server-assigned session id.
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Whether the session can no longer be used.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Time since the last request.
    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }
}

impl fmt::Debug for ProtocolSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolSession")
            .field("server", &self.server)
            .field("session_id", &self.session_id)
            .field("next_request_id", &self.next_request_id)
            .field("broken", &self.broken)
            .finish()
    }
}
