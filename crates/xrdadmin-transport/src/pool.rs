//! Session pool keyed by server address.
//!
//! Every request from the admin layer goes through `SessionPool::call`. The pool
//! hands each attempt an exclusive session (opening and logging in a new one
//! when no idle session exists), retries transient failures with backoff,
//! honours `Wait` replies, and keeps the shared reachability cache current.
//!
//! Idle sessions go stale when a server restarts or drops quiet connections.
//! Sessions idle longer than `idle_timeout` are closed on checkout. A reused
//! session whose connection turns out dead costs no retry and does not mark
//! the server unreachable: the server's idle bucket is emptied and the
//! request goes out once more on a fresh connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::auth::CredentialProvider;
use crate::cancel::{CancelReason, CancelToken};
use crate::deadline::DeadlineContext;
use crate::error::{Result, TransportError};
use crate::health::ReachabilityCache;
use crate::metrics::{MetricsSnapshot, TransportMetrics};
use crate::protocol::Opcode;
use crate::retry::{is_retryable, RetryConfig, RetryExecutor};
use crate::session::{ProtocolSession, Reply, ServerAddr, SessionConfig};
use crate::transport::Transport;

/// Configuration for the session pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle sessions kept per server.
    pub max_idle_per_server: usize,
    /// Idle sessions older than this are closed instead of reused.
    pub idle_timeout: Duration,
    /// Per-attempt reply timeout.
    pub request_timeout: Duration,
    /// `Wait` replies honoured per call before giving up.
    pub max_wait_replies: u32,
    /// How long a server stays marked unreachable.
    pub unreachable_ttl: Duration,
    /// Retry policy for transient failures.
    pub retry: RetryConfig,
    /// Settings applied to new sessions.
    pub session: SessionConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_server: 4,
            idle_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(10),
            max_wait_replies: 8,
            unreachable_ttl: Duration::from_secs(30),
            retry: RetryConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

/// Statistics about the session pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Idle sessions across all servers.
    pub idle_sessions: usize,
    /// Servers holding at least one idle session.
    pub servers: usize,
    /// Counter snapshot.
    pub metrics: MetricsSnapshot,
}

/// Deadline and cancellation shared by every sub-request of one operation.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Overall deadline; no deadline when unset.
    pub deadline: DeadlineContext,
    /// Cancellation token observed by every attempt.
    pub cancel: CancelToken,
}

impl CallContext {
    /// Context without deadline or external cancellation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Context that expires after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: DeadlineContext::with_timeout(timeout),
            cancel: CancelToken::new(),
        }
    }

    /// Replaces the cancellation token.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Context sharing this deadline with a child cancellation token.
    pub fn child(&self) -> Self {
        Self {
            deadline: self.deadline,
            cancel: self.cancel.child(),
        }
    }

    /// Error to report when this context no longer allows new work.
    pub fn check(&self) -> Result<()> {
        if let Some(reason) = self.cancel.reason() {
            return Err(TransportError::Cancelled { reason });
        }
        if self.deadline.is_expired() {
            return Err(TransportError::Cancelled {
                reason: CancelReason::DeadlineExceeded,
            });
        }
        Ok(())
    }
}

/// A checked-out session. Dropping it without checking it back in closes it.
struct Lease<'a> {
    pool: &'a SessionPool,
    session: Option<ProtocolSession>,
    reused: bool,
}

impl Lease<'_> {
    fn session_mut(&mut self) -> Result<&mut ProtocolSession> {
        self.session.as_mut().ok_or(TransportError::NotConnected)
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if self.session.take().is_some() {
            self.pool.metrics.session_closed();
        }
    }
}

/// Failures that mean the connection itself is gone, as opposed to a slow
/// or misbehaving server.
fn is_dead_connection(error: &TransportError) -> bool {
    matches!(error, TransportError::ConnectionReset | TransportError::IoError(_))
}

/// Pool of protocol sessions, one bucket of idle sessions per server.
pub struct SessionPool {
    transport: Arc<dyn Transport>,
    config: PoolConfig,
    retry: RetryExecutor,
    credentials: Option<Arc<dyn CredentialProvider>>,
    idle: Mutex<HashMap<ServerAddr, Vec<ProtocolSession>>>,
    reachability: Arc<ReachabilityCache>,
    metrics: Arc<TransportMetrics>,
    closed: AtomicBool,
}

impl SessionPool {
    /// Creates an empty pool over `transport`.
    pub fn new(transport: Arc<dyn Transport>, config: PoolConfig) -> Self {
        let reachability = Arc::new(ReachabilityCache::new(config.unreachable_ttl));
        Self {
            transport,
            retry: RetryExecutor::new(config.retry.clone()),
            config,
            credentials: None,
            idle: Mutex::new(HashMap::new()),
            reachability,
            metrics: Arc::new(TransportMetrics::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Presents credentials from `provider` on every new session.
    pub fn with_credentials(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(provider);
        self
    }

    /// Shares an existing reachability cache.
    pub fn with_reachability(mut self, reachability: Arc<ReachabilityCache>) -> Self {
        self.reachability = reachability;
        self
    }

    /// Pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Reachability cache updated by every call.
    pub fn reachability(&self) -> &Arc<ReachabilityCache> {
        &self.reachability
    }

    /// Pool counters.
    pub fn metrics(&self) -> &Arc<TransportMetrics> {
        &self.metrics
    }

    /// Sends one request to `server` and returns the first reply that is not
    /// `Wait`.
    ///
    /// Transient failures are retried with backoff. `Wait` replies are honoured
    /// up to `max_wait_replies` times; beyond that the call fails with
    /// `RequestTimeout`. The whole call, backoff sleeps included, stops as soon
    /// as `ctx` is cancelled or its deadline expires.
    pub async fn call(
        &self,
        server: &ServerAddr,
        opcode: Opcode,
        payload: Vec<u8>,
        ctx: &CallContext,
    ) -> Result<Reply> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::NotConnected);
        }
        ctx.check()?;

        let work = self.call_with_waits(server, opcode, payload, ctx);
        let expiry = async {
            match ctx.deadline.remaining() {
                Some(remaining) => tokio::time::sleep(remaining).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            reason = ctx.cancel.cancelled() => Err(TransportError::Cancelled { reason }),
            _ = expiry => Err(TransportError::Cancelled { reason: CancelReason::DeadlineExceeded }),
            result = work => result,
        }
    }

    async fn call_with_waits(
        &self,
        server: &ServerAddr,
        opcode: Opcode,
        payload: Vec<u8>,
        ctx: &CallContext,
    ) -> Result<Reply> {
        let mut waits = 0u32;
        loop {
            let reply = self
                .retry
                .execute(|_attempt| self.attempt(server, opcode, payload.clone(), ctx))
                .await
                .into_result()?;

            match reply {
                Reply::Wait(wait) => {
                    waits += 1;
                    if waits > self.config.max_wait_replies {
                        return Err(TransportError::RequestTimeout {
                            request_id: 0,
                            timeout_ms: self.config.request_timeout.as_millis() as u64,
                        });
                    }
                    let delay = Duration::from_millis(wait.millis).min(self.config.request_timeout);
                    debug!(server = %server, %opcode, delay_ms = delay.as_millis() as u64, "server asked to wait");
                    tokio::time::sleep(delay).await;
                }
                other => return Ok(other),
            }
        }
    }

    async fn attempt(
        &self,
        server: &ServerAddr,
        opcode: Opcode,
        payload: Vec<u8>,
        ctx: &CallContext,
    ) -> Result<Reply> {
        ctx.check()?;
        let mut lease = self.checkout(server).await?;
        let mut result = self.exchange(&mut lease, opcode, payload.clone(), ctx).await;

        if lease.reused && matches!(&result, Err(e) if is_dead_connection(e)) {
            let discarded = self.discard_idle(server);
            debug!(server = %server, discarded, "reused session was dead, reconnecting");
            drop(lease);
            ctx.check()?;
            lease = self.connect(server).await?;
            result = self.exchange(&mut lease, opcode, payload, ctx).await;
        }

        match result {
            Ok(reply) => {
                self.reachability.record_success(server);
                self.metrics.record_reply(&reply);
                self.checkin(lease);
                Ok(reply)
            }
            Err(e) => {
                self.note_failure(server, &e);
                Err(e)
            }
        }
    }

    async fn exchange(
        &self,
        lease: &mut Lease<'_>,
        opcode: Opcode,
        payload: Vec<u8>,
        ctx: &CallContext,
    ) -> Result<Reply> {
        let timeout = ctx.deadline.clamp(self.config.request_timeout);
        self.metrics.inc_requests_sent();
        lease.session_mut()?.call(opcode, payload, timeout).await
    }

    async fn checkout(&self, server: &ServerAddr) -> Result<Lease<'_>> {
        if let Some(session) = self.take_idle(server) {
            debug!(server = %server, session_id = session.session_id(), "reusing idle session");
            return Ok(Lease {
                pool: self,
                session: Some(session),
                reused: true,
            });
        }
        self.connect(server).await
    }

    /// Most recently used idle session of `server` that has not outlived
    /// `idle_timeout`. Expired ones met on the way are closed.
    fn take_idle(&self, server: &ServerAddr) -> Option<ProtocolSession> {
        let mut idle = self.idle.lock();
        let bucket = idle.get_mut(server)?;
        while let Some(session) = bucket.pop() {
            if session.idle_for() <= self.config.idle_timeout {
                return Some(session);
            }
            debug!(server = %server, session_id = session.session_id(), "closing expired idle session");
            self.metrics.session_closed();
        }
        None
    }

    fn discard_idle(&self, server: &ServerAddr) -> usize {
        let dropped = self.idle.lock().remove(server).unwrap_or_default();
        for _ in &dropped {
            self.metrics.session_closed();
        }
        dropped.len()
    }

    async fn connect(&self, server: &ServerAddr) -> Result<Lease<'_>> {
        let credentials = self
            .credentials
            .as_ref()
            .and_then(|provider| provider.credentials_for(server));
        match ProtocolSession::open(
            self.transport.as_ref(),
            server.clone(),
            credentials,
            &self.config.session,
        )
        .await
        {
            Ok(session) => {
                self.metrics.session_opened();
                Ok(Lease {
                    pool: self,
                    session: Some(session),
                    reused: false,
                })
            }
            Err(e @ TransportError::LoginRejected { .. }) => {
                self.reachability.record_success(server);
                self.metrics.inc_login_failures();
                Err(e)
            }
            Err(e) => {
                self.note_failure(server, &e);
                Err(e)
            }
        }
    }

    fn checkin(&self, mut lease: Lease<'_>) {
        let Some(session) = lease.session.take() else {
            return;
        };
        if session.is_broken() || self.closed.load(Ordering::Acquire) {
            self.metrics.session_closed();
            return;
        }
        let mut idle = self.idle.lock();
        let bucket = idle.entry(session.server().clone()).or_default();
        if bucket.len() < self.config.max_idle_per_server {
            bucket.push(session);
        } else {
            drop(idle);
            self.metrics.session_closed();
        }
    }

    fn note_failure(&self, server: &ServerAddr, error: &TransportError) {
        if matches!(error, TransportError::RequestTimeout { .. }) {
            self.metrics.inc_timeouts();
        }
        if is_retryable(error) {
            self.metrics.inc_transport_errors();
            self.reachability.record_failure(server);
        }
    }

    /// Current statistics.
    pub fn stats(&self) -> PoolStats {
        let idle = self.idle.lock();
        PoolStats {
            idle_sessions: idle.values().map(Vec::len).sum(),
            servers: idle.values().filter(|v| !v.is_empty()).count(),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Releases every idle session and refuses further calls.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<ProtocolSession> = self.idle.lock().drain().flat_map(|(_, v)| v).collect();
        for _ in &drained {
            self.metrics.session_closed();
        }
        info!(released = drained.len(), "session pool shut down");
    }

    /// Whether `shutdown` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("config", &self.config)
            .field("closed", &self.is_closed())
            .finish()
    }
}
