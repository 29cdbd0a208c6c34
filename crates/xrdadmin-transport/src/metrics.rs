//! Session pool counters.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::Serialize;

use crate::session::Reply;

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
/// Point-in-time copy of the pool counters.
pub struct MetricsSnapshot {
    /// Requests written to a session.
    pub requests_sent: u64,
    /// `Ok` replies received.
    pub replies_ok: u64,
    /// `Error` replies received.
    pub replies_error: u64,
    /// `Redirect` replies received.
    pub redirects: u64,
    /// `Wait` replies received.
    pub waits: u64,
    /// Attempts that failed at the transport level.
    pub transport_errors: u64,
    /// Attempts that timed out.
    pub timeouts: u64,
    /// Sessions opened.
    pub sessions_opened: u64,
    /// Sessions discarded or released.
    pub sessions_closed: u64,
    /// Sessions currently open.
    pub active_sessions: u32,
    /// Logins rejected by a server.
    pub login_failures: u64,
}

/// Lock-free counters updated by the session pool.
pub struct TransportMetrics {
    requests_sent: AtomicU64,
    replies_ok: AtomicU64,
    replies_error: AtomicU64,
    redirects: AtomicU64,
    waits: AtomicU64,
    transport_errors: AtomicU64,
    timeouts: AtomicU64,
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
    active_sessions: AtomicU32,
    login_failures: AtomicU64,
}

impl Default for TransportMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransportMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl TransportMetrics {
    /// Creates a collector with every counter at zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            requests_sent: AtomicU64::new(0),
            replies_ok: AtomicU64::new(0),
            replies_error: AtomicU64::new(0),
            redirects: AtomicU64::new(0),
            waits: AtomicU64::new(0),
            transport_errors: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            sessions_opened: AtomicU64::new(0),
            sessions_closed: AtomicU64::new(0),
            active_sessions: AtomicU32::new(0),
            login_failures: AtomicU64::new(0),
        }
    }

    /// Counts a request written to a session.
    pub fn inc_requests_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a received reply by kind.
    pub fn record_reply(&self, reply: &Reply) {
        let counter = match reply {
            Reply::Ok(_) => &self.replies_ok,
            Reply::Error(_) => &self.replies_error,
            Reply::Redirect(_) => &self.redirects,
            Reply::Wait(_) => &self.waits,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a transport-level failure.
    pub fn inc_transport_errors(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a timed out attempt.
    pub fn inc_timeouts(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a rejected login.
    pub fn inc_login_failures(&self) {
        self.login_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a newly opened session.
    pub fn session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a session that was dropped.
    pub fn session_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .active_sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    /// Takes a snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            replies_ok: self.replies_ok.load(Ordering::Relaxed),
            replies_error: self.replies_error.load(Ordering::Relaxed),
            redirects: self.redirects.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            login_failures: self.login_failures.load(Ordering::Relaxed),
        }
    }
}
