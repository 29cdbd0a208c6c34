//! Process-wide server reachability cache.
//!
//! Every call outcome recorded by the session pool updates the state of the
//! server it went to. A server is marked unreachable after a transport-level
//! failure and goes back to `Unknown` once `unreachable_ttl` has elapsed, so it
//! is tried again instead of being shunned forever.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::session::ServerAddr;

/// Last known reachability of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reachability {
    /// The last call to the server completed a round trip.
    Reachable,
    /// The last call failed at the transport level.
    Unreachable,
    /// No recent observation.
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    state: Reachability,
    consecutive_failures: u32,
    observed_at: Instant,
}

/// Reachability state keyed by server address.
#[derive(Debug)]
pub struct ReachabilityCache {
    entries: DashMap<ServerAddr, Entry>,
    unreachable_ttl: Duration,
}

impl ReachabilityCache {
    /// Creates a cache whose unreachable marks expire after `unreachable_ttl`.
    pub fn new(unreachable_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            unreachable_ttl,
        }
    }

    /// Current state of `server`.
    pub fn state(&self, server: &ServerAddr) -> Reachability {
        match self.entries.get(server) {
            Some(entry) => {
                if entry.state == Reachability::Unreachable
                    && entry.observed_at.elapsed() >= self.unreachable_ttl
                {
                    Reachability::Unknown
                } else {
                    entry.state
                }
            }
            None => Reachability::Unknown,
        }
    }

    /// Whether `server` is currently believed to be down.
    pub fn is_unreachable(&self, server: &ServerAddr) -> bool {
        self.state(server) == Reachability::Unreachable
    }

    /// Records a completed round trip.
    pub fn record_success(&self, server: &ServerAddr) {
        self.entries.insert(
            server.clone(),
            Entry {
                state: Reachability::Reachable,
                consecutive_failures: 0,
                observed_at: Instant::now(),
            },
        );
    }

    /// Records a transport-level failure.
    pub fn record_failure(&self, server: &ServerAddr) {
        let mut entry = self.entries.entry(server.clone()).or_insert(Entry {
            state: Reachability::Unknown,
            consecutive_failures: 0,
            observed_at: Instant::now(),
        });
        entry.state = Reachability::Unreachable;
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        entry.observed_at = Instant::now();
        tracing::debug!(
            server = %server,
            failures = entry.consecutive_failures,
            "server marked unreachable"
        );
    }

    /// Consecutive transport failures observed for `server`.
    pub fn consecutive_failures(&self, server: &ServerAddr) -> u32 {
        self.entries
            .get(server)
            .map(|e| e.consecutive_failures)
            .unwrap_or(0)
    }

    /// Orders `candidates` so that servers not marked unreachable come first,
    /// keeping the relative order within each group.
    pub fn prefer_reachable(&self, candidates: &[ServerAddr]) -> Vec<ServerAddr> {
        let (mut up, down): (Vec<_>, Vec<_>) = candidates
            .iter()
            .cloned()
            .partition(|s| !self.is_unreachable(s));
        up.extend(down);
        up
    }
}

impl Default for ReachabilityCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}
