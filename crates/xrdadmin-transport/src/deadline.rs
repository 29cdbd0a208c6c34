//! Operation deadlines.
//!
//! One deadline covers an operation and every sub-request it makes:
//! redirect hops, retries, `Wait` pauses and batch members. Per-attempt
//! timeouts are clamped to whatever is left of it.

use std::time::{Duration, Instant};

/// Instant by which an operation must be done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    /// Deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            at: now.checked_add(timeout).unwrap_or(now + Duration::from_secs(86_400 * 365)),
        }
    }

    /// The instant itself.
    pub fn at(&self) -> Instant {
        self.at
    }

    /// Time left; zero once passed.
    pub fn time_left(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// Whether the deadline has passed.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }
}

/// Optional deadline carried by a call context.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeadlineContext {
    deadline: Option<Deadline>,
}

impl DeadlineContext {
    /// No deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deadline `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Deadline::after(timeout)),
        }
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Deadline> {
        self.deadline
    }

    /// True only when a deadline is set and has passed.
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| d.is_expired())
    }

    /// Time left, `None` without a deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.time_left())
    }

    /// `timeout`, shortened to the time left.
    pub fn clamp(&self, timeout: Duration) -> Duration {
        self.remaining().map_or(timeout, |left| left.min(timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbounded_context() {
        let ctx = DeadlineContext::new();
        assert!(ctx.deadline().is_none());
        assert!(!ctx.is_expired());
        assert_eq!(ctx.clamp(Duration::from_secs(3)), Duration::from_secs(3));
    }

    #[test]
    fn test_clamp_never_exceeds_time_left() {
        let ctx = DeadlineContext::with_timeout(Duration::from_millis(200));
        assert!(ctx.clamp(Duration::from_secs(10)) <= Duration::from_millis(200));
        assert_eq!(ctx.clamp(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_passed_deadline() {
        let ctx = DeadlineContext::with_timeout(Duration::ZERO);
        assert!(ctx.is_expired());
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
        assert_eq!(ctx.clamp(Duration::from_secs(1)), Duration::ZERO);
    }

    #[test]
    fn test_huge_timeout_does_not_overflow() {
        let deadline = Deadline::after(Duration::MAX);
        assert!(!deadline.is_expired());
        assert!(deadline.at() > Instant::now());
    }
}
