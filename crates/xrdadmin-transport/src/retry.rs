//! Bounded retries of transient transport failures.
//!
//! A redirector or data server that refuses, resets or stalls is given a few
//! more chances with growing pauses in between. Semantic failures never show
//! up here: they come back as completed round trips carrying an `Error` reply
//! and the caller surfaces them on the first attempt.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::{Result, TransportError};

/// How often and how patiently to retry.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt; 0 disables retrying.
    pub max_retries: u32,
    /// Pause before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound on any single pause, jitter excluded.
    pub max_backoff: Duration,
    /// Growth factor between consecutive pauses.
    pub backoff_multiplier: f64,
    /// Stretch each pause by a random amount of up to half its length.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Pause before retry number `retry` (0-based), before jitter.
    fn pause(&self, retry: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(retry.min(i32::MAX as u32) as i32);
        let nominal = self.initial_backoff.as_nanos() as f64 * factor;
        if nominal.is_finite() && nominal < self.max_backoff.as_nanos() as f64 {
            Duration::from_nanos(nominal as u64)
        } else {
            self.max_backoff
        }
    }
}

/// Result of a retried operation.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    /// Some attempt succeeded.
    Success(T),
    /// The error was permanent or the retries ran out.
    Exhausted {
        /// Error of the final attempt.
        last_error: TransportError,
        /// Attempts made, the first one included.
        attempts: u32,
    },
}

impl<T> RetryOutcome<T> {
    /// Drops the attempt count.
    pub fn into_result(self) -> Result<T> {
        match self {
            RetryOutcome::Success(v) => Ok(v),
            RetryOutcome::Exhausted { last_error, .. } => Err(last_error),
        }
    }

    /// Attempts made before giving up; `None` on success.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            RetryOutcome::Success(_) => None,
            RetryOutcome::Exhausted { attempts, .. } => Some(*attempts),
        }
    }
}

/// Runs an operation until it succeeds, fails permanently or runs out of
/// retries.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Executor following `config`.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// The configuration in use.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Runs `operation`, passing it the 1-based attempt number.
    ///
    /// The caller bounds the total time: dropping the returned future stops
    /// any pending pause.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let error = match operation(attempts).await {
                Ok(value) => return RetryOutcome::Success(value),
                Err(e) => e,
            };
            if attempts > self.config.max_retries || !is_retryable(&error) {
                return RetryOutcome::Exhausted {
                    last_error: error,
                    attempts,
                };
            }
            let pause = self.backoff(attempts - 1);
            warn!(
                attempt = attempts,
                pause_ms = pause.as_millis() as u64,
                error = %error,
                "transient transport failure, retrying"
            );
            tokio::time::sleep(pause).await;
        }
    }

    fn backoff(&self, retry: u32) -> Duration {
        let pause = self.config.pause(retry);
        if !self.config.jitter || pause < Duration::from_millis(2) {
            return pause;
        }
        let stretch: f64 = rand::thread_rng().gen_range(0.0..0.5);
        pause.mul_f64(1.0 + stretch)
    }
}

/// Whether another attempt could plausibly succeed.
///
/// Connection setup failures, resets, stalls and socket errors are
/// transient. Framing and codec faults, rejected logins, bad addresses,
/// closed pools and cancellation are not.
pub fn is_retryable(error: &TransportError) -> bool {
    matches!(
        error,
        TransportError::ConnectionRefused { .. }
            | TransportError::ConnectionTimeout { .. }
            | TransportError::ConnectionReset
            | TransportError::RequestTimeout { .. }
            | TransportError::IoError(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelReason;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn quick(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_transient_and_permanent_errors() {
        assert!(is_retryable(&TransportError::ConnectionReset));
        assert!(is_retryable(&TransportError::ConnectionRefused {
            addr: "mgr1.example.org:1094".to_string()
        }));
        assert!(is_retryable(&TransportError::RequestTimeout {
            request_id: 1,
            timeout_ms: 5000
        }));
        assert!(!is_retryable(&TransportError::InvalidFrame {
            reason: "short header".to_string()
        }));
        assert!(!is_retryable(&TransportError::NotConnected));
        assert!(!is_retryable(&TransportError::Cancelled {
            reason: CancelReason::UserRequested
        }));
        assert!(!is_retryable(&TransportError::InvalidAddress {
            addr: "mgr1".to_string()
        }));
    }

    #[tokio::test]
    async fn test_succeeds_on_third_attempt() {
        let executor = RetryExecutor::new(quick(3));
        let calls = Arc::new(AtomicU32::new(0));

        let outcome = executor
            .execute(|_| {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::Relaxed) < 2 {
                        Err(TransportError::ConnectionReset)
                    } else {
                        Ok(17u64)
                    }
                }
            })
            .await;

        assert!(matches!(outcome, RetryOutcome::Success(17)));
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let executor = RetryExecutor::new(quick(3));
        let outcome: RetryOutcome<()> = executor
            .execute(|_| async { Err(TransportError::ConnectionReset) })
            .await;
        assert_eq!(outcome.attempts(), Some(4));
        assert!(matches!(outcome.into_result(), Err(TransportError::ConnectionReset)));
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let executor = RetryExecutor::new(quick(3));
        let outcome: RetryOutcome<()> = executor
            .execute(|_| async {
                Err(TransportError::LoginRejected {
                    addr: "mgr1.example.org:1094".to_string(),
                    message: "bad token".to_string(),
                })
            })
            .await;
        assert_eq!(outcome.attempts(), Some(1));
    }

    #[tokio::test]
    async fn test_attempt_numbers_count_from_one() {
        let executor = RetryExecutor::new(quick(2));
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let _ = executor
            .execute(|attempt| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().push(attempt);
                    Err::<(), _>(TransportError::ConnectionReset)
                }
            })
            .await;
        assert_eq!(*seen.lock(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_zero_retries_means_one_attempt() {
        let executor = RetryExecutor::new(quick(0));
        let outcome: RetryOutcome<()> = executor
            .execute(|_| async { Err(TransportError::ConnectionReset) })
            .await;
        assert_eq!(outcome.attempts(), Some(1));
    }

    #[test]
    fn test_pause_grows_then_caps() {
        let config = RetryConfig {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            jitter: false,
            ..RetryConfig::default()
        };
        let executor = RetryExecutor::new(config);
        assert_eq!(executor.backoff(0), Duration::from_millis(100));
        assert_eq!(executor.backoff(1), Duration::from_millis(200));
        assert_eq!(executor.backoff(2), Duration::from_millis(400));
        assert_eq!(executor.backoff(3), Duration::from_millis(500));
        assert_eq!(executor.backoff(u32::MAX), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_within_half_again() {
        let executor = RetryExecutor::default();
        for retry in 0..6 {
            let nominal = executor.config().pause(retry);
            let pause = executor.backoff(retry);
            assert!(pause >= nominal);
            assert!(pause <= nominal.mul_f64(1.5));
        }
    }
}
