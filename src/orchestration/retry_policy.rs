//! # Retry Policy
//!
//! Exponential backoff shared by every retry loop in the dispatcher: per-row
//! downstream calls, whole-item reprocessing, queue polls, deletes and
//! dead-letter sends.
//!
//! Attempts are numbered from zero. After attempt `n` fails with a retryable
//! error the policy waits `base * 2^n` (capped at `max_delay`), unless `n + 1`
//! attempts have already used up `max_attempts`.

use crate::config::RetryConfig;
use crate::downstream::RowOperationError;
use crate::messaging::MessagingError;
use crate::storage::StorageError;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Errors that know whether another attempt could succeed
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for RowOperationError {
    fn is_retryable(&self) -> bool {
        RowOperationError::is_retryable(self)
    }
}

impl Retryable for StorageError {
    fn is_retryable(&self) -> bool {
        StorageError::is_retryable(self)
    }
}

impl Retryable for MessagingError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    Stop,
}

/// Last error of an exhausted retry loop
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub error: E,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.max_attempts,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Uncapped-by-attempts delay after failed attempt `attempt`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Decision after attempt `attempt` failed with a retryable error
    pub fn next_delay(&self, attempt: u32) -> RetryDecision {
        if attempt.saturating_add(1) >= self.max_attempts {
            RetryDecision::Stop
        } else {
            RetryDecision::RetryAfter(self.backoff(attempt))
        }
    }

    /// Decision after attempt `attempt` failed with `error`
    pub fn decide<E: Retryable + ?Sized>(&self, attempt: u32, error: &E) -> RetryDecision {
        if error.is_retryable() {
            self.next_delay(attempt)
        } else {
            RetryDecision::Stop
        }
    }

    /// Run `operation` until it succeeds, fails terminally or attempts run out
    pub async fn retry<T, E, F, Fut>(
        &self,
        operation_name: &str,
        mut operation: F,
    ) -> Result<T, RetryExhausted<E>>
    where
        E: Retryable + Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0u32;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => match self.decide(attempt, &error) {
                    RetryDecision::RetryAfter(delay) => {
                        debug!(
                            operation = %operation_name,
                            attempt = attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "Retrying after failure"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    RetryDecision::Stop => {
                        warn!(
                            operation = %operation_name,
                            attempts = attempt + 1,
                            retryable = error.is_retryable(),
                            error = %error,
                            "Giving up"
                        );
                        return Err(RetryExhausted {
                            error,
                            attempts: attempt + 1,
                        });
                    }
                },
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(2), Duration::from_secs(60), 3)
    }

    #[test]
    fn test_exponential_schedule() {
        let policy = policy();
        assert_eq!(
            policy.next_delay(0),
            RetryDecision::RetryAfter(Duration::from_secs(2))
        );
        assert_eq!(
            policy.next_delay(1),
            RetryDecision::RetryAfter(Duration::from_secs(4))
        );
        assert_eq!(policy.next_delay(2), RetryDecision::Stop);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::new(Duration::from_secs(2), Duration::from_secs(10), 50);
        assert_eq!(policy.backoff(3), Duration::from_secs(10));
        assert_eq!(policy.backoff(40), Duration::from_secs(10));
    }

    #[test]
    fn test_non_retryable_stops_immediately() {
        let policy = policy();
        let err = RowOperationError::permanent("401");
        assert_eq!(policy.decide(0, &err), RetryDecision::Stop);

        let err = RowOperationError::throttled("429");
        assert_eq!(
            policy.decide(0, &err),
            RetryDecision::RetryAfter(Duration::from_secs(2))
        );
    }

    #[test]
    fn test_single_attempt_policy_never_retries() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(1), 1);
        assert_eq!(policy.next_delay(0), RetryDecision::Stop);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_loop_sleeps_between_attempts() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result = policy()
            .retry("poll_batch", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(MessagingError::throttled("poll_batch"))
                } else {
                    Ok("done")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_loop_reports_attempts() {
        let result = policy()
            .retry("send", || async {
                Err::<(), _>(MessagingError::unknown_sink("dlq_x"))
            })
            .await;
        let exhausted = result.unwrap_err();
        assert_eq!(exhausted.attempts, 1);
    }
}
