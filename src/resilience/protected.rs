//! # Circuit Breaker Protected Row Operation
//!
//! Wraps any [`RowOperation`] so that a failing downstream trips the breaker and
//! further rows fail fast with [`RowOperationError::CircuitOpen`] (retryable).

use crate::downstream::{CsvRow, RowOperation, RowOperationError, RowOperationResponse};
use crate::resilience::{CircuitBreaker, CircuitBreakerError};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct ProtectedRowOperation {
    inner: Arc<dyn RowOperation>,
    breaker: Arc<CircuitBreaker>,
}

impl std::fmt::Debug for ProtectedRowOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtectedRowOperation")
            .field("breaker", &self.breaker.name())
            .field("state", &self.breaker.state())
            .finish()
    }
}

impl ProtectedRowOperation {
    pub fn new(inner: Arc<dyn RowOperation>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

#[async_trait]
impl RowOperation for ProtectedRowOperation {
    async fn invoke(&self, row: &CsvRow) -> Result<RowOperationResponse, RowOperationError> {
        self.breaker
            .call(|| self.inner.invoke(row))
            .await
            .map_err(|e| match e {
                CircuitBreakerError::CircuitOpen { component } => {
                    warn!(
                        component = %component,
                        row_index = row.index,
                        "Row operation rejected by open circuit"
                    );
                    RowOperationError::CircuitOpen { component }
                }
                CircuitBreakerError::OperationFailed(inner) => inner,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downstream::TimeLimitedRowOperation;
    use crate::resilience::{CircuitBreakerConfig, CircuitState};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct AlwaysThrottled {
        calls: AtomicU32,
    }

    #[async_trait]
    impl RowOperation for AlwaysThrottled {
        async fn invoke(&self, _row: &CsvRow) -> Result<RowOperationResponse, RowOperationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(RowOperationError::throttled("429"))
        }
    }

    #[tokio::test]
    async fn test_open_circuit_short_circuits_downstream() {
        let downstream = Arc::new(AlwaysThrottled::default());
        let breaker = Arc::new(CircuitBreaker::new(
            "row_operation",
            CircuitBreakerConfig {
                failure_threshold: 2,
                timeout: Duration::from_secs(60),
                success_threshold: 1,
            },
        ));
        let protected = ProtectedRowOperation::new(downstream.clone(), breaker.clone());
        let row = CsvRow::from_record(0, ["id"], ["1"]);

        for _ in 0..2 {
            let err = protected.invoke(&row).await.unwrap_err();
            assert!(matches!(err, RowOperationError::Throttled { .. }));
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let err = protected.invoke(&row).await.unwrap_err();
        assert!(matches!(err, RowOperationError::CircuitOpen { .. }));
        assert!(err.is_retryable());
        assert_eq!(downstream.calls.load(Ordering::SeqCst), 2);
    }

    /// Fails once, hangs once, then answers normally
    #[derive(Default)]
    struct FailsThenHangs {
        calls: AtomicU32,
    }

    #[async_trait]
    impl RowOperation for FailsThenHangs {
        async fn invoke(&self, row: &CsvRow) -> Result<RowOperationResponse, RowOperationError> {
            match self.calls.fetch_add(1, Ordering::SeqCst) {
                0 => Err(RowOperationError::transient_io("reset")),
                1 => std::future::pending().await,
                _ => Ok(RowOperationResponse {
                    result_id: format!("res-{}", row.index),
                    processing_time: Duration::ZERO,
                }),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_timeout_on_trial_call_does_not_wedge_circuit() {
        let downstream = Arc::new(FailsThenHangs::default());
        let breaker = Arc::new(CircuitBreaker::new(
            "row_operation",
            CircuitBreakerConfig {
                failure_threshold: 1,
                timeout: Duration::from_secs(60),
                success_threshold: 1,
            },
        ));
        let protected = ProtectedRowOperation::new(downstream.clone(), breaker.clone());
        let row = CsvRow::from_record(0, ["id"], ["1"]);

        assert!(protected.invoke(&row).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(61)).await;
        let hung = tokio::time::timeout(Duration::from_secs(35), protected.invoke(&row)).await;
        assert!(hung.is_err());

        tokio::time::advance(Duration::from_secs(3 * 3600)).await;
        for _ in 0..5 {
            assert!(protected.invoke(&row).await.is_ok());
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.metrics().rejected_count, 0);
        assert_eq!(downstream.calls.load(Ordering::SeqCst), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_inside_breaker_counts_as_failure() {
        let downstream = Arc::new(FailsThenHangs::default());
        downstream.calls.store(1, Ordering::SeqCst);
        let breaker = Arc::new(CircuitBreaker::new(
            "row_operation",
            CircuitBreakerConfig {
                failure_threshold: 1,
                timeout: Duration::from_secs(60),
                success_threshold: 1,
            },
        ));
        let timed = Arc::new(TimeLimitedRowOperation::new(downstream, Duration::from_secs(35)));
        let protected = ProtectedRowOperation::new(timed, breaker.clone());
        let row = CsvRow::from_record(0, ["id"], ["1"]);

        let err = protected.invoke(&row).await.unwrap_err();
        assert!(matches!(err, RowOperationError::Timeout { .. }));
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.metrics().failure_count, 1);
    }
}
