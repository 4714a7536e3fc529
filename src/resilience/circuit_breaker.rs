//! # Circuit Breaker
//!
//! Fails fast once the downstream keeps failing, so a struggling dependency is
//! not hammered by every in-flight row. Three states:
//!
//! - **Closed**: calls pass through; consecutive failures are counted.
//! - **Open**: calls are refused until the timeout elapses.
//! - **HalfOpen**: a limited number of trial calls are admitted; a success
//!   streak closes the circuit, any failure reopens it.

use crate::resilience::{CircuitBreakerConfig, CircuitBreakerMetrics};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Open,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error("Circuit breaker is open for {component}")]
    CircuitOpen { component: String },

    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

#[derive(Debug)]
struct BreakerState {
    metrics: CircuitBreakerMetrics,
    opened_at: Option<Instant>,
    /// Successful trial calls since entering half-open
    half_open_successes: u64,
    /// Bumped on every state transition, so a late release cannot free a
    /// trial slot from a later half-open round
    generation: u64,
}

/// Releases the admission of a call whose future is dropped before it
/// reports a result (outer timeout, abandoned row)
struct AdmissionGuard<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    settled: bool,
}

impl Drop for AdmissionGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release_abandoned(self.generation);
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    state: AtomicU8,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(
            component = %name,
            failure_threshold = config.failure_threshold,
            timeout_seconds = config.timeout.as_secs(),
            success_threshold = config.success_threshold,
            "Circuit breaker initialized"
        );

        Self {
            name,
            state: AtomicU8::new(CircuitState::Closed as u8),
            config,
            inner: Mutex::new(BreakerState {
                metrics: CircuitBreakerMetrics::new(),
                opened_at: None,
                half_open_successes: 0,
                generation: 0,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `operation` if the circuit admits it, recording the result. A call
    /// dropped before it finishes records nothing and frees its trial slot.
    ///
    /// ```rust
    /// use stagger_dispatch::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
    ///
    /// # tokio_test::block_on(async {
    /// let breaker = CircuitBreaker::new("row_operation", CircuitBreakerConfig::default());
    /// let result = breaker.call(|| async { Ok::<_, String>(42) }).await;
    /// assert_eq!(result.ok(), Some(42));
    /// assert_eq!(breaker.state(), CircuitState::Closed);
    /// # });
    /// ```
    pub async fn call<F, T, E, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(generation) = self.try_admit() else {
            return Err(CircuitBreakerError::CircuitOpen {
                component: self.name.clone(),
            });
        };
        let mut guard = AdmissionGuard {
            breaker: self,
            generation,
            settled: false,
        };

        let started = Instant::now();
        let result = operation().await;
        let duration = started.elapsed();
        guard.settled = true;

        match &result {
            Ok(_) => self.record_success(duration),
            Err(_) => self.record_failure(duration),
        }

        result.map_err(CircuitBreakerError::OperationFailed)
    }

    /// Admit a call, returning the state generation it was admitted under
    fn try_admit(&self) -> Option<u64> {
        let mut inner = self.inner.lock();
        match self.state() {
            CircuitState::Closed => Some(inner.generation),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|opened| opened.elapsed() >= self.config.timeout)
                    .unwrap_or(true);
                if elapsed {
                    self.enter_half_open(&mut inner);
                    inner.metrics.half_open_calls += 1;
                    Some(inner.generation)
                } else {
                    inner.metrics.rejected_count += 1;
                    None
                }
            }
            CircuitState::HalfOpen => {
                if inner.metrics.half_open_calls < u64::from(self.config.success_threshold) {
                    inner.metrics.half_open_calls += 1;
                    Some(inner.generation)
                } else {
                    inner.metrics.rejected_count += 1;
                    None
                }
            }
        }
    }

    /// A call admitted in `generation` was dropped without a result. Its trial
    /// slot goes back to the pool if the same half-open round is still running.
    fn release_abandoned(&self, generation: u64) {
        let mut inner = self.inner.lock();
        inner.metrics.abandoned_count += 1;
        if self.state() == CircuitState::HalfOpen && inner.generation == generation {
            inner.metrics.half_open_calls = inner.metrics.half_open_calls.saturating_sub(1);
        }
        debug!(
            component = %self.name,
            half_open_calls = inner.metrics.half_open_calls,
            "Protected call abandoned before completion"
        );
    }

    fn record_success(&self, duration: Duration) {
        let mut inner = self.inner.lock();
        inner.metrics.total_calls += 1;
        inner.metrics.success_count += 1;
        inner.metrics.total_duration += duration;
        inner.metrics.consecutive_failures = 0;

        if self.state() == CircuitState::HalfOpen {
            inner.half_open_successes += 1;
            if inner.half_open_successes >= u64::from(self.config.success_threshold) {
                self.enter_closed(&mut inner);
            }
        }
    }

    fn record_failure(&self, duration: Duration) {
        let mut inner = self.inner.lock();
        inner.metrics.total_calls += 1;
        inner.metrics.failure_count += 1;
        inner.metrics.total_duration += duration;
        inner.metrics.consecutive_failures += 1;

        debug!(
            component = %self.name,
            consecutive_failures = inner.metrics.consecutive_failures,
            "Protected call failed"
        );

        match self.state() {
            CircuitState::Closed
                if inner.metrics.consecutive_failures
                    >= u64::from(self.config.failure_threshold) =>
            {
                self.enter_open(&mut inner);
            }
            CircuitState::HalfOpen => self.enter_open(&mut inner),
            _ => {}
        }
    }

    fn enter_closed(&self, inner: &mut BreakerState) {
        inner.generation += 1;
        self.state.store(CircuitState::Closed as u8, Ordering::Release);
        inner.opened_at = None;
        inner.metrics.consecutive_failures = 0;
        inner.metrics.half_open_calls = 0;
        inner.half_open_successes = 0;
        info!(component = %self.name, "Circuit breaker closed");
    }

    fn enter_open(&self, inner: &mut BreakerState) {
        inner.generation += 1;
        self.state.store(CircuitState::Open as u8, Ordering::Release);
        inner.opened_at = Some(Instant::now());
        inner.metrics.half_open_calls = 0;
        inner.half_open_successes = 0;
        error!(
            component = %self.name,
            consecutive_failures = inner.metrics.consecutive_failures,
            timeout_seconds = self.config.timeout.as_secs(),
            "Circuit breaker opened"
        );
    }

    fn enter_half_open(&self, inner: &mut BreakerState) {
        inner.generation += 1;
        self.state
            .store(CircuitState::HalfOpen as u8, Ordering::Release);
        inner.metrics.half_open_calls = 0;
        inner.half_open_successes = 0;
        info!(
            component = %self.name,
            success_threshold = self.config.success_threshold,
            "Circuit breaker half-open"
        );
    }

    pub fn force_open(&self) {
        warn!(component = %self.name, "Circuit breaker forced open");
        let mut inner = self.inner.lock();
        self.enter_open(&mut inner);
    }

    pub fn force_closed(&self) {
        warn!(component = %self.name, "Circuit breaker forced closed");
        let mut inner = self.inner.lock();
        self.enter_closed(&mut inner);
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let snapshot = self.inner.lock().metrics.clone();
        snapshot.with_derived(self.state())
    }
}
