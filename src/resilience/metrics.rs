//! # Circuit Breaker Metrics
//!
//! Counters kept by each breaker, plus the rates derived from them when a
//! snapshot is taken.

use crate::resilience::CircuitState;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    pub total_calls: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Calls refused while open
    pub rejected_count: u64,
    /// Admitted calls dropped before they reported a result
    pub abandoned_count: u64,
    pub consecutive_failures: u64,
    /// Trial calls admitted since entering half-open
    pub half_open_calls: u64,
    pub total_duration: Duration,
    pub current_state: CircuitState,
    pub failure_rate: f64,
    pub average_duration: Duration,
}

impl CircuitBreakerMetrics {
    pub fn new() -> Self {
        Self {
            total_calls: 0,
            success_count: 0,
            failure_count: 0,
            rejected_count: 0,
            abandoned_count: 0,
            consecutive_failures: 0,
            half_open_calls: 0,
            total_duration: Duration::ZERO,
            current_state: CircuitState::Closed,
            failure_rate: 0.0,
            average_duration: Duration::ZERO,
        }
    }

    /// Fill in the derived fields for a snapshot
    pub(crate) fn with_derived(mut self, state: CircuitState) -> Self {
        self.current_state = state;
        if self.total_calls > 0 {
            self.failure_rate = self.failure_count as f64 / self.total_calls as f64;
            let calls = u32::try_from(self.total_calls).unwrap_or(u32::MAX);
            self.average_duration = self.total_duration / calls;
        }
        self
    }

    pub fn format_summary(&self) -> String {
        format!(
            "state={:?} calls={} failures={} rejected={} failure_rate={:.1}% avg={}ms",
            self.current_state,
            self.total_calls,
            self.failure_count,
            self.rejected_count,
            self.failure_rate * 100.0,
            self.average_duration.as_millis()
        )
    }
}

impl Default for CircuitBreakerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
