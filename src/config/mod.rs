//! # Dispatcher Configuration
//!
//! Typed configuration for every component of the dispatcher. Values are layered
//! by [`ConfigManager`]: built-in defaults, `config/dispatcher.toml`, an optional
//! environment overlay (`config/dispatcher.{env}.toml`) and finally `STAGGER__*`
//! environment variables.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use stagger_dispatch::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let max = manager.config().dispatch.max_concurrency;
//! let unit = manager.config().stagger.unit_delay();
//! # let _ = (max, unit);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use crate::constants::{limits, sinks, DeadLetterStage};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure mirroring `config/dispatcher.toml`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub queue: QueueConfig,
    pub dispatch: DispatchConfig,
    pub stagger: StaggerConfig,
    pub retry: RetryConfig,
    pub row_processing: RowProcessingConfig,
    pub dead_letter: DeadLetterConfig,
    pub circuit_breaker: CircuitBreakerSettings,
    pub storage: StorageConfig,
    pub telemetry: TelemetryConfig,
}

/// Source queue polling behaviour
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    pub queue_name: String,
    pub max_batch_size: usize,
    pub poll_wait_ms: u64,
    pub idle_wait_ms: u64,
    pub visibility_timeout_seconds: u32,
    /// When set, the pgmq backend is used instead of the in-memory queue
    pub database_url: Option<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_name: "object_events".to_string(),
            max_batch_size: limits::MAX_BATCH_SIZE,
            poll_wait_ms: limits::MAX_POLL_WAIT_MS,
            idle_wait_ms: 1_000,
            visibility_timeout_seconds: 900,
            database_url: None,
        }
    }
}

impl QueueConfig {
    pub fn poll_wait(&self) -> Duration {
        Duration::from_millis(self.poll_wait_ms)
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }
}

/// Worker pool sizing
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    pub items_per_worker: usize,
    pub shutdown_grace_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            min_concurrency: 1,
            max_concurrency: 10,
            items_per_worker: 10,
            shutdown_grace_ms: 30_000,
        }
    }
}

impl DispatchConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Start-offset spacing for items within a batch
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StaggerConfig {
    pub unit_delay_ms: u64,
    pub high_priority_divisor: u32,
    pub low_priority_multiplier: u32,
    /// Queue depth above which spacing widens
    pub depth_threshold: u64,
    pub depth_spacing_factor: f64,
    pub max_spacing_multiplier: f64,
}

impl Default for StaggerConfig {
    fn default() -> Self {
        Self {
            unit_delay_ms: 1_000,
            high_priority_divisor: 2,
            low_priority_multiplier: 2,
            depth_threshold: 100,
            depth_spacing_factor: 0.5,
            max_spacing_multiplier: 4.0,
        }
    }
}

impl StaggerConfig {
    pub fn unit_delay(&self) -> Duration {
        Duration::from_millis(self.unit_delay_ms)
    }
}

/// Exponential backoff parameters shared by every retry loop
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
            max_attempts: 3,
        }
    }
}

/// Per-object row processing limits
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RowProcessingConfig {
    pub row_timeout_ms: u64,
    pub max_row_failure_ratio: f64,
    pub max_in_flight_rows: usize,
    pub cancellation_grace_ms: u64,
}

impl Default for RowProcessingConfig {
    fn default() -> Self {
        Self {
            // The downstream may take up to 30s; leave headroom
            row_timeout_ms: 35_000,
            max_row_failure_ratio: 0.1,
            max_in_flight_rows: 4,
            cancellation_grace_ms: 10_000,
        }
    }
}

impl RowProcessingConfig {
    pub fn row_timeout(&self) -> Duration {
        Duration::from_millis(self.row_timeout_ms)
    }

    pub fn cancellation_grace(&self) -> Duration {
        Duration::from_millis(self.cancellation_grace_ms)
    }
}

/// Named dead-letter sinks
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    pub parse_sink: String,
    pub invoke_sink: String,
    pub dispatch_sink: String,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            parse_sink: sinks::PARSE.to_string(),
            invoke_sink: sinks::INVOKE.to_string(),
            dispatch_sink: sinks::DISPATCH.to_string(),
        }
    }
}

impl DeadLetterConfig {
    pub fn sink_for(&self, stage: DeadLetterStage) -> &str {
        match stage {
            DeadLetterStage::Parse => &self.parse_sink,
            DeadLetterStage::Invoke => &self.invoke_sink,
            DeadLetterStage::Dispatch => &self.dispatch_sink,
        }
    }
}

/// Circuit breaker around the downstream row operation
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub timeout_seconds: u64,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            timeout_seconds: 60,
            success_threshold: 1,
        }
    }
}

/// Local object storage root used by the filesystem store
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub root_directory: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_directory: "data/buckets".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub service_name: String,
    /// Interval for logging the in-process metrics snapshot
    pub metrics_log_interval_seconds: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            service_name: "stagger-dispatcher".to_string(),
            metrics_log_interval_seconds: 60,
        }
    }
}

impl DispatcherConfig {
    /// Reject values that would make the dispatcher misbehave at runtime
    pub fn validate(&self) -> ConfigResult<()> {
        let queue = &self.queue;
        if queue.queue_name.trim().is_empty() {
            return Err(ConfigurationError::invalid_value(
                "queue.queue_name",
                &queue.queue_name,
                "queue name must not be empty",
            ));
        }
        if queue.max_batch_size == 0 || queue.max_batch_size > limits::MAX_BATCH_SIZE {
            return Err(ConfigurationError::invalid_value(
                "queue.max_batch_size",
                queue.max_batch_size,
                format!("must be between 1 and {}", limits::MAX_BATCH_SIZE),
            ));
        }
        if queue.poll_wait_ms > limits::MAX_POLL_WAIT_MS {
            return Err(ConfigurationError::invalid_value(
                "queue.poll_wait_ms",
                queue.poll_wait_ms,
                format!("must not exceed {}", limits::MAX_POLL_WAIT_MS),
            ));
        }

        let dispatch = &self.dispatch;
        if dispatch.min_concurrency == 0 {
            return Err(ConfigurationError::invalid_value(
                "dispatch.min_concurrency",
                dispatch.min_concurrency,
                "at least one worker is required",
            ));
        }
        if dispatch.min_concurrency > dispatch.max_concurrency {
            return Err(ConfigurationError::invalid_value(
                "dispatch.min_concurrency",
                dispatch.min_concurrency,
                format!(
                    "must not exceed dispatch.max_concurrency ({})",
                    dispatch.max_concurrency
                ),
            ));
        }
        if dispatch.items_per_worker == 0 {
            return Err(ConfigurationError::invalid_value(
                "dispatch.items_per_worker",
                dispatch.items_per_worker,
                "must be greater than 0",
            ));
        }

        let stagger = &self.stagger;
        if stagger.high_priority_divisor == 0 {
            return Err(ConfigurationError::invalid_value(
                "stagger.high_priority_divisor",
                stagger.high_priority_divisor,
                "must be greater than 0",
            ));
        }
        if stagger.low_priority_multiplier == 0 {
            return Err(ConfigurationError::invalid_value(
                "stagger.low_priority_multiplier",
                stagger.low_priority_multiplier,
                "must be greater than 0",
            ));
        }
        if stagger.depth_threshold == 0 {
            return Err(ConfigurationError::invalid_value(
                "stagger.depth_threshold",
                stagger.depth_threshold,
                "must be greater than 0",
            ));
        }
        if !(stagger.depth_spacing_factor >= 0.0) {
            return Err(ConfigurationError::invalid_value(
                "stagger.depth_spacing_factor",
                stagger.depth_spacing_factor,
                "must be a non-negative number",
            ));
        }
        if !(stagger.max_spacing_multiplier >= 1.0) {
            return Err(ConfigurationError::invalid_value(
                "stagger.max_spacing_multiplier",
                stagger.max_spacing_multiplier,
                "must be at least 1.0",
            ));
        }

        let retry = &self.retry;
        if retry.max_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "retry.max_attempts",
                retry.max_attempts,
                "must allow at least one attempt",
            ));
        }
        if retry.base_delay_ms > retry.max_delay_ms {
            return Err(ConfigurationError::invalid_value(
                "retry.base_delay_ms",
                retry.base_delay_ms,
                format!("must not exceed retry.max_delay_ms ({})", retry.max_delay_ms),
            ));
        }

        let rows = &self.row_processing;
        if !(0.0..=1.0).contains(&rows.max_row_failure_ratio) {
            return Err(ConfigurationError::invalid_value(
                "row_processing.max_row_failure_ratio",
                rows.max_row_failure_ratio,
                "must be within [0.0, 1.0]",
            ));
        }
        if rows.max_in_flight_rows == 0 {
            return Err(ConfigurationError::invalid_value(
                "row_processing.max_in_flight_rows",
                rows.max_in_flight_rows,
                "must be greater than 0",
            ));
        }
        if rows.row_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "row_processing.row_timeout_ms",
                rows.row_timeout_ms,
                "must be greater than 0",
            ));
        }

        for stage in DeadLetterStage::ALL {
            if self.dead_letter.sink_for(stage).trim().is_empty() {
                return Err(ConfigurationError::invalid_value(
                    format!("dead_letter.{stage}_sink"),
                    "",
                    "sink name must not be empty",
                ));
            }
        }

        let breaker = &self.circuit_breaker;
        if breaker.enabled && (breaker.failure_threshold == 0 || breaker.success_threshold == 0) {
            return Err(ConfigurationError::invalid_value(
                "circuit_breaker.failure_threshold",
                breaker.failure_threshold,
                "thresholds must be greater than 0 when the breaker is enabled",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = DispatcherConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue.max_batch_size, 10);
        assert_eq!(config.stagger.unit_delay(), Duration::from_secs(1));
        assert_eq!(config.dead_letter.sink_for(DeadLetterStage::Parse), "dlq_parse");
    }

    #[test]
    fn test_min_above_max_rejected() {
        let mut config = DispatcherConfig::default();
        config.dispatch.min_concurrency = 12;
        config.dispatch.max_concurrency = 3;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("dispatch.min_concurrency"));
    }

    #[test]
    fn test_failure_ratio_bounds() {
        let mut config = DispatcherConfig::default();
        config.row_processing.max_row_failure_ratio = 1.5;
        assert!(config.validate().is_err());

        config.row_processing.max_row_failure_ratio = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_batch_size_cannot_exceed_queue_limit() {
        let mut config = DispatcherConfig::default();
        config.queue.max_batch_size = 11;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_sink_rejected() {
        let mut config = DispatcherConfig::default();
        config.dead_letter.invoke_sink = "  ".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("dead_letter.invoke_sink"));
    }
}
