//! # Downstream Row Operation
//!
//! The slow external dependency invoked once per CSV row. The dispatcher only
//! relies on the contract: a call may take a long time, and a failure says
//! whether it is worth retrying.

mod simulated;
mod timed;

pub use simulated::SimulatedRowOperation;
pub use timed::TimeLimitedRowOperation;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// One parsed CSV row, keyed by header name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsvRow {
    /// Zero-based position in the object, header excluded
    pub index: usize,
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl CsvRow {
    pub fn new(index: usize, fields: serde_json::Map<String, serde_json::Value>) -> Self {
        Self { index, fields }
    }

    /// Build a row from parallel header and value slices
    pub fn from_record<'a>(
        index: usize,
        headers: impl IntoIterator<Item = &'a str>,
        values: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let fields = headers
            .into_iter()
            .zip(values)
            .map(|(h, v)| (h.to_string(), serde_json::Value::String(v.to_string())))
            .collect();
        Self { index, fields }
    }

    pub fn as_json(&self) -> serde_json::Value {
        serde_json::Value::Object(self.fields.clone())
    }
}

/// Successful downstream response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowOperationResponse {
    pub result_id: String,
    pub processing_time: Duration,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RowOperationError {
    #[error("Row operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Row operation throttled: {message}")]
    Throttled { message: String },

    #[error("Transient I/O failure: {message}")]
    TransientIo { message: String },

    #[error("Row operation rejected: {message}")]
    Permanent { message: String },

    #[error("Circuit breaker open for {component}")]
    CircuitOpen { component: String },
}

impl RowOperationError {
    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn throttled(message: impl Into<String>) -> Self {
        Self::Throttled {
            message: message.into(),
        }
    }

    pub fn transient_io(message: impl Into<String>) -> Self {
        Self::TransientIo {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent { .. })
    }

    pub fn cause(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Throttled { .. } => "throttled",
            Self::TransientIo { .. } => "transient_io",
            Self::Permanent { .. } => "permanent",
            Self::CircuitOpen { .. } => "circuit_open",
        }
    }
}

/// Per-row downstream call
#[async_trait]
pub trait RowOperation: Send + Sync {
    async fn invoke(&self, row: &CsvRow) -> Result<RowOperationResponse, RowOperationError>;
}
