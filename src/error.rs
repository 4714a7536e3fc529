//! # Dispatcher Error Types
//!
//! Crate-level error type. Component errors (messaging, storage, downstream,
//! configuration) convert into [`DispatchError`] at the seams where they cross
//! into the coordinator.

use crate::config::ConfigurationError;
use crate::downstream::RowOperationError;
use crate::messaging::MessagingError;
use crate::storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Row operation error: {0}")]
    RowOperation(#[from] RowOperationError),

    /// A dead-letter send failed even after retries; the source message must
    /// stay on the queue so native redrive can take over.
    #[error("Dead-letter sink '{sink}' unavailable after {attempts} attempts: {message}")]
    SinkUnavailable {
        sink: String,
        attempts: u32,
        message: String,
    },

    #[error("Worker pool closed: {message}")]
    WorkerPoolClosed { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DispatchError {
    pub fn sink_unavailable(
        sink: impl Into<String>,
        attempts: u32,
        message: impl Into<String>,
    ) -> Self {
        Self::SinkUnavailable {
            sink: sink.into(),
            attempts,
            message: message.into(),
        }
    }

    pub fn worker_pool_closed(message: impl Into<String>) -> Self {
        Self::WorkerPoolClosed {
            message: message.into(),
        }
    }

    /// Short machine-readable name used in dead-letter records and metrics labels
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Messaging(_) => "messaging",
            Self::Storage(_) => "storage",
            Self::RowOperation(_) => "row_operation",
            Self::SinkUnavailable { .. } => "sink_unavailable",
            Self::WorkerPoolClosed { .. } => "worker_pool_closed",
            Self::Serialization(_) => "serialization",
        }
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_unavailable_display() {
        let err = DispatchError::sink_unavailable("dlq_invoke", 3, "connection refused");
        assert_eq!(
            err.to_string(),
            "Dead-letter sink 'dlq_invoke' unavailable after 3 attempts: connection refused"
        );
        assert_eq!(err.kind(), "sink_unavailable");
    }

    #[test]
    fn test_from_messaging_error() {
        let err: DispatchError = MessagingError::timeout("poll_batch", 20).into();
        assert_eq!(err.kind(), "messaging");
    }
}
