//! # Messaging Error Types
//!
//! Errors raised by the source queue and the dead-letter sinks. Each variant
//! knows whether the transport failure is worth retrying.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("Queue connection error: {message}")]
    Connection { message: String },

    #[error("Queue operation failed: {queue_name}: {operation}: {message}")]
    QueueOperation {
        queue_name: String,
        operation: String,
        message: String,
    },

    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Queue throttled request: {operation}")]
    Throttled { operation: String },

    #[error("Network timeout: operation {operation} timed out after {timeout_seconds}s")]
    Timeout {
        operation: String,
        timeout_seconds: u64,
    },

    #[error("Receipt token rejected: {receipt_token}")]
    InvalidReceipt { receipt_token: String },

    #[error("Message serialization error: {message}")]
    MessageSerialization { message: String },

    #[error("Dead-letter sink not configured: {sink_name}")]
    UnknownSink { sink_name: String },

    #[error("Internal messaging error: {message}")]
    Internal { message: String },
}

impl MessagingError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn queue_operation(
        queue_name: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::QueueOperation {
            queue_name: queue_name.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn queue_not_found(queue_name: impl Into<String>) -> Self {
        Self::QueueNotFound {
            queue_name: queue_name.into(),
        }
    }

    pub fn throttled(operation: impl Into<String>) -> Self {
        Self::Throttled {
            operation: operation.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_seconds: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_seconds,
        }
    }

    pub fn invalid_receipt(receipt_token: impl Into<String>) -> Self {
        Self::InvalidReceipt {
            receipt_token: receipt_token.into(),
        }
    }

    pub fn unknown_sink(sink_name: impl Into<String>) -> Self {
        Self::UnknownSink {
            sink_name: sink_name.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Transport failures that may succeed on a later attempt
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::QueueOperation { .. }
                | Self::Throttled { .. }
                | Self::Timeout { .. }
        )
    }
}

impl From<sqlx::Error> for MessagingError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => MessagingError::timeout("database_pool", 30),
            sqlx::Error::Database(db_err) => {
                MessagingError::queue_operation("pgmq", "query", db_err.to_string())
            }
            sqlx::Error::Configuration(config_err) => {
                MessagingError::internal(format!("database configuration: {config_err}"))
            }
            sqlx::Error::Decode(decode_err) => {
                MessagingError::internal(format!("row decode: {decode_err}"))
            }
            other => MessagingError::connection(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        MessagingError::MessageSerialization {
            message: err.to_string(),
        }
    }
}

pub type MessagingResult<T> = Result<T, MessagingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(MessagingError::throttled("poll_batch").is_transient());
        assert!(MessagingError::timeout("delete_message", 5).is_transient());
        assert!(MessagingError::connection("reset by peer").is_transient());
        assert!(!MessagingError::queue_not_found("missing").is_transient());
        assert!(!MessagingError::unknown_sink("dlq_other").is_transient());
        assert!(!MessagingError::invalid_receipt("r-1").is_transient());
    }

    #[test]
    fn test_sqlx_pool_timeout_is_transient() {
        let err: MessagingError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, MessagingError::Timeout { .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = MessagingError::queue_operation("object_events", "read", "relation missing");
        let display = err.to_string();
        assert!(display.contains("object_events"));
        assert!(display.contains("read"));
        assert!(display.contains("relation missing"));
    }
}
