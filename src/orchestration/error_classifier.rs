//! # Error Classification
//!
//! Maps component errors onto a small set of categories, each with a stable
//! cause string for dead-letter records and a retryable flag.
//!
//! ```text
//! RowOperationError ─┐
//! StorageError ──────┼──▶ ErrorClassifier ──▶ ErrorClassification { category, retryable }
//! MessagingError ────┤
//! MessageParseError ─┘
//! ```

use crate::downstream::RowOperationError;
use crate::messaging::{MessageParseError, MessagingError};
use crate::storage::StorageError;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Will never succeed if retried
    Permanent,
    /// May succeed on retry
    Transient,
    Timeout,
    RateLimit,
    Network,
    /// Protected dependency is failing fast
    CircuitOpen,
    /// The referenced object does not exist
    NotFound,
    /// Message body or object content cannot be parsed
    MalformedInput,
    Configuration,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Transient => "transient",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Network => "network",
            ErrorCategory::CircuitOpen => "circuit_open",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::MalformedInput => "malformed_input",
            ErrorCategory::Configuration => "configuration",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub category: ErrorCategory,
    pub retryable: bool,
    /// Finer-grained cause recorded with dead-letter records
    pub cause: String,
    pub message: String,
}

impl ErrorClassification {
    fn new(category: ErrorCategory, retryable: bool, cause: &str, message: impl ToString) -> Self {
        Self {
            category,
            retryable,
            cause: cause.to_string(),
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify_row_error(&self, error: &RowOperationError) -> ErrorClassification {
        let category = match error {
            RowOperationError::Timeout { .. } => ErrorCategory::Timeout,
            RowOperationError::Throttled { .. } => ErrorCategory::RateLimit,
            RowOperationError::TransientIo { .. } => ErrorCategory::Network,
            RowOperationError::Permanent { .. } => ErrorCategory::Permanent,
            RowOperationError::CircuitOpen { .. } => ErrorCategory::CircuitOpen,
        };
        ErrorClassification::new(category, error.is_retryable(), error.cause(), error)
    }

    pub fn classify_storage_error(&self, error: &StorageError) -> ErrorClassification {
        let category = match error {
            StorageError::NotFound { .. } => ErrorCategory::NotFound,
            StorageError::Io { .. } => ErrorCategory::Network,
            StorageError::Throttled { .. } => ErrorCategory::RateLimit,
            StorageError::Timeout { .. } => ErrorCategory::Timeout,
        };
        ErrorClassification::new(category, error.is_retryable(), error.cause(), error)
    }

    pub fn classify_messaging_error(&self, error: &MessagingError) -> ErrorClassification {
        let (category, cause) = match error {
            MessagingError::Connection { .. } => (ErrorCategory::Network, "connection"),
            MessagingError::QueueOperation { .. } => (ErrorCategory::Transient, "queue_operation"),
            MessagingError::Throttled { .. } => (ErrorCategory::RateLimit, "throttled"),
            MessagingError::Timeout { .. } => (ErrorCategory::Timeout, "timeout"),
            MessagingError::QueueNotFound { .. } => (ErrorCategory::Configuration, "queue_not_found"),
            MessagingError::UnknownSink { .. } => (ErrorCategory::Configuration, "unknown_sink"),
            MessagingError::InvalidReceipt { .. } => (ErrorCategory::Permanent, "invalid_receipt"),
            MessagingError::MessageSerialization { .. } => {
                (ErrorCategory::MalformedInput, "serialization")
            }
            MessagingError::Internal { .. } => (ErrorCategory::Permanent, "internal"),
        };
        ErrorClassification::new(category, error.is_transient(), cause, error)
    }

    pub fn classify_parse_error(&self, error: &MessageParseError) -> ErrorClassification {
        let cause = match error {
            MessageParseError::InvalidJson(_) => "invalid_json",
            MessageParseError::MissingBucket | MessageParseError::MissingKey => "missing_field",
            MessageParseError::InvalidBucket(_) => "invalid_bucket",
            MessageParseError::PathTraversal(_) => "path_traversal",
        };
        ErrorClassification::new(ErrorCategory::MalformedInput, false, cause, error)
    }
}
