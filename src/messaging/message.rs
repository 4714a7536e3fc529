//! # Queue Message Structures
//!
//! The raw message handed out by the source queue, the object-created event
//! body it carries, and the dead-letter record written to the sinks.

use crate::constants::{DeadLetterStage, Priority};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One message as delivered by the source queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Queue-assigned identifier, stable across redeliveries
    pub message_id: String,
    /// Token required to delete this delivery
    pub receipt_token: String,
    /// Raw JSON body
    pub body: String,
    /// How many times the queue has handed this message out
    pub receive_count: u32,
}

impl QueueMessage {
    pub fn new(
        message_id: impl Into<String>,
        receipt_token: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            receipt_token: receipt_token.into(),
            body: body.into(),
            receive_count: 1,
        }
    }
}

/// Object-created event body:
/// `{"detail": {"bucket": {"name": ..}, "object": {"key": ..}}}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectEventBody {
    /// Event id, used as the execution id when present
    #[serde(default)]
    pub id: Option<String>,
    pub detail: ObjectEventDetail,
    #[serde(default)]
    pub processing_options: Option<ProcessingOptions>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectEventDetail {
    pub bucket: BucketRef,
    pub object: ObjectRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketRef {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectRef {
    pub key: String,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingOptions {
    #[serde(default)]
    pub priority: Option<String>,
}

/// Validated reference extracted from a message body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectReference {
    pub bucket: String,
    pub key: String,
    pub size: Option<u64>,
    pub priority: Priority,
    pub event_id: Option<String>,
}

/// Why a message body could not become a work item. Never retryable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MessageParseError {
    #[error("Message body is not valid event JSON: {0}")]
    InvalidJson(String),

    #[error("Bucket name is missing")]
    MissingBucket,

    #[error("Object key is missing")]
    MissingKey,

    #[error("Invalid bucket name format: {0}")]
    InvalidBucket(String),

    #[error("Invalid object key: potential path traversal in '{0}'")]
    PathTraversal(String),
}

impl MessageParseError {
    /// Name of the offending field, if the failure was a validation failure
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Self::InvalidJson(_) => None,
            Self::MissingBucket | Self::InvalidBucket(_) => Some("bucket"),
            Self::MissingKey | Self::PathTraversal(_) => Some("key"),
        }
    }
}

impl ObjectReference {
    /// Parse and validate a raw message body
    pub fn parse(body: &str) -> Result<Self, MessageParseError> {
        let event: ObjectEventBody = serde_json::from_str(body)
            .map_err(|e| MessageParseError::InvalidJson(e.to_string()))?;

        let bucket = event.detail.bucket.name.trim().to_string();
        let key = event.detail.object.key.to_string();

        validate_bucket(&bucket)?;
        validate_key(&key)?;

        let priority = event
            .processing_options
            .and_then(|options| options.priority)
            .map(|p| Priority::from_str_lossy(&p))
            .unwrap_or_default();

        Ok(Self {
            bucket,
            key,
            size: event.detail.object.size,
            priority,
            event_id: event.id.filter(|id| !id.is_empty()),
        })
    }
}

/// 3-63 chars of lowercase alphanumerics, `-` or `.`, alphanumeric at both ends
fn validate_bucket(bucket: &str) -> Result<(), MessageParseError> {
    if bucket.is_empty() {
        return Err(MessageParseError::MissingBucket);
    }

    let bytes = bucket.as_bytes();
    let edge_ok = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    let body_ok = |b: u8| edge_ok(b) || b == b'-' || b == b'.';

    let valid = (3..=63).contains(&bytes.len())
        && edge_ok(bytes[0])
        && edge_ok(bytes[bytes.len() - 1])
        && bytes.iter().copied().all(body_ok);

    if valid {
        Ok(())
    } else {
        Err(MessageParseError::InvalidBucket(bucket.to_string()))
    }
}

fn validate_key(key: &str) -> Result<(), MessageParseError> {
    if key.is_empty() {
        return Err(MessageParseError::MissingKey);
    }
    if key.contains("..") || key.starts_with('/') {
        return Err(MessageParseError::PathTraversal(key.to_string()));
    }
    Ok(())
}

/// Failure context written to a dead-letter sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub stage: DeadLetterStage,
    /// The original message body, or a synthesized context for dispatch failures
    pub original_payload: serde_json::Value,
    pub error: String,
    /// Error class that caused the failure (e.g. `timeout`, `permanent`, `invalid_json`)
    pub cause: String,
    pub timestamp: DateTime<Utc>,
    pub execution_id: String,
}

impl DeadLetterRecord {
    pub fn new(
        stage: DeadLetterStage,
        original_payload: serde_json::Value,
        error: impl Into<String>,
        cause: impl Into<String>,
        execution_id: impl Into<String>,
    ) -> Self {
        Self {
            stage,
            original_payload,
            error: error.into(),
            cause: cause.into(),
            timestamp: Utc::now(),
            execution_id: execution_id.into(),
        }
    }

    /// Keep the original body verbatim; non-JSON bodies are wrapped as a string
    pub fn payload_from_body(body: &str) -> serde_json::Value {
        serde_json::from_str(body).unwrap_or_else(|_| serde_json::Value::String(body.to_string()))
    }
}
