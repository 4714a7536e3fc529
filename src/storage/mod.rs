//! # Object Storage
//!
//! Read-side access to the objects referenced by queue events. Objects are
//! handed back as byte streams so row processing never buffers a whole file.

mod filesystem;
mod in_memory;

pub use filesystem::FileSystemObjectStore;
pub use in_memory::InMemoryObjectStore;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;

/// Streaming object body
pub type ObjectStream = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("Storage I/O error for {bucket}/{key}: {message}")]
    Io {
        bucket: String,
        key: String,
        message: String,
    },

    #[error("Storage throttled request for {bucket}/{key}")]
    Throttled { bucket: String, key: String },

    #[error("Storage request for {bucket}/{key} timed out")]
    Timeout { bucket: String, key: String },
}

impl StorageError {
    pub fn not_found(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    pub fn io(bucket: impl Into<String>, key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Io {
            bucket: bucket.into(),
            key: key.into(),
            message: message.into(),
        }
    }

    /// Missing objects never appear on retry; everything else might
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NotFound { .. })
    }

    pub fn cause(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "object_not_found",
            Self::Io { .. } => "storage_io",
            Self::Throttled { .. } => "throttled",
            Self::Timeout { .. } => "timeout",
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Source of object bodies
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Open the object for streaming reads
    async fn fetch_object(&self, bucket: &str, key: &str) -> StorageResult<ObjectStream>;
}
