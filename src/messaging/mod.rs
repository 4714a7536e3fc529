//! # Messaging Module
//!
//! Source-queue and dead-letter collaborators. The dispatcher only sees the
//! [`QueueClient`] and [`DeadLetterSink`] traits; backends are an in-memory
//! queue (local runs, tests) and pgmq over PostgreSQL.

pub mod errors;
pub mod in_memory;
pub mod message;
pub mod pgmq_client;
pub mod queue;

pub use errors::{MessagingError, MessagingResult};
pub use in_memory::{InMemoryDeadLetterSink, InMemoryQueue};
pub use message::{DeadLetterRecord, MessageParseError, ObjectReference, QueueMessage};
pub use pgmq_client::PgmqQueue;
pub use queue::{DeadLetterSink, QueueClient};
