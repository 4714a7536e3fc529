//! Collaborator contracts for the source queue and the dead-letter sinks.

use super::errors::MessagingResult;
use super::message::{DeadLetterRecord, QueueMessage};
use async_trait::async_trait;
use std::time::Duration;

/// Source queue with long-poll receive and explicit delete
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Receive up to `max_messages`, waiting at most `wait_time` for the first one
    async fn poll_batch(
        &self,
        max_messages: usize,
        wait_time: Duration,
    ) -> MessagingResult<Vec<QueueMessage>>;

    /// Acknowledge a delivery so it is never redelivered
    async fn delete_message(&self, receipt_token: &str) -> MessagingResult<()>;

    /// Approximate, eventually-consistent number of visible messages
    async fn approximate_depth(&self) -> MessagingResult<u64>;

    fn queue_name(&self) -> &str;
}

/// Durable destinations for work that cannot complete, addressed by name
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send_to_dead_letter(
        &self,
        sink_name: &str,
        record: &DeadLetterRecord,
    ) -> MessagingResult<()>;
}
