//! # Orchestration Types
//!
//! Data shared between the coordinator, the workers and the row processor:
//! work items, batches, per-row results, item outcomes and the per-batch
//! report returned by [`Dispatcher::run_once`](crate::orchestration::Dispatcher::run_once).

use crate::constants::{DeadLetterStage, OutcomeStatus, Priority, RowStatus};
use crate::messaging::{MessageParseError, ObjectReference, QueueMessage};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One validated unit of work, owned by a single worker until it resolves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    /// Queue message id, stable across redeliveries
    pub id: String,
    pub receipt_token: String,
    pub bucket: String,
    pub key: String,
    /// Processing attempts made so far within this delivery
    pub attempt_count: u32,
    pub priority: Priority,
    /// Correlation id carried into logs and dead-letter records
    pub execution_id: String,
    /// How many times the queue has delivered this message
    pub receive_count: u32,
}

impl WorkItem {
    pub fn from_reference(message: &QueueMessage, reference: ObjectReference) -> Self {
        let execution_id = reference
            .event_id
            .unwrap_or_else(|| message.message_id.clone());
        Self {
            id: message.message_id.clone(),
            receipt_token: message.receipt_token.clone(),
            bucket: reference.bucket,
            key: reference.key,
            attempt_count: 0,
            priority: reference.priority,
            execution_id,
            receive_count: message.receive_count,
        }
    }
}

/// A polled message together with the result of parsing its body
#[derive(Debug, Clone)]
pub struct BatchEntry {
    /// Position in queue delivery order; drives the stagger offset
    pub index: usize,
    pub message: QueueMessage,
    pub parsed: Result<WorkItem, MessageParseError>,
}

impl BatchEntry {
    /// Malformed bodies are scheduled at standard priority
    pub fn priority(&self) -> Priority {
        self.parsed
            .as_ref()
            .map(|item| item.priority)
            .unwrap_or_default()
    }

    pub fn execution_id(&self) -> &str {
        match &self.parsed {
            Ok(item) => &item.execution_id,
            Err(_) => &self.message.message_id,
        }
    }
}

/// Messages from one poll, in delivery order
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub entries: Vec<BatchEntry>,
}

impl Batch {
    pub fn from_messages(messages: Vec<QueueMessage>) -> Self {
        let entries = messages
            .into_iter()
            .enumerate()
            .map(|(index, message)| {
                let parsed = ObjectReference::parse(&message.body)
                    .map(|reference| WorkItem::from_reference(&message, reference));
                BatchEntry {
                    index,
                    message,
                    parsed,
                }
            })
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Result of invoking the downstream for one row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowResult {
    pub row_index: usize,
    pub status: RowStatus,
    pub latency: Duration,
    pub error: Option<String>,
}

impl RowResult {
    pub fn success(row_index: usize, latency: Duration) -> Self {
        Self {
            row_index,
            status: RowStatus::Success,
            latency,
            error: None,
        }
    }

    pub fn failure(row_index: usize, latency: Duration, error: impl Into<String>) -> Self {
        Self {
            row_index,
            status: RowStatus::Failure,
            latency,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RowStatus::Success
    }
}

/// Why an item did not succeed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureContext {
    /// Error class, e.g. `timeout`, `permanent`, `row_failure_ratio_exceeded`
    pub cause: String,
    pub message: String,
}

/// Aggregate result of processing one work item once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingOutcome {
    pub work_item_id: String,
    pub status: OutcomeStatus,
    /// Rows read from the object, failed rows included
    pub rows_processed: usize,
    pub rows_failed: usize,
    pub error_context: Option<FailureContext>,
}

impl ProcessingOutcome {
    pub fn success(work_item_id: impl Into<String>, rows_processed: usize, rows_failed: usize) -> Self {
        Self {
            work_item_id: work_item_id.into(),
            status: OutcomeStatus::Success,
            rows_processed,
            rows_failed,
            error_context: None,
        }
    }

    pub fn failure(
        work_item_id: impl Into<String>,
        status: OutcomeStatus,
        rows_processed: usize,
        rows_failed: usize,
        cause: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            work_item_id: work_item_id.into(),
            status,
            rows_processed,
            rows_failed,
            error_context: Some(FailureContext {
                cause: cause.into(),
                message: message.into(),
            }),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }

    pub fn is_retryable(&self) -> bool {
        self.status == OutcomeStatus::RetryableFailure
    }

    pub fn cause(&self) -> &str {
        self.error_context
            .as_ref()
            .map(|ctx| ctx.cause.as_str())
            .unwrap_or("none")
    }

    pub fn error_message(&self) -> &str {
        self.error_context
            .as_ref()
            .map(|ctx| ctx.message.as_str())
            .unwrap_or_default()
    }

    pub fn failure_ratio(&self) -> f64 {
        if self.rows_processed == 0 {
            0.0
        } else {
            self.rows_failed as f64 / self.rows_processed as f64
        }
    }
}

/// The single terminal action taken for a polled message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "resolution", rename_all = "snake_case")]
pub enum ItemResolution {
    /// Processed successfully and deleted
    Acknowledged,
    /// Failure context recorded in the stage's sink, then deleted
    DeadLettered { stage: DeadLetterStage },
    /// The dead-letter send could not complete; left on the queue for native redrive
    SinkUnavailable { stage: DeadLetterStage },
    /// Cancelled before resolving; left on the queue for redelivery
    Released,
}

/// What happened to one message of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemReport {
    pub message_id: String,
    pub execution_id: String,
    pub resolution: ItemResolution,
    /// Processing attempts made (0 for parse failures and unstarted items)
    pub attempts: u32,
    pub rows_processed: usize,
    pub rows_failed: usize,
    /// Time from batch dispatch to the item entering a worker slot
    pub started_after: Option<Duration>,
    /// Whether the source message delete went through
    pub deleted: bool,
}

impl ItemReport {
    pub fn new(message_id: impl Into<String>, execution_id: impl Into<String>, resolution: ItemResolution) -> Self {
        Self {
            message_id: message_id.into(),
            execution_id: execution_id.into(),
            resolution,
            attempts: 0,
            rows_processed: 0,
            rows_failed: 0,
            started_after: None,
            deleted: false,
        }
    }
}

/// Summary of one poll-dispatch-join cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub batch_size: usize,
    pub queue_depth: u64,
    pub effective_concurrency: usize,
    /// Per-item reports, in delivery order
    pub items: Vec<ItemReport>,
    /// Polling failed after retries; no messages were received
    pub poll_failed: bool,
    /// The poll failure could not be written to the dispatch sink either
    pub sink_unavailable: bool,
}

impl BatchReport {
    pub fn is_empty(&self) -> bool {
        self.batch_size == 0
    }

    pub fn count(&self, resolution: ItemResolution) -> usize {
        self.items
            .iter()
            .filter(|item| item.resolution == resolution)
            .count()
    }

    pub fn acknowledged(&self) -> usize {
        self.count(ItemResolution::Acknowledged)
    }

    pub fn dead_lettered(&self, stage: DeadLetterStage) -> usize {
        self.count(ItemResolution::DeadLettered { stage })
    }

    pub fn released(&self) -> usize {
        self.count(ItemResolution::Released)
    }
}
