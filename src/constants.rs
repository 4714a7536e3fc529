//! # System Constants
//!
//! Shared enums and default values that define the operational boundaries of
//! the dispatcher: priorities, dead-letter stages and outcome statuses.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default dead-letter sink names, one per failure stage
pub mod sinks {
    pub const PARSE: &str = "dlq_parse";
    pub const INVOKE: &str = "dlq_invoke";
    pub const DISPATCH: &str = "dlq_dispatch";
}

/// Hard limits mirrored from the queue service contract
pub mod limits {
    /// Largest batch a single poll may return
    pub const MAX_BATCH_SIZE: usize = 10;
    /// Longest long-poll wait accepted by the queue
    pub const MAX_POLL_WAIT_MS: u64 = 20_000;
}

/// Processing priority carried in the message body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Standard,
    Low,
}

impl Priority {
    /// Lenient parse; unknown values fall back to `Standard`
    pub fn from_str_lossy(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "high" => Priority::High,
            "low" => Priority::Low,
            _ => Priority::Standard,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Standard => "standard",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage at which a work item failed terminally; selects the dead-letter sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterStage {
    /// Message body could not be parsed or validated
    Parse,
    /// Row processing failed permanently or exhausted retries
    Invoke,
    /// Coordinator-level failure (polling, worker pool)
    Dispatch,
}

impl DeadLetterStage {
    pub const ALL: [DeadLetterStage; 3] = [
        DeadLetterStage::Parse,
        DeadLetterStage::Invoke,
        DeadLetterStage::Dispatch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterStage::Parse => "parse",
            DeadLetterStage::Invoke => "invoke",
            DeadLetterStage::Dispatch => "dispatch",
        }
    }
}

impl fmt::Display for DeadLetterStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final status of one work item's processing attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    RetryableFailure,
    TerminalFailure,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Success => "success",
            OutcomeStatus::RetryableFailure => "retryable_failure",
            OutcomeStatus::TerminalFailure => "terminal_failure",
        }
    }
}

/// Per-row status reported by the row processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    Success,
    Failure,
}
