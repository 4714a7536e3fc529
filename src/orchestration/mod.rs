//! # Orchestration
//!
//! The dispatch core: a coordinator that polls the source queue and fans each
//! batch out to a bounded, staggered pool of workers.
//!
//! ## Core Components
//!
//! - **Dispatcher**: poll -> size pool -> stagger -> join, one batch at a time
//! - **ConcurrencyController**: worker-pool size from approximate queue depth
//! - **StaggerScheduler**: deterministic start offsets per batch position
//! - **RowProcessor**: streams one object as CSV and invokes the downstream per row
//! - **RetryPolicy**: bounded exponential backoff shared by every retry site
//! - **DeadLetterRouter**: stage-specific dead-letter delivery with alerting
//! - **ErrorClassifier**: maps failures onto retryability and a short cause string

pub mod concurrency;
pub mod dead_letter;
pub mod dispatcher;
pub mod error_classifier;
pub mod metrics;
pub mod retry_policy;
pub mod row_processor;
pub mod stagger;
pub mod types;

pub use concurrency::ConcurrencyController;
pub use dead_letter::DeadLetterRouter;
pub use dispatcher::Dispatcher;
pub use error_classifier::{ErrorCategory, ErrorClassification, ErrorClassifier};
pub use metrics::{DispatchMetrics, MetricsSnapshot};
pub use retry_policy::{RetryDecision, RetryExhausted, RetryPolicy, Retryable};
pub use row_processor::RowProcessor;
pub use stagger::StaggerScheduler;
pub use types::{
    Batch, BatchEntry, BatchReport, FailureContext, ItemReport, ItemResolution,
    ProcessingOutcome, RowResult, WorkItem,
};
