#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Stagger Dispatch
//!
//! A staggered, bounded-concurrency batch dispatcher.
//!
//! ## Overview
//!
//! A coordinator long-polls a source queue for "object created" events, sizes
//! a worker pool from the current backlog, and releases the batch's items one
//! by one on a deterministic stagger. Each worker streams its object as CSV and
//! calls a downstream operation once per row. Every message resolves to exactly
//! one terminal action: acknowledged, dead-lettered by failure stage, or left
//! on the queue for redelivery.
//!
//! ## Module Organization
//!
//! - [`config`] - Layered TOML + environment configuration
//! - [`constants`] - Priorities, failure stages and default sink names
//! - [`downstream`] - The per-row operation and its simulated implementation
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured logging setup and helpers
//! - [`messaging`] - Source queue and dead-letter sink backends
//! - [`orchestration`] - Dispatcher, scheduling, retries and row processing
//! - [`resilience`] - Circuit breaker around the downstream operation
//! - [`storage`] - Object store backends
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stagger_dispatch::config::DispatcherConfig;
//! use stagger_dispatch::downstream::SimulatedRowOperation;
//! use stagger_dispatch::messaging::{InMemoryDeadLetterSink, InMemoryQueue};
//! use stagger_dispatch::orchestration::Dispatcher;
//! use stagger_dispatch::storage::InMemoryObjectStore;
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> stagger_dispatch::Result<()> {
//! let config = DispatcherConfig::default();
//! let dispatcher = Dispatcher::new(
//!     &config,
//!     Arc::new(InMemoryQueue::new("object-events", Duration::from_secs(30))),
//!     Arc::new(InMemoryDeadLetterSink::new(["dlq_parse", "dlq_invoke", "dlq_dispatch"])),
//!     Arc::new(InMemoryObjectStore::new()),
//!     Arc::new(SimulatedRowOperation::default()),
//! );
//!
//! let cancel = CancellationToken::new();
//! dispatcher.run(cancel).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod downstream;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod orchestration;
pub mod resilience;
pub mod storage;

pub use config::{ConfigManager, DispatcherConfig};
pub use constants::{DeadLetterStage, OutcomeStatus, Priority, RowStatus};
pub use error::{DispatchError, Result};
pub use orchestration::{BatchReport, Dispatcher, ItemResolution, MetricsSnapshot};
