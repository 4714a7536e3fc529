//! # Dispatch Metrics
//!
//! OpenTelemetry counters for the dispatcher, mirrored by in-process atomics so
//! tests and the periodic metrics log can read them without an exporter.
//!
//! | Counter | Labels |
//! |---------|--------|
//! | `stagger.items.processed.total` | |
//! | `stagger.items.failed.total` | `cause` |
//! | `stagger.items.dead_lettered.total` | `stage` |
//! | `stagger.rows.processed.total` | |
//! | `stagger.rows.failed.total` | |
//! | `stagger.poll.failures.total` | |
//! | `stagger.sink.failures.total` | `sink` |

use crate::constants::DeadLetterStage;
use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

static DISPATCH_METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    DISPATCH_METER.get_or_init(|| opentelemetry::global::meter_provider().meter("stagger-dispatch"))
}

pub fn items_processed_total() -> Counter<u64> {
    meter()
        .u64_counter("stagger.items.processed.total")
        .with_description("Work items processed successfully and acknowledged")
        .build()
}

pub fn items_failed_total() -> Counter<u64> {
    meter()
        .u64_counter("stagger.items.failed.total")
        .with_description("Work items that ended in a terminal failure")
        .build()
}

pub fn items_dead_lettered_total() -> Counter<u64> {
    meter()
        .u64_counter("stagger.items.dead_lettered.total")
        .with_description("Dead-letter records delivered, by stage")
        .build()
}

pub fn rows_processed_total() -> Counter<u64> {
    meter()
        .u64_counter("stagger.rows.processed.total")
        .with_description("CSV rows sent to the downstream operation")
        .build()
}

pub fn rows_failed_total() -> Counter<u64> {
    meter()
        .u64_counter("stagger.rows.failed.total")
        .with_description("CSV rows that failed after retries")
        .build()
}

pub fn poll_failures_total() -> Counter<u64> {
    meter()
        .u64_counter("stagger.poll.failures.total")
        .with_description("Queue polls that failed after retries")
        .build()
}

pub fn sink_failures_total() -> Counter<u64> {
    meter()
        .u64_counter("stagger.sink.failures.total")
        .with_description("Dead-letter sends that failed after retries")
        .build()
}

/// In-process counters, shared by every component of one dispatcher
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    batches: AtomicU64,
    items_processed: AtomicU64,
    items_failed: AtomicU64,
    items_released: AtomicU64,
    dead_lettered_parse: AtomicU64,
    dead_lettered_invoke: AtomicU64,
    dead_lettered_dispatch: AtomicU64,
    rows_processed: AtomicU64,
    rows_failed: AtomicU64,
    poll_failures: AtomicU64,
    sink_failures: AtomicU64,
    delete_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub batches: u64,
    pub items_processed: u64,
    pub items_failed: u64,
    pub items_released: u64,
    pub dead_lettered_parse: u64,
    pub dead_lettered_invoke: u64,
    pub dead_lettered_dispatch: u64,
    pub rows_processed: u64,
    pub rows_failed: u64,
    pub poll_failures: u64,
    pub sink_failures: u64,
    pub delete_failures: u64,
}

impl MetricsSnapshot {
    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered_parse + self.dead_lettered_invoke + self.dead_lettered_dispatch
    }
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_item_processed(&self) {
        self.items_processed.fetch_add(1, Ordering::Relaxed);
        items_processed_total().add(1, &[]);
    }

    pub fn record_item_failed(&self, cause: &str) {
        self.items_failed.fetch_add(1, Ordering::Relaxed);
        items_failed_total().add(1, &[KeyValue::new("cause", cause.to_string())]);
    }

    pub fn record_item_released(&self) {
        self.items_released.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self, stage: DeadLetterStage) {
        let counter = match stage {
            DeadLetterStage::Parse => &self.dead_lettered_parse,
            DeadLetterStage::Invoke => &self.dead_lettered_invoke,
            DeadLetterStage::Dispatch => &self.dead_lettered_dispatch,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        items_dead_lettered_total().add(1, &[KeyValue::new("stage", stage.as_str())]);
    }

    pub fn record_rows(&self, processed: usize, failed: usize) {
        let processed = processed as u64;
        let failed = failed as u64;
        self.rows_processed.fetch_add(processed, Ordering::Relaxed);
        self.rows_failed.fetch_add(failed, Ordering::Relaxed);
        rows_processed_total().add(processed, &[]);
        if failed > 0 {
            rows_failed_total().add(failed, &[]);
        }
    }

    pub fn record_poll_failure(&self) {
        self.poll_failures.fetch_add(1, Ordering::Relaxed);
        poll_failures_total().add(1, &[]);
    }

    pub fn record_sink_failure(&self, sink: &str) {
        self.sink_failures.fetch_add(1, Ordering::Relaxed);
        sink_failures_total().add(1, &[KeyValue::new("sink", sink.to_string())]);
    }

    pub fn record_delete_failure(&self) {
        self.delete_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            items_processed: self.items_processed.load(Ordering::Relaxed),
            items_failed: self.items_failed.load(Ordering::Relaxed),
            items_released: self.items_released.load(Ordering::Relaxed),
            dead_lettered_parse: self.dead_lettered_parse.load(Ordering::Relaxed),
            dead_lettered_invoke: self.dead_lettered_invoke.load(Ordering::Relaxed),
            dead_lettered_dispatch: self.dead_lettered_dispatch.load(Ordering::Relaxed),
            rows_processed: self.rows_processed.load(Ordering::Relaxed),
            rows_failed: self.rows_failed.load(Ordering::Relaxed),
            poll_failures: self.poll_failures.load(Ordering::Relaxed),
            sink_failures: self.sink_failures.load(Ordering::Relaxed),
            delete_failures: self.delete_failures.load(Ordering::Relaxed),
        }
    }
}
