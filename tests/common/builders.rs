//! Test doubles and a wired-up dispatcher harness

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use stagger_dispatch::config::DispatcherConfig;
use stagger_dispatch::downstream::{CsvRow, RowOperation, RowOperationError, RowOperationResponse};
use stagger_dispatch::messaging::{InMemoryDeadLetterSink, InMemoryQueue};
use stagger_dispatch::orchestration::Dispatcher;
use stagger_dispatch::storage::InMemoryObjectStore;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const TEST_BUCKET: &str = "incoming-data";

/// Downstream double: pops scripted errors first, then falls back to
/// `default_error` (or success). Tracks concurrent calls.
pub struct ScriptedOperation {
    latency: Duration,
    script: Mutex<VecDeque<RowOperationError>>,
    default_error: Option<RowOperationError>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedOperation {
    pub fn succeeding(latency: Duration) -> Self {
        Self {
            latency,
            script: Mutex::new(VecDeque::new()),
            default_error: None,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn failing_with(error: RowOperationError) -> Self {
        Self {
            default_error: Some(error),
            ..Self::succeeding(Duration::ZERO)
        }
    }

    pub fn then_fail(self, errors: impl IntoIterator<Item = RowOperationError>) -> Self {
        self.script.lock().extend(errors);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RowOperation for ScriptedOperation {
    async fn invoke(&self, row: &CsvRow) -> Result<RowOperationResponse, RowOperationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        let scripted = self.script.lock().pop_front();
        tokio::time::sleep(self.latency).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match scripted.or_else(|| self.default_error.clone()) {
            Some(error) => Err(error),
            None => Ok(RowOperationResponse {
                result_id: format!("res-{}", row.index),
                processing_time: self.latency,
            }),
        }
    }
}

/// Dispatcher settings with round numbers: 1s stagger unit, no depth widening,
/// 1..=3 workers, 2s/4s backoff over 3 attempts, breaker off.
pub fn test_config() -> DispatcherConfig {
    let mut config = DispatcherConfig::default();
    config.queue.queue_name = "object_events_test".to_string();
    config.queue.poll_wait_ms = 0;
    config.queue.idle_wait_ms = 1_000;
    config.dispatch.min_concurrency = 1;
    config.dispatch.max_concurrency = 3;
    config.dispatch.items_per_worker = 10;
    config.stagger.unit_delay_ms = 1_000;
    config.stagger.depth_spacing_factor = 0.0;
    config.retry.base_delay_ms = 2_000;
    config.retry.max_delay_ms = 60_000;
    config.retry.max_attempts = 3;
    config.row_processing.row_timeout_ms = 35_000;
    config.row_processing.max_in_flight_rows = 4;
    config.row_processing.cancellation_grace_ms = 10_000;
    config.circuit_breaker.enabled = false;
    config
}

pub fn event_body(bucket: &str, key: &str) -> String {
    json!({
        "id": format!("evt-{key}"),
        "detail": {
            "bucket": { "name": bucket },
            "object": { "key": key }
        }
    })
    .to_string()
}

pub fn event_body_with_priority(bucket: &str, key: &str, priority: &str) -> String {
    json!({
        "id": format!("evt-{key}"),
        "detail": {
            "bucket": { "name": bucket },
            "object": { "key": key }
        },
        "processing_options": { "priority": priority }
    })
    .to_string()
}

pub struct DispatchHarness {
    pub config: DispatcherConfig,
    pub queue: Arc<InMemoryQueue>,
    pub sink: Arc<InMemoryDeadLetterSink>,
    pub store: Arc<InMemoryObjectStore>,
    pub operation: Arc<ScriptedOperation>,
}

impl DispatchHarness {
    pub fn new(operation: ScriptedOperation) -> Self {
        Self::with_config(test_config(), operation)
    }

    pub fn with_config(config: DispatcherConfig, operation: ScriptedOperation) -> Self {
        let sink = InMemoryDeadLetterSink::new([
            config.dead_letter.parse_sink.clone(),
            config.dead_letter.invoke_sink.clone(),
            config.dead_letter.dispatch_sink.clone(),
        ]);
        Self {
            queue: Arc::new(InMemoryQueue::new(
                config.queue.queue_name.clone(),
                Duration::from_secs(300),
            )),
            sink: Arc::new(sink),
            store: Arc::new(InMemoryObjectStore::new()),
            operation: Arc::new(operation),
            config,
        }
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            &self.config,
            self.queue.clone(),
            self.sink.clone(),
            self.store.clone(),
            self.operation.clone(),
        )
    }

    /// Store `csv` under `key` and enqueue its object-created event
    pub fn enqueue_object(&self, key: &str, csv: &str) -> String {
        self.store.put(TEST_BUCKET, key, csv.as_bytes().to_vec());
        self.queue.send(event_body(TEST_BUCKET, key))
    }

    pub fn enqueue_raw(&self, body: &str) -> String {
        self.queue.send(body)
    }
}

/// A small CSV with `rows` data rows
pub fn csv_with_rows(rows: usize) -> String {
    let mut csv = String::from("id,name,email\n");
    for i in 0..rows {
        csv.push_str(&format!("{i},user-{i},user{i}@example.com\n"));
    }
    csv
}
