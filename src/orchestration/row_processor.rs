//! # Row Processor
//!
//! Processes one work item end to end: stream the object as CSV, invoke the
//! downstream once per row (bounded timeout, per-row retry), and fold the row
//! results into a [`ProcessingOutcome`].
//!
//! Rows are read lazily and at most `max_in_flight_rows` downstream calls run
//! at once, so an object is never buffered whole. On cancellation no new rows
//! are started; calls already in flight get `cancellation_grace` to finish and
//! the item comes back as a retryable failure.
//!
//! The row deadline is part of the operation chain itself, beneath the circuit
//! breaker when one is attached, so a timed-out call is recorded by the breaker
//! like any other failure.

use super::error_classifier::ErrorClassifier;
use super::metrics::DispatchMetrics;
use super::retry_policy::{RetryDecision, RetryPolicy};
use super::types::{ProcessingOutcome, RowResult, WorkItem};
use crate::config::RowProcessingConfig;
use crate::constants::OutcomeStatus;
use crate::downstream::{CsvRow, RowOperation, TimeLimitedRowOperation};
use crate::logging::redact_sensitive;
use crate::resilience::{CircuitBreaker, ProtectedRowOperation};
use crate::storage::ObjectStore;
use csv_async::{AsyncReaderBuilder, StringRecord};
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CAUSE_CANCELLED: &str = "cancelled";
const CAUSE_MALFORMED_CSV: &str = "malformed_csv";
const CAUSE_RATIO_EXCEEDED: &str = "row_failure_ratio_exceeded";

/// Running totals for one processing attempt
#[derive(Debug, Default)]
struct RowTally {
    total: usize,
    failed: usize,
    last_cause: Option<&'static str>,
    last_error: Option<String>,
}

impl RowTally {
    fn record(&mut self, result: RowResult, cause: Option<&'static str>) {
        self.total += 1;
        if !result.is_success() {
            self.failed += 1;
            self.last_cause = cause;
            self.last_error = result.error;
        }
    }
}

pub struct RowProcessor {
    store: Arc<dyn ObjectStore>,
    operation: Arc<dyn RowOperation>,
    retry: RetryPolicy,
    config: RowProcessingConfig,
    classifier: ErrorClassifier,
    metrics: Arc<DispatchMetrics>,
}

impl std::fmt::Debug for RowProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowProcessor")
            .field("retry", &self.retry)
            .field("config", &self.config)
            .finish()
    }
}

impl RowProcessor {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        operation: Arc<dyn RowOperation>,
        retry: RetryPolicy,
        config: RowProcessingConfig,
        metrics: Arc<DispatchMetrics>,
    ) -> Self {
        let operation: Arc<dyn RowOperation> =
            Arc::new(TimeLimitedRowOperation::new(operation, config.row_timeout()));
        Self {
            store,
            operation,
            retry,
            config,
            classifier: ErrorClassifier::new(),
            metrics,
        }
    }

    /// Route every downstream call through `breaker`. The row deadline stays
    /// inside the protected call.
    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.operation = Arc::new(ProtectedRowOperation::new(self.operation, breaker));
        self
    }

    pub async fn process(&self, cancel: &CancellationToken, item: &WorkItem) -> ProcessingOutcome {
        self.run(cancel, &item.id, &item.bucket, &item.key, &item.execution_id)
            .await
    }

    /// Process an object outside of a queue-delivered work item
    pub async fn process_object(
        &self,
        cancel: &CancellationToken,
        bucket: &str,
        key: &str,
        execution_id: &str,
    ) -> ProcessingOutcome {
        self.run(cancel, execution_id, bucket, key, execution_id).await
    }

    async fn run(
        &self,
        cancel: &CancellationToken,
        work_item_id: &str,
        bucket: &str,
        key: &str,
        execution_id: &str,
    ) -> ProcessingOutcome {
        let started = Instant::now();

        let stream = match self.store.fetch_object(bucket, key).await {
            Ok(stream) => stream,
            Err(e) => {
                let classification = self.classifier.classify_storage_error(&e);
                warn!(
                    execution_id = %execution_id,
                    bucket = %bucket,
                    key = %key,
                    retryable = classification.retryable,
                    error = %e,
                    "Failed to fetch object"
                );
                let status = if classification.retryable {
                    OutcomeStatus::RetryableFailure
                } else {
                    OutcomeStatus::TerminalFailure
                };
                return ProcessingOutcome::failure(
                    work_item_id,
                    status,
                    0,
                    0,
                    classification.cause,
                    classification.message,
                );
            }
        };

        let mut reader = AsyncReaderBuilder::new()
            .has_headers(true)
            .flexible(false)
            .create_reader(stream);

        let headers: Vec<String> = match reader.headers().await {
            Ok(record) => record.iter().map(str::to_string).collect(),
            Err(e) => {
                let io_failure = matches!(e.kind(), csv_async::ErrorKind::Io(_));
                warn!(
                    execution_id = %execution_id,
                    key = %key,
                    error = %e,
                    "Unreadable CSV header"
                );
                let (status, cause) = if io_failure {
                    (OutcomeStatus::RetryableFailure, "storage_io")
                } else {
                    (OutcomeStatus::TerminalFailure, CAUSE_MALFORMED_CSV)
                };
                return ProcessingOutcome::failure(work_item_id, status, 0, 0, cause, e.to_string());
            }
        };

        let mut tally = RowTally::default();
        let mut in_flight = FuturesUnordered::new();
        let mut record = StringRecord::new();
        let mut next_index = 0usize;
        let mut exhausted = false;
        let mut stream_error: Option<String> = None;

        loop {
            while !exhausted
                && in_flight.len() < self.config.max_in_flight_rows
                && !cancel.is_cancelled()
            {
                match reader.read_record(&mut record).await {
                    Ok(true) => {
                        let row = CsvRow::from_record(
                            next_index,
                            headers.iter().map(String::as_str),
                            record.iter(),
                        );
                        next_index += 1;
                        in_flight.push(self.process_row(row, cancel, execution_id));
                    }
                    Ok(false) => exhausted = true,
                    Err(e) if matches!(e.kind(), csv_async::ErrorKind::Io(_)) => {
                        stream_error = Some(e.to_string());
                        exhausted = true;
                    }
                    Err(e) => {
                        debug!(
                            execution_id = %execution_id,
                            row_index = next_index,
                            error = %e,
                            "Malformed CSV record"
                        );
                        tally.record(
                            RowResult::failure(next_index, std::time::Duration::ZERO, e.to_string()),
                            Some(CAUSE_MALFORMED_CSV),
                        );
                        next_index += 1;
                    }
                }
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    let grace = self.config.cancellation_grace();
                    let pending = in_flight.len();
                    let drained = tokio::time::timeout(grace, async {
                        while let Some((result, cause)) = in_flight.next().await {
                            tally.record(result, cause);
                        }
                    })
                    .await;
                    info!(
                        execution_id = %execution_id,
                        pending_rows = pending,
                        abandoned = drained.is_err(),
                        "Row processing cancelled"
                    );
                    self.metrics.record_rows(tally.total, tally.failed);
                    return ProcessingOutcome::failure(
                        work_item_id,
                        OutcomeStatus::RetryableFailure,
                        tally.total,
                        tally.failed,
                        CAUSE_CANCELLED,
                        "processing cancelled before all rows completed",
                    );
                }
                Some((result, cause)) = in_flight.next() => {
                    tally.record(result, cause);
                }
            }
        }

        self.metrics.record_rows(tally.total, tally.failed);

        if let Some(error) = stream_error {
            warn!(execution_id = %execution_id, key = %key, error = %error, "Object stream failed mid-read");
            return ProcessingOutcome::failure(
                work_item_id,
                OutcomeStatus::RetryableFailure,
                tally.total,
                tally.failed,
                "storage_io",
                error,
            );
        }

        self.finish(work_item_id, execution_id, tally, started)
    }

    fn finish(
        &self,
        work_item_id: &str,
        execution_id: &str,
        tally: RowTally,
        started: Instant,
    ) -> ProcessingOutcome {
        let max_ratio = self.config.max_row_failure_ratio;
        let ratio = if tally.total == 0 {
            0.0
        } else {
            tally.failed as f64 / tally.total as f64
        };

        info!(
            execution_id = %execution_id,
            rows_total = tally.total,
            rows_failed = tally.failed,
            failure_ratio = ratio,
            duration_ms = started.elapsed().as_millis() as u64,
            "Object processed"
        );

        if ratio <= max_ratio {
            return ProcessingOutcome::success(work_item_id, tally.total, tally.failed);
        }

        let message = format!(
            "{} of {} rows failed (ratio {:.3} exceeds {:.3}); last error: {}",
            tally.failed,
            tally.total,
            ratio,
            max_ratio,
            tally.last_error.as_deref().unwrap_or("unknown")
        );
        ProcessingOutcome::failure(
            work_item_id,
            OutcomeStatus::TerminalFailure,
            tally.total,
            tally.failed,
            tally.last_cause.unwrap_or(CAUSE_RATIO_EXCEEDED),
            message,
        )
    }

    /// Invoke the downstream for one row, retrying retryable failures
    async fn process_row(
        &self,
        row: CsvRow,
        cancel: &CancellationToken,
        execution_id: &str,
    ) -> (RowResult, Option<&'static str>) {
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            let error = match self.operation.invoke(&row).await {
                Ok(response) => {
                    debug!(
                        execution_id = %execution_id,
                        row_index = row.index,
                        result_id = %response.result_id,
                        attempts = attempt + 1,
                        "Row processed"
                    );
                    return (RowResult::success(row.index, started.elapsed()), None);
                }
                Err(error) => error,
            };

            let decision = if cancel.is_cancelled() {
                RetryDecision::Stop
            } else {
                self.retry.decide(attempt, &error)
            };

            match decision {
                RetryDecision::RetryAfter(delay) => {
                    debug!(
                        execution_id = %execution_id,
                        row_index = row.index,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying row"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel.cancelled() => {
                            return (
                                RowResult::failure(row.index, started.elapsed(), error.to_string()),
                                Some(error.cause()),
                            );
                        }
                    }
                    attempt += 1;
                }
                RetryDecision::Stop => {
                    warn!(
                        execution_id = %execution_id,
                        row_index = row.index,
                        attempts = attempt + 1,
                        error = %error,
                        row = %redact_sensitive(&row.as_json()),
                        "Row failed"
                    );
                    return (
                        RowResult::failure(row.index, started.elapsed(), error.to_string()),
                        Some(error.cause()),
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downstream::{RowOperationError, RowOperationResponse};
    use crate::resilience::{CircuitBreakerConfig, CircuitState};
    use crate::storage::InMemoryObjectStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Replays scripted results in call order, then succeeds
    #[derive(Default)]
    struct Scripted {
        script: Mutex<VecDeque<Result<(), RowOperationError>>>,
        latency: Duration,
        calls: Mutex<Vec<usize>>,
    }

    impl Scripted {
        fn new(script: Vec<Result<(), RowOperationError>>, latency: Duration) -> Self {
            Self {
                script: Mutex::new(script.into()),
                latency,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RowOperation for Scripted {
        async fn invoke(&self, row: &CsvRow) -> Result<RowOperationResponse, RowOperationError> {
            self.calls.lock().push(row.index);
            let next = self.script.lock().pop_front().unwrap_or(Ok(()));
            tokio::time::sleep(self.latency).await;
            next.map(|()| RowOperationResponse {
                result_id: format!("res-{}", row.index),
                processing_time: self.latency,
            })
        }
    }

    /// Hangs for the first `slow_calls` calls, then answers immediately
    struct HangsThenRecovers {
        slow_calls: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl RowOperation for HangsThenRecovers {
        async fn invoke(&self, row: &CsvRow) -> Result<RowOperationResponse, RowOperationError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.slow_calls {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(RowOperationResponse {
                result_id: format!("res-{}", row.index),
                processing_time: Duration::ZERO,
            })
        }
    }

    fn breaker(failure_threshold: u32, timeout: Duration) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "row_operation",
            CircuitBreakerConfig {
                failure_threshold,
                timeout,
                success_threshold: 1,
            },
        ))
    }

    fn processor(
        store: Arc<InMemoryObjectStore>,
        operation: Arc<Scripted>,
        config: RowProcessingConfig,
    ) -> RowProcessor {
        RowProcessor::new(
            store,
            operation,
            RetryPolicy::new(Duration::from_secs(2), Duration::from_secs(60), 3),
            config,
            Arc::new(DispatchMetrics::new()),
        )
    }

    fn csv(rows: usize) -> String {
        let mut body = String::from("id,name\n");
        for i in 0..rows {
            body.push_str(&format!("{i},name-{i}\n"));
        }
        body
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_rows_succeed() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.put("uploads", "a.csv", csv(5));
        let op = Arc::new(Scripted::new(vec![], Duration::from_secs(5)));
        let processor = processor(store, op.clone(), RowProcessingConfig::default());

        let outcome = processor
            .process_object(&CancellationToken::new(), "uploads", "a.csv", "exec-1")
            .await;

        assert!(outcome.is_success());
        assert_eq!(outcome.rows_processed, 5);
        assert_eq!(outcome.rows_failed, 0);
        assert_eq!(op.calls.lock().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_row_retries_with_backoff() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.put("uploads", "a.csv", csv(1));
        let op = Arc::new(Scripted::new(
            vec![
                Err(RowOperationError::throttled("429")),
                Err(RowOperationError::throttled("429")),
            ],
            Duration::ZERO,
        ));
        let processor = processor(store, op.clone(), RowProcessingConfig::default());

        let started = Instant::now();
        let outcome = processor
            .process_object(&CancellationToken::new(), "uploads", "a.csv", "exec-1")
            .await;

        assert!(outcome.is_success());
        assert_eq!(op.calls.lock().len(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_ratio_boundary() {
        let config = RowProcessingConfig {
            max_row_failure_ratio: 0.25,
            ..RowProcessingConfig::default()
        };

        // 1 of 4 rows fails: exactly at the ratio
        let store = Arc::new(InMemoryObjectStore::new());
        store.put("uploads", "a.csv", csv(4));
        let op = Arc::new(Scripted::new(
            vec![Err(RowOperationError::permanent("bad row"))],
            Duration::ZERO,
        ));
        let outcome = processor(store, op, config.clone())
            .process_object(&CancellationToken::new(), "uploads", "a.csv", "e")
            .await;
        assert!(outcome.is_success());
        assert_eq!(outcome.rows_failed, 1);

        // 2 of 4 rows fail: above the ratio
        let store = Arc::new(InMemoryObjectStore::new());
        store.put("uploads", "a.csv", csv(4));
        let op = Arc::new(Scripted::new(
            vec![
                Err(RowOperationError::permanent("bad row")),
                Err(RowOperationError::permanent("bad row")),
            ],
            Duration::ZERO,
        ));
        let outcome = processor(store, op, config)
            .process_object(&CancellationToken::new(), "uploads", "a.csv", "e")
            .await;
        assert_eq!(outcome.status, OutcomeStatus::TerminalFailure);
        assert_eq!(outcome.cause(), "permanent");
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_object_succeeds() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.put("uploads", "empty.csv", "");
        let op = Arc::new(Scripted::default());
        let outcome = processor(store, op, RowProcessingConfig::default())
            .process_object(&CancellationToken::new(), "uploads", "empty.csv", "e")
            .await;
        assert!(outcome.is_success());
        assert_eq!(outcome.rows_processed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_record_counts_as_failed_row() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.put("uploads", "a.csv", "id,name\n1,a\n2\n3,c\n");
        let op = Arc::new(Scripted::default());
        let outcome = processor(store, op.clone(), RowProcessingConfig::default())
            .process_object(&CancellationToken::new(), "uploads", "a.csv", "e")
            .await;

        assert_eq!(outcome.rows_processed, 3);
        assert_eq!(outcome.rows_failed, 1);
        assert_eq!(outcome.status, OutcomeStatus::TerminalFailure);
        assert_eq!(outcome.cause(), "malformed_csv");
        assert_eq!(op.calls.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_object_is_terminal() {
        let store = Arc::new(InMemoryObjectStore::new());
        let op = Arc::new(Scripted::default());
        let outcome = processor(store, op, RowProcessingConfig::default())
            .process_object(&CancellationToken::new(), "uploads", "gone.csv", "e")
            .await;
        assert_eq!(outcome.status, OutcomeStatus::TerminalFailure);
        assert_eq!(outcome.cause(), "object_not_found");
    }

    #[tokio::test(start_paused = true)]
    async fn test_row_timeout_is_retryable_failure() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.put("uploads", "a.csv", csv(1));
        let op = Arc::new(Scripted::new(vec![], Duration::from_secs(60)));
        let config = RowProcessingConfig {
            row_timeout_ms: 1_000,
            ..RowProcessingConfig::default()
        };
        let outcome = processor(store, op.clone(), config)
            .process_object(&CancellationToken::new(), "uploads", "a.csv", "e")
            .await;

        assert_eq!(outcome.status, OutcomeStatus::TerminalFailure);
        assert_eq!(outcome.cause(), "timeout");
        assert_eq!(op.calls.lock().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_rows_are_bounded() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.put("uploads", "a.csv", csv(8));
        let op = Arc::new(Scripted::new(vec![], Duration::from_secs(10)));
        let config = RowProcessingConfig {
            max_in_flight_rows: 2,
            ..RowProcessingConfig::default()
        };

        let started = Instant::now();
        let outcome = processor(store, op, config)
            .process_object(&CancellationToken::new(), "uploads", "a.csv", "e")
            .await;
        assert!(outcome.is_success());
        assert_eq!(started.elapsed(), Duration::from_secs(40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_waits_for_in_flight_then_returns_retryable() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.put("uploads", "a.csv", csv(10));
        let op = Arc::new(Scripted::new(vec![], Duration::from_secs(5)));
        let config = RowProcessingConfig {
            max_in_flight_rows: 2,
            cancellation_grace_ms: 10_000,
            ..RowProcessingConfig::default()
        };
        let processor = processor(store, op.clone(), config);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            canceller.cancel();
        });

        let outcome = processor
            .process_object(&cancel, "uploads", "a.csv", "e")
            .await;

        assert_eq!(outcome.status, OutcomeStatus::RetryableFailure);
        assert_eq!(outcome.cause(), "cancelled");
        // two rows finished at 5s, two more were in flight at 7s and finish by 10s
        assert_eq!(outcome.rows_processed, 4);
        assert_eq!(op.calls.lock().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_row_timeouts_open_the_circuit() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.put("uploads", "a.csv", csv(1));
        let op = Arc::new(Scripted::new(vec![], Duration::from_secs(60)));
        let config = RowProcessingConfig {
            row_timeout_ms: 1_000,
            ..RowProcessingConfig::default()
        };
        let circuit = breaker(2, Duration::from_secs(60));
        let processor = processor(store, op.clone(), config).with_circuit_breaker(circuit.clone());

        let outcome = processor
            .process_object(&CancellationToken::new(), "uploads", "a.csv", "e")
            .await;

        // two timed-out calls trip the breaker; the third attempt is refused
        assert_eq!(circuit.state(), CircuitState::Open);
        assert_eq!(circuit.metrics().failure_count, 2);
        assert_eq!(circuit.metrics().rejected_count, 1);
        assert_eq!(op.calls.lock().len(), 2);
        assert_eq!(outcome.status, OutcomeStatus::TerminalFailure);
        assert_eq!(outcome.cause(), "circuit_open");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_trial_call_reopens_then_circuit_recovers() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.put("uploads", "a.csv", csv(1));
        let op = Arc::new(HangsThenRecovers {
            slow_calls: 2,
            calls: AtomicU32::new(0),
        });
        let config = RowProcessingConfig {
            row_timeout_ms: 1_000,
            ..RowProcessingConfig::default()
        };
        let circuit = breaker(1, Duration::from_secs(5));
        let processor = RowProcessor::new(
            store,
            op.clone(),
            RetryPolicy::new(Duration::from_secs(2), Duration::from_secs(60), 5),
            config,
            Arc::new(DispatchMetrics::new()),
        )
        .with_circuit_breaker(circuit.clone());

        let started = Instant::now();
        let outcome = processor
            .process_object(&CancellationToken::new(), "uploads", "a.csv", "e")
            .await;

        // first call times out at 1s and opens; refused at 3s; the 7s trial call
        // times out at 8s and reopens; the 16s trial call succeeds and closes
        assert!(outcome.is_success());
        assert_eq!(outcome.rows_failed, 0);
        assert_eq!(op.calls.load(Ordering::SeqCst), 3);
        assert_eq!(circuit.state(), CircuitState::Closed);
        assert_eq!(circuit.metrics().failure_count, 2);
        assert_eq!(circuit.metrics().rejected_count, 1);
        assert_eq!(started.elapsed(), Duration::from_secs(16));
    }
}
