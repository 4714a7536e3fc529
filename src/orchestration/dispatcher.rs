//! # Dispatcher
//!
//! The coordinator loop. Each cycle is an explicit poll -> fan-out -> join:
//!
//! 1. Long-poll up to `max_batch_size` messages (transport failures retried;
//!    on exhaustion a dispatch-stage dead-letter record is emitted and the loop
//!    carries on).
//! 2. Size the worker pool from the approximate queue depth.
//! 3. Give every item its stagger offset; after the offset it waits for a pool
//!    slot, so spacing and the concurrency cap both hold.
//! 4. Each worker parses the body, runs the row processor (with item-level
//!    retries) and resolves the message to exactly one terminal action.
//! 5. The batch is joined before the next poll.
//!
//! Only cancellation stops [`Dispatcher::run`]; no single message can.

use super::concurrency::ConcurrencyController;
use super::dead_letter::DeadLetterRouter;
use super::error_classifier::ErrorClassifier;
use super::metrics::{DispatchMetrics, MetricsSnapshot};
use super::retry_policy::{RetryDecision, RetryPolicy};
use super::row_processor::RowProcessor;
use super::stagger::StaggerScheduler;
use super::types::{Batch, BatchEntry, BatchReport, ItemReport, ItemResolution, WorkItem};
use crate::config::{DispatcherConfig, QueueConfig};
use crate::constants::{DeadLetterStage, OutcomeStatus};
use crate::downstream::RowOperation;
use crate::error::{DispatchError, Result};
use crate::logging::{log_dispatch_operation, log_error};
use crate::messaging::{DeadLetterRecord, DeadLetterSink, MessageParseError, QueueClient, QueueMessage};
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig};
use crate::storage::ObjectStore;
use futures::future::join_all;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct Dispatcher {
    queue: Arc<dyn QueueClient>,
    processor: RowProcessor,
    router: DeadLetterRouter,
    concurrency: ConcurrencyController,
    stagger: StaggerScheduler,
    retry: RetryPolicy,
    queue_config: QueueConfig,
    classifier: ErrorClassifier,
    breaker: Option<Arc<CircuitBreaker>>,
    metrics: Arc<DispatchMetrics>,
    run_id: Uuid,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("queue", &self.queue.queue_name())
            .field("run_id", &self.run_id)
            .field("concurrency", &self.concurrency)
            .field("stagger", &self.stagger)
            .field("retry", &self.retry)
            .finish()
    }
}

/// Polling ran out of retries
#[derive(Debug, Clone, Copy)]
struct PollFailure {
    /// The dispatch-stage record reached its sink
    dead_lettered: bool,
}

impl Dispatcher {
    /// Wire the dispatcher from configuration and its collaborators. The row
    /// operation is wrapped in a circuit breaker when one is enabled.
    pub fn new(
        config: &DispatcherConfig,
        queue: Arc<dyn QueueClient>,
        sink: Arc<dyn DeadLetterSink>,
        store: Arc<dyn ObjectStore>,
        operation: Arc<dyn RowOperation>,
    ) -> Self {
        let metrics = Arc::new(DispatchMetrics::new());
        let retry = RetryPolicy::from_config(&config.retry);

        let processor = RowProcessor::new(
            store,
            operation,
            retry,
            config.row_processing.clone(),
            metrics.clone(),
        );
        let (processor, breaker) = if config.circuit_breaker.enabled {
            let breaker = Arc::new(CircuitBreaker::new(
                "row_operation",
                CircuitBreakerConfig::from(&config.circuit_breaker),
            ));
            (processor.with_circuit_breaker(breaker.clone()), Some(breaker))
        } else {
            (processor, None)
        };
        let router = DeadLetterRouter::new(sink, config.dead_letter.clone(), retry, metrics.clone());

        Self {
            queue,
            processor,
            router,
            concurrency: ConcurrencyController::from_config(&config.dispatch),
            stagger: StaggerScheduler::from_config(&config.stagger),
            retry,
            queue_config: config.queue.clone(),
            classifier: ErrorClassifier::new(),
            breaker,
            metrics,
            run_id: Uuid::new_v4(),
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    /// Poll and dispatch until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(
            run_id = %self.run_id,
            queue = %self.queue.queue_name(),
            max_batch_size = self.queue_config.max_batch_size,
            max_concurrency = self.concurrency.max(),
            "Dispatcher started"
        );

        while !cancel.is_cancelled() {
            let report = self.run_once(&cancel).await;
            if report.is_empty() && !cancel.is_cancelled() {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(self.queue_config.idle_wait()) => {}
                }
            }
        }

        let snapshot = self.metrics.snapshot();
        info!(
            run_id = %self.run_id,
            batches = snapshot.batches,
            items_processed = snapshot.items_processed,
            items_failed = snapshot.items_failed,
            dead_lettered = snapshot.dead_lettered(),
            items_released = snapshot.items_released,
            "Dispatcher stopped"
        );
        Ok(())
    }

    /// One poll -> fan-out -> join cycle
    pub async fn run_once(&self, cancel: &CancellationToken) -> BatchReport {
        if cancel.is_cancelled() {
            return BatchReport::default();
        }

        let messages = match self.poll(cancel).await {
            Some(Ok(messages)) => messages,
            Some(Err(failure)) => {
                return BatchReport {
                    poll_failed: true,
                    sink_unavailable: !failure.dead_lettered,
                    ..BatchReport::default()
                }
            }
            None => return BatchReport::default(),
        };
        if messages.is_empty() {
            debug!(run_id = %self.run_id, "Poll returned no messages");
            return BatchReport::default();
        }

        self.metrics.record_batch();
        let batch = Batch::from_messages(messages);
        let batch_size = batch.len();

        let queue_depth = match self.queue.approximate_depth().await {
            Ok(depth) => depth,
            Err(e) => {
                warn!(
                    run_id = %self.run_id,
                    error = %e,
                    fallback_depth = batch_size,
                    "Queue depth lookup failed; using batch size"
                );
                batch_size as u64
            }
        };
        let effective_concurrency = self.concurrency.effective(queue_depth);

        info!(
            run_id = %self.run_id,
            batch_size = batch_size,
            queue_depth = queue_depth,
            effective_concurrency = effective_concurrency,
            "Dispatching batch"
        );

        let slots = Semaphore::new(effective_concurrency);
        let dispatched_at = Instant::now();
        let items = join_all(batch.entries.into_iter().map(|entry| {
            let offset = self
                .stagger
                .offset(entry.index, queue_depth, entry.priority());
            self.dispatch_entry(entry, offset, &slots, dispatched_at, cancel)
        }))
        .await;

        BatchReport {
            batch_size,
            queue_depth,
            effective_concurrency,
            items,
            poll_failed: false,
            sink_unavailable: false,
        }
    }

    /// `None` when cancelled while polling, `Some(Err)` when retries ran out
    async fn poll(
        &self,
        cancel: &CancellationToken,
    ) -> Option<std::result::Result<Vec<QueueMessage>, PollFailure>> {
        let max_messages = self.queue_config.max_batch_size;
        let wait = self.queue_config.poll_wait();

        let polled = tokio::select! {
            biased;
            () = cancel.cancelled() => return None,
            polled = self.retry.retry("poll_batch", || self.queue.poll_batch(max_messages, wait)) => polled,
        };

        match polled {
            Ok(messages) => Some(Ok(messages)),
            Err(exhausted) => {
                self.metrics.record_poll_failure();
                let classification = self.classifier.classify_messaging_error(&exhausted.error);
                log_error(
                    "dispatcher",
                    "poll_batch",
                    &classification.message,
                    Some(self.queue.queue_name()),
                );
                let payload = json!({
                    "queue_name": self.queue.queue_name(),
                    "error": classification.message,
                    "attempts": exhausted.attempts,
                });
                // Sink exhaustion is alerted by the router; polling goes on regardless
                let routed = self
                    .router
                    .route(
                        DeadLetterStage::Dispatch,
                        payload,
                        &classification.message,
                        &classification.cause,
                        &self.run_id.to_string(),
                    )
                    .await;
                Some(Err(PollFailure {
                    dead_lettered: routed.is_ok(),
                }))
            }
        }
    }

    /// Stagger, wait for a slot, then resolve the entry
    async fn dispatch_entry(
        &self,
        entry: BatchEntry,
        offset: Duration,
        slots: &Semaphore,
        dispatched_at: Instant,
        cancel: &CancellationToken,
    ) -> ItemReport {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return self.release(&entry),
            () = tokio::time::sleep(offset) => {}
        }

        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => return self.release(&entry),
            permit = slots.acquire() => permit,
        };
        let Ok(_permit) = permit else {
            let err = DispatchError::worker_pool_closed("slot semaphore closed");
            log_error("dispatcher", "acquire_slot", &err.to_string(), Some(entry.execution_id()));
            return self.release(&entry);
        };

        let started_after = dispatched_at.elapsed();
        debug!(
            execution_id = %entry.execution_id(),
            index = entry.index,
            offset_ms = offset.as_millis() as u64,
            started_after_ms = started_after.as_millis() as u64,
            "Worker slot acquired"
        );

        let mut report = match &entry.parsed {
            Ok(item) => self.handle_work_item(&entry.message, item.clone(), cancel).await,
            Err(parse_error) => self.handle_parse_failure(&entry.message, parse_error).await,
        };
        report.started_after = Some(started_after);
        report
    }

    fn release(&self, entry: &BatchEntry) -> ItemReport {
        self.metrics.record_item_released();
        log_dispatch_operation(
            "release",
            entry.execution_id(),
            None,
            None,
            "released",
            Some("cancelled before completion; left for redelivery"),
        );
        ItemReport::new(
            entry.message.message_id.clone(),
            entry.execution_id(),
            ItemResolution::Released,
        )
    }

    /// Malformed input never parses on retry: dead-letter and delete
    async fn handle_parse_failure(
        &self,
        message: &QueueMessage,
        parse_error: &MessageParseError,
    ) -> ItemReport {
        let classification = self.classifier.classify_parse_error(parse_error);
        warn!(
            message_id = %message.message_id,
            cause = %classification.cause,
            field = parse_error.field(),
            error = %parse_error,
            "Message body rejected"
        );
        self.metrics.record_item_failed(&classification.cause);

        let record = DeadLetterRecord::new(
            DeadLetterStage::Parse,
            DeadLetterRecord::payload_from_body(&message.body),
            classification.message,
            classification.cause,
            message.message_id.clone(),
        );
        self.dead_letter_and_delete(message, &record, 0, 0, 0).await
    }

    /// Process with item-level retries until the item resolves
    async fn handle_work_item(
        &self,
        message: &QueueMessage,
        mut item: WorkItem,
        cancel: &CancellationToken,
    ) -> ItemReport {
        loop {
            let outcome = self.processor.process(cancel, &item).await;
            item.attempt_count += 1;

            let exhausted = match outcome.status {
                OutcomeStatus::Success => {
                    self.metrics.record_item_processed();
                    let deleted = self.acknowledge(message, &item.execution_id).await;
                    log_dispatch_operation(
                        "acknowledge",
                        &item.execution_id,
                        Some(&item.bucket),
                        Some(&item.key),
                        "success",
                        Some(&format!(
                            "rows_processed={} rows_failed={}",
                            outcome.rows_processed, outcome.rows_failed
                        )),
                    );
                    let mut report = ItemReport::new(
                        item.id.clone(),
                        item.execution_id.clone(),
                        ItemResolution::Acknowledged,
                    );
                    report.attempts = item.attempt_count;
                    report.rows_processed = outcome.rows_processed;
                    report.rows_failed = outcome.rows_failed;
                    report.deleted = deleted;
                    return report;
                }
                OutcomeStatus::RetryableFailure if cancel.is_cancelled() => {
                    let mut report = self.release_item(&item);
                    report.rows_processed = outcome.rows_processed;
                    report.rows_failed = outcome.rows_failed;
                    return report;
                }
                OutcomeStatus::RetryableFailure => {
                    match self.retry.next_delay(item.attempt_count - 1) {
                        RetryDecision::RetryAfter(delay) => {
                            info!(
                                execution_id = %item.execution_id,
                                attempt = item.attempt_count,
                                delay_ms = delay.as_millis() as u64,
                                cause = %outcome.cause(),
                                "Retrying work item"
                            );
                            tokio::select! {
                                biased;
                                () = cancel.cancelled() => return self.release_item(&item),
                                () = tokio::time::sleep(delay) => {}
                            }
                            continue;
                        }
                        RetryDecision::Stop => true,
                    }
                }
                OutcomeStatus::TerminalFailure => false,
            };

            self.metrics.record_item_failed(outcome.cause());
            let error = if exhausted {
                format!(
                    "retries exhausted after {} attempts: {}",
                    item.attempt_count,
                    outcome.error_message()
                )
            } else {
                outcome.error_message().to_string()
            };
            let record = DeadLetterRecord::new(
                DeadLetterStage::Invoke,
                DeadLetterRecord::payload_from_body(&message.body),
                error,
                outcome.cause(),
                item.execution_id.clone(),
            );
            return self
                .dead_letter_and_delete(
                    message,
                    &record,
                    item.attempt_count,
                    outcome.rows_processed,
                    outcome.rows_failed,
                )
                .await;
        }
    }

    fn release_item(&self, item: &WorkItem) -> ItemReport {
        self.metrics.record_item_released();
        log_dispatch_operation(
            "release",
            &item.execution_id,
            Some(&item.bucket),
            Some(&item.key),
            "released",
            Some("cancelled mid-processing; left for redelivery"),
        );
        let mut report = ItemReport::new(
            item.id.clone(),
            item.execution_id.clone(),
            ItemResolution::Released,
        );
        report.attempts = item.attempt_count;
        report
    }

    /// Route to the stage's sink, then delete; keep the message if the sink is down
    async fn dead_letter_and_delete(
        &self,
        message: &QueueMessage,
        record: &DeadLetterRecord,
        attempts: u32,
        rows_processed: usize,
        rows_failed: usize,
    ) -> ItemReport {
        let stage = record.stage;
        let (resolution, deleted) = match self.router.route_record(record).await {
            Ok(()) => {
                let deleted = self.acknowledge(message, &record.execution_id).await;
                (ItemResolution::DeadLettered { stage }, deleted)
            }
            Err(e) => {
                warn!(
                    execution_id = %record.execution_id,
                    message_id = %message.message_id,
                    error = %e,
                    "Leaving message on queue for native redrive"
                );
                (ItemResolution::SinkUnavailable { stage }, false)
            }
        };

        log_dispatch_operation(
            "dead_letter",
            &record.execution_id,
            None,
            None,
            stage.as_str(),
            Some(&record.error),
        );

        let mut report = ItemReport::new(
            message.message_id.clone(),
            record.execution_id.clone(),
            resolution,
        );
        report.attempts = attempts;
        report.rows_processed = rows_processed;
        report.rows_failed = rows_failed;
        report.deleted = deleted;
        report
    }

    /// Delete with retries; a message that cannot be deleted is redelivered later
    async fn acknowledge(&self, message: &QueueMessage, execution_id: &str) -> bool {
        let token = message.receipt_token.as_str();
        match self
            .retry
            .retry("delete_message", || self.queue.delete_message(token))
            .await
        {
            Ok(()) => true,
            Err(exhausted) => {
                self.metrics.record_delete_failure();
                log_error(
                    "dispatcher",
                    "delete_message",
                    &exhausted.error.to_string(),
                    Some(execution_id),
                );
                false
            }
        }
    }
}
