//! # In-Memory Queue and Dead-Letter Sinks
//!
//! Process-local implementations of the messaging traits with the same
//! delivery semantics as a hosted queue: long-poll receive, per-delivery
//! receipt tokens, visibility timeout redelivery and optional native redrive
//! after a maximum receive count. Used by the binary when no database is
//! configured, and by tests (with fault injection).

use super::errors::{MessagingError, MessagingResult};
use super::message::{DeadLetterRecord, QueueMessage};
use super::queue::{DeadLetterSink, QueueClient};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: String,
    body: String,
    receive_count: u32,
}

#[derive(Debug)]
struct InFlight {
    message: StoredMessage,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    available: VecDeque<StoredMessage>,
    in_flight: HashMap<String, InFlight>,
    redriven: Vec<QueueMessage>,
    next_id: u64,
}

/// In-process queue with hosted-queue delivery semantics
#[derive(Debug)]
pub struct InMemoryQueue {
    name: String,
    visibility_timeout: Duration,
    max_receive_count: Option<u32>,
    state: Mutex<QueueState>,
    notify: Notify,
    poll_failures: AtomicU32,
    delete_failures: AtomicU32,
    depth_override: Mutex<Option<u64>>,
    poll_calls: AtomicU64,
}

impl InMemoryQueue {
    pub fn new(name: impl Into<String>, visibility_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            visibility_timeout,
            max_receive_count: None,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            poll_failures: AtomicU32::new(0),
            delete_failures: AtomicU32::new(0),
            depth_override: Mutex::new(None),
            poll_calls: AtomicU64::new(0),
        }
    }

    /// Move messages aside once they have been received `max_receive_count` times
    pub fn with_redrive(mut self, max_receive_count: u32) -> Self {
        self.max_receive_count = Some(max_receive_count);
        self
    }

    /// Enqueue a body; returns the assigned message id
    pub fn send(&self, body: impl Into<String>) -> String {
        let message_id = {
            let mut state = self.state.lock();
            state.next_id += 1;
            let message_id = format!("msg-{}", state.next_id);
            state.available.push_back(StoredMessage {
                message_id: message_id.clone(),
                body: body.into(),
                receive_count: 0,
            });
            message_id
        };
        self.notify.notify_waiters();
        message_id
    }

    /// Visible messages not currently leased
    pub fn visible_len(&self) -> usize {
        let mut state = self.state.lock();
        self.release_expired(&mut state);
        state.available.len()
    }

    /// Messages currently leased to a consumer
    pub fn in_flight_len(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Messages moved aside by native redrive
    pub fn redriven(&self) -> Vec<QueueMessage> {
        self.state.lock().redriven.clone()
    }

    /// Make every in-flight message visible again, as if its lease expired
    pub fn expire_leases(&self) {
        {
            let mut state = self.state.lock();
            let leased: Vec<String> = state.in_flight.keys().cloned().collect();
            for receipt in leased {
                if let Some(entry) = state.in_flight.remove(&receipt) {
                    state.available.push_back(entry.message);
                }
            }
        }
        self.notify.notify_waiters();
    }

    /// Fail the next `count` polls with a throttling error
    pub fn inject_poll_failures(&self, count: u32) {
        self.poll_failures.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` deletes with a timeout error
    pub fn inject_delete_failures(&self, count: u32) {
        self.delete_failures.store(count, Ordering::SeqCst);
    }

    /// Report a fixed depth instead of the visible count
    pub fn set_depth_override(&self, depth: Option<u64>) {
        *self.depth_override.lock() = depth;
    }

    pub fn poll_calls(&self) -> u64 {
        self.poll_calls.load(Ordering::SeqCst)
    }

    fn release_expired(&self, state: &mut QueueState) {
        let now = Instant::now();
        let expired: Vec<String> = state
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.visible_at <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();

        for receipt in expired {
            if let Some(entry) = state.in_flight.remove(&receipt) {
                debug!(
                    queue = %self.name,
                    message_id = %entry.message.message_id,
                    "Visibility timeout elapsed, message visible again"
                );
                state.available.push_back(entry.message);
            }
        }
    }

    fn take_batch(&self, max_messages: usize) -> Vec<QueueMessage> {
        let mut state = self.state.lock();
        self.release_expired(&mut state);

        let mut batch = Vec::new();
        while batch.len() < max_messages {
            let Some(mut message) = state.available.pop_front() else {
                break;
            };

            if let Some(limit) = self.max_receive_count {
                if message.receive_count >= limit {
                    warn!(
                        queue = %self.name,
                        message_id = %message.message_id,
                        receive_count = message.receive_count,
                        "Max receive count reached, redriving message"
                    );
                    state.redriven.push(QueueMessage {
                        message_id: message.message_id,
                        receipt_token: String::new(),
                        body: message.body,
                        receive_count: message.receive_count,
                    });
                    continue;
                }
            }

            message.receive_count += 1;
            let receipt_token = Uuid::new_v4().to_string();
            batch.push(QueueMessage {
                message_id: message.message_id.clone(),
                receipt_token: receipt_token.clone(),
                body: message.body.clone(),
                receive_count: message.receive_count,
            });
            state.in_flight.insert(
                receipt_token,
                InFlight {
                    message,
                    visible_at: Instant::now() + self.visibility_timeout,
                },
            );
        }
        batch
    }
}

fn take_injected(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl QueueClient for InMemoryQueue {
    async fn poll_batch(
        &self,
        max_messages: usize,
        wait_time: Duration,
    ) -> MessagingResult<Vec<QueueMessage>> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        if take_injected(&self.poll_failures) {
            return Err(MessagingError::throttled("poll_batch"));
        }

        let deadline = Instant::now() + wait_time;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.take_batch(max_messages);
            if !batch.is_empty() {
                return Ok(batch);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn delete_message(&self, receipt_token: &str) -> MessagingResult<()> {
        if take_injected(&self.delete_failures) {
            return Err(MessagingError::timeout("delete_message", 5));
        }

        let removed = self.state.lock().in_flight.remove(receipt_token);
        match removed {
            Some(entry) => {
                debug!(
                    queue = %self.name,
                    message_id = %entry.message.message_id,
                    "Message deleted"
                );
                Ok(())
            }
            None => Err(MessagingError::invalid_receipt(receipt_token)),
        }
    }

    async fn approximate_depth(&self) -> MessagingResult<u64> {
        if let Some(depth) = *self.depth_override.lock() {
            return Ok(depth);
        }
        Ok(self.visible_len() as u64)
    }

    fn queue_name(&self) -> &str {
        &self.name
    }
}

/// Named in-memory dead-letter sinks
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterSink {
    known_sinks: HashSet<String>,
    records: DashMap<String, Vec<DeadLetterRecord>>,
    send_failures: AtomicU32,
    send_attempts: AtomicU64,
}

impl InMemoryDeadLetterSink {
    /// Accept records only for the given sink names
    pub fn new<I, S>(sink_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            known_sinks: sink_names.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn records(&self, sink_name: &str) -> Vec<DeadLetterRecord> {
        self.records
            .get(sink_name)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    pub fn total_records(&self) -> usize {
        self.records.iter().map(|entry| entry.value().len()).sum()
    }

    /// Fail the next `count` sends with a connection error
    pub fn inject_send_failures(&self, count: u32) {
        self.send_failures.store(count, Ordering::SeqCst);
    }

    pub fn send_attempts(&self) -> u64 {
        self.send_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn send_to_dead_letter(
        &self,
        sink_name: &str,
        record: &DeadLetterRecord,
    ) -> MessagingResult<()> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        if take_injected(&self.send_failures) {
            return Err(MessagingError::connection(format!(
                "sink {sink_name} unreachable"
            )));
        }
        if !self.known_sinks.contains(sink_name) {
            return Err(MessagingError::unknown_sink(sink_name));
        }

        self.records
            .entry(sink_name.to_string())
            .or_default()
            .push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DeadLetterStage;

    #[tokio::test]
    async fn test_poll_delete_cycle() {
        let queue = InMemoryQueue::new("events", Duration::from_secs(30));
        queue.send("a");
        queue.send("b");

        let batch = queue.poll_batch(10, Duration::ZERO).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].body, "a");
        assert_eq!(batch[0].receive_count, 1);
        assert_eq!(queue.in_flight_len(), 2);

        queue.delete_message(&batch[0].receipt_token).await.unwrap();
        assert_eq!(queue.in_flight_len(), 1);

        let err = queue.delete_message("unknown").await.unwrap_err();
        assert!(matches!(err, MessagingError::InvalidReceipt { .. }));
    }

    #[tokio::test]
    async fn test_poll_respects_max_messages() {
        let queue = InMemoryQueue::new("events", Duration::from_secs(30));
        for i in 0..15 {
            queue.send(format!("m{i}"));
        }
        let batch = queue.poll_batch(10, Duration::ZERO).await.unwrap();
        assert_eq!(batch.len(), 10);
        assert_eq!(queue.approximate_depth().await.unwrap(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_wakes_on_send() {
        let queue = std::sync::Arc::new(InMemoryQueue::new("events", Duration::from_secs(30)));
        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            producer.send("late");
        });

        let started = Instant::now();
        let batch = queue.poll_batch(10, Duration::from_secs(20)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_long_poll_times_out() {
        let queue = InMemoryQueue::new("events", Duration::from_secs(30));
        let batch = queue.poll_batch(10, Duration::from_secs(5)).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_visibility_timeout_redelivers() {
        let queue = InMemoryQueue::new("events", Duration::from_secs(30));
        queue.send("a");

        let first = queue.poll_batch(1, Duration::ZERO).await.unwrap();
        assert!(queue.poll_batch(1, Duration::ZERO).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        let second = queue.poll_batch(1, Duration::ZERO).await.unwrap();
        assert_eq!(second[0].message_id, first[0].message_id);
        assert_eq!(second[0].receive_count, 2);
        assert_ne!(second[0].receipt_token, first[0].receipt_token);
    }

    #[tokio::test]
    async fn test_native_redrive_after_max_receives() {
        let queue = InMemoryQueue::new("events", Duration::from_secs(30)).with_redrive(2);
        queue.send("poison");

        for _ in 0..2 {
            let batch = queue.poll_batch(1, Duration::ZERO).await.unwrap();
            assert_eq!(batch.len(), 1);
            queue.expire_leases();
        }

        assert!(queue.poll_batch(1, Duration::ZERO).await.unwrap().is_empty());
        let redriven = queue.redriven();
        assert_eq!(redriven.len(), 1);
        assert_eq!(redriven[0].body, "poison");
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let queue = InMemoryQueue::new("events", Duration::from_secs(30));
        queue.inject_poll_failures(1);
        assert!(queue.poll_batch(1, Duration::ZERO).await.is_err());
        assert!(queue.poll_batch(1, Duration::ZERO).await.is_ok());
        assert_eq!(queue.poll_calls(), 2);
    }

    #[tokio::test]
    async fn test_sink_rejects_unknown_names() {
        let sinks = InMemoryDeadLetterSink::new(["dlq_parse"]);
        let record = DeadLetterRecord::new(
            DeadLetterStage::Parse,
            serde_json::json!("x"),
            "bad",
            "invalid_json",
            "exec-1",
        );

        sinks.send_to_dead_letter("dlq_parse", &record).await.unwrap();
        let err = sinks
            .send_to_dead_letter("dlq_other", &record)
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::UnknownSink { .. }));
        assert_eq!(sinks.records("dlq_parse").len(), 1);
        assert_eq!(sinks.total_records(), 1);
    }
}
