//! # PostgreSQL Message Queue Backend
//!
//! [`QueueClient`] and [`DeadLetterSink`] over pgmq, using plain SQL through a
//! shared sqlx pool. The pgmq message id doubles as the receipt token; each
//! read bumps `read_ct`, which becomes the receive count.

use super::errors::{MessagingError, MessagingResult};
use super::message::{DeadLetterRecord, QueueMessage};
use super::queue::{DeadLetterSink, QueueClient};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::time::Duration;
use tracing::{debug, info};

/// Poll interval pgmq uses while long-polling inside `read_with_poll`
const POLL_INTERVAL_MS: i32 = 100;

/// pgmq-backed source queue; also serves as the dead-letter sink
#[derive(Debug, Clone)]
pub struct PgmqQueue {
    pool: PgPool,
    queue_name: String,
    visibility_timeout_seconds: i32,
}

impl PgmqQueue {
    /// Connect a new pool
    pub async fn connect(
        database_url: &str,
        queue_name: impl Into<String>,
        visibility_timeout_seconds: u32,
    ) -> MessagingResult<Self> {
        info!("Connecting to pgmq");
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await?;
        Ok(Self::new_with_pool(pool, queue_name, visibility_timeout_seconds))
    }

    /// Reuse an existing pool
    pub fn new_with_pool(
        pool: PgPool,
        queue_name: impl Into<String>,
        visibility_timeout_seconds: u32,
    ) -> Self {
        Self {
            pool,
            queue_name: queue_name.into(),
            visibility_timeout_seconds: i32::try_from(visibility_timeout_seconds)
                .unwrap_or(i32::MAX),
        }
    }

    /// Create the source queue and the given sink queues if missing
    pub async fn ensure_queues(&self, sink_names: &[&str]) -> MessagingResult<()> {
        for name in std::iter::once(self.queue_name.as_str()).chain(sink_names.iter().copied()) {
            sqlx::query("SELECT pgmq.create($1)")
                .bind(name)
                .execute(&self.pool)
                .await
                .map_err(|e| MessagingError::queue_operation(name, "create", e.to_string()))?;
            debug!(queue = %name, "Queue ensured");
        }
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl QueueClient for PgmqQueue {
    async fn poll_batch(
        &self,
        max_messages: usize,
        wait_time: Duration,
    ) -> MessagingResult<Vec<QueueMessage>> {
        let limit = i32::try_from(max_messages).unwrap_or(i32::MAX);
        let wait_seconds = i32::try_from(wait_time.as_secs()).unwrap_or(i32::MAX);

        let rows = sqlx::query(
            "SELECT msg_id, read_ct, message FROM pgmq.read_with_poll($1, $2, $3, $4, $5)",
        )
        .bind(&self.queue_name)
        .bind(self.visibility_timeout_seconds)
        .bind(limit)
        .bind(wait_seconds)
        .bind(POLL_INTERVAL_MS)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| MessagingError::queue_operation(&self.queue_name, "read", e.to_string()))?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let msg_id: i64 = row.try_get("msg_id")?;
            let read_ct: i32 = row.try_get("read_ct")?;
            let body: serde_json::Value = row.try_get("message")?;
            messages.push(QueueMessage {
                message_id: msg_id.to_string(),
                receipt_token: msg_id.to_string(),
                body: body.to_string(),
                receive_count: u32::try_from(read_ct).unwrap_or_default(),
            });
        }

        debug!(
            queue = %self.queue_name,
            count = messages.len(),
            "Polled messages from pgmq"
        );
        Ok(messages)
    }

    async fn delete_message(&self, receipt_token: &str) -> MessagingResult<()> {
        let msg_id: i64 = receipt_token
            .parse()
            .map_err(|_| MessagingError::invalid_receipt(receipt_token))?;

        let deleted: bool = sqlx::query_scalar("SELECT pgmq.delete($1, $2::bigint)")
            .bind(&self.queue_name)
            .bind(msg_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                MessagingError::queue_operation(&self.queue_name, "delete", e.to_string())
            })?;

        if deleted {
            Ok(())
        } else {
            Err(MessagingError::invalid_receipt(receipt_token))
        }
    }

    async fn approximate_depth(&self) -> MessagingResult<u64> {
        let length: i64 = sqlx::query_scalar("SELECT queue_length FROM pgmq.metrics($1)")
            .bind(&self.queue_name)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                MessagingError::queue_operation(&self.queue_name, "metrics", e.to_string())
            })?;
        Ok(u64::try_from(length).unwrap_or_default())
    }

    fn queue_name(&self) -> &str {
        &self.queue_name
    }
}

#[async_trait]
impl DeadLetterSink for PgmqQueue {
    async fn send_to_dead_letter(
        &self,
        sink_name: &str,
        record: &DeadLetterRecord,
    ) -> MessagingResult<()> {
        let payload = serde_json::to_value(record)?;
        let msg_id: i64 = sqlx::query_scalar("SELECT pgmq.send($1, $2)")
            .bind(sink_name)
            .bind(&payload)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| MessagingError::queue_operation(sink_name, "send", e.to_string()))?;

        debug!(
            sink = %sink_name,
            msg_id = msg_id,
            execution_id = %record.execution_id,
            "Dead-letter record sent"
        );
        Ok(())
    }
}
