//! # Dead-Letter Router
//!
//! Sends terminal failures to the sink matching their stage. Sends are retried
//! with the shared [`RetryPolicy`]; if the sink still cannot be reached the
//! failure is raised as an operational alert and returned as
//! [`DispatchError::SinkUnavailable`] so the caller keeps the source message.

use super::metrics::DispatchMetrics;
use super::retry_policy::RetryPolicy;
use crate::config::DeadLetterConfig;
use crate::constants::DeadLetterStage;
use crate::error::{DispatchError, Result};
use crate::logging::{log_dead_letter, log_error};
use crate::messaging::{DeadLetterRecord, DeadLetterSink};
use std::sync::Arc;
use tracing::error;

pub struct DeadLetterRouter {
    sink: Arc<dyn DeadLetterSink>,
    config: DeadLetterConfig,
    retry: RetryPolicy,
    metrics: Arc<DispatchMetrics>,
}

impl std::fmt::Debug for DeadLetterRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterRouter")
            .field("config", &self.config)
            .field("retry", &self.retry)
            .finish()
    }
}

impl DeadLetterRouter {
    pub fn new(
        sink: Arc<dyn DeadLetterSink>,
        config: DeadLetterConfig,
        retry: RetryPolicy,
        metrics: Arc<DispatchMetrics>,
    ) -> Self {
        Self {
            sink,
            config,
            retry,
            metrics,
        }
    }

    pub fn sink_name(&self, stage: DeadLetterStage) -> &str {
        self.config.sink_for(stage)
    }

    /// Build a record for `stage` and deliver it
    pub async fn route(
        &self,
        stage: DeadLetterStage,
        payload: serde_json::Value,
        error: &str,
        cause: &str,
        execution_id: &str,
    ) -> Result<()> {
        let record = DeadLetterRecord::new(stage, payload, error, cause, execution_id);
        self.route_record(&record).await
    }

    pub async fn route_record(&self, record: &DeadLetterRecord) -> Result<()> {
        let sink_name = self.sink_name(record.stage);

        let sent = self
            .retry
            .retry("send_to_dead_letter", || {
                self.sink.send_to_dead_letter(sink_name, record)
            })
            .await;

        match sent {
            Ok(()) => {
                log_dead_letter(
                    record.stage.as_str(),
                    sink_name,
                    &record.execution_id,
                    &record.error,
                );
                self.metrics.record_dead_lettered(record.stage);
                Ok(())
            }
            Err(exhausted) => {
                self.metrics.record_sink_failure(sink_name);
                let message = exhausted.error.to_string();
                error!(
                    alert = "dead_letter_sink_unavailable",
                    stage = %record.stage,
                    sink = %sink_name,
                    execution_id = %record.execution_id,
                    attempts = exhausted.attempts,
                    error = %message,
                    "OPERATIONAL ALERT: dead-letter record could not be delivered"
                );
                log_error(
                    "dead_letter_router",
                    "route",
                    &message,
                    Some(&record.execution_id),
                );
                Err(DispatchError::sink_unavailable(
                    sink_name,
                    exhausted.attempts,
                    message,
                ))
            }
        }
    }
}
