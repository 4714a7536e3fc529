//! Stand-in for the external API: uniform latency, occasional failures.

use super::{CsvRow, RowOperation, RowOperationError, RowOperationResponse};
use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct SimulatedRowOperation {
    min_latency: Duration,
    max_latency: Duration,
    failure_rate: f64,
    /// Share of failures that are retryable (server errors vs. auth errors)
    retryable_share: f64,
}

impl Default for SimulatedRowOperation {
    fn default() -> Self {
        Self {
            min_latency: Duration::from_secs(5),
            max_latency: Duration::from_secs(30),
            failure_rate: 0.05,
            retryable_share: 0.8,
        }
    }
}

impl SimulatedRowOperation {
    pub fn new(
        min_latency: Duration,
        max_latency: Duration,
        failure_rate: f64,
        retryable_share: f64,
    ) -> Self {
        Self {
            min_latency,
            max_latency: max_latency.max(min_latency),
            failure_rate: failure_rate.clamp(0.0, 1.0),
            retryable_share: retryable_share.clamp(0.0, 1.0),
        }
    }

    /// Draw latency and outcome up front; the thread-local rng cannot cross an await
    fn sample(&self) -> (Duration, Option<bool>, u32) {
        let mut rng = rand::rng();
        let latency = if self.max_latency > self.min_latency {
            rng.random_range(self.min_latency..=self.max_latency)
        } else {
            self.min_latency
        };
        let failure = rng
            .random_bool(self.failure_rate)
            .then(|| rng.random_bool(self.retryable_share));
        (latency, failure, rng.random_range(1000..10000))
    }
}

#[async_trait]
impl RowOperation for SimulatedRowOperation {
    async fn invoke(&self, row: &CsvRow) -> Result<RowOperationResponse, RowOperationError> {
        let (latency, failure, result_suffix) = self.sample();
        tokio::time::sleep(latency).await;
        let latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);

        match failure {
            Some(true) => {
                warn!(row_index = row.index, latency_ms, "Simulated API error (500)");
                Err(RowOperationError::transient_io("API call timed out (status 500)"))
            }
            Some(false) => {
                warn!(row_index = row.index, latency_ms, "Simulated API error (401)");
                Err(RowOperationError::permanent("API call rejected (status 401)"))
            }
            None => {
                debug!(row_index = row.index, latency_ms, "Simulated API call complete");
                Ok(RowOperationResponse {
                    result_id: format!("res-{result_suffix}"),
                    processing_time: latency,
                })
            }
        }
    }
}
