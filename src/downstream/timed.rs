//! Per-call deadline for a [`RowOperation`]. An elapsed deadline comes back as
//! [`RowOperationError::Timeout`], so anything wrapping this operation (the
//! circuit breaker in particular) sees the timeout as an ordinary failure.

use super::{CsvRow, RowOperation, RowOperationError, RowOperationResponse};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct TimeLimitedRowOperation {
    inner: Arc<dyn RowOperation>,
    timeout: Duration,
}

impl std::fmt::Debug for TimeLimitedRowOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeLimitedRowOperation")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl TimeLimitedRowOperation {
    pub fn new(inner: Arc<dyn RowOperation>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl RowOperation for TimeLimitedRowOperation {
    async fn invoke(&self, row: &CsvRow) -> Result<RowOperationResponse, RowOperationError> {
        tokio::time::timeout(self.timeout, self.inner.invoke(row))
            .await
            .unwrap_or_else(|_| Err(RowOperationError::timeout(self.timeout)))
    }
}
