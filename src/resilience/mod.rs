//! # Resilience Module
//!
//! Circuit breaker protection for the downstream row operation. When the
//! dependency keeps failing, rows fail fast as retryable errors instead of
//! piling more load onto it.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use stagger_dispatch::downstream::{RowOperation, SimulatedRowOperation};
//! use stagger_dispatch::resilience::{CircuitBreaker, CircuitBreakerConfig, ProtectedRowOperation};
//! use std::sync::Arc;
//!
//! let breaker = Arc::new(CircuitBreaker::new("row_operation", CircuitBreakerConfig::default()));
//! let operation: Arc<dyn RowOperation> = Arc::new(ProtectedRowOperation::new(
//!     Arc::new(SimulatedRowOperation::default()),
//!     breaker,
//! ));
//! # let _ = operation;
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod metrics;
pub mod protected;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitState};
pub use config::CircuitBreakerConfig;
pub use metrics::CircuitBreakerMetrics;
pub use protected::ProtectedRowOperation;
