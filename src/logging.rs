//! # Structured Logging Module
//!
//! Environment-aware structured logging. Console output is JSON so dead-letter
//! and dispatch events can be indexed by the log pipeline, with helpers for the
//! handful of events every component emits.

use chrono::Utc;
use serde_json::Value;
use std::process;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Field-name fragments whose values are masked before logging
const SENSITIVE_FIELDS: [&str; 6] = ["password", "ssn", "credit_card", "secret", "token", "key"];

const REDACTED: &str = "***REDACTED***";

/// Initialize structured logging with environment-specific configuration.
/// `RUST_LOG` takes precedence over the environment default.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = crate::config::loader::detect_environment();
        let default_level = get_log_level(&environment);
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

        let subscriber = tracing_subscriber::registry().with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_current_span(true)
                .with_filter(filter),
        );

        // A host process may already own the global subscriber
        if subscriber.try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - keeping existing");
        }

        tracing::info!(
            pid = process::id(),
            environment = %environment,
            "Structured logging initialized"
        );
    });
}

fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        _ => "debug",
    }
}

/// Copy of `value` with sensitive fields masked, recursing into objects and arrays
pub fn redact_sensitive(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, val)| {
                    let lowered = key.to_lowercase();
                    if SENSITIVE_FIELDS.iter().any(|field| lowered.contains(field)) {
                        (key.clone(), Value::String(REDACTED.to_string()))
                    } else {
                        (key.clone(), redact_sensitive(val))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_sensitive).collect()),
        other => other.clone(),
    }
}

/// Log one step of a work item's lifecycle
pub fn log_dispatch_operation(
    operation: &str,
    execution_id: &str,
    bucket: Option<&str>,
    key: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        execution_id = %execution_id,
        bucket = bucket,
        key = key,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "DISPATCH_OPERATION"
    );
}

/// Log a record handed to a dead-letter sink
pub fn log_dead_letter(stage: &str, sink: &str, execution_id: &str, error: &str) {
    tracing::warn!(
        stage = %stage,
        sink = %sink,
        execution_id = %execution_id,
        error = %error,
        timestamp = %Utc::now().to_rfc3339(),
        "DEAD_LETTER"
    );
}

/// Log error with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "ERROR"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(get_log_level("test"), "debug");
        assert_eq!(get_log_level("development"), "debug");
        assert_eq!(get_log_level("production"), "info");
    }

    #[test]
    fn test_redacts_nested_sensitive_fields() {
        let row = json!({
            "customer": "acme",
            "api_token": "abc123",
            "billing": { "credit_card": "4111", "city": "Oslo" },
            "contacts": [{ "Password": "pw", "name": "kim" }]
        });

        let safe = redact_sensitive(&row);
        assert_eq!(safe["customer"], "acme");
        assert_eq!(safe["api_token"], REDACTED);
        assert_eq!(safe["billing"]["credit_card"], REDACTED);
        assert_eq!(safe["billing"]["city"], "Oslo");
        assert_eq!(safe["contacts"][0]["Password"], REDACTED);
        assert_eq!(safe["contacts"][0]["name"], "kim");
    }

    #[test]
    fn test_scalars_pass_through() {
        assert_eq!(redact_sensitive(&json!(42)), json!(42));
    }
}
