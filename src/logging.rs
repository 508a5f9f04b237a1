//! # Structured Logging Module
//!
//! Environment-aware structured logging for master and worker nodes, plus
//! helpers that give dispatch, state and registry events a consistent shape.

use chrono::Utc;
use std::process;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging once per process.
///
/// `RUST_LOG` wins over `config.level`, which wins over the environment default.
pub fn init_structured_logging(config: &LoggingConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let log_level = config
            .level
            .clone()
            .unwrap_or_else(|| get_log_level(&environment));
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));

        let layer = if config.json {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .json()
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(true)
                .boxed()
        };

        if tracing_subscriber::registry()
            .with(layer.with_filter(filter))
            .try_init()
            .is_err()
        {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = process::id(),
            environment = %environment,
            json = config.json,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

/// Current environment from `DAGFLOW_ENV`
fn get_environment() -> String {
    std::env::var("DAGFLOW_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        "test" => "warn".to_string(),
        _ => "debug".to_string(),
    }
}

/// Log structured data for a dispatch attempt
pub fn log_dispatch_operation(
    operation: &str,
    task_instance_id: i64,
    worker_group: &str,
    host: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        task_instance_id = task_instance_id,
        worker_group = %worker_group,
        host = host,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📤 DISPATCH_OPERATION"
    );
}

/// Log a workflow or task state transition
pub fn log_state_transition(
    entity: &str,
    entity_id: i64,
    from_state: &str,
    to_state: &str,
    event: &str,
) {
    tracing::info!(
        entity = %entity,
        entity_id = entity_id,
        from_state = %from_state,
        to_state = %to_state,
        event = %event,
        timestamp = %Utc::now().to_rfc3339(),
        "🔄 STATE_TRANSITION"
    );
}

/// Log registry membership changes
pub fn log_registry_operation(operation: &str, path: &str, status: &str, details: Option<&str>) {
    tracing::info!(
        operation = %operation,
        path = %path,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📡 REGISTRY_OPERATION"
    );
}

/// Log errors with structured context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "❌ ERROR"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_levels_by_environment() {
        assert_eq!(get_log_level("production"), "info");
        assert_eq!(get_log_level("test"), "warn");
        assert_eq!(get_log_level("development"), "debug");
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig::default();
        init_structured_logging(&config);
        init_structured_logging(&config);
    }
}
