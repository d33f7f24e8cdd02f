//! # Structured Logging Module
//!
//! Environment-aware structured logging for the operation engine. Every driver
//! invocation runs inside a span carrying the operation id, kind and stage, so log
//! lines emitted by steps are attributed to the operation they belong to.

use crate::config::LoggingConfig;
use crate::models::{OperationId, OperationKind, Stage};
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging once per process.
///
/// The filter comes from `RUST_LOG` when set, then `logging.level`, then a default
/// derived from `KCP_ENV`. An already-installed global subscriber is left alone.
pub fn init_structured_logging(config: &LoggingConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            let level = config
                .level
                .clone()
                .unwrap_or_else(|| get_log_level(&environment).to_string());
            EnvFilter::new(level)
        });

        let layer = if config.json {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .json()
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true)
                .boxed()
        };

        if tracing_subscriber::registry()
            .with(layer.with_filter(filter))
            .try_init()
            .is_err()
        {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
            return;
        }

        tracing::info!(
            environment = %environment,
            json = config.json,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

/// Get current environment from environment variables
fn get_environment() -> String {
    std::env::var("KCP_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Get log level based on environment
fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        _ => "debug",
    }
}

/// Terminal outcomes reported through [`log_operation_event`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationEvent {
    Succeeded,
    Failed,
    TimedOut,
}

impl OperationEvent {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

/// Log structured data for a terminal operation event
pub fn log_operation_event(
    operation_id: &OperationId,
    kind: OperationKind,
    stage: &Stage,
    event: OperationEvent,
    details: Option<&str>,
) {
    match event {
        OperationEvent::Succeeded => tracing::info!(
            operation_id = %operation_id,
            kind = %kind,
            stage = %stage,
            event = event.as_str(),
            details = details,
            "📋 OPERATION_EVENT"
        ),
        OperationEvent::Failed | OperationEvent::TimedOut => tracing::error!(
            operation_id = %operation_id,
            kind = %kind,
            stage = %stage,
            event = event.as_str(),
            details = details,
            "📋 OPERATION_EVENT"
        ),
    }
}
