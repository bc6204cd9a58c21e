//! # Structured Logging Module
//!
//! Environment-aware structured logging that outputs to the console and to a JSON
//! file, for following shards across the scheduling center and the nodes.

use crate::config::LoggingConfig;
use chrono::Utc;
use std::fs;
use std::process;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<Option<WorkerGuard>> = OnceLock::new();

/// Initialize structured logging with environment-specific defaults
pub fn init_structured_logging() {
    init_structured_logging_with(&LoggingConfig::default());
}

/// Initialize structured logging from explicit settings. Only the first call
/// installs a subscriber; later calls are no-ops.
pub fn init_structured_logging_with(settings: &LoggingConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let log_level = settings
            .level
            .clone()
            .or_else(|| std::env::var("RUST_LOG").ok())
            .unwrap_or_else(|| get_log_level(&environment).to_string());

        let pid = process::id();
        let console = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true)
            .with_ansi(true)
            .with_filter(EnvFilter::new(&log_level));

        let file_output = if settings.json_file {
            fs::create_dir_all(&settings.directory).ok().map(|_| {
                let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
                let file_name = format!("{environment}.{pid}.{timestamp}.log");
                let appender = tracing_appender::rolling::never(&settings.directory, &file_name);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                (writer, guard, settings.directory.join(file_name))
            })
        } else {
            None
        };

        match file_output {
            Some((writer, guard, path)) => {
                let file_layer = fmt::layer()
                    .with_writer(writer)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_ansi(false)
                    .json()
                    .with_filter(EnvFilter::new(&log_level));
                if tracing_subscriber::registry()
                    .with(console)
                    .with(file_layer)
                    .try_init()
                    .is_err()
                {
                    tracing::debug!("Global tracing subscriber already initialized");
                }
                tracing::info!(
                    pid = pid,
                    environment = %environment,
                    log_file = %path.display(),
                    "🔧 STRUCTURED LOGGING: Initialized with file output"
                );
                Some(guard)
            }
            None => {
                if tracing_subscriber::registry().with(console).try_init().is_err() {
                    tracing::debug!("Global tracing subscriber already initialized");
                }
                tracing::info!(pid = pid, environment = %environment, "🔧 STRUCTURED LOGGING: Initialized");
                None
            }
        }
    });
}

/// Get current environment from environment variables
fn get_environment() -> String {
    std::env::var("VULNSCAN_ENV")
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

/// Log structured data for task operations
pub fn log_task_operation(
    operation: &str,
    task_id: Option<&str>,
    task_name: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        task_id = task_id,
        task_name = task_name,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📋 TASK_OPERATION"
    );
}

/// Log structured data for shard operations
pub fn log_shard_operation(
    operation: &str,
    task_id: Option<&str>,
    shard_id: Option<&str>,
    node_id: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        task_id = task_id,
        shard_id = shard_id,
        node_id = node_id,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🧩 SHARD_OPERATION"
    );
}

/// Log structured data for node lifecycle operations
pub fn log_node_operation(operation: &str, node_id: &str, status: &str, details: Option<&str>) {
    tracing::info!(
        operation = %operation,
        node_id = %node_id,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🖥️ NODE_OPERATION"
    );
}

/// Log structured data for registry operations
pub fn log_registry_operation(
    operation: &str,
    plugin_id: Option<&str>,
    version: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        plugin_id = plugin_id,
        version = version,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📚 REGISTRY_OPERATION"
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
        "❌ ERROR"
    );
}
