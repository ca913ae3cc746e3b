//! Structured logging for the tessera backend.
//!
//! Provides production-ready structured logging with:
//! - JSON output for log aggregation services
//! - Correlation IDs for request tracing
//! - Categorized events for the log-maintenance pipeline
//!
//! # Usage
//!
//! ```no_run
//! use tessera::logging::{init_logging, LogLevel};
//!
//! init_logging(LogLevel::Info, true).unwrap(); // JSON mode for production
//! ```

use serde::Serialize;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Application log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl From<&str> for LogLevel {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

/// Event categories for structured logging across the log-maintenance pipeline.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// Entries accepted into the submission queue and assigned indices.
    Sequencing,
    /// Integration of sequenced entries into the Merkle tree.
    Integration,
    /// Checkpoint publication.
    Checkpoint,
    /// Witness cosigning round-trips.
    Witness,
    /// Antispam follower progress.
    Antispam,
    /// System lifecycle events (startup, shutdown).
    System,
}

/// Structured log event.
#[derive(Debug, Serialize)]
pub struct LogEvent {
    /// Seconds since the Unix epoch.
    pub timestamp_secs: u64,
    pub level: String,
    pub category: EventCategory,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
}

impl LogEvent {
    pub fn new(level: LogLevel, category: EventCategory, message: impl Into<String>) -> Self {
        Self {
            timestamp_secs: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            level: format!("{:?}", level).to_uppercase(),
            category,
            message: message.into(),
            correlation_id: None,
            data: None,
            duration_ms: None,
            error: None,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error = Some(ErrorDetails {
            code: code.into(),
            message: message.into(),
        });
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| format!("{{\"error\": \"failed to serialize log\", \"message\": \"{}\"}}", self.message))
    }
}

/// Log a sequencing outcome: an entry (or batch) accepted and assigned an index.
pub fn log_sequenced(first_index: u64, count: usize, correlation_id: &str) {
    let event = LogEvent::new(
        LogLevel::Info,
        EventCategory::Sequencing,
        format!("sequenced {} entries starting at {}", count, first_index),
    )
    .with_correlation_id(correlation_id)
    .with_data(serde_json::json!({"first_index": first_index, "count": count}));

    tracing::info!(target: "tessera::sequencer", "{}", event.to_json());
}

/// Log integration progress: the tree grew to `new_size` with the given root.
pub fn log_integrated(new_size: u64, root_hash_hex: &str) {
    let event = LogEvent::new(
        LogLevel::Info,
        EventCategory::Integration,
        format!("integrated tree to size {}", new_size),
    )
    .with_data(serde_json::json!({"size": new_size, "root_hash": root_hash_hex}));

    tracing::info!(target: "tessera::integrator", "{}", event.to_json());
}

/// Log a checkpoint publication, successful or not.
pub fn log_checkpoint(size: u64, success: bool, error: Option<&str>) {
    let level = if success { LogLevel::Info } else { LogLevel::Error };
    let mut event = LogEvent::new(
        level,
        EventCategory::Checkpoint,
        format!("publish checkpoint at size {}", size),
    )
    .with_data(serde_json::json!({"size": size, "success": success}));

    if let Some(err) = error {
        event = event.with_error("CHECKPOINT_ERROR", err);
    }

    if success {
        tracing::info!(target: "tessera::checkpoint", "{}", event.to_json());
    } else {
        tracing::error!(target: "tessera::checkpoint", "{}", event.to_json());
    }
}

/// Log a witness cosigning round, successful or not.
pub fn log_witness_round(endpoint: &str, success: bool, error: Option<&str>) {
    let level = if success { LogLevel::Info } else { LogLevel::Warn };
    let mut event = LogEvent::new(
        level,
        EventCategory::Witness,
        format!("witness round with {}", endpoint),
    )
    .with_data(serde_json::json!({"endpoint": endpoint, "success": success}));

    if let Some(err) = error {
        event = event.with_error("WITNESS_ERROR", err);
    }

    if success {
        tracing::info!(target: "tessera::witness", "{}", event.to_json());
    } else {
        tracing::warn!(target: "tessera::witness", "{}", event.to_json());
    }
}

/// Initialize the logging system.
pub fn init_logging(level: LogLevel, json_format: bool) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("tessera={}", format!("{:?}", level).to_lowercase()))
    });

    if json_format {
        let subscriber = tracing_subscriber::registry().with(filter).with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_span_events(FmtSpan::CLOSE),
        );
        subscriber
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))?;
    } else {
        let subscriber = tracing_subscriber::registry().with(filter).with(
            fmt::layer()
                .pretty()
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_span_events(FmtSpan::CLOSE),
        );
        subscriber
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))?;
    }

    Ok(())
}

/// Initialize logging from [`crate::config::TesseraConfig`].
pub fn init_from_config(config: &crate::config::TesseraConfig) -> Result<(), LoggingError> {
    let level = LogLevel::from(config.log_level.as_str());
    init_logging(level, true)
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to initialize logging: {0}")]
    InitFailed(String),
}

/// Generate a unique correlation ID for request/operation tracing.
pub fn generate_correlation_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();

    format!("{:x}-{:04x}", nanos & 0xFFFFFFFF, (nanos % 65536) as u16)
}
