//! Structured logging system using tracing crate
//!
//! Provides contextual, machine-readable logging with specialized span macros
//! for different agent operations.
//!
//! ## Log Format Options
//!
//! The logging system supports three output formats controlled by the `LOG_FORMAT` environment variable:
//!
//! - `json` - Structured JSON format for production and log aggregation systems
//! - `pretty` - Human-readable format with colors and indentation for development
//! - `compact` - Terminal-friendly format with colors but minimal spacing
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: Log level (ERROR, WARN, INFO, DEBUG, TRACE) - defaults to INFO
//! - `LOG_FORMAT`: Output format (json, pretty, compact) - defaults to json
//! - `LOG_SPANS`: Include span events (true/false) - defaults to false
//! - `RUST_LOG`: Override log filtering (follows env_logger format)
//!
//! The filter sits behind a reload layer; the runtime config key `log_level`
//! swaps it through [`LogLevelHandle`] without a restart.
//!
//! ## Examples
//!
//! ```bash
//! # Production JSON logging
//! LOG_FORMAT=json LOG_LEVEL=INFO lucid-agent-core run
//!
//! # Development with colors
//! LOG_FORMAT=pretty LOG_LEVEL=DEBUG lucid-agent-core run
//! ```

use super::mqtt_log::{mqtt_log_layer, LogStream};
use std::env;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter, Registry};

/// Dependencies that are chatty at info level
const QUIET_DIRECTIVES: [&str; 4] = ["rumqttc=warn", "hyper=warn", "reqwest=warn", "tokio=warn"];

/// Log output format options
#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    /// JSON format for structured logging (machine-readable)
    Json,
    /// Pretty format with colors and indentation (human-readable)
    Pretty,
    /// Compact format with colors but minimal spacing (terminal-friendly)
    Compact,
}

impl LogFormat {
    /// Parse log format from string
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json, // Default to JSON for production
        }
    }
}

/// Runtime config level names to tracing directives
pub fn map_log_level(level: &str) -> Option<&'static str> {
    match level.to_uppercase().as_str() {
        "DEBUG" => Some("debug"),
        "INFO" => Some("info"),
        "WARNING" | "WARN" => Some("warn"),
        "ERROR" | "CRITICAL" => Some("error"),
        _ => None,
    }
}

/// Filter at `level` with dependency noise turned down
pub fn base_filter(level: &str) -> EnvFilter {
    QUIET_DIRECTIVES
        .iter()
        .filter_map(|directive| directive.parse::<Directive>().ok())
        .fold(EnvFilter::new(level), |filter, directive| {
            filter.add_directive(directive)
        })
}

/// Swaps the active log filter at runtime
#[derive(Clone)]
pub struct LogLevelHandle {
    handle: reload::Handle<EnvFilter, Registry>,
}

impl std::fmt::Debug for LogLevelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogLevelHandle").finish_non_exhaustive()
    }
}

impl LogLevelHandle {
    pub fn new(handle: reload::Handle<EnvFilter, Registry>) -> Self {
        Self { handle }
    }

    /// Apply a runtime config level (`DEBUG`, `INFO`, `WARNING`, `ERROR`, `CRITICAL`)
    pub fn apply(&self, level: &str) -> Result<(), String> {
        let directive = map_log_level(level).ok_or_else(|| format!("unknown log level: {level}"))?;
        self.handle
            .reload(base_filter(directive))
            .map_err(|e| e.to_string())
    }

    /// Current filter, rendered
    pub fn current(&self) -> Option<String> {
        self.handle.with_current(|filter| filter.to_string()).ok()
    }
}

/// What the rest of the agent needs from the installed subscriber
#[derive(Debug)]
pub struct LoggingHandles {
    pub log_level: LogLevelHandle,
    /// Gate for the `logs` stream, driven by the `logs_enabled` config key
    pub logs_enabled: Arc<AtomicBool>,
    /// Records to forward once a transport exists
    pub log_stream: LogStream,
}

/// Initialize logging with manual configuration
pub fn init_logging(
    level: Level,
    format: LogFormat,
    include_spans: bool,
) -> Result<LoggingHandles, String> {
    let filter = match env::var("RUST_LOG") {
        // Allow RUST_LOG to override
        Ok(rust_log) => EnvFilter::new(rust_log),
        Err(_) => base_filter(&level.to_string().to_lowercase()),
    };
    let (filter_layer, reload_handle) = reload::Layer::new(filter);

    let logs_enabled = Arc::new(AtomicBool::new(false));
    let (mqtt_layer, log_stream) = mqtt_log_layer(logs_enabled.clone());

    let span_events = if include_spans {
        fmt::format::FmtSpan::NEW | fmt::format::FmtSpan::CLOSE
    } else {
        fmt::format::FmtSpan::NONE
    };

    let subscriber = tracing_subscriber::registry()
        .with(filter_layer)
        .with(mqtt_layer);

    let installed = match format {
        LogFormat::Json => subscriber
            .with(fmt::layer().json().with_span_events(span_events))
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(true)
                    .with_span_events(span_events),
            )
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(span_events),
            )
            .try_init(),
    };
    installed.map_err(|e| e.to_string())?;

    Ok(LoggingHandles {
        log_level: LogLevelHandle::new(reload_handle),
        logs_enabled,
        log_stream,
    })
}

/// Parse `LOG_LEVEL` style names, defaulting to INFO
pub fn parse_level(name: &str) -> Level {
    match name.to_uppercase().as_str() {
        "ERROR" | "CRITICAL" => Level::ERROR,
        "WARN" | "WARNING" => Level::WARN,
        "INFO" => Level::INFO,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Initialize logging from environment variables
pub fn init_default_logging() -> Result<LoggingHandles, String> {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string());
    let level = parse_level(&log_level);

    let format = env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string());
    let log_format = LogFormat::parse(&format);

    let include_spans = env::var("LOG_SPANS")
        .unwrap_or_else(|_| "false".to_string())
        .to_lowercase()
        == "true";

    init_logging(level, log_format, include_spans)
}

/// Create a command handling span
#[macro_export]
macro_rules! command_span {
    ($($field:tt)*) => {
        tracing::info_span!("command", $($field)*)
    };
}

/// Create an MQTT operation span
#[macro_export]
macro_rules! mqtt_span {
    ($($field:tt)*) => {
        tracing::info_span!("mqtt_operation", $($field)*)
    };
}

/// Create a lifecycle event span
#[macro_export]
macro_rules! lifecycle_span {
    ($($field:tt)*) => {
        tracing::info_span!("lifecycle_event", $($field)*)
    };
}

// Re-export macros for convenience
pub use {command_span, lifecycle_span, mqtt_span};
