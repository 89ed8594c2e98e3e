//! Observability for the LUCID agent
//!
//! Structured logging with a runtime-adjustable level, plus forwarding of
//! log events to the agent's `logs` topic.

pub mod logging;
pub mod mqtt_log;

// Re-export for convenience
pub use logging::{
    init_default_logging, init_logging, LogFormat, LogLevelHandle, LoggingHandles,
};
pub use mqtt_log::{spawn_log_forwarder, LogStream, MqttLogLayer};

// Span macros for structured logging
pub use logging::{command_span, lifecycle_span, mqtt_span};
