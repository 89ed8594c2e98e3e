//! LUCID Agent Core
//!
//! A device agent that keeps one MQTT session with a central broker,
//! publishes retained snapshots of itself (metadata, status, state, config),
//! streams telemetry and logs, and executes commands: configuration changes,
//! component lifecycle (install, uninstall, upgrade, enable, disable), its
//! own upgrade and supervised restarts.
//!
//! # Overview
//!
//! - Topic construction under `lucid/agents/<agent_id>/...`
//! - MQTT transport with QoS handling, last will and reconnection
//! - Durable component registry and runtime config with atomic writes
//! - Pluggable components with per-capability command routes
//! - Bounded worker pool so long-running commands never block reception
//!
//! # Quick Start
//!
//! ```rust
//! use lucid_agent_core::protocol::topics::TopicSchema;
//!
//! let topics = TopicSchema::new("agent_1").unwrap();
//! assert_eq!(topics.status(), "lucid/agents/agent_1/status");
//! assert_eq!(
//!     topics.cmd("components/install").unwrap(),
//!     "lucid/agents/agent_1/cmd/components/install"
//! );
//! ```

pub mod agent;
pub mod commands;
pub mod components;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod observability;
pub mod paths;
pub mod protocol;
pub mod storage;
pub mod testing;
pub mod transport;

pub use agent::{Runtime, RuntimeError};
pub use commands::{CoreServices, RuntimeSettings};
pub use config::BootstrapConfig;
pub use error::{AgentError, AgentResult};
pub use protocol::topics::TopicSchema;
pub use transport::mqtt::MqttClient;
