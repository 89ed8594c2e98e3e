//! MQTT v5 client for the agent session
//!
//! Pure decisions live apart from I/O:
//!
//! - [`connection`] - connection state, reconnect policy, broker options and last will
//! - [`message_handler`] - event routing and forwarding to the runtime
//! - [`health_monitor`] - reconnection decisions and state transitions
//! - [`client`] - the supervisor task and the [`Transport`](crate::transport::Transport) impl
//!
//! # Usage
//!
//! ```rust,no_run
//! use lucid_agent_core::agent::session::SessionClock;
//! use lucid_agent_core::config::MqttSection;
//! use lucid_agent_core::protocol::TopicSchema;
//! use lucid_agent_core::transport::mqtt::MqttClient;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let config = MqttSection {
//!     broker_url: "mqtt://localhost:1883".to_string(),
//!     username_env: None,
//!     password_env: None,
//!     heartbeat_interval_secs: 30,
//! };
//!
//! let topics = TopicSchema::new("rig_01")?;
//! let mut client = MqttClient::new(topics, config, Arc::new(SessionClock::new()))?;
//! client.connect().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::{MqttClient, PendingAcks};
pub use connection::{ConnectionState, MqttError, ReconnectConfig};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
pub use message_handler::{EventRoute, MessageHandler};
