//! Pure connection state management for MQTT client
//!
//! Connection state, reconnect policy, errors and broker options. The last
//! will is built here so that every (re)connection registers the same
//! offline status payload the agent publishes on clean shutdown.

use crate::agent::session::SessionClock;
use crate::config::MqttSection;
use crate::protocol::messages::StatusState;
use crate::protocol::snapshots::build_status;
use crate::protocol::topics::TopicSchema;
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::{mqttbytes::QoS, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Connection state for MQTT client
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state - attempting to connect
    Connecting,
    /// Successfully connected and ready for operations
    Connected,
    /// Disconnected with reason
    Disconnected(String),
    /// Attempting to reconnect (attempt count)
    Reconnecting(u32),
    /// Permanently disconnected - max reconnection attempts exceeded
    PermanentlyDisconnected(String),
}

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Backoff pattern in milliseconds
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: vec![1_000, 2_000, 5_000, 10_000],
            sustained_delay: 10_000,
        }
    }
}

impl ReconnectConfig {
    /// Total time for all attempts, `None` when retries are unlimited
    pub fn calculate_max_total_time(&self) -> Option<u64> {
        self.max_attempts.map(|max_attempts| {
            (1..=max_attempts)
                .map(|attempt| self.calculate_backoff_delay(attempt))
                .sum()
        })
    }

    /// Delay for a 1-based attempt: the pattern, then the sustained delay
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Serialization error")]
    SerializationError(#[source] serde_json::Error),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid agent id: {0}")]
    InvalidAgentId(String),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Connection failed: {0}")]
    ConnectionFailedStr(String),
}

/// Stable client id so the broker replaces a stale session of the same agent
pub fn client_id(agent_id: &str) -> String {
    format!("lucid.agent.{agent_id}")
}

/// Build broker options, credentials and the offline last will
pub fn configure_mqtt_options(
    topics: &TopicSchema,
    config: &MqttSection,
    session: &SessionClock,
) -> Result<MqttOptions, MqttError> {
    let url = Url::parse(&config.broker_url)
        .map_err(|_| MqttError::InvalidBrokerUrl(config.broker_url.clone()))?;

    let host = url
        .host_str()
        .ok_or_else(|| MqttError::InvalidBrokerUrl(config.broker_url.clone()))?;
    let port = url
        .port()
        .unwrap_or(if url.scheme() == "mqtts" { 8883 } else { 1883 });

    let mut mqtt_options = MqttOptions::new(client_id(topics.agent_id()), host, port);

    if url.scheme() == "mqtts" {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(username_env) = &config.username_env {
        if let Ok(username) = std::env::var(username_env) {
            let password = config
                .password_env
                .as_ref()
                .and_then(|env_name| std::env::var(env_name).ok())
                .unwrap_or_default();
            mqtt_options.set_credentials(&username, &password);
        }
    }

    mqtt_options.set_keep_alive(Duration::from_secs(60));
    mqtt_options.set_max_packet_size(Some(256 * 1024));

    mqtt_options.set_last_will(build_last_will(topics, session)?);

    Ok(mqtt_options)
}

/// Offline status, retained, QoS 1
pub fn build_last_will(
    topics: &TopicSchema,
    session: &SessionClock,
) -> Result<LastWill, MqttError> {
    let status = build_status(
        StatusState::Offline,
        session.connected_since(),
        chrono::Utc::now(),
    );
    let payload = serde_json::to_vec(&status).map_err(MqttError::SerializationError)?;
    Ok(LastWill::new(
        topics.status(),
        payload,
        QoS::AtLeastOnce,
        true,
        None,
    ))
}
