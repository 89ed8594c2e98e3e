//! Transport layer between the agent and the broker
//!
//! [`Transport`] is the seam the runtime, dispatcher and schedulers talk
//! through. [`mqtt::MqttClient`] is the production implementation; tests use
//! `testing::mocks::MockTransport`.

use std::time::Duration;
use tokio::sync::mpsc;

pub mod mqtt;

pub use mqtt::ConnectionState;

/// Delivery guarantee for a publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// QoS 0: telemetry and log streams
    AtMostOnce,
    /// QoS 1: results, retained snapshots, status
    AtLeastOnce,
}

/// Session events forwarded from the transport's own task to the runtime
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Broker acknowledged the connection (initial or after reconnect)
    Connected,
    /// Session lost, reconnection handled by the transport
    Disconnected(String),
    /// Inbound publish on a subscribed topic
    Message { topic: String, payload: Vec<u8> },
}

/// Transport abstraction for broker communication
///
/// Enables dependency injection and testing without a broker.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Connect and wait for the broker's acknowledgement
    async fn connect(&mut self) -> Result<(), Self::Error>;

    /// Disconnect and stop the session task
    async fn disconnect(&self) -> Result<(), Self::Error>;

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
        delivery: Delivery,
    ) -> Result<(), Self::Error>;

    async fn subscribe(&self, topic: &str) -> Result<(), Self::Error>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), Self::Error>;

    /// Wait until every at-least-once publish has been acknowledged.
    /// Returns `false` if `timeout` elapsed first.
    async fn flush(&self, timeout: Duration) -> bool;

    fn is_connected(&self) -> bool;

    fn connection_state(&self) -> Option<ConnectionState>;

    /// Where session events are delivered. Must be set before `connect`.
    fn set_event_sender(&self, sender: mpsc::Sender<TransportEvent>);
}

/// Type alias for MQTT transport
pub type MqttTransport = mqtt::MqttClient;
