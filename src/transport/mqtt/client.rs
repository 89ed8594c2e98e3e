//! Impure I/O operations for MQTT client
//!
//! Owns the rumqttc event loop in a supervisor task that reconnects with
//! backoff, forwards session events to the runtime and tracks outstanding
//! QoS 1 acknowledgements for [`Transport::flush`].

use super::connection::{configure_mqtt_options, ConnectionState, MqttError, ReconnectConfig};
use super::health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
use super::message_handler::{EventRoute, MessageForwarder, MessageHandler};
use crate::agent::session::SessionClock;
use crate::config::MqttSection;
use crate::protocol::topics::TopicSchema;
use crate::transport::{Delivery, Transport, TransportEvent};
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::PublishProperties;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Count of QoS 1 publishes still waiting for a PubAck
#[derive(Debug, Default)]
pub struct PendingAcks {
    count: AtomicU64,
    idle: Notify,
}

impl PendingAcks {
    pub fn record_publish(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn acknowledge(&self) {
        let previous = self
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        if previous <= 1 {
            self.idle.notify_waiters();
        }
    }

    /// In-flight packets of a dropped session are never acknowledged
    pub fn reset(&self) {
        self.count.store(0, Ordering::SeqCst);
        self.idle.notify_waiters();
    }

    pub fn outstanding(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.idle.notified();
                if self.outstanding() == 0 {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}

/// Everything the supervisor task shares with the client handle
struct Supervisor {
    topics: TopicSchema,
    config: MqttSection,
    session: Arc<SessionClock>,
    shared_client: Arc<Mutex<AsyncClient>>,
    reconnect_config: ReconnectConfig,
    message_forwarder: Arc<MessageForwarder>,
    pending_acks: Arc<PendingAcks>,
    state_tx: watch::Sender<ConnectionState>,
}

/// MQTT v5 transport for the agent
pub struct MqttClient {
    topics: TopicSchema,
    config: MqttSection,
    session: Arc<SessionClock>,
    client: Arc<Mutex<AsyncClient>>,
    event_loop: std::sync::Mutex<Option<EventLoop>>,
    event_loop_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    state_rx: Option<watch::Receiver<ConnectionState>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    reconnect_config: ReconnectConfig,
    message_forwarder: Arc<MessageForwarder>,
    pending_acks: Arc<PendingAcks>,
}

impl MqttClient {
    pub fn new(
        topics: TopicSchema,
        config: MqttSection,
        session: Arc<SessionClock>,
    ) -> Result<Self, MqttError> {
        let (client, event_loop) = Self::create_connection(&topics, &config, &session)?;

        Ok(MqttClient {
            topics,
            config,
            session,
            client: Arc::new(Mutex::new(client)),
            event_loop: std::sync::Mutex::new(Some(event_loop)),
            event_loop_handle: std::sync::Mutex::new(None),
            state_rx: None,
            shutdown_tx: None,
            reconnect_config: ReconnectConfig::default(),
            message_forwarder: Arc::new(MessageForwarder::new()),
            pending_acks: Arc::new(PendingAcks::default()),
        })
    }

    pub fn with_reconnect_config(mut self, reconnect_config: ReconnectConfig) -> Self {
        self.reconnect_config = reconnect_config;
        self
    }

    /// Fresh options on every call so the last will carries the current
    /// `connected_since`
    fn create_connection(
        topics: &TopicSchema,
        config: &MqttSection,
        session: &SessionClock,
    ) -> Result<(AsyncClient, EventLoop), MqttError> {
        let mqtt_options = configure_mqtt_options(topics, config, session)?;
        Ok(AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY))
    }

    #[allow(clippy::type_complexity)]
    fn setup_connection_channels() -> (
        (
            watch::Sender<ConnectionState>,
            watch::Receiver<ConnectionState>,
        ),
        (watch::Sender<bool>, watch::Receiver<bool>),
    ) {
        let state_channels = watch::channel(ConnectionState::Connecting);
        let shutdown_channels = watch::channel(false);
        (state_channels, shutdown_channels)
    }

    /// Wait for ConnAck with timeout
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let timeout_result = tokio::time::timeout(timeout, async {
            loop {
                if state_rx.changed().await.is_err() {
                    return Err(MqttError::ConnectionFailedStr(
                        "State channel closed".to_string(),
                    ));
                }
                match *state_rx.borrow() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected(ref reason) => {
                        return Err(MqttError::ConnectionFailedStr(reason.clone()));
                    }
                    ConnectionState::PermanentlyDisconnected(ref reason) => {
                        return Err(MqttError::ConnectionFailedStr(format!(
                            "Permanently disconnected: {reason}"
                        )));
                    }
                    ConnectionState::Connecting => continue,
                    ConnectionState::Reconnecting(_) => continue,
                }
            }
        })
        .await;

        match timeout_result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(MqttError::ConnectionFailedStr(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        }
    }

    /// Start the supervisor and wait for the first ConnAck
    pub async fn connect(&mut self) -> Result<(), MqttError> {
        let event_loop = self
            .event_loop
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| {
            MqttError::ConnectionFailedStr("Event loop already started".to_string())
        })?;

        let ((state_tx, state_rx), (shutdown_tx, mut shutdown_rx)) =
            Self::setup_connection_channels();
        self.state_rx = Some(state_rx.clone());
        self.shutdown_tx = Some(shutdown_tx);

        let supervisor = Supervisor {
            topics: self.topics.clone(),
            config: self.config.clone(),
            session: self.session.clone(),
            shared_client: self.client.clone(),
            reconnect_config: self.reconnect_config.clone(),
            message_forwarder: self.message_forwarder.clone(),
            pending_acks: self.pending_acks.clone(),
            state_tx,
        };

        let handle = tokio::spawn(async move {
            let agent_id = supervisor.topics.agent_id().to_string();
            info!(agent_id = %agent_id, "Starting MQTT event loop with reconnection supervisor");
            let mut reconnect_attempts = 0u32;
            let mut current_event_loop = event_loop;

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!("Shutdown signal received, stopping reconnection supervisor");
                            break;
                        }
                    }

                    event_result = current_event_loop.poll() => {
                        match event_result {
                            Ok(event) => {
                                let route = MessageHandler::route_mqtt_event(&event);
                                if !Self::process_event_route(
                                    &supervisor,
                                    route,
                                    &mut reconnect_attempts,
                                    shutdown_rx.clone(),
                                    &mut current_event_loop,
                                ).await {
                                    break;
                                }
                            }
                            Err(e) => {
                                if !Self::handle_event_loop_error(
                                    &supervisor,
                                    e,
                                    &mut reconnect_attempts,
                                    shutdown_rx.clone(),
                                    &mut current_event_loop,
                                ).await {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            info!(agent_id = %agent_id, "MQTT event loop stopped");
        });

        if let Ok(mut slot) = self.event_loop_handle.lock() {
            *slot = Some(handle);
        }

        let connection_timeout =
            HealthMonitor::calculate_connection_timeout(&self.reconnect_config);
        Self::wait_for_connection_confirmation(state_rx, connection_timeout).await
    }

    /// Returns true to continue the loop (after reconnection), false to break
    async fn handle_event_loop_error(
        supervisor: &Supervisor,
        error: rumqttc::v5::ConnectionError,
        reconnect_attempts: &mut u32,
        shutdown_rx: watch::Receiver<bool>,
        current_event_loop: &mut EventLoop,
    ) -> bool {
        let error_str = error.to_string();
        let was_connected = matches!(*supervisor.state_tx.borrow(), ConnectionState::Connected);
        let new_state =
            HealthMonitor::determine_next_state(ConnectionEvent::NetworkError(error_str.clone()));
        let _ = supervisor.state_tx.send(new_state);

        if was_connected {
            supervisor.pending_acks.reset();
            let _ = supervisor
                .message_forwarder
                .forward(TransportEvent::Disconnected(error_str))
                .await;
        }

        Self::should_attempt_reconnection(
            supervisor,
            reconnect_attempts,
            shutdown_rx,
            current_event_loop,
        )
        .await
    }

    /// Returns true to continue the loop, false to break
    async fn process_event_route(
        supervisor: &Supervisor,
        route: EventRoute,
        reconnect_attempts: &mut u32,
        shutdown_rx: watch::Receiver<bool>,
        current_event_loop: &mut EventLoop,
    ) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                let new_state = HealthMonitor::determine_next_state(ConnectionEvent::ConnAckReceived);
                let _ = supervisor.state_tx.send(new_state);
                *reconnect_attempts = 0;
                supervisor.pending_acks.reset();
                if let Err(e) = supervisor
                    .message_forwarder
                    .forward(TransportEvent::Connected)
                    .await
                {
                    warn!(error = %e, "Connected event not delivered");
                }
                true
            }
            EventRoute::MessageReceived {
                topic,
                payload,
                retain,
            } => {
                debug!(target: "mqtt_transport", topic = %topic, "Received MQTT message");
                if MessageHandler::should_process_message(&topic, retain) {
                    if let Err(e) = supervisor
                        .message_forwarder
                        .forward(TransportEvent::Message { topic, payload })
                        .await
                    {
                        error!(error = %e, "Failed to forward message");
                    }
                }
                true
            }
            EventRoute::PublishAcknowledged { packet_id } => {
                debug!(target: "mqtt_transport", packet_id, "Publish acknowledged");
                supervisor.pending_acks.acknowledge();
                true
            }
            EventRoute::Disconnected => {
                let new_state =
                    HealthMonitor::determine_next_state(ConnectionEvent::DisconnectedByBroker);
                let _ = supervisor.state_tx.send(new_state);
                supervisor.pending_acks.reset();
                let _ = supervisor
                    .message_forwarder
                    .forward(TransportEvent::Disconnected(
                        "Broker disconnected".to_string(),
                    ))
                    .await;

                Self::should_attempt_reconnection(
                    supervisor,
                    reconnect_attempts,
                    shutdown_rx,
                    current_event_loop,
                )
                .await
            }
            EventRoute::SubscriptionConfirmed { packet_id } => {
                debug!(target: "mqtt_transport", packet_id, "Subscription confirmed");
                true
            }
            EventRoute::InfrastructureEvent(event_str) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event_str);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    /// Returns true if sleep completed, false if shutdown requested
    async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("Shutdown signal received during reconnection delay, stopping");
                    return false;
                }
                true
            }
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {
                true
            }
        }
    }

    /// Swap in a fresh client and event loop. Always returns true so the
    /// loop retries on failure.
    async fn apply_new_connection(supervisor: &Supervisor, current_event_loop: &mut EventLoop) -> bool {
        match Self::create_connection(&supervisor.topics, &supervisor.config, &supervisor.session) {
            Ok((new_client, new_event_loop)) => {
                info!("Created new connection for reconnection attempt");
                *current_event_loop = new_event_loop;
                let mut client_guard = supervisor.shared_client.lock().await;
                *client_guard = new_client;
                true
            }
            Err(e) => {
                error!(error = %e, "Failed to create new connection");
                true
            }
        }
    }

    async fn should_attempt_reconnection(
        supervisor: &Supervisor,
        reconnect_attempts: &mut u32,
        shutdown_rx: watch::Receiver<bool>,
        current_event_loop: &mut EventLoop,
    ) -> bool {
        let reconnect_config = &supervisor.reconnect_config;
        let decision = HealthMonitor::should_attempt_reconnection(
            *reconnect_attempts,
            reconnect_config,
            *shutdown_rx.borrow(),
        );

        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                *reconnect_attempts = attempt;
                let new_state =
                    HealthMonitor::determine_next_state(ConnectionEvent::ReconnectionStarted(attempt));
                let _ = supervisor.state_tx.send(new_state);

                let max_display = reconnect_config
                    .max_attempts
                    .map_or("unlimited".to_string(), |max| max.to_string());
                info!(
                    "Attempting reconnection {}/{} after {}ms delay",
                    attempt, max_display, delay_ms
                );

                if !Self::interruptible_sleep(shutdown_rx.clone(), delay_ms).await {
                    return false;
                }

                if *shutdown_rx.borrow() {
                    info!("Shutdown signal received, aborting reconnection");
                    return false;
                }

                Self::apply_new_connection(supervisor, current_event_loop).await
            }
            ReconnectionDecision::AbortShutdownRequested => {
                info!("Shutdown signal received, stopping reconnection");
                false
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                let reason = format!(
                    "Max reconnection attempts ({}) exceeded",
                    reconnect_config.max_attempts.unwrap_or_default()
                );
                let new_state =
                    HealthMonitor::determine_next_state(ConnectionEvent::PermanentFailure(reason));
                let _ = supervisor.state_tx.send(new_state);
                false
            }
        }
    }

    /// Stop the supervisor and close the session. Publishing the offline
    /// status is the runtime's job.
    pub async fn disconnect(&self) -> Result<(), MqttError> {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
            info!("Sent shutdown signal to reconnection supervisor");
        }

        if self.state_rx.is_some() {
            let client = self.client.lock().await;
            if let Err(e) = client.disconnect().await {
                warn!(error = %e, "MQTT disconnect request failed");
            }
        }

        let handle = self
            .event_loop_handle
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(Ok(())) => info!("Event loop task shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => {
                    warn!(error = %e, "Event loop task ended with error")
                }
                Err(_) => warn!("Event loop task didn't shut down gracefully, forcing abort"),
                _ => {}
            }
        }

        info!("MQTT client disconnected");
        Ok(())
    }

    /// None until `connect` has been called
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.state_rx.as_ref().map(|rx| rx.borrow().clone())
    }

    pub fn is_permanently_disconnected(&self) -> bool {
        matches!(
            self.connection_state(),
            Some(ConnectionState::PermanentlyDisconnected(_))
        )
    }

    fn check_connection_state(&self) -> Result<(), MqttError> {
        let state_rx = self.state_rx.as_ref().ok_or_else(|| {
            MqttError::ConnectionFailedStr("Client not connected: state_rx is None".to_string())
        })?;

        let current_state = state_rx.borrow().clone();
        if !HealthMonitor::can_publish(&current_state) {
            return Err(MqttError::NotConnected {
                state: current_state,
            });
        }

        Ok(())
    }

    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
        delivery: Delivery,
    ) -> Result<(), MqttError> {
        self.check_connection_state()?;

        let qos = MessageHandler::determine_qos_level(delivery);
        let client = self.client.lock().await;
        client
            .publish_with_properties(topic, qos, retain, payload, PublishProperties::default())
            .await
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))?;

        if qos == QoS::AtLeastOnce {
            self.pending_acks.record_publish();
        }
        debug!(target: "mqtt_transport", topic, retain, "Published");
        Ok(())
    }

    pub async fn subscribe(&self, topic: &str) -> Result<(), MqttError> {
        if let Some(state_rx) = &self.state_rx {
            let current_state = state_rx.borrow().clone();
            if !HealthMonitor::can_subscribe(&current_state) {
                return Err(MqttError::NotConnected {
                    state: current_state,
                });
            }
        }

        let client = self.client.lock().await;
        client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| {
                MqttError::SubscriptionFailed(format!("Failed to subscribe to {topic}: {e}").into())
            })?;
        debug!(target: "mqtt_transport", topic, "Subscribed");
        Ok(())
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<(), MqttError> {
        self.check_connection_state()?;

        let client = self.client.lock().await;
        client.unsubscribe(topic).await.map_err(|e| {
            MqttError::SubscriptionFailed(format!("Failed to unsubscribe from {topic}: {e}").into())
        })?;
        debug!(target: "mqtt_transport", topic, "Unsubscribed");
        Ok(())
    }
}

#[async_trait]
impl Transport for MqttClient {
    type Error = MqttError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        MqttClient::connect(self).await
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        MqttClient::disconnect(self).await
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
        delivery: Delivery,
    ) -> Result<(), Self::Error> {
        MqttClient::publish(self, topic, payload, retain, delivery).await
    }

    async fn subscribe(&self, topic: &str) -> Result<(), Self::Error> {
        MqttClient::subscribe(self, topic).await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), Self::Error> {
        MqttClient::unsubscribe(self, topic).await
    }

    async fn flush(&self, timeout: Duration) -> bool {
        self.pending_acks.wait_idle(timeout).await
    }

    fn is_connected(&self) -> bool {
        matches!(self.connection_state(), Some(ConnectionState::Connected))
    }

    fn connection_state(&self) -> Option<ConnectionState> {
        MqttClient::connection_state(self)
    }

    fn set_event_sender(&self, sender: mpsc::Sender<TransportEvent>) {
        self.message_forwarder.set_sender(sender);
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }
        if let Ok(mut slot) = self.event_loop_handle.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Duration;

    fn test_client() -> MqttClient {
        let config = MqttSection {
            broker_url: "mqtt://localhost:1883".to_string(),
            username_env: None,
            password_env: None,
            heartbeat_interval_secs: 30,
        };
        let topics = TopicSchema::new("test_agent").unwrap();
        MqttClient::new(topics, config, Arc::new(SessionClock::new())).unwrap()
    }

    #[test]
    fn test_setup_connection_channels() {
        let ((state_tx, state_rx), (shutdown_tx, shutdown_rx)) =
            MqttClient::setup_connection_channels();

        assert_eq!(*state_rx.borrow(), ConnectionState::Connecting);
        assert!(!(*shutdown_rx.borrow()));

        state_tx.send(ConnectionState::Connected).unwrap();
        assert_eq!(*state_rx.borrow(), ConnectionState::Connected);

        shutdown_tx.send(true).unwrap();
        assert!(*shutdown_rx.borrow());
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_success() {
        let ((state_tx, state_rx), (_, _)) = MqttClient::setup_connection_channels();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(ConnectionState::Connected);
        });

        let result =
            MqttClient::wait_for_connection_confirmation(state_rx, Duration::from_millis(200))
                .await;
        assert!(result.is_ok(), "Should successfully wait for connection");
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_timeout() {
        let ((state_tx, state_rx), (_, _)) = MqttClient::setup_connection_channels();

        // keep the sender alive so the channel doesn't close
        let _handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            drop(state_tx);
        });

        let result =
            MqttClient::wait_for_connection_confirmation(state_rx, Duration::from_millis(10)).await;
        let err_msg = result.unwrap_err().to_string();
        assert!(
            err_msg.contains("ConnAck") || err_msg.contains("timeout"),
            "Error should mention timeout or ConnAck, got: {err_msg}"
        );
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_disconnected() {
        let ((state_tx, state_rx), (_, _)) = MqttClient::setup_connection_channels();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(ConnectionState::Disconnected("Test disconnect".to_string()));
        });

        let result =
            MqttClient::wait_for_connection_confirmation(state_rx, Duration::from_millis(200))
                .await;
        assert!(result.unwrap_err().to_string().contains("Test disconnect"));
    }

    #[tokio::test]
    async fn test_interruptible_sleep_completes() {
        let ((_, _), (_, shutdown_rx)) = MqttClient::setup_connection_channels();
        assert!(MqttClient::interruptible_sleep(shutdown_rx, 10).await);
    }

    #[tokio::test]
    async fn test_interruptible_sleep_interrupted() {
        let ((_, _), (shutdown_tx, shutdown_rx)) = MqttClient::setup_connection_channels();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = shutdown_tx.send(true);
        });

        assert!(!MqttClient::interruptible_sleep(shutdown_rx, 1_000).await);
    }

    #[tokio::test]
    async fn test_pending_acks_flush() {
        let acks = Arc::new(PendingAcks::default());
        assert!(acks.wait_idle(Duration::from_millis(10)).await);

        acks.record_publish();
        acks.record_publish();
        assert!(!acks.wait_idle(Duration::from_millis(10)).await);

        let waiter = {
            let acks = acks.clone();
            tokio::spawn(async move { acks.wait_idle(Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        acks.acknowledge();
        acks.acknowledge();
        assert!(waiter.await.unwrap());
        assert_eq!(acks.outstanding(), 0);
    }

    #[test]
    fn test_pending_acks_never_underflow() {
        let acks = PendingAcks::default();
        acks.acknowledge();
        assert_eq!(acks.outstanding(), 0);
        acks.record_publish();
        acks.reset();
        assert_eq!(acks.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_connection_state_before_connect() {
        let client = test_client();
        assert!(client.connection_state().is_none());
        assert!(!client.is_permanently_disconnected());
        assert!(!Transport::is_connected(&client));
    }

    #[tokio::test]
    async fn test_publish_fails_without_connection() {
        let client = test_client();
        let result = client
            .publish("lucid/agents/test_agent/status", b"{}".to_vec(), true, Delivery::AtLeastOnce)
            .await;
        assert!(result.is_err(), "publish should fail without connection");
        assert!(client.unsubscribe("a/b").await.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_without_connection() {
        let client = test_client();
        assert!(client.disconnect().await.is_ok());
    }
}
