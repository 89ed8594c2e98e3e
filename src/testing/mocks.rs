//! Mock implementations for testing
//!
//! Provides a mock [`Transport`], component publisher, package manager and
//! process signaller so the runtime and lifecycle paths can be exercised
//! without a broker, a venv or a supervisor.

use crate::components::ComponentPublisher;
use crate::error::AgentError;
use crate::lifecycle::{CommandOutput, LifecycleError, PackageManager, ProcessSignaller};
use crate::transport::{mqtt::ConnectionState, Delivery, Transport, TransportEvent};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Shared ordered log of side effects across mocks
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    entries: Arc<StdMutex<Vec<String>>>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry.into());
        }
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    /// Index of the first entry starting with `prefix`
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.entries().iter().position(|entry| entry.starts_with(prefix))
    }
}

/// One publish seen by [`MockTransport`]
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
    pub delivery: Delivery,
}

impl PublishedMessage {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.payload).unwrap_or(Value::Null)
    }
}

/// Mock transport for testing
#[derive(Debug, Default)]
pub struct MockTransport {
    pub published_messages: Arc<Mutex<Vec<PublishedMessage>>>,
    pub subscriptions: Arc<Mutex<BTreeSet<String>>>,
    pub should_fail: bool,
    connected: AtomicBool,
    flush_calls: AtomicUsize,
    disconnects: AtomicUsize,
    event_sender: StdMutex<Option<mpsc::Sender<TransportEvent>>>,
    timeline: Option<Timeline>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Default::default()
        }
    }

    pub fn with_timeline(timeline: Timeline) -> Self {
        Self {
            timeline: Some(timeline),
            ..Default::default()
        }
    }

    fn record(&self, entry: String) {
        if let Some(timeline) = &self.timeline {
            timeline.record(entry);
        }
    }

    pub async fn get_published_messages(&self) -> Vec<PublishedMessage> {
        self.published_messages.lock().await.clone()
    }

    /// Publishes on exactly `topic`, in order
    pub async fn published_on(&self, topic: &str) -> Vec<PublishedMessage> {
        self.published_messages
            .lock()
            .await
            .iter()
            .filter(|message| message.topic == topic)
            .cloned()
            .collect()
    }

    pub async fn last_json_on(&self, topic: &str) -> Option<Value> {
        self.published_on(topic).await.last().map(PublishedMessage::json)
    }

    pub async fn get_subscriptions(&self) -> BTreeSet<String> {
        self.subscriptions.lock().await.clone()
    }

    pub async fn clear_history(&self) {
        self.published_messages.lock().await.clear();
    }

    pub fn flush_calls(&self) -> usize {
        self.flush_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    fn sender(&self) -> Option<mpsc::Sender<TransportEvent>> {
        self.event_sender
            .lock()
            .ok()
            .and_then(|sender| sender.clone())
    }

    /// Deliver a session event as if it came from the broker
    pub async fn inject(&self, event: TransportEvent) -> bool {
        match self.sender() {
            Some(sender) => sender.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Deliver an inbound message
    pub async fn inject_message(&self, topic: &str, payload: &str) -> bool {
        self.inject(TransportEvent::Message {
            topic: topic.to_string(),
            payload: payload.as_bytes().to_vec(),
        })
        .await
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = AgentError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        if self.should_fail {
            return Err(AgentError::internal_error("Mock connection failure"));
        }
        self.connected.store(true, Ordering::SeqCst);
        if let Some(sender) = self.sender() {
            let _ = sender.send(TransportEvent::Connected).await;
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        self.connected.store(false, Ordering::SeqCst);
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.record("disconnect".to_string());
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
        delivery: Delivery,
    ) -> Result<(), Self::Error> {
        if self.should_fail {
            return Err(AgentError::internal_error("Mock publish failure"));
        }
        self.record(format!("publish {topic}"));
        self.published_messages.lock().await.push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            retain,
            delivery,
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), Self::Error> {
        if self.should_fail {
            return Err(AgentError::internal_error("Mock subscribe failure"));
        }
        self.subscriptions.lock().await.insert(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), Self::Error> {
        self.subscriptions.lock().await.remove(topic);
        Ok(())
    }

    async fn flush(&self, _timeout: Duration) -> bool {
        self.flush_calls.fetch_add(1, Ordering::SeqCst);
        self.record("flush".to_string());
        true
    }

    fn is_connected(&self) -> bool {
        !self.should_fail && self.connected.load(Ordering::SeqCst)
    }

    fn connection_state(&self) -> Option<ConnectionState> {
        if self.should_fail {
            Some(ConnectionState::Disconnected(
                "Mock disconnection".to_string(),
            ))
        } else if self.connected.load(Ordering::SeqCst) {
            Some(ConnectionState::Connected)
        } else {
            Some(ConnectionState::Connecting)
        }
    }

    fn set_event_sender(&self, sender: mpsc::Sender<TransportEvent>) {
        if let Ok(mut event_sender) = self.event_sender.lock() {
            *event_sender = Some(sender);
        }
    }
}

/// Component publisher that keeps everything it is given
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<(String, Value, bool)>>,
}

impl RecordingPublisher {
    pub async fn published(&self) -> Vec<(String, Value, bool)> {
        self.published.lock().await.clone()
    }
}

#[async_trait]
impl ComponentPublisher for RecordingPublisher {
    async fn publish_json(&self, topic: &str, payload: &Value, retain: bool) -> Result<(), String> {
        self.published
            .lock()
            .await
            .push((topic.to_string(), payload.clone(), retain));
        Ok(())
    }
}

/// Package manager that records invocations instead of running pip
#[derive(Debug, Default)]
pub struct MockPackageManager {
    calls: StdMutex<Vec<String>>,
    failure: Option<String>,
    timeline: Option<Timeline>,
}

impl MockPackageManager {
    /// Every call fails with an operational error carrying `message`
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_timeline(timeline: Timeline) -> Self {
        Self {
            timeline: Some(timeline),
            ..Default::default()
        }
    }

    /// `install <artifact file name>` / `uninstall <dist>` in call order
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    fn run(&self, call: String) -> Result<CommandOutput, LifecycleError> {
        if let Some(timeline) = &self.timeline {
            timeline.record(format!("pip {call}"));
        }
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call.clone());
        }
        match &self.failure {
            Some(message) => Err(LifecycleError::Operational(message.clone())),
            None => Ok(CommandOutput {
                stdout_tail: format!("mock {call}"),
                stderr_tail: String::new(),
            }),
        }
    }
}

#[async_trait]
impl PackageManager for MockPackageManager {
    async fn install(&self, artifact: &Path) -> Result<CommandOutput, LifecycleError> {
        let name = artifact
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.run(format!("install {name}"))
    }

    async fn uninstall(&self, dist_name: &str) -> Result<CommandOutput, LifecycleError> {
        self.run(format!("uninstall {dist_name}"))
    }
}

/// Signaller that counts restart signals instead of terminating the process
#[derive(Debug, Default)]
pub struct RecordingSignaller {
    count: AtomicUsize,
    timeline: Option<Timeline>,
}

impl RecordingSignaller {
    pub fn with_timeline(timeline: Timeline) -> Self {
        Self {
            count: AtomicUsize::new(0),
            timeline: Some(timeline),
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl ProcessSignaller for RecordingSignaller {
    fn terminate_self(&self) -> std::io::Result<()> {
        self.count.fetch_add(1, Ordering::SeqCst);
        if let Some(timeline) = &self.timeline {
            timeline.record("signal");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_transport_records_publishes_in_order() {
        let timeline = Timeline::new();
        let transport = MockTransport::with_timeline(timeline.clone());
        transport
            .publish("a", b"{\"x\":1}".to_vec(), true, Delivery::AtLeastOnce)
            .await
            .unwrap();
        transport.flush(Duration::from_secs(1)).await;
        transport
            .publish("b", Vec::new(), false, Delivery::AtMostOnce)
            .await
            .unwrap();

        let published = transport.get_published_messages().await;
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].json()["x"], 1);
        assert!(published[0].retain);
        assert_eq!(published[1].delivery, Delivery::AtMostOnce);
        assert_eq!(timeline.entries(), vec!["publish a", "flush", "publish b"]);
    }

    #[tokio::test]
    async fn test_mock_transport_connect_emits_connected() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut transport = MockTransport::new();
        transport.set_event_sender(tx);
        transport.connect().await.unwrap();
        assert!(transport.is_connected());
        assert_eq!(rx.recv().await, Some(TransportEvent::Connected));

        assert!(transport.inject_message("t", "{}").await);
        assert!(matches!(rx.recv().await, Some(TransportEvent::Message { .. })));
    }

    #[tokio::test]
    async fn test_mock_transport_subscriptions() {
        let transport = MockTransport::new();
        transport.subscribe("a").await.unwrap();
        transport.subscribe("b").await.unwrap();
        transport.unsubscribe("a").await.unwrap();
        assert_eq!(
            transport.get_subscriptions().await,
            BTreeSet::from(["b".to_string()])
        );
    }

    #[tokio::test]
    async fn test_mock_transport_failure() {
        let mut transport = MockTransport::with_failure();
        assert!(transport.connect().await.is_err());
        assert!(transport
            .publish("a", Vec::new(), false, Delivery::AtLeastOnce)
            .await
            .is_err());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_mock_package_manager_failure() {
        let pm = MockPackageManager::failing("pip install failed rc=1");
        let err = pm.install(Path::new("/tmp/a.whl")).await.unwrap_err();
        assert_eq!(err.to_string(), "pip install failed rc=1");
        assert_eq!(pm.calls(), vec!["install a.whl".to_string()]);
    }
}
