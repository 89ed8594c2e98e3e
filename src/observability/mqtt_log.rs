//! Forwarding of log events to the agent's `logs` topic
//!
//! A tracing layer turns events into [`LogPayload`]s and hands them to a
//! bounded channel without blocking; a forwarder task publishes them at
//! QoS 0 once the transport exists. Events from the transport itself are
//! never forwarded, so publishing a log line cannot produce another one.

use crate::protocol::messages::LogPayload;
use crate::transport::{Delivery, Transport};
use chrono::Utc;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

pub const MAX_LOGS_PER_SECOND: u32 = 10;
pub const LOG_CHANNEL_CAPACITY: usize = 256;

const EXCLUDED_TARGETS: [&str; 4] = [
    "rumqttc",
    "lucid_agent_core::transport",
    "lucid_agent_core::observability",
    "lucid_agent_core::agent::runtime::publish",
];

fn is_excluded(target: &str) -> bool {
    EXCLUDED_TARGETS.iter().any(|excluded| {
        target == *excluded || target.starts_with(&format!("{excluded}::"))
    })
}

/// Fixed one-second window limiter
#[derive(Debug)]
pub struct RateLimiter {
    max_per_window: u32,
    window: Duration,
    window_start: Option<Instant>,
    count: u32,
}

impl RateLimiter {
    pub fn new(max_per_window: u32, window: Duration) -> Self {
        Self {
            max_per_window,
            window,
            window_start: None,
            count: 0,
        }
    }

    pub fn allow(&mut self, now: Instant) -> bool {
        match self.window_start {
            Some(start) if now.duration_since(start) < self.window => {}
            _ => {
                self.window_start = Some(now);
                self.count = 0;
            }
        }
        if self.count >= self.max_per_window {
            return false;
        }
        self.count += 1;
        true
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

/// Tracing layer feeding the `logs` stream
pub struct MqttLogLayer {
    sender: mpsc::Sender<LogPayload>,
    enabled: Arc<AtomicBool>,
    limiter: Mutex<RateLimiter>,
}

impl MqttLogLayer {
    fn to_payload(event: &Event<'_>) -> LogPayload {
        let metadata = event.metadata();
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        LogPayload {
            level: metadata.level().to_string(),
            target: metadata.target().to_string(),
            message: format!("{}{}", visitor.message, visitor.fields),
            ts: Utc::now(),
        }
    }
}

impl<S: Subscriber> Layer<S> for MqttLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        if is_excluded(event.metadata().target()) {
            return;
        }
        let allowed = match self.limiter.lock() {
            Ok(mut limiter) => limiter.allow(Instant::now()),
            Err(_) => false,
        };
        if !allowed {
            return;
        }
        // full channel: drop the record
        let _ = self.sender.try_send(Self::to_payload(event));
    }
}

/// Receiving end of the log channel
#[derive(Debug)]
pub struct LogStream {
    receiver: mpsc::Receiver<LogPayload>,
}

impl LogStream {
    pub async fn recv(&mut self) -> Option<LogPayload> {
        self.receiver.recv().await
    }
}

pub fn mqtt_log_layer(enabled: Arc<AtomicBool>) -> (MqttLogLayer, LogStream) {
    let (sender, receiver) = mpsc::channel(LOG_CHANNEL_CAPACITY);
    let layer = MqttLogLayer {
        sender,
        enabled,
        limiter: Mutex::new(RateLimiter::new(MAX_LOGS_PER_SECOND, Duration::from_secs(1))),
    };
    (layer, LogStream { receiver })
}

/// Publish every record from `stream` on `topic` until the layer is dropped
pub fn spawn_log_forwarder<T: Transport + 'static>(
    mut stream: LogStream,
    transport: Arc<T>,
    topic: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(record) = stream.recv().await {
            let Ok(bytes) = serde_json::to_vec(&record) else {
                continue;
            };
            // best effort: a lost log line is not worth a retry
            let _ = transport
                .publish(&topic, bytes, false, Delivery::AtMostOnce)
                .await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::MockTransport;
    use tracing_subscriber::prelude::*;

    #[test]
    fn test_rate_limiter_window() {
        let mut limiter = RateLimiter::new(3, Duration::from_secs(1));
        let start = Instant::now();
        assert!(limiter.allow(start));
        assert!(limiter.allow(start));
        assert!(limiter.allow(start));
        assert!(!limiter.allow(start + Duration::from_millis(500)));
        assert!(limiter.allow(start + Duration::from_millis(1001)));
    }

    #[test]
    fn test_excluded_targets() {
        assert!(is_excluded("rumqttc::state"));
        assert!(is_excluded("lucid_agent_core::transport::mqtt::client"));
        assert!(!is_excluded("lucid_agent_core::lifecycle::manager"));
        assert!(!is_excluded("rumqttcx"));
    }

    #[tokio::test]
    async fn test_layer_respects_toggle_and_limit() {
        let enabled = Arc::new(AtomicBool::new(false));
        let (layer, mut stream) = mqtt_log_layer(enabled.clone());
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "lucid_agent_core::commands", "dropped while disabled");
            enabled.store(true, Ordering::Relaxed);
            tracing::info!(target: "lucid_agent_core::transport::mqtt", "excluded target");
            for i in 0..20 {
                tracing::warn!(target: "lucid_agent_core::commands", attempt = i, "component failed");
            }
        });

        let mut received = Vec::new();
        while let Ok(record) = stream.receiver.try_recv() {
            received.push(record);
        }
        assert_eq!(received.len(), MAX_LOGS_PER_SECOND as usize);
        assert_eq!(received[0].level, "WARN");
        assert_eq!(received[0].message, "component failed attempt=0");
        assert_eq!(received[0].target, "lucid_agent_core::commands");
    }

    #[tokio::test]
    async fn test_forwarder_publishes_at_most_once() {
        let enabled = Arc::new(AtomicBool::new(true));
        let (layer, stream) = mqtt_log_layer(enabled);
        let transport = Arc::new(MockTransport::new());
        let handle = spawn_log_forwarder(stream, transport.clone(), "lucid/agents/a/logs".to_string());

        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, || {
            tracing::error!(target: "lucid_agent_core::lifecycle", "install failed");
        });
        // subscriber and layer dropped here, closing the channel
        handle.await.unwrap();

        let published = transport.published_on("lucid/agents/a/logs").await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].delivery, Delivery::AtMostOnce);
        assert!(!published[0].retain);
        assert_eq!(published[0].json()["message"], "install failed");
    }
}
