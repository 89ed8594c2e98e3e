//! Pure routing of MQTT events plus forwarding to the runtime

use crate::transport::{Delivery, TransportEvent};
use rumqttc::v5::{mqttbytes::QoS, Event};
use std::sync::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Commands are never retained; a retained publish on a command topic is
    /// a stale replay and is skipped.
    pub fn should_process_message(topic: &str, retain: bool) -> bool {
        if retain {
            debug!(topic, "Ignoring retained message");
            return false;
        }
        true
    }

    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => {
                use rumqttc::v5::mqttbytes::v5::Packet;
                match incoming {
                    Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                    Packet::Publish(publish) => EventRoute::MessageReceived {
                        topic: String::from_utf8_lossy(&publish.topic).to_string(),
                        payload: publish.payload.to_vec(),
                        retain: publish.retain,
                    },
                    Packet::PubAck(ack) => EventRoute::PublishAcknowledged { packet_id: ack.pkid },
                    Packet::Disconnect(_) => EventRoute::Disconnected,
                    Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                        packet_id: suback.pkid,
                    },
                    other => EventRoute::InfrastructureEvent(format!("{other:?}")),
                }
            }
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    pub fn determine_qos_level(delivery: Delivery) -> QoS {
        match delivery {
            Delivery::AtMostOnce => QoS::AtMostOnce,
            Delivery::AtLeastOnce => QoS::AtLeastOnce,
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    ConnectionAcknowledged,
    MessageReceived {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    },
    /// Broker acknowledged one of our QoS 1 publishes
    PublishAcknowledged { packet_id: u16 },
    Disconnected,
    SubscriptionConfirmed { packet_id: u16 },
    /// PingResp and friends
    InfrastructureEvent(String),
    OutgoingEvent,
}

/// Hands session events to the runtime's receive loop
#[derive(Default)]
pub struct MessageForwarder {
    sender: RwLock<Option<mpsc::Sender<TransportEvent>>>,
}

impl MessageForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_sender(&self, sender: mpsc::Sender<TransportEvent>) {
        match self.sender.write() {
            Ok(mut slot) => *slot = Some(sender),
            Err(poisoned) => *poisoned.into_inner() = Some(sender),
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<TransportEvent>> {
        match self.sender.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub async fn forward(&self, event: TransportEvent) -> Result<(), String> {
        match self.sender() {
            Some(sender) => sender
                .send(event)
                .await
                .map_err(|e| format!("Failed to forward transport event: {e}")),
            None => {
                warn!("Transport event dropped, no receiver configured");
                Err("No event sender configured".to_string())
            }
        }
    }
}
