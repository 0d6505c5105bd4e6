//! Inbound application message handling
//!
//! Converts decoded PUBLISH packets into [`InboundMessage`] values and hands
//! them to whoever registered a receiver on the client.

use super::codec::Publish;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Application message received on the subscribed topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboundMessage {
    pub topic: String,
    /// Payload decoded as UTF-8, invalid sequences replaced
    pub payload: String,
    pub qos: u8,
    pub packet_id: Option<u16>,
}

impl InboundMessage {
    /// Parse the payload as JSON
    pub fn json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}

/// Pure decisions about inbound PUBLISH packets
pub struct MessageHandler;

impl MessageHandler {
    pub fn to_inbound(publish: &Publish) -> InboundMessage {
        InboundMessage {
            topic: publish.topic.clone(),
            payload: publish.payload_text(),
            qos: publish.qos,
            packet_id: publish.packet_id,
        }
    }

    /// Packet id that must be acknowledged with PUBACK, if any.
    ///
    /// Every QoS 1 PUBLISH is acknowledged, including broker redeliveries.
    pub fn ack_required(publish: &Publish) -> Option<u16> {
        match publish.qos {
            1 => publish.packet_id,
            _ => None,
        }
    }
}

/// Delivers inbound messages to the application channel
#[derive(Default)]
pub struct MessageForwarder {
    sender: Option<mpsc::Sender<InboundMessage>>,
}

impl MessageForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_sender(&mut self, sender: mpsc::Sender<InboundMessage>) {
        self.sender = Some(sender);
    }

    pub fn has_sender(&self) -> bool {
        self.sender.is_some()
    }

    /// Forward a message without waiting; returns `false` when it was dropped.
    ///
    /// A full channel drops the message so a slow consumer never stalls the
    /// connection.
    pub fn forward(&self, message: InboundMessage) -> bool {
        let Some(sender) = &self.sender else {
            debug!(topic = %message.topic, "No message receiver registered, dropping message");
            return false;
        };

        match sender.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                warn!(topic = %message.topic, "Message receiver is full, dropping message");
                false
            }
            Err(TrySendError::Closed(message)) => {
                warn!(topic = %message.topic, "Message receiver closed, dropping message");
                false
            }
        }
    }
}
