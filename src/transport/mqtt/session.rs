//! Handshake and dispatch state machine
//!
//! [`Session`] owns all per-connection protocol state: the handshake phase,
//! the pending subscription and the packet id counter. It performs no I/O.
//! Each input (connection start, inbound frame) yields a list of
//! [`SessionAction`]s that the client task applies in order.

use super::codec::{self, decode_packet, packet_type, Connect, Frame, Packet, SUBACK_FAILURE};
use super::connection::{ConnectionPhase, MqttError, ResolvedCredentials};
use super::message_handler::{InboundMessage, MessageHandler};
use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Whether a failed write tears down the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendKind {
    /// CONNECT and SUBSCRIBE: failure is fatal
    Handshake,
    /// PUBACK and PINGREQ: failure is logged and counted
    BestEffort,
}

/// Side effects requested by the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    Send {
        packet: Bytes,
        kind: SendKind,
        label: &'static str,
    },
    ArmHandshakeTimer,
    ClearHandshakeTimer,
    /// SUBACK accepted: reset backoff, start keepalive, notify observers
    Subscribed,
    Deliver(InboundMessage),
}

/// Cyclic packet identifier source over 1..=65535
#[derive(Debug, Clone)]
pub struct PacketIdAllocator {
    next: u16,
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl PacketIdAllocator {
    pub fn allocate(&mut self) -> u16 {
        let id = self.next;
        self.next = if id == u16::MAX { 1 } else { id + 1 };
        id
    }
}

#[derive(Debug)]
pub struct Session {
    phase: ConnectionPhase,
    pending_subscription: Option<u16>,
    packet_ids: PacketIdAllocator,
    topic: String,
}

impl Session {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            phase: ConnectionPhase::Idle,
            pending_subscription: None,
            packet_ids: PacketIdAllocator::default(),
            topic: topic.into(),
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub fn pending_subscription(&self) -> Option<u16> {
        self.pending_subscription
    }

    /// Socket is open: send CONNECT and wait for CONNACK
    pub fn begin(
        &mut self,
        credentials: &ResolvedCredentials,
        keep_alive: u16,
    ) -> Result<Vec<SessionAction>, MqttError> {
        self.reset();

        let packet = codec::encode_connect(&Connect {
            client_id: &credentials.client_id,
            username: &credentials.username,
            password: &credentials.password,
            keep_alive,
        })?;
        self.phase = ConnectionPhase::WaitConnAck;
        debug!(client_id = %credentials.client_id, keep_alive, "Sending CONNECT");

        Ok(vec![
            SessionAction::Send {
                packet,
                kind: SendKind::Handshake,
                label: "CONNECT",
            },
            SessionAction::ArmHandshakeTimer,
        ])
    }

    /// Apply one inbound frame
    pub fn handle_frame(&mut self, frame: &Frame) -> Result<Vec<SessionAction>, MqttError> {
        let packet = match decode_packet(frame) {
            Ok(packet) => packet,
            // A malformed PUBLISH is still correctly framed, so the stream stays in sync
            Err(e) if frame.packet_type() == packet_type::PUBLISH => {
                warn!(error = %e, "Dropping malformed PUBLISH");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        match packet {
            Packet::ConnectAck { return_code, .. } => self.on_connect_ack(return_code),
            Packet::SubscribeAck {
                packet_id,
                granted_qos,
            } => self.on_subscribe_ack(packet_id, granted_qos),
            Packet::Publish(publish) => {
                if self.phase != ConnectionPhase::Connected {
                    debug!(
                        phase = %self.phase,
                        topic = %publish.topic,
                        "Dropping PUBLISH received before subscription"
                    );
                    return Ok(Vec::new());
                }

                // Acknowledge before handing the message to the application
                let mut actions = Vec::with_capacity(2);
                if let Some(packet_id) = MessageHandler::ack_required(&publish) {
                    actions.push(SessionAction::Send {
                        packet: codec::encode_publish_ack(packet_id),
                        kind: SendKind::BestEffort,
                        label: "PUBACK",
                    });
                }
                actions.push(SessionAction::Deliver(MessageHandler::to_inbound(&publish)));
                Ok(actions)
            }
            Packet::PingResponse => Ok(Vec::new()),
            Packet::Other { packet_type } => {
                debug!(packet_type, "Ignoring unsupported packet");
                Ok(Vec::new())
            }
        }
    }

    fn on_connect_ack(&mut self, return_code: u8) -> Result<Vec<SessionAction>, MqttError> {
        if self.phase != ConnectionPhase::WaitConnAck {
            warn!(phase = %self.phase, "Ignoring unexpected CONNACK");
            return Ok(Vec::new());
        }
        if return_code != 0 {
            return Err(MqttError::ConnectionRefused { code: return_code });
        }

        let packet_id = self.packet_ids.allocate();
        let packet = codec::encode_subscribe(packet_id, &self.topic)?;
        self.pending_subscription = Some(packet_id);
        self.phase = ConnectionPhase::WaitSubAck;
        debug!(packet_id, topic = %self.topic, "CONNACK accepted, subscribing");

        Ok(vec![
            SessionAction::ClearHandshakeTimer,
            SessionAction::Send {
                packet,
                kind: SendKind::Handshake,
                label: "SUBSCRIBE",
            },
            SessionAction::ArmHandshakeTimer,
        ])
    }

    fn on_subscribe_ack(
        &mut self,
        packet_id: u16,
        granted_qos: u8,
    ) -> Result<Vec<SessionAction>, MqttError> {
        if self.phase != ConnectionPhase::WaitSubAck || self.pending_subscription != Some(packet_id)
        {
            warn!(
                packet_id,
                expected = ?self.pending_subscription,
                "Ignoring SUBACK for unknown subscription"
            );
            return Ok(Vec::new());
        }

        self.pending_subscription = None;
        if granted_qos == SUBACK_FAILURE {
            return Err(MqttError::SubscriptionRejected {
                topic: self.topic.clone(),
            });
        }

        self.phase = ConnectionPhase::Connected;
        info!(topic = %self.topic, granted_qos, "Subscription confirmed");
        Ok(vec![
            SessionAction::ClearHandshakeTimer,
            SessionAction::Subscribed,
        ])
    }

    /// Error for a handshake timer that fired, or `None` if it is stale
    pub fn handshake_timed_out(&self, timeout: Duration) -> Option<MqttError> {
        match self.phase {
            ConnectionPhase::WaitConnAck | ConnectionPhase::WaitSubAck => {
                Some(MqttError::HandshakeTimeout {
                    phase: self.phase,
                    timeout,
                })
            }
            _ => None,
        }
    }

    /// Back to idle after the connection is torn down
    pub fn reset(&mut self) {
        self.phase = ConnectionPhase::Idle;
        self.pending_subscription = None;
    }
}
