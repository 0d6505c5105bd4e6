//! In-memory broker for exercising [`MqttClient`](crate::transport::MqttClient)
//!
//! [`DuplexConnector`] hands the client one end of a `tokio::io::duplex`
//! pipe per connection attempt and queues the other end on a
//! [`DuplexListener`]. Wrap that end in a [`MockBroker`] to script the
//! broker side of the conversation.

use crate::transport::mqtt::codec::{
    encode_remaining_length, packet_type, Frame, SUBSCRIBE_HEADER,
};
use crate::transport::mqtt::framer::FrameAssembler;
use crate::transport::Connector;
use bytes::{BufMut, BytesMut};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, Mutex};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Connector that produces in-memory pipes
#[derive(Debug, Clone)]
pub struct DuplexConnector {
    accepted: mpsc::UnboundedSender<DuplexStream>,
    connects: Arc<AtomicUsize>,
}

/// Broker ends of the pipes handed out by a [`DuplexConnector`]
#[derive(Debug)]
pub struct DuplexListener {
    incoming: Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
    connects: Arc<AtomicUsize>,
}

impl DuplexConnector {
    pub fn new() -> (Self, DuplexListener) {
        let (accepted, incoming) = mpsc::unbounded_channel();
        let connects = Arc::new(AtomicUsize::new(0));
        (
            Self {
                accepted,
                connects: Arc::clone(&connects),
            },
            DuplexListener {
                incoming: Mutex::new(incoming),
                connects,
            },
        )
    }
}

#[async_trait::async_trait]
impl Connector for DuplexConnector {
    type Stream = DuplexStream;

    async fn connect(&self, _host: &str, _port: u16, _timeout: Duration) -> io::Result<DuplexStream> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (client, broker) = tokio::io::duplex(PIPE_CAPACITY);
        self.accepted.send(broker).map_err(|_| {
            io::Error::new(io::ErrorKind::ConnectionRefused, "listener dropped")
        })?;
        Ok(client)
    }
}

impl DuplexListener {
    /// Next connection, or `None` if none arrives within `timeout`
    pub async fn accept(&self, timeout: Duration) -> Option<MockBroker> {
        let mut incoming = self.incoming.lock().await;
        tokio::time::timeout(timeout, incoming.recv())
            .await
            .ok()
            .flatten()
            .map(MockBroker::new)
    }

    /// Connection attempts seen so far
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

/// CONNECT as seen by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub protocol_name: String,
    pub protocol_level: u8,
    pub flags: u8,
    pub keep_alive: u16,
    pub client_id: String,
    pub username: String,
    pub password: String,
}

/// SUBSCRIBE as seen by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub packet_id: u16,
    pub topic: String,
    pub requested_qos: u8,
}

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> io::Result<&'a [u8]> {
        let end = self.pos + n;
        let slice = self
            .data
            .get(self.pos..end)
            .ok_or_else(|| invalid(format!("need {end} bytes, have {}", self.data.len())))?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> io::Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> io::Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn string(&mut self) -> io::Result<String> {
        let len = usize::from(self.u16()?);
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| invalid(e.to_string()))
    }
}

pub fn parse_connect(frame: &Frame) -> io::Result<ConnectRequest> {
    if frame.packet_type() != packet_type::CONNECT {
        return Err(invalid(format!(
            "expected CONNECT, got packet type {}",
            frame.packet_type()
        )));
    }
    let mut cursor = Cursor {
        data: &frame.body,
        pos: 0,
    };
    Ok(ConnectRequest {
        protocol_name: cursor.string()?,
        protocol_level: cursor.u8()?,
        flags: cursor.u8()?,
        keep_alive: cursor.u16()?,
        client_id: cursor.string()?,
        username: cursor.string()?,
        password: cursor.string()?,
    })
}

pub fn parse_subscribe(frame: &Frame) -> io::Result<SubscribeRequest> {
    if frame.header != SUBSCRIBE_HEADER {
        return Err(invalid(format!(
            "expected SUBSCRIBE header 0x82, got {:#04x}",
            frame.header
        )));
    }
    let mut cursor = Cursor {
        data: &frame.body,
        pos: 0,
    };
    Ok(SubscribeRequest {
        packet_id: cursor.u16()?,
        topic: cursor.string()?,
        requested_qos: cursor.u8()?,
    })
}

fn frame_bytes(header: u8, body: &[u8]) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(body.len() + 5);
    out.put_u8(header);
    // Test payloads are far below the varint limit
    if encode_remaining_length(body.len(), &mut out).is_err() {
        out.put_u8(0);
    }
    out.put_slice(body);
    out.to_vec()
}

pub fn connack_bytes(return_code: u8) -> Vec<u8> {
    frame_bytes(packet_type::CONNACK << 4, &[0x00, return_code])
}

pub fn suback_bytes(packet_id: u16, granted_qos: u8) -> Vec<u8> {
    let [hi, lo] = packet_id.to_be_bytes();
    frame_bytes(packet_type::SUBACK << 4, &[hi, lo, granted_qos])
}

pub fn pingresp_bytes() -> Vec<u8> {
    vec![packet_type::PINGRESP << 4, 0x00]
}

/// PUBLISH at QoS 0 (`packet_id` ignored) or QoS 1
pub fn publish_bytes(topic: &str, payload: &[u8], qos: u8, packet_id: u16) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_u16(topic.len() as u16);
    body.put_slice(topic.as_bytes());
    if qos > 0 {
        body.put_u16(packet_id);
    }
    body.put_slice(payload);
    frame_bytes((packet_type::PUBLISH << 4) | ((qos & 0x03) << 1), &body)
}

/// Broker end of one connection
pub struct MockBroker {
    stream: DuplexStream,
    assembler: FrameAssembler,
}

impl MockBroker {
    pub fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            assembler: FrameAssembler::new(),
        }
    }

    /// Next frame from the client. `UnexpectedEof` once the client hangs up.
    pub async fn read_frame(&mut self) -> io::Result<Frame> {
        let mut buf = [0u8; 1024];
        loop {
            if let Some(frame) = self
                .assembler
                .next_frame()
                .map_err(|e| invalid(e.to_string()))?
            {
                return Ok(frame);
            }
            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "client closed the connection",
                ));
            }
            self.assembler.extend(&buf[..n]);
        }
    }

    /// Next frame, or `None` if nothing arrives within `timeout`
    pub async fn read_frame_timeout(&mut self, timeout: Duration) -> Option<io::Result<Frame>> {
        tokio::time::timeout(timeout, self.read_frame()).await.ok()
    }

    pub async fn expect_connect(&mut self) -> io::Result<ConnectRequest> {
        let frame = self.read_frame().await?;
        parse_connect(&frame)
    }

    pub async fn expect_subscribe(&mut self) -> io::Result<SubscribeRequest> {
        let frame = self.read_frame().await?;
        parse_subscribe(&frame)
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }

    pub async fn send_connack(&mut self, return_code: u8) -> io::Result<()> {
        self.send_raw(&connack_bytes(return_code)).await
    }

    pub async fn send_suback(&mut self, packet_id: u16, granted_qos: u8) -> io::Result<()> {
        self.send_raw(&suback_bytes(packet_id, granted_qos)).await
    }

    pub async fn send_publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: u8,
        packet_id: u16,
    ) -> io::Result<()> {
        self.send_raw(&publish_bytes(topic, payload, qos, packet_id))
            .await
    }

    pub async fn send_pingresp(&mut self) -> io::Result<()> {
        self.send_raw(&pingresp_bytes()).await
    }

    /// CONNECT, CONNACK 0, SUBSCRIBE, SUBACK granted 0
    pub async fn accept_session(&mut self) -> io::Result<(ConnectRequest, SubscribeRequest)> {
        let connect = self.expect_connect().await?;
        self.send_connack(0).await?;
        let subscribe = self.expect_subscribe().await?;
        self.send_suback(subscribe.packet_id, 0).await?;
        Ok((connect, subscribe))
    }
}
