//! MQTT 3.1.1 wire codec
//!
//! Covers the subset of control packets this client speaks: it builds
//! CONNECT, SUBSCRIBE, PINGREQ and PUBACK frames and parses CONNACK, SUBACK,
//! PUBLISH and PINGRESP bodies. Framing (splitting a byte stream into
//! frames) lives in [`super::framer`].

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Control packet type codes (upper nibble of the fixed header)
pub mod packet_type {
    pub const CONNECT: u8 = 1;
    pub const CONNACK: u8 = 2;
    pub const PUBLISH: u8 = 3;
    pub const PUBACK: u8 = 4;
    pub const SUBSCRIBE: u8 = 8;
    pub const SUBACK: u8 = 9;
    pub const PINGREQ: u8 = 12;
    pub const PINGRESP: u8 = 13;
}

pub const PROTOCOL_NAME: &str = "MQTT";
pub const PROTOCOL_LEVEL: u8 = 0x04;
/// username + password + clean session, no will
pub const CONNECT_FLAGS: u8 = 0xC2;
/// SUBSCRIBE carries reserved flag bits 0b0010
pub const SUBSCRIBE_HEADER: u8 = 0x82;
pub const SUBACK_FAILURE: u8 = 0x80;
/// Largest value representable in four remaining-length bytes
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Wire-level errors. All of them are fatal for the current connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Malformed remaining length: more than four bytes")]
    MalformedLength,
    #[error("Remaining length {0} exceeds protocol maximum")]
    LengthTooLarge(usize),
    #[error("{packet} truncated: need {needed} bytes, got {actual}")]
    Truncated {
        packet: &'static str,
        needed: usize,
        actual: usize,
    },
    #[error("String field of {0} bytes does not fit a 2-byte length prefix")]
    StringTooLong(usize),
}

/// One complete control packet as cut from the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// First fixed-header byte: type nibble and flags nibble
    pub header: u8,
    pub remaining_length: usize,
    /// Variable header and payload, exactly `remaining_length` bytes
    pub body: Bytes,
}

impl Frame {
    pub fn packet_type(&self) -> u8 {
        self.header >> 4
    }

    pub fn flags(&self) -> u8 {
        self.header & 0x0F
    }
}

/// Encode `len` as an MQTT variable byte integer.
pub fn encode_remaining_length(len: usize, dst: &mut BytesMut) -> Result<(), CodecError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(CodecError::LengthTooLarge(len));
    }

    let mut value = len;
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        dst.put_u8(byte);
        if value == 0 {
            return Ok(());
        }
    }
}

/// Decode a variable byte integer from the start of `src`.
///
/// Returns `(value, bytes_consumed)`, or `None` when `src` ends before the
/// terminating byte. A fifth continuation byte is a [`CodecError::MalformedLength`].
pub fn decode_remaining_length(src: &[u8]) -> Result<Option<(usize, usize)>, CodecError> {
    let mut value = 0usize;
    for (idx, byte) in src.iter().enumerate() {
        if idx >= 4 {
            return Err(CodecError::MalformedLength);
        }
        value |= ((byte & 0x7F) as usize) << (7 * idx);
        if byte & 0x80 == 0 {
            return Ok(Some((value, idx + 1)));
        }
    }

    if src.len() >= 4 {
        return Err(CodecError::MalformedLength);
    }
    Ok(None)
}

fn write_utf8_str(dst: &mut BytesMut, value: &str) -> Result<(), CodecError> {
    let len = u16::try_from(value.len()).map_err(|_| CodecError::StringTooLong(value.len()))?;
    dst.put_u16(len);
    dst.put_slice(value.as_bytes());
    Ok(())
}

fn write_frame(header: u8, body: &[u8]) -> Result<Bytes, CodecError> {
    let mut out = BytesMut::with_capacity(body.len() + 5);
    out.put_u8(header);
    encode_remaining_length(body.len(), &mut out)?;
    out.put_slice(body);
    Ok(out.freeze())
}

/// CONNECT fields this client sends
#[derive(Clone, PartialEq, Eq)]
pub struct Connect<'a> {
    pub client_id: &'a str,
    pub username: &'a str,
    pub password: &'a str,
    pub keep_alive: u16,
}

impl std::fmt::Debug for Connect<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connect")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &"***")
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

pub fn encode_connect(connect: &Connect<'_>) -> Result<Bytes, CodecError> {
    let mut body = BytesMut::new();
    write_utf8_str(&mut body, PROTOCOL_NAME)?;
    body.put_u8(PROTOCOL_LEVEL);
    body.put_u8(CONNECT_FLAGS);
    body.put_u16(connect.keep_alive);
    write_utf8_str(&mut body, connect.client_id)?;
    write_utf8_str(&mut body, connect.username)?;
    write_utf8_str(&mut body, connect.password)?;
    write_frame(packet_type::CONNECT << 4, &body)
}

/// SUBSCRIBE for a single topic filter at requested QoS 0
pub fn encode_subscribe(packet_id: u16, topic: &str) -> Result<Bytes, CodecError> {
    let mut body = BytesMut::new();
    body.put_u16(packet_id);
    write_utf8_str(&mut body, topic)?;
    body.put_u8(0x00);
    write_frame(SUBSCRIBE_HEADER, &body)
}

pub fn encode_ping_request() -> Bytes {
    Bytes::from_static(&[packet_type::PINGREQ << 4, 0x00])
}

pub fn encode_publish_ack(packet_id: u16) -> Bytes {
    let [hi, lo] = packet_id.to_be_bytes();
    Bytes::copy_from_slice(&[packet_type::PUBACK << 4, 0x02, hi, lo])
}

/// Inbound PUBLISH
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub qos: u8,
    pub dup: bool,
    pub retain: bool,
    /// Present only when `qos > 0`
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

impl Publish {
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Inbound packets, decoded from a [`Frame`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ConnectAck {
        session_present: bool,
        return_code: u8,
    },
    SubscribeAck {
        packet_id: u16,
        granted_qos: u8,
    },
    Publish(Publish),
    PingResponse,
    /// Anything this client does not consume
    Other {
        packet_type: u8,
    },
}

fn ensure_len(packet: &'static str, body: &[u8], needed: usize) -> Result<(), CodecError> {
    if body.len() < needed {
        return Err(CodecError::Truncated {
            packet,
            needed,
            actual: body.len(),
        });
    }
    Ok(())
}

fn read_u16(body: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([body[offset], body[offset + 1]])
}

pub fn decode_packet(frame: &Frame) -> Result<Packet, CodecError> {
    match frame.packet_type() {
        packet_type::CONNACK => decode_connect_ack(&frame.body),
        packet_type::SUBACK => decode_subscribe_ack(&frame.body),
        packet_type::PUBLISH => decode_publish(frame.header, &frame.body).map(Packet::Publish),
        packet_type::PINGRESP => Ok(Packet::PingResponse),
        other => Ok(Packet::Other { packet_type: other }),
    }
}

fn decode_connect_ack(body: &[u8]) -> Result<Packet, CodecError> {
    ensure_len("CONNACK", body, 2)?;
    Ok(Packet::ConnectAck {
        session_present: body[0] & 0x01 != 0,
        return_code: body[1],
    })
}

fn decode_subscribe_ack(body: &[u8]) -> Result<Packet, CodecError> {
    ensure_len("SUBACK", body, 3)?;
    Ok(Packet::SubscribeAck {
        packet_id: read_u16(body, 0),
        granted_qos: body[2],
    })
}

fn decode_publish(header: u8, body: &Bytes) -> Result<Publish, CodecError> {
    let qos = (header & 0x06) >> 1;

    ensure_len("PUBLISH", body, 2)?;
    let topic_len = read_u16(body, 0) as usize;
    let mut offset = 2;
    ensure_len("PUBLISH", body, offset + topic_len)?;
    let topic = String::from_utf8_lossy(&body[offset..offset + topic_len]).into_owned();
    offset += topic_len;

    let packet_id = if qos > 0 {
        ensure_len("PUBLISH", body, offset + 2)?;
        let id = read_u16(body, offset);
        offset += 2;
        Some(id)
    } else {
        None
    };

    Ok(Publish {
        topic,
        qos,
        dup: header & 0x08 != 0,
        retain: header & 0x01 != 0,
        packet_id,
        payload: body.slice(offset..),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn encoded_len(n: usize) -> usize {
        let mut dst = BytesMut::new();
        encode_remaining_length(n, &mut dst).unwrap();
        dst.len()
    }

    fn frame_from(bytes: &[u8]) -> Frame {
        let (len, consumed) = decode_remaining_length(&bytes[1..]).unwrap().unwrap();
        Frame {
            header: bytes[0],
            remaining_length: len,
            body: Bytes::copy_from_slice(&bytes[1 + consumed..]),
        }
    }

    /// Reads a CONNECT body back without going through the encoder helpers
    fn parse_connect(bytes: &[u8]) -> (String, u8, u8, u16, String, String, String) {
        assert_eq!(bytes[0], 0x10);
        let (len, consumed) = decode_remaining_length(&bytes[1..]).unwrap().unwrap();
        let body = &bytes[1 + consumed..];
        assert_eq!(body.len(), len);

        let mut pos = 0;
        let take_str = |pos: &mut usize| {
            let n = u16::from_be_bytes([body[*pos], body[*pos + 1]]) as usize;
            let s = std::str::from_utf8(&body[*pos + 2..*pos + 2 + n])
                .unwrap()
                .to_string();
            *pos += 2 + n;
            s
        };
        let name = take_str(&mut pos);
        let level = body[pos];
        let flags = body[pos + 1];
        let keep_alive = u16::from_be_bytes([body[pos + 2], body[pos + 3]]);
        pos += 4;
        let client_id = take_str(&mut pos);
        let username = take_str(&mut pos);
        let password = take_str(&mut pos);
        assert_eq!(pos, body.len());
        (name, level, flags, keep_alive, client_id, username, password)
    }

    #[test]
    fn test_remaining_length_boundaries() {
        assert_eq!(encoded_len(0), 1);
        assert_eq!(encoded_len(127), 1);
        assert_eq!(encoded_len(128), 2);
        assert_eq!(encoded_len(16_383), 2);
        assert_eq!(encoded_len(16_384), 3);
        assert_eq!(encoded_len(2_097_151), 3);
        assert_eq!(encoded_len(2_097_152), 4);
        assert_eq!(encoded_len(MAX_REMAINING_LENGTH), 4);
    }

    #[test]
    fn test_remaining_length_known_encodings() {
        let mut dst = BytesMut::new();
        encode_remaining_length(321, &mut dst).unwrap();
        assert_eq!(&dst[..], &[0xC1, 0x02]);
    }

    #[test]
    fn test_remaining_length_rejects_oversized_value() {
        let mut dst = BytesMut::new();
        assert_eq!(
            encode_remaining_length(MAX_REMAINING_LENGTH + 1, &mut dst),
            Err(CodecError::LengthTooLarge(MAX_REMAINING_LENGTH + 1))
        );
    }

    #[test]
    fn test_decode_needs_more_data() {
        assert_eq!(decode_remaining_length(&[]), Ok(None));
        assert_eq!(decode_remaining_length(&[0x80]), Ok(None));
        assert_eq!(decode_remaining_length(&[0xFF, 0xFF, 0xFF]), Ok(None));
    }

    #[test]
    fn test_decode_rejects_fifth_continuation_byte() {
        assert_eq!(
            decode_remaining_length(&[0xFF, 0xFF, 0xFF, 0xFF]),
            Err(CodecError::MalformedLength)
        );
        assert_eq!(
            decode_remaining_length(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]),
            Err(CodecError::MalformedLength)
        );
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        assert_eq!(decode_remaining_length(&[0x05, 0xAA, 0xBB]), Ok(Some((5, 1))));
    }

    proptest! {
        #[test]
        fn prop_remaining_length_round_trip(n in 0usize..(1 << 28)) {
            let mut dst = BytesMut::new();
            encode_remaining_length(n, &mut dst).unwrap();
            prop_assert_eq!(decode_remaining_length(&dst), Ok(Some((n, dst.len()))));
        }
    }

    #[test]
    fn test_connect_fields_survive_independent_decode() {
        let bytes = encode_connect(&Connect {
            client_id: "c",
            username: "u",
            password: "p",
            keep_alive: 120,
        })
        .unwrap();

        let (name, level, flags, keep_alive, client_id, username, password) =
            parse_connect(&bytes);
        assert_eq!(name, "MQTT");
        assert_eq!(level, 0x04);
        assert_eq!(flags, 0xC2);
        assert_eq!(keep_alive, 120);
        assert_eq!(client_id, "c");
        assert_eq!(username, "u");
        assert_eq!(password, "p");
    }

    #[test]
    fn test_connect_debug_redacts_password() {
        let connect = Connect {
            client_id: "c",
            username: "u",
            password: "hunter2",
            keep_alive: 60,
        };
        assert!(!format!("{connect:?}").contains("hunter2"));
    }

    #[test]
    fn test_subscribe_layout() {
        let bytes = encode_subscribe(0x0102, "a/b").unwrap();
        assert_eq!(
            &bytes[..],
            &[0x82, 0x08, 0x01, 0x02, 0x00, 0x03, b'a', b'/', b'b', 0x00]
        );
    }

    #[test]
    fn test_fixed_frames() {
        assert_eq!(&encode_ping_request()[..], &[0xC0, 0x00]);
        assert_eq!(&encode_publish_ack(0xBEEF)[..], &[0x40, 0x02, 0xBE, 0xEF]);
    }

    #[test]
    fn test_string_too_long() {
        let topic = "x".repeat(70_000);
        assert_eq!(
            encode_subscribe(1, &topic),
            Err(CodecError::StringTooLong(70_000))
        );
    }

    #[test]
    fn test_decode_connack() {
        let packet = decode_packet(&frame_from(&[0x20, 0x02, 0x00, 0x05])).unwrap();
        assert_eq!(
            packet,
            Packet::ConnectAck {
                session_present: false,
                return_code: 5
            }
        );
    }

    #[test]
    fn test_decode_truncated_connack() {
        let err = decode_packet(&frame_from(&[0x20, 0x01, 0x00])).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { packet: "CONNACK", .. }));
    }

    #[test]
    fn test_decode_suback() {
        let packet = decode_packet(&frame_from(&[0x90, 0x03, 0x00, 0x07, 0x80])).unwrap();
        assert_eq!(
            packet,
            Packet::SubscribeAck {
                packet_id: 7,
                granted_qos: SUBACK_FAILURE
            }
        );

        let err = decode_packet(&frame_from(&[0x90, 0x02, 0x00, 0x07])).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { packet: "SUBACK", .. }));
    }

    #[test]
    fn test_decode_publish_qos0() {
        let packet = decode_packet(&frame_from(&[
            0x30, 0x07, 0x00, 0x02, b't', b'/', b'h', b'i', b'!',
        ]))
        .unwrap();
        let Packet::Publish(publish) = packet else {
            panic!("expected publish");
        };
        assert_eq!(publish.topic, "t/");
        assert_eq!(publish.qos, 0);
        assert_eq!(publish.packet_id, None);
        assert_eq!(publish.payload_text(), "hi!");
    }

    #[test]
    fn test_decode_publish_qos1_with_flags() {
        let packet = decode_packet(&frame_from(&[
            0x3B, 0x07, 0x00, 0x01, b't', 0x12, 0x34, b'o', b'k',
        ]))
        .unwrap();
        let Packet::Publish(publish) = packet else {
            panic!("expected publish");
        };
        assert_eq!(publish.qos, 1);
        assert!(publish.dup);
        assert!(publish.retain);
        assert_eq!(publish.packet_id, Some(0x1234));
        assert_eq!(&publish.payload[..], b"ok");
    }

    #[test]
    fn test_decode_publish_missing_packet_id() {
        let err = decode_packet(&frame_from(&[0x32, 0x04, 0x00, 0x01, b't', 0x12])).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { packet: "PUBLISH", .. }));
    }

    #[test]
    fn test_decode_pingresp_and_unknown() {
        assert_eq!(
            decode_packet(&frame_from(&[0xD0, 0x00])).unwrap(),
            Packet::PingResponse
        );
        assert_eq!(
            decode_packet(&frame_from(&[0xB0, 0x02, 0x00, 0x01])).unwrap(),
            Packet::Other { packet_type: 11 }
        );
    }
}
