//! Stream reassembly for inbound MQTT bytes
//!
//! Socket reads arrive in arbitrary chunks. [`FrameAssembler`] buffers them
//! and cuts complete frames off the front of the buffer, one at a time. This
//! is the only place partial packets are handled.

use super::codec::{decode_remaining_length, CodecError, Frame};
use bytes::{Buf, BytesMut};

/// Growing receive buffer that yields complete frames
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: BytesMut,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk read from the socket
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Cut the next complete frame off the buffer.
    ///
    /// Returns `Ok(None)` when the buffer holds only a partial frame; the
    /// buffer is left untouched in that case. A frame is removed from the
    /// buffer in the same call that returns it.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        if self.buffer.len() < 2 {
            return Ok(None);
        }

        let header = self.buffer[0];
        let Some((remaining_length, length_bytes)) = decode_remaining_length(&self.buffer[1..])?
        else {
            return Ok(None);
        };

        let header_len = 1 + length_bytes;
        let total_len = header_len + remaining_length;
        if self.buffer.len() < total_len {
            return Ok(None);
        }

        let mut body = self.buffer.split_to(total_len).freeze();
        body.advance(header_len);

        Ok(Some(Frame {
            header,
            remaining_length,
            body,
        }))
    }

    /// Bytes waiting for the rest of their frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONNACK: [u8; 4] = [0x20, 0x02, 0x00, 0x00];
    const SUBACK: [u8; 5] = [0x90, 0x03, 0x00, 0x01, 0x00];

    fn drain(assembler: &mut FrameAssembler) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = assembler.next_frame().unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_single_complete_frame() {
        let mut assembler = FrameAssembler::new();
        assembler.extend(&CONNACK);

        let frames = drain(&mut assembler);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].packet_type(), 2);
        assert_eq!(frames[0].remaining_length, 2);
        assert_eq!(&frames[0].body[..], &[0x00, 0x00]);
        assert_eq!(assembler.buffered(), 0);
    }

    #[test]
    fn test_byte_by_byte_delivery() {
        let mut assembler = FrameAssembler::new();
        let mut frames = Vec::new();
        for byte in CONNACK.iter().chain(SUBACK.iter()) {
            assembler.extend(&[*byte]);
            frames.extend(drain(&mut assembler));
        }

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].packet_type(), 2);
        assert_eq!(frames[1].packet_type(), 9);
        assert_eq!(assembler.buffered(), 0);
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let mut assembler = FrameAssembler::new();
        let mut chunk = Vec::new();
        chunk.extend_from_slice(&CONNACK);
        chunk.extend_from_slice(&SUBACK);
        chunk.extend_from_slice(&[0xD0, 0x00]);
        assembler.extend(&chunk);

        let types: Vec<u8> = drain(&mut assembler)
            .iter()
            .map(Frame::packet_type)
            .collect();
        assert_eq!(types, vec![2, 9, 13]);
    }

    #[test]
    fn test_partial_frame_is_kept() {
        let mut assembler = FrameAssembler::new();
        assembler.extend(&[0x30, 0x05, 0x00, 0x01]);
        assert!(assembler.next_frame().unwrap().is_none());
        assert_eq!(assembler.buffered(), 4);

        assembler.extend(&[b't', b'h', b'i', 0xD0]);
        let frame = assembler.next_frame().unwrap().unwrap();
        assert_eq!(&frame.body[..], &[0x00, 0x01, b't', b'h', b'i']);
        // trailing 0xD0 waits for its length byte
        assert!(assembler.next_frame().unwrap().is_none());
        assert_eq!(assembler.buffered(), 1);
    }

    #[test]
    fn test_incomplete_multi_byte_length() {
        let mut assembler = FrameAssembler::new();
        let mut frame = vec![0x30, 0x80, 0x01];
        frame.extend(std::iter::repeat(0u8).take(128));

        assembler.extend(&frame[..2]);
        assert!(assembler.next_frame().unwrap().is_none());
        assembler.extend(&frame[2..100]);
        assert!(assembler.next_frame().unwrap().is_none());
        assembler.extend(&frame[100..]);

        let parsed = assembler.next_frame().unwrap().unwrap();
        assert_eq!(parsed.remaining_length, 128);
        assert_eq!(parsed.body.len(), 128);
        assert_eq!(assembler.buffered(), 0);
    }

    #[test]
    fn test_malformed_length_is_an_error() {
        let mut assembler = FrameAssembler::new();
        assembler.extend(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x7F]);
        assert_eq!(assembler.next_frame(), Err(CodecError::MalformedLength));
    }

    #[test]
    fn test_clear_discards_partial_data() {
        let mut assembler = FrameAssembler::new();
        assembler.extend(&[0x30, 0x05, 0x00]);
        assembler.clear();
        assert_eq!(assembler.buffered(), 0);
        assembler.extend(&CONNACK);
        assert_eq!(drain(&mut assembler).len(), 1);
    }
}
