// RTMP messages
// Assembled message types and protocol control message helpers

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// RTMP message type ids
pub mod msg_type {
    pub const SET_CHUNK_SIZE: u8 = 1;
    pub const ABORT: u8 = 2;
    pub const ACK: u8 = 3;
    pub const USER_CONTROL: u8 = 4;
    pub const WINDOW_ACK_SIZE: u8 = 5;
    pub const SET_PEER_BANDWIDTH: u8 = 6;
    pub const AUDIO: u8 = 8;
    pub const VIDEO: u8 = 9;
    pub const DATA_AMF3: u8 = 15;
    pub const COMMAND_AMF3: u8 = 17;
    pub const DATA_AMF0: u8 = 18;
    pub const COMMAND_AMF0: u8 = 20;
}

/// Well-known chunk stream ids for outbound messages.
pub mod csid {
    pub const PROTOCOL_CONTROL: u16 = 2;
    pub const COMMAND: u16 = 3;
    pub const AUDIO: u16 = 4;
    pub const DATA: u16 = 5;
    pub const VIDEO: u16 = 6;
}

/// User control event types (the subset the ingest emits).
pub mod user_control {
    pub const STREAM_BEGIN: u16 = 0;
    pub const STREAM_EOF: u16 = 1;
}

/// One fully assembled RTMP message.
#[derive(Debug, Clone)]
pub struct RtmpMessage {
    pub chunk_stream_id: u16,
    pub type_id: u8,
    pub timestamp: u32,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl RtmpMessage {
    pub fn new(chunk_stream_id: u16, type_id: u8, timestamp: u32, stream_id: u32, payload: Bytes) -> Self {
        Self {
            chunk_stream_id,
            type_id,
            timestamp,
            stream_id,
            payload,
        }
    }

    pub fn set_chunk_size(size: u32) -> Self {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32(size);
        Self::new(csid::PROTOCOL_CONTROL, msg_type::SET_CHUNK_SIZE, 0, 0, buf.freeze())
    }

    pub fn ack(sequence: u32) -> Self {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32(sequence);
        Self::new(csid::PROTOCOL_CONTROL, msg_type::ACK, 0, 0, buf.freeze())
    }

    pub fn window_ack_size(size: u32) -> Self {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32(size);
        Self::new(csid::PROTOCOL_CONTROL, msg_type::WINDOW_ACK_SIZE, 0, 0, buf.freeze())
    }

    /// limit type 2 = dynamic
    pub fn set_peer_bandwidth(size: u32, limit_type: u8) -> Self {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_u32(size);
        buf.put_u8(limit_type);
        Self::new(
            csid::PROTOCOL_CONTROL,
            msg_type::SET_PEER_BANDWIDTH,
            0,
            0,
            buf.freeze(),
        )
    }

    pub fn user_control(event: u16, stream_id: u32) -> Self {
        let mut buf = BytesMut::with_capacity(6);
        buf.put_u16(event);
        buf.put_u32(stream_id);
        Self::new(csid::PROTOCOL_CONTROL, msg_type::USER_CONTROL, 0, 0, buf.freeze())
    }

    pub fn command(stream_id: u32, body: Bytes) -> Self {
        Self::new(csid::COMMAND, msg_type::COMMAND_AMF0, 0, stream_id, body)
    }

    /// Read the payload of a 4-byte protocol control message.
    pub fn payload_u32(&self) -> Option<u32> {
        if self.payload.len() < 4 {
            return None;
        }
        let mut bytes = self.payload.clone();
        Some(bytes.get_u32())
    }

    pub fn is_media(&self) -> bool {
        matches!(self.type_id, msg_type::AUDIO | msg_type::VIDEO | msg_type::DATA_AMF0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_payloads() {
        assert_eq!(RtmpMessage::set_chunk_size(4096).payload_u32(), Some(4096));
        assert_eq!(RtmpMessage::ack(12345).payload_u32(), Some(12345));
        assert_eq!(
            RtmpMessage::window_ack_size(2_500_000).payload_u32(),
            Some(2_500_000)
        );

        let bw = RtmpMessage::set_peer_bandwidth(2_500_000, 2);
        assert_eq!(bw.payload.len(), 5);
        assert_eq!(bw.payload[4], 2);

        let uc = RtmpMessage::user_control(user_control::STREAM_BEGIN, 1);
        assert_eq!(uc.payload.len(), 6);
        assert_eq!(&uc.payload[..2], &[0, 0]);
        assert_eq!(&uc.payload[2..], &[0, 0, 0, 1]);
    }

    #[test]
    fn test_media_classification() {
        let audio = RtmpMessage::new(4, msg_type::AUDIO, 0, 1, Bytes::new());
        let command = RtmpMessage::command(0, Bytes::new());
        assert!(audio.is_media());
        assert!(!command.is_media());
    }
}
