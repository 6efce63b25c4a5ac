// RTMP chunking
// Incremental chunk-stream demultiplexer and the matching writer

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use super::message::RtmpMessage;

/// Protocol default until a SetChunkSize arrives.
pub const DEFAULT_CHUNK_SIZE: usize = 128;

/// Sanity cap on a single message payload.
const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

const EXTENDED_TIMESTAMP: u32 = 0xFF_FF_FF;

#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("chunk format {fmt} on unknown chunk stream {csid}")]
    UnknownChunkStream { fmt: u8, csid: u16 },
    #[error("message length {0} exceeds limit")]
    MessageTooLarge(u32),
}

/// Per-chunk-stream assembly state.
struct CsidState {
    timestamp: u32,
    timestamp_delta: u32,
    length: u32,
    type_id: u8,
    stream_id: u32,
    extended_ts: bool,
    payload: BytesMut,
}

/// Incremental demultiplexer. Feed it the socket buffer; it consumes whole
/// chunks only and yields a message once every chunk of it has arrived.
pub struct ChunkReader {
    chunk_size: usize,
    states: HashMap<u16, CsidState>,
}

impl ChunkReader {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            states: HashMap::new(),
        }
    }

    /// Peer announced a new chunk size.
    pub fn set_chunk_size(&mut self, size: usize) {
        if size > 0 {
            self.chunk_size = size;
        }
    }

    /// Try to decode one message. Returns `None` when more bytes are needed;
    /// call again after the buffer grows. Nothing is consumed and no state
    /// is touched until a whole chunk (header + data) is buffered.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RtmpMessage>, ChunkError> {
        loop {
            let Some(header) = self.peek_header(buf)? else {
                return Ok(None);
            };

            let continuation = self
                .states
                .get(&header.csid)
                .map(|s| !s.payload.is_empty())
                .unwrap_or(false);

            // Message length for this chunk: a new fmt0/1 header carries it,
            // everything else inherits from the chunk stream's state.
            let length = if !continuation && header.fmt <= 1 {
                header.length_field
            } else {
                self.states
                    .get(&header.csid)
                    .ok_or(ChunkError::UnknownChunkStream {
                        fmt: header.fmt,
                        csid: header.csid,
                    })?
                    .length
            };
            if length > MAX_MESSAGE_SIZE {
                return Err(ChunkError::MessageTooLarge(length));
            }

            let already = self
                .states
                .get(&header.csid)
                .map(|s| s.payload.len() as u32)
                .unwrap_or(0);
            let data_size = (length.saturating_sub(already) as usize).min(self.chunk_size);

            if buf.len() < header.header_len + data_size {
                return Ok(None);
            }

            // The whole chunk is here: commit the header to state, consume
            if !continuation {
                self.apply_header(&header)?;
            }
            buf.advance(header.header_len);
            let data = buf.split_to(data_size);

            let state = self
                .states
                .get_mut(&header.csid)
                .ok_or(ChunkError::UnknownChunkStream {
                    fmt: header.fmt,
                    csid: header.csid,
                })?;
            state.payload.extend_from_slice(&data);

            if state.payload.len() as u32 >= state.length {
                let payload = state.payload.split().freeze();
                return Ok(Some(RtmpMessage {
                    chunk_stream_id: header.csid,
                    type_id: state.type_id,
                    timestamp: state.timestamp,
                    stream_id: state.stream_id,
                    payload,
                }));
            }
            // Chunk consumed but the message continues; try the next chunk
        }
    }

    /// Parse one chunk header without consuming or mutating. Returns `None`
    /// when the buffer holds less than a full header.
    fn peek_header(&self, buf: &BytesMut) -> Result<Option<ParsedHeader>, ChunkError> {
        if buf.is_empty() {
            return Ok(None);
        }

        let b0 = buf[0];
        let fmt = b0 >> 6;
        let (csid, basic_len) = match b0 & 0x3F {
            0 => {
                if buf.len() < 2 {
                    return Ok(None);
                }
                (64 + buf[1] as u16, 2)
            }
            1 => {
                if buf.len() < 3 {
                    return Ok(None);
                }
                (64 + buf[1] as u16 + 256 * buf[2] as u16, 3)
            }
            n => (n as u16, 1),
        };

        let msg_header_len = match fmt {
            0 => 11,
            1 => 7,
            2 => 3,
            _ => 0,
        };
        if buf.len() < basic_len + msg_header_len {
            return Ok(None);
        }
        let header = &buf[basic_len..basic_len + msg_header_len];

        let ts_field = if msg_header_len >= 3 {
            Some(read_u24(&header[0..3]))
        } else {
            None
        };
        let extended = match ts_field {
            Some(ts) => ts == EXTENDED_TIMESTAMP,
            None => self
                .states
                .get(&csid)
                .map(|s| s.extended_ts)
                .unwrap_or(false),
        };
        let ext_len = if extended { 4 } else { 0 };
        let header_len = basic_len + msg_header_len + ext_len;
        if buf.len() < header_len {
            return Ok(None);
        }
        let ext_ts = if extended {
            let raw = &buf[basic_len + msg_header_len..header_len];
            Some(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
        } else {
            None
        };

        let (length_field, type_field) = if msg_header_len >= 7 {
            (read_u24(&header[3..6]), header[6])
        } else {
            (0, 0)
        };
        let stream_id_field = if msg_header_len == 11 {
            u32::from_le_bytes([header[7], header[8], header[9], header[10]])
        } else {
            0
        };

        Ok(Some(ParsedHeader {
            fmt,
            csid,
            header_len,
            ts_field,
            ext_ts,
            extended,
            length_field,
            type_field,
            stream_id_field,
        }))
    }

    /// Fold a new-message header into the chunk stream's state.
    fn apply_header(&mut self, header: &ParsedHeader) -> Result<(), ChunkError> {
        match header.fmt {
            0 => {
                let timestamp = header
                    .ext_ts
                    .unwrap_or_else(|| header.ts_field.unwrap_or(0));
                self.states.insert(
                    header.csid,
                    CsidState {
                        timestamp,
                        timestamp_delta: 0,
                        length: header.length_field,
                        type_id: header.type_field,
                        stream_id: header.stream_id_field,
                        extended_ts: header.extended,
                        payload: BytesMut::new(),
                    },
                );
            }
            1 => {
                let state = self.states.get_mut(&header.csid).ok_or(
                    ChunkError::UnknownChunkStream {
                        fmt: header.fmt,
                        csid: header.csid,
                    },
                )?;
                let delta = header
                    .ext_ts
                    .unwrap_or_else(|| header.ts_field.unwrap_or(0));
                state.timestamp = state.timestamp.wrapping_add(delta);
                state.timestamp_delta = delta;
                state.length = header.length_field;
                state.type_id = header.type_field;
                state.extended_ts = header.extended;
            }
            2 => {
                let state = self.states.get_mut(&header.csid).ok_or(
                    ChunkError::UnknownChunkStream {
                        fmt: header.fmt,
                        csid: header.csid,
                    },
                )?;
                let delta = header
                    .ext_ts
                    .unwrap_or_else(|| header.ts_field.unwrap_or(0));
                state.timestamp = state.timestamp.wrapping_add(delta);
                state.timestamp_delta = delta;
                state.extended_ts = header.extended;
            }
            _ => {
                let state = self.states.get_mut(&header.csid).ok_or(
                    ChunkError::UnknownChunkStream {
                        fmt: header.fmt,
                        csid: header.csid,
                    },
                )?;
                let delta = header.ext_ts.unwrap_or(state.timestamp_delta);
                state.timestamp = state.timestamp.wrapping_add(delta);
            }
        }
        Ok(())
    }
}

impl Default for ChunkReader {
    fn default() -> Self {
        Self::new()
    }
}

struct ParsedHeader {
    fmt: u8,
    csid: u16,
    header_len: usize,
    ts_field: Option<u32>,
    ext_ts: Option<u32>,
    extended: bool,
    length_field: u32,
    type_field: u8,
    stream_id_field: u32,
}

fn read_u24(bytes: &[u8]) -> u32 {
    (u32::from(bytes[0]) << 16) | (u32::from(bytes[1]) << 8) | u32::from(bytes[2])
}

/// Serializes messages as a type-0 chunk plus type-3 continuations.
pub struct ChunkWriter {
    chunk_size: usize,
}

impl ChunkWriter {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Our side announced a new chunk size.
    pub fn set_chunk_size(&mut self, size: usize) {
        if size > 0 {
            self.chunk_size = size;
        }
    }

    pub fn encode(&self, msg: &RtmpMessage) -> Bytes {
        let csid = msg.chunk_stream_id.min(63) as u8;
        let extended = msg.timestamp >= EXTENDED_TIMESTAMP;
        let ts_field = if extended {
            EXTENDED_TIMESTAMP
        } else {
            msg.timestamp
        };

        let mut out = BytesMut::with_capacity(msg.payload.len() + 18);

        out.put_u8(csid); // fmt 0
        put_u24(&mut out, ts_field);
        put_u24(&mut out, msg.payload.len() as u32);
        out.put_u8(msg.type_id);
        out.put_u32_le(msg.stream_id);
        if extended {
            out.put_u32(msg.timestamp);
        }

        let mut offset = 0;
        let total = msg.payload.len();
        loop {
            let take = (total - offset).min(self.chunk_size);
            out.put_slice(&msg.payload[offset..offset + take]);
            offset += take;
            if offset >= total {
                break;
            }
            out.put_u8(0xC0 | csid); // fmt 3 continuation
            if extended {
                out.put_u32(msg.timestamp);
            }
        }

        out.freeze()
    }
}

impl Default for ChunkWriter {
    fn default() -> Self {
        Self::new()
    }
}

fn put_u24(buf: &mut BytesMut, value: u32) {
    buf.put_u8((value >> 16) as u8);
    buf.put_u8((value >> 8) as u8);
    buf.put_u8(value as u8);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::message::msg_type;

    fn round_trip(payload_len: usize) {
        let payload: Vec<u8> = (0..payload_len).map(|i| (i % 251) as u8).collect();
        let msg = RtmpMessage::new(3, msg_type::COMMAND_AMF0, 1000, 1, Bytes::from(payload.clone()));

        let writer = ChunkWriter::new();
        let encoded = writer.encode(&msg);

        let mut reader = ChunkReader::new();
        let mut buf = BytesMut::from(&encoded[..]);
        let decoded = reader.decode(&mut buf).unwrap().expect("one message");

        assert_eq!(decoded.type_id, msg_type::COMMAND_AMF0);
        assert_eq!(decoded.timestamp, 1000);
        assert_eq!(decoded.stream_id, 1);
        assert_eq!(&decoded.payload[..], &payload[..]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_single_chunk_message() {
        round_trip(100);
    }

    #[test]
    fn test_multi_chunk_message() {
        // Spans several 128-byte chunks with fmt-3 continuations
        round_trip(1000);
    }

    #[test]
    fn test_exact_chunk_boundary() {
        round_trip(DEFAULT_CHUNK_SIZE);
        round_trip(DEFAULT_CHUNK_SIZE * 3);
    }

    #[test]
    fn test_partial_feed_waits() {
        let payload: Vec<u8> = vec![7; 300];
        let msg = RtmpMessage::new(3, msg_type::VIDEO, 40, 1, Bytes::from(payload));
        let encoded = ChunkWriter::new().encode(&msg);

        let mut reader = ChunkReader::new();
        let mut buf = BytesMut::new();

        // Feed one byte at a time; nothing must come out until the end
        let mut produced = None;
        for (i, byte) in encoded.iter().enumerate() {
            buf.put_u8(*byte);
            if let Some(msg) = reader.decode(&mut buf).unwrap() {
                produced = Some((i, msg));
                break;
            }
        }

        let (at, msg) = produced.expect("message must eventually assemble");
        assert_eq!(at, encoded.len() - 1);
        assert_eq!(msg.payload.len(), 300);
    }

    #[test]
    fn test_timestamp_delta_chain() {
        // fmt0 then fmt1 with a delta, hand-assembled
        let mut buf = BytesMut::new();

        // fmt0, csid 4: ts=100, len=2, type=8 (audio), sid=1
        buf.put_u8(0x04);
        put_u24(&mut buf, 100);
        put_u24(&mut buf, 2);
        buf.put_u8(8);
        buf.put_u32_le(1);
        buf.put_slice(&[0xAF, 0x01]);

        // fmt1, csid 4: delta=33, len=2, type=8
        buf.put_u8(0x44);
        put_u24(&mut buf, 33);
        put_u24(&mut buf, 2);
        buf.put_u8(8);
        buf.put_slice(&[0xAF, 0x01]);

        // fmt3, csid 4: inherits delta=33
        buf.put_u8(0xC4);
        buf.put_slice(&[0xAF, 0x01]);

        let mut reader = ChunkReader::new();
        let first = reader.decode(&mut buf).unwrap().unwrap();
        let second = reader.decode(&mut buf).unwrap().unwrap();
        let third = reader.decode(&mut buf).unwrap().unwrap();

        assert_eq!(first.timestamp, 100);
        assert_eq!(second.timestamp, 133);
        assert_eq!(third.timestamp, 166);
    }

    #[test]
    fn test_extended_timestamp() {
        let msg = RtmpMessage::new(3, msg_type::VIDEO, 0x0100_0000, 1, Bytes::from_static(&[1, 2, 3]));
        let encoded = ChunkWriter::new().encode(&msg);

        let mut reader = ChunkReader::new();
        let mut buf = BytesMut::from(&encoded[..]);
        let decoded = reader.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.timestamp, 0x0100_0000);
    }

    #[test]
    fn test_interleaved_chunk_streams() {
        let writer = ChunkWriter::new();
        let audio = RtmpMessage::new(4, msg_type::AUDIO, 10, 1, Bytes::from(vec![1u8; 200]));
        let video = RtmpMessage::new(6, msg_type::VIDEO, 12, 1, Bytes::from(vec![2u8; 200]));

        let a = writer.encode(&audio);
        let v = writer.encode(&video);

        // Interleave: audio chunk 1, video chunk 1, audio chunk 2, video chunk 2
        // Chunk layout per message: 12-byte header + 128 bytes, then 1-byte
        // header + 72 bytes.
        let mut buf = BytesMut::new();
        buf.put_slice(&a[..12 + 128]);
        buf.put_slice(&v[..12 + 128]);
        buf.put_slice(&a[12 + 128..]);
        buf.put_slice(&v[12 + 128..]);

        let mut reader = ChunkReader::new();
        let first = reader.decode(&mut buf).unwrap().unwrap();
        let second = reader.decode(&mut buf).unwrap().unwrap();

        assert_eq!(first.type_id, msg_type::AUDIO);
        assert_eq!(first.payload.len(), 200);
        assert_eq!(second.type_id, msg_type::VIDEO);
        assert_eq!(second.payload.len(), 200);
    }

    #[test]
    fn test_fmt1_without_state_is_error() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x44); // fmt1 on never-seen csid 4
        put_u24(&mut buf, 33);
        put_u24(&mut buf, 2);
        buf.put_u8(8);
        buf.put_slice(&[0xAF, 0x01]);

        let mut reader = ChunkReader::new();
        assert!(reader.decode(&mut buf).is_err());
    }
}
