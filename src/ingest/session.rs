// RTMP server session
// One connection: handshake, command dispatch, publish or play

use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use super::amf0::{self, AmfValue};
use super::chunk::{ChunkError, ChunkReader, ChunkWriter};
use super::handshake::{Handshake, HandshakeError, HandshakeRole};
use super::hub::{FrameKind, MediaFrame};
use super::message::{csid, msg_type, user_control, RtmpMessage};
use super::IngestServer;

/// Chunk size we announce after `connect`.
const OUT_CHUNK_SIZE: usize = 4096;

/// Acknowledgement window we request from the peer.
const WINDOW_ACK_SIZE: u32 = 2_500_000;

/// Poll cadence while a player waits for the publisher to appear.
const PLAY_WAIT_POLL: std::time::Duration = std::time::Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error("publish rejected")]
    Rejected,
}

enum SessionMode {
    Command,
    Playing {
        path: String,
        stream_id: u32,
        rx: broadcast::Receiver<MediaFrame>,
    },
}

/// Server side of one RTMP connection.
pub struct ServerSession {
    id: u64,
    ingest: Arc<IngestServer>,
    rd: OwnedReadHalf,
    writer: MessageWriter,
    buf: BytesMut,
    reader: ChunkReader,
    app: String,
    publishing: Option<(String, String)>,
    next_stream_id: u32,
    bytes_received: u64,
    last_ack: u64,
}

impl ServerSession {
    pub fn new(id: u64, stream: TcpStream, ingest: Arc<IngestServer>) -> Self {
        let (rd, wr) = stream.into_split();
        Self {
            id,
            ingest,
            rd,
            writer: MessageWriter::new(wr),
            buf: BytesMut::with_capacity(8192),
            reader: ChunkReader::new(),
            app: String::new(),
            publishing: None,
            next_stream_id: 0,
            bytes_received: 0,
            last_ack: 0,
        }
    }

    /// Drive the session to completion, then release whatever it held.
    pub async fn run(&mut self) {
        let result = self.run_inner().await;
        match result {
            Ok(()) => log::debug!("Ingest session {} closed", self.id),
            Err(SessionError::Rejected) => {}
            Err(err) => log::debug!("Ingest session {} ended: {err}", self.id),
        }

        if let Some((path, _stream)) = self.publishing.take() {
            self.ingest.hub().unpublish(&path);
            self.ingest.done_publish(&path);
        }
    }

    async fn run_inner(&mut self) -> Result<(), SessionError> {
        self.handshake().await?;

        loop {
            let Some(message) = self.next_message().await? else {
                return Ok(());
            };

            let mode = self.dispatch(message).await?;
            if let SessionMode::Playing {
                path,
                stream_id,
                rx,
            } = mode
            {
                return self.play_loop(path, stream_id, rx).await;
            }
        }
    }

    async fn handshake(&mut self) -> Result<(), SessionError> {
        let mut handshake = Handshake::new(HandshakeRole::Server);
        handshake.generate_initial();

        while !handshake.is_done() {
            let needed = handshake.bytes_needed();
            while self.buf.len() < needed {
                let n = self.rd.read_buf(&mut self.buf).await?;
                if n == 0 {
                    return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
                }
                self.bytes_received += n as u64;
            }

            let mut bytes = self.buf.split_to(needed).freeze();
            if let Some(response) = handshake.process(&mut bytes)? {
                self.writer.write_raw(&response).await?;
            }
        }
        Ok(())
    }

    /// Read until one full message is assembled. `None` means a clean EOF.
    async fn next_message(&mut self) -> Result<Option<RtmpMessage>, SessionError> {
        loop {
            if let Some(message) = self.reader.decode(&mut self.buf)? {
                return Ok(Some(message));
            }
            let n = self.rd.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Ok(None);
            }
            self.bytes_received += n as u64;
            self.maybe_ack().await?;
        }
    }

    async fn maybe_ack(&mut self) -> Result<(), SessionError> {
        if self.bytes_received - self.last_ack >= u64::from(WINDOW_ACK_SIZE) {
            self.last_ack = self.bytes_received;
            self.writer
                .send(&RtmpMessage::ack(self.bytes_received as u32))
                .await?;
        }
        Ok(())
    }

    async fn dispatch(&mut self, message: RtmpMessage) -> Result<SessionMode, SessionError> {
        match message.type_id {
            msg_type::SET_CHUNK_SIZE => {
                if let Some(size) = message.payload_u32() {
                    self.reader.set_chunk_size(size as usize);
                }
            }
            msg_type::COMMAND_AMF0 => return self.handle_command(message).await,
            msg_type::AUDIO | msg_type::VIDEO | msg_type::DATA_AMF0 => {
                self.handle_media(message);
            }
            // Acks, user control, AMF3 traffic: nothing to do
            _ => {}
        }
        Ok(SessionMode::Command)
    }

    async fn handle_command(
        &mut self,
        message: RtmpMessage,
    ) -> Result<SessionMode, SessionError> {
        let mut body = message.payload.clone();
        let values = match amf0::decode_all(&mut body) {
            Ok(values) => values,
            Err(err) => {
                log::debug!("Session {}: undecodable command: {err}", self.id);
                return Ok(SessionMode::Command);
            }
        };

        let name = values.first().and_then(AmfValue::as_str).unwrap_or("");
        let transaction_id = values.get(1).and_then(AmfValue::as_number).unwrap_or(0.0);

        match name {
            "connect" => {
                self.app = values
                    .get(2)
                    .and_then(|v| v.property("app"))
                    .and_then(AmfValue::as_str)
                    .unwrap_or("")
                    .trim_matches('/')
                    .to_string();
                self.ingest.pre_connect(self.id, &self.app);

                self.writer
                    .send(&RtmpMessage::window_ack_size(WINDOW_ACK_SIZE))
                    .await?;
                self.writer
                    .send(&RtmpMessage::set_peer_bandwidth(WINDOW_ACK_SIZE, 2))
                    .await?;
                self.writer
                    .send(&RtmpMessage::set_chunk_size(OUT_CHUNK_SIZE as u32))
                    .await?;
                self.writer.set_chunk_size(OUT_CHUNK_SIZE);

                let body = amf0::encode_all(&[
                    AmfValue::String("_result".to_string()),
                    AmfValue::Number(transaction_id),
                    AmfValue::Object(vec![
                        (
                            "fmsVer".to_string(),
                            AmfValue::String("FMS/3,0,1,123".to_string()),
                        ),
                        ("capabilities".to_string(), AmfValue::Number(31.0)),
                    ]),
                    AmfValue::Object(vec![
                        ("level".to_string(), AmfValue::String("status".to_string())),
                        (
                            "code".to_string(),
                            AmfValue::String("NetConnection.Connect.Success".to_string()),
                        ),
                        (
                            "description".to_string(),
                            AmfValue::String("Connection succeeded.".to_string()),
                        ),
                        ("objectEncoding".to_string(), AmfValue::Number(0.0)),
                    ]),
                ]);
                self.writer.send(&RtmpMessage::command(0, body)).await?;
            }
            "createStream" => {
                self.next_stream_id += 1;
                let body = amf0::encode_all(&[
                    AmfValue::String("_result".to_string()),
                    AmfValue::Number(transaction_id),
                    AmfValue::Null,
                    AmfValue::Number(f64::from(self.next_stream_id)),
                ]);
                self.writer.send(&RtmpMessage::command(0, body)).await?;
            }
            "publish" => {
                let raw_name = values.get(3).and_then(AmfValue::as_str).unwrap_or("");
                let stream_name = raw_name.split('?').next().unwrap_or("").to_string();
                return self.handle_publish(message.stream_id, stream_name).await;
            }
            "play" => {
                let stream_name = values
                    .get(3)
                    .and_then(AmfValue::as_str)
                    .unwrap_or("")
                    .split('?')
                    .next()
                    .unwrap_or("")
                    .to_string();
                return self.handle_play(message.stream_id, stream_name).await;
            }
            "deleteStream" | "closeStream" | "FCUnpublish" => {
                if let Some((path, _stream)) = self.publishing.take() {
                    self.ingest.hub().unpublish(&path);
                    self.ingest.done_publish(&path);
                }
            }
            // Encoder chatter that needs no reply
            "releaseStream" | "FCPublish" | "getStreamLength" => {}
            other => log::debug!("Session {}: ignoring command '{other}'", self.id),
        }

        Ok(SessionMode::Command)
    }

    async fn handle_publish(
        &mut self,
        stream_id: u32,
        stream_name: String,
    ) -> Result<SessionMode, SessionError> {
        if let Err(err) = self.ingest.pre_publish(&self.app, &stream_name) {
            self.writer
                .send(&on_status(
                    stream_id,
                    "error",
                    "NetStream.Publish.BadName",
                    &format!("Publish rejected: {err}"),
                ))
                .await?;
            return Err(SessionError::Rejected);
        }

        let path = format!("{}/{}", self.app, stream_name);
        if self.ingest.hub().publish(&path).is_err() {
            self.ingest.publish_failed();
            self.writer
                .send(&on_status(
                    stream_id,
                    "error",
                    "NetStream.Publish.BadConnection",
                    "Stream is already being published.",
                ))
                .await?;
            return Err(SessionError::Rejected);
        }

        self.publishing = Some((path, stream_name.clone()));
        self.writer
            .send(&RtmpMessage::user_control(
                user_control::STREAM_BEGIN,
                stream_id,
            ))
            .await?;
        self.writer
            .send(&on_status(
                stream_id,
                "status",
                "NetStream.Publish.Start",
                "Publishing started.",
            ))
            .await?;

        self.ingest.post_publish(&self.app, &stream_name);
        Ok(SessionMode::Command)
    }

    async fn handle_play(
        &mut self,
        stream_id: u32,
        stream_name: String,
    ) -> Result<SessionMode, SessionError> {
        let path = format!("{}/{}", self.app, stream_name);

        self.writer
            .send(&RtmpMessage::user_control(
                user_control::STREAM_BEGIN,
                stream_id,
            ))
            .await?;
        self.writer
            .send(&on_status(
                stream_id,
                "status",
                "NetStream.Play.Start",
                "Playing.",
            ))
            .await?;

        // The player may arrive before the publisher; wait for the stream
        // while still noticing the peer going away.
        let (rx, catchup) = loop {
            match self.ingest.hub().subscribe(&path) {
                Ok(subscribed) => break subscribed,
                Err(_) => {
                    let read: Option<std::io::Result<usize>> = tokio::select! {
                        _ = tokio::time::sleep(PLAY_WAIT_POLL) => None,
                        read = self.rd.read_buf(&mut self.buf) => Some(read),
                    };
                    match read {
                        None => {}
                        // EOF while waiting: the peer gave up
                        Some(Ok(0)) => return Ok(SessionMode::Command),
                        Some(Ok(n)) => self.bytes_received += n as u64,
                        Some(Err(err)) => return Err(err.into()),
                    }
                }
            }
        };

        for frame in catchup {
            self.send_media(stream_id, &frame).await?;
        }

        Ok(SessionMode::Playing {
            path,
            stream_id,
            rx,
        })
    }

    /// Forward hub frames to the player until either side goes away.
    async fn play_loop(
        &mut self,
        path: String,
        stream_id: u32,
        mut rx: broadcast::Receiver<MediaFrame>,
    ) -> Result<(), SessionError> {
        enum Step {
            Frame(Result<MediaFrame, broadcast::error::RecvError>),
            Read(std::io::Result<usize>),
        }

        let result = loop {
            // Arms only capture the outcome; handling below keeps the borrow
            // of `self` out of the select futures.
            let step = tokio::select! {
                frame = rx.recv() => Step::Frame(frame),
                read = self.rd.read_buf(&mut self.buf) => Step::Read(read),
            };

            match step {
                Step::Frame(Ok(frame)) => {
                    if let Err(err) = self.send_media(stream_id, &frame).await {
                        break Err(err.into());
                    }
                }
                Step::Frame(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    log::warn!("Player session {} lagged, skipped {skipped} frames", self.id);
                }
                Step::Frame(Err(broadcast::error::RecvError::Closed)) => {
                    // Publisher went away
                    let _ = self
                        .writer
                        .send(&RtmpMessage::user_control(
                            user_control::STREAM_EOF,
                            stream_id,
                        ))
                        .await;
                    let _ = self
                        .writer
                        .send(&on_status(
                            stream_id,
                            "status",
                            "NetStream.Play.UnpublishNotify",
                            "Stream ended.",
                        ))
                        .await;
                    break Ok(());
                }
                Step::Read(Ok(0)) => break Ok(()),
                Step::Read(Ok(n)) => {
                    self.bytes_received += n as u64;
                    if self.drain_player_commands() {
                        break Ok(());
                    }
                }
                Step::Read(Err(err)) => break Err(err.into()),
            }
        };

        self.ingest.hub().unsubscribe(&path);
        result
    }

    /// Parse control traffic from a playing peer; returns true when the
    /// player asked to stop.
    fn drain_player_commands(&mut self) -> bool {
        loop {
            match self.reader.decode(&mut self.buf) {
                Ok(Some(message)) => {
                    if message.type_id != msg_type::COMMAND_AMF0 {
                        continue;
                    }
                    let mut body = message.payload.clone();
                    let Ok(values) = amf0::decode_all(&mut body) else {
                        continue;
                    };
                    let name = values.first().and_then(AmfValue::as_str).unwrap_or("");
                    if name == "deleteStream" || name == "closeStream" {
                        return true;
                    }
                }
                Ok(None) => return false,
                Err(err) => {
                    log::debug!("Player session {}: {err}", self.id);
                    return false;
                }
            }
        }
    }

    async fn send_media(
        &mut self,
        stream_id: u32,
        frame: &MediaFrame,
    ) -> Result<(), std::io::Error> {
        let chunk_stream = match frame.kind {
            FrameKind::Audio => csid::AUDIO,
            FrameKind::Video => csid::VIDEO,
            FrameKind::Metadata => csid::DATA,
        };
        let message = RtmpMessage::new(
            chunk_stream,
            frame.kind.message_type(),
            frame.timestamp,
            stream_id,
            frame.payload.clone(),
        );
        self.writer.send(&message).await
    }

    /// Media from the publisher flows into the hub.
    fn handle_media(&mut self, message: RtmpMessage) {
        let Some((path, _)) = self.publishing.as_ref() else {
            return;
        };

        let frame = match message.type_id {
            msg_type::AUDIO => {
                MediaFrame::new(FrameKind::Audio, message.timestamp, message.payload)
            }
            msg_type::VIDEO => {
                MediaFrame::new(FrameKind::Video, message.timestamp, message.payload)
            }
            msg_type::DATA_AMF0 => {
                let payload = unwrap_set_data_frame(&message.payload);
                MediaFrame::new(FrameKind::Metadata, message.timestamp, payload)
            }
            _ => return,
        };

        self.ingest.hub().broadcast(path, frame);
    }
}

/// Strip the `@setDataFrame` wrapper encoders put around `onMetaData`, so
/// players receive the bare data message.
fn unwrap_set_data_frame(payload: &Bytes) -> Bytes {
    let mut probe = payload.clone();
    match amf0::decode(&mut probe) {
        Ok(AmfValue::String(name)) if name == "@setDataFrame" => probe,
        _ => payload.clone(),
    }
}

/// Build an `onStatus` command message.
fn on_status(stream_id: u32, level: &str, code: &str, description: &str) -> RtmpMessage {
    let body = amf0::encode_all(&[
        AmfValue::String("onStatus".to_string()),
        AmfValue::Number(0.0),
        AmfValue::Null,
        AmfValue::Object(vec![
            ("level".to_string(), AmfValue::String(level.to_string())),
            ("code".to_string(), AmfValue::String(code.to_string())),
            (
                "description".to_string(),
                AmfValue::String(description.to_string()),
            ),
        ]),
    ]);
    RtmpMessage::command(stream_id, body)
}

/// Serializes outbound messages through one chunk writer.
struct MessageWriter {
    wr: OwnedWriteHalf,
    chunk: ChunkWriter,
}

impl MessageWriter {
    fn new(wr: OwnedWriteHalf) -> Self {
        Self {
            wr,
            chunk: ChunkWriter::new(),
        }
    }

    fn set_chunk_size(&mut self, size: usize) {
        self.chunk.set_chunk_size(size);
    }

    async fn send(&mut self, message: &RtmpMessage) -> Result<(), std::io::Error> {
        let encoded = self.chunk.encode(message);
        self.wr.write_all(&encoded).await
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), std::io::Error> {
        self.wr.write_all(bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwrap_set_data_frame() {
        let wrapped = amf0::encode_all(&[
            AmfValue::String("@setDataFrame".to_string()),
            AmfValue::String("onMetaData".to_string()),
            AmfValue::EcmaArray(vec![(
                "duration".to_string(),
                AmfValue::Number(0.0),
            )]),
        ]);
        let mut unwrapped = unwrap_set_data_frame(&wrapped);
        let values = amf0::decode_all(&mut unwrapped).unwrap();
        assert_eq!(values[0].as_str(), Some("onMetaData"));

        let bare = amf0::encode_all(&[AmfValue::String("onMetaData".to_string())]);
        assert_eq!(unwrap_set_data_frame(&bare), bare);
    }

    #[test]
    fn test_on_status_shape() {
        let message = on_status(1, "error", "NetStream.Publish.BadName", "rejected");
        assert_eq!(message.type_id, msg_type::COMMAND_AMF0);
        assert_eq!(message.stream_id, 1);

        let mut body = message.payload.clone();
        let values = amf0::decode_all(&mut body).unwrap();
        assert_eq!(values[0].as_str(), Some("onStatus"));
        assert_eq!(
            values[3].property("code").and_then(AmfValue::as_str),
            Some("NetStream.Publish.BadName")
        );
    }
}
