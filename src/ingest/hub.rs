// Stream hub
// Routes media from the one publisher to the loopback players

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

use super::message::msg_type;

/// Broadcast channel depth per stream. Laggy players skip ahead.
const CHANNEL_CAPACITY: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("stream '{0}' already has a publisher")]
    AlreadyPublishing(String),
    #[error("no publisher on stream '{0}'")]
    NoSuchStream(String),
}

/// Kind of frame moving through the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Audio,
    Video,
    Metadata,
}

impl FrameKind {
    pub fn message_type(self) -> u8 {
        match self {
            FrameKind::Audio => msg_type::AUDIO,
            FrameKind::Video => msg_type::VIDEO,
            FrameKind::Metadata => msg_type::DATA_AMF0,
        }
    }
}

/// One media frame. Cheap to clone: the payload is reference counted.
#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub kind: FrameKind,
    pub timestamp: u32,
    pub payload: Bytes,
}

impl MediaFrame {
    pub fn new(kind: FrameKind, timestamp: u32, payload: Bytes) -> Self {
        Self {
            kind,
            timestamp,
            payload,
        }
    }

    /// AVC sequence header: codec id 7, AVC packet type 0.
    pub fn is_video_sequence_header(&self) -> bool {
        self.kind == FrameKind::Video
            && self.payload.len() >= 2
            && self.payload[0] & 0x0F == 7
            && self.payload[1] == 0
    }

    /// AAC sequence header: sound format 10, AAC packet type 0.
    pub fn is_audio_sequence_header(&self) -> bool {
        self.kind == FrameKind::Audio
            && self.payload.len() >= 2
            && self.payload[0] >> 4 == 10
            && self.payload[1] == 0
    }

    pub fn is_keyframe(&self) -> bool {
        self.kind == FrameKind::Video
            && !self.payload.is_empty()
            && self.payload[0] >> 4 == 1
    }
}

struct StreamEntry {
    sender: broadcast::Sender<MediaFrame>,
    metadata: Option<MediaFrame>,
    video_header: Option<MediaFrame>,
    audio_header: Option<MediaFrame>,
    subscriber_count: usize,
}

impl StreamEntry {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            metadata: None,
            video_header: None,
            audio_header: None,
            subscriber_count: 0,
        }
    }

    /// Frames a late joiner needs before live frames make sense.
    fn catchup_frames(&self) -> Vec<MediaFrame> {
        let mut frames = Vec::with_capacity(3);
        if let Some(ref metadata) = self.metadata {
            frames.push(metadata.clone());
        }
        if let Some(ref video) = self.video_header {
            frames.push(video.clone());
        }
        if let Some(ref audio) = self.audio_header {
            frames.push(audio.clone());
        }
        frames
    }
}

/// The in-process fan-out point between the publish session and the play
/// sessions, keyed by stream path (`app/stream`).
pub struct StreamHub {
    streams: Mutex<HashMap<String, StreamEntry>>,
}

impl StreamHub {
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Claim a stream path for publishing. One publisher per path.
    pub fn publish(&self, path: &str) -> Result<(), HubError> {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        if streams.contains_key(path) {
            return Err(HubError::AlreadyPublishing(path.to_string()));
        }
        streams.insert(path.to_string(), StreamEntry::new());
        Ok(())
    }

    /// Release a stream path; players see the channel close.
    pub fn unpublish(&self, path: &str) {
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(path);
    }

    /// Join a stream: returns the live receiver plus cached catchup frames
    /// (metadata and sequence headers).
    pub fn subscribe(
        &self,
        path: &str,
    ) -> Result<(broadcast::Receiver<MediaFrame>, Vec<MediaFrame>), HubError> {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        let entry = streams
            .get_mut(path)
            .ok_or_else(|| HubError::NoSuchStream(path.to_string()))?;
        entry.subscriber_count += 1;
        Ok((entry.sender.subscribe(), entry.catchup_frames()))
    }

    pub fn unsubscribe(&self, path: &str) {
        if let Some(entry) = self
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(path)
        {
            entry.subscriber_count = entry.subscriber_count.saturating_sub(1);
        }
    }

    /// Push a frame from the publisher to every player, refreshing the
    /// cached headers on the way through.
    pub fn broadcast(&self, path: &str, frame: MediaFrame) {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = streams.get_mut(path) else {
            return;
        };

        match frame.kind {
            FrameKind::Metadata => entry.metadata = Some(frame.clone()),
            FrameKind::Video if frame.is_video_sequence_header() => {
                entry.video_header = Some(frame.clone())
            }
            FrameKind::Audio if frame.is_audio_sequence_header() => {
                entry.audio_header = Some(frame.clone())
            }
            _ => {}
        }

        // Err only means no player is currently listening
        let _ = entry.sender.send(frame);
    }

    pub fn has_publisher(&self, path: &str) -> bool {
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(path)
    }

    pub fn subscriber_count(&self, path: &str) -> usize {
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .map(|e| e.subscriber_count)
            .unwrap_or(0)
    }

    /// Drop every stream (listener shutdown).
    pub fn clear(&self) {
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl Default for StreamHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_publisher_per_path() {
        let hub = StreamHub::new();
        hub.publish("live/obs").unwrap();
        assert!(matches!(
            hub.publish("live/obs"),
            Err(HubError::AlreadyPublishing(_))
        ));

        hub.unpublish("live/obs");
        hub.publish("live/obs").unwrap();
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscriber() {
        let hub = StreamHub::new();
        hub.publish("live/obs").unwrap();

        let (mut rx, catchup) = hub.subscribe("live/obs").unwrap();
        assert!(catchup.is_empty());

        hub.broadcast(
            "live/obs",
            MediaFrame::new(FrameKind::Video, 40, Bytes::from_static(&[0x17, 0x01, 0x00])),
        );

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.timestamp, 40);
        assert!(frame.is_keyframe());
    }

    #[tokio::test]
    async fn test_late_joiner_gets_headers() {
        let hub = StreamHub::new();
        hub.publish("live/obs").unwrap();

        hub.broadcast(
            "live/obs",
            MediaFrame::new(FrameKind::Metadata, 0, Bytes::from_static(&[0x02])),
        );
        hub.broadcast(
            "live/obs",
            MediaFrame::new(FrameKind::Video, 0, Bytes::from_static(&[0x17, 0x00, 0x00])),
        );
        hub.broadcast(
            "live/obs",
            MediaFrame::new(FrameKind::Audio, 0, Bytes::from_static(&[0xAF, 0x00])),
        );
        // A plain inter frame must not be cached
        hub.broadcast(
            "live/obs",
            MediaFrame::new(FrameKind::Video, 40, Bytes::from_static(&[0x27, 0x01, 0x00])),
        );

        let (_rx, catchup) = hub.subscribe("live/obs").unwrap();
        assert_eq!(catchup.len(), 3);
        assert_eq!(catchup[0].kind, FrameKind::Metadata);
        assert!(catchup[1].is_video_sequence_header());
        assert!(catchup[2].is_audio_sequence_header());
    }

    #[test]
    fn test_subscribe_requires_publisher() {
        let hub = StreamHub::new();
        assert!(matches!(
            hub.subscribe("live/none"),
            Err(HubError::NoSuchStream(_))
        ));
    }

    #[test]
    fn test_subscriber_counting() {
        let hub = StreamHub::new();
        hub.publish("live/obs").unwrap();
        let (_a, _) = hub.subscribe("live/obs").unwrap();
        let (_b, _) = hub.subscribe("live/obs").unwrap();
        assert_eq!(hub.subscriber_count("live/obs"), 2);

        hub.unsubscribe("live/obs");
        assert_eq!(hub.subscriber_count("live/obs"), 1);
    }

    #[test]
    fn test_frame_classification() {
        let avc_header = MediaFrame::new(FrameKind::Video, 0, Bytes::from_static(&[0x17, 0x00]));
        let keyframe = MediaFrame::new(FrameKind::Video, 0, Bytes::from_static(&[0x17, 0x01]));
        let inter = MediaFrame::new(FrameKind::Video, 0, Bytes::from_static(&[0x27, 0x01]));
        let aac_header = MediaFrame::new(FrameKind::Audio, 0, Bytes::from_static(&[0xAF, 0x00]));
        let aac_raw = MediaFrame::new(FrameKind::Audio, 0, Bytes::from_static(&[0xAF, 0x01]));

        assert!(avc_header.is_video_sequence_header());
        assert!(keyframe.is_keyframe());
        assert!(!inter.is_keyframe());
        assert!(aac_header.is_audio_sequence_header());
        assert!(!aac_raw.is_audio_sequence_header());
    }
}
