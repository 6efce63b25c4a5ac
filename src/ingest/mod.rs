// RTMP Ingest
// The embedded protocol server the publisher pushes into

mod amf0;
mod chunk;
mod handshake;
mod hub;
mod message;
mod session;

pub use amf0::{AmfValue, decode as amf_decode, decode_all as amf_decode_all, encode_all as amf_encode_all};
pub use chunk::{ChunkReader, ChunkWriter};
pub use handshake::{Handshake, HandshakeRole};
pub use hub::{FrameKind, MediaFrame, StreamHub};
pub use message::{csid, msg_type, RtmpMessage};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::models::{loopback_host, RtmpServerConfig};
use crate::services::{IngestSource, Module, RelayError, RelayResult};

/// State of the single publish session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IngestStatus {
    Idle,
    Connecting,
    Streaming,
}

/// Snapshot handed to status subscribers and the control API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestInfo {
    pub status: IngestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_path: Option<String>,
    /// Ingest URL with the bind host rewritten for loopback consumers
    pub url: String,
    pub app: String,
    pub port: u16,
    pub enabled: bool,
}

type StatusCallback = Box<dyn Fn(&IngestInfo) + Send + Sync>;

/// The ingest endpoint: accepts one publisher, enforces the stream key, and
/// re-serves the stream to loopback players on the same listener.
pub struct IngestServer {
    config: RwLock<RtmpServerConfig>,
    status: RwLock<IngestStatus>,
    actual_path: RwLock<Option<String>>,
    subscribers: Mutex<Vec<(u64, StatusCallback)>>,
    next_subscription: AtomicU64,
    next_session: AtomicU64,
    hub: StreamHub,
    listener_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl IngestServer {
    pub fn new(config: RtmpServerConfig) -> Self {
        Self {
            config: RwLock::new(config),
            status: RwLock::new(IngestStatus::Idle),
            actual_path: RwLock::new(None),
            subscribers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            next_session: AtomicU64::new(1),
            hub: StreamHub::new(),
            listener_task: Mutex::new(None),
        }
    }

    pub(crate) fn hub(&self) -> &StreamHub {
        &self.hub
    }

    pub fn config(&self) -> RtmpServerConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn status(&self) -> IngestStatus {
        *self.status.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a status callback. Callbacks run serially on the ingest
    /// event path and must not block.
    pub fn subscribe<F>(&self, callback: F) -> u64
    where
        F: Fn(&IngestInfo) + Send + Sync + 'static,
    {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Box::new(callback)));
        id
    }

    pub fn unsubscribe(&self, subscription_id: u64) {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(id, _)| *id != subscription_id);
    }

    fn notify(&self) {
        let info = self.info();
        let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        for (_, callback) in subscribers.iter() {
            callback(&info);
        }
    }

    /// The publish path in use: the observed one when a publisher is live,
    /// otherwise the configured `/app/streamKey`.
    pub fn stream_path(&self) -> String {
        self.actual_path
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_else(|| {
                self.config
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .stream_path()
            })
    }

    pub fn info(&self) -> IngestInfo {
        let config = self.config.read().unwrap_or_else(|e| e.into_inner());
        IngestInfo {
            status: self.status(),
            actual_path: self
                .actual_path
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            url: format!(
                "rtmp://{}:{}{}",
                loopback_host(&config.host),
                config.port,
                self.stream_path()
            ),
            app: config.app_name.clone(),
            port: config.port,
            enabled: config.enabled,
        }
    }

    /// Apply a new listener configuration. The listener restarts only when
    /// the binding or publish path actually changed.
    pub async fn reconfigure(self: &Arc<Self>, new_config: RtmpServerConfig) -> RelayResult<()> {
        let changed = {
            let current = self.config.read().unwrap_or_else(|e| e.into_inner());
            current.host != new_config.host
                || current.port != new_config.port
                || current.app_name != new_config.app_name
                || current.stream_key != new_config.stream_key
        };

        let was_running = self
            .listener_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some();

        if changed && was_running {
            self.stop_listener();
        }
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = new_config.clone();
        if changed && was_running && new_config.enabled {
            self.start_listener().await?;
        }
        Ok(())
    }

    /// Bind and start accepting publishers. Starting an already-running
    /// listener is a no-op.
    pub async fn start_listener(self: &Arc<Self>) -> RelayResult<()> {
        {
            let task = self.listener_task.lock().unwrap_or_else(|e| e.into_inner());
            if task.is_some() {
                return Ok(());
            }
        }

        let (host, port) = {
            let config = self.config.read().unwrap_or_else(|e| e.into_inner());
            (config.host.clone(), config.port)
        };

        let listener = tokio::net::TcpListener::bind((host.as_str(), port))
            .await
            .map_err(|_| RelayError::PortUnavailable(vec![port]))?;
        log::info!("RTMP ingest listening on rtmp://{host}:{port}");

        let ingest = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        let session_id = ingest.next_session.fetch_add(1, Ordering::Relaxed);
                        log::debug!("Ingest connection {session_id} from {peer}");
                        let ingest = Arc::clone(&ingest);
                        tokio::spawn(async move {
                            session::ServerSession::new(session_id, stream, ingest)
                                .run()
                                .await;
                        });
                    }
                    Err(err) => {
                        log::warn!("Ingest accept failed: {err}");
                    }
                }
            }
        });

        *self
            .listener_task
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(task);
        Ok(())
    }

    /// Stop accepting and drop all stream state.
    pub fn stop_listener(&self) {
        if let Some(task) = self
            .listener_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        self.hub.clear();
        *self.status.write().unwrap_or_else(|e| e.into_inner()) = IngestStatus::Idle;
        *self.actual_path.write().unwrap_or_else(|e| e.into_inner()) = None;
        self.notify();
    }

    pub fn is_listening(&self) -> bool {
        self.listener_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    // --- session hooks -----------------------------------------------------

    /// Handshake completed; connection identified itself.
    pub(crate) fn pre_connect(&self, session_id: u64, app: &str) {
        log::info!("Ingest session {session_id} connected to app '{app}'");
    }

    /// Gate a publish attempt: the trailing path segment must equal the
    /// configured stream key, and only one publisher may be live.
    pub(crate) fn pre_publish(&self, app: &str, stream_name: &str) -> RelayResult<()> {
        let key = self
            .config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .stream_key
            .clone();

        if !key.is_empty() && stream_name != key {
            log::warn!(
                "Rejected publish to '{app}/{stream_name}': stream key '{stream_name}' does not match"
            );
            return Err(RelayError::IngestRejected);
        }

        if self.status() == IngestStatus::Streaming {
            log::warn!("Rejected publish to '{app}/{stream_name}': a publisher is already live");
            return Err(RelayError::IngestRejected);
        }

        *self.status.write().unwrap_or_else(|e| e.into_inner()) = IngestStatus::Connecting;
        self.notify();
        Ok(())
    }

    /// An accepted publish that lost the race for the hub entry.
    pub(crate) fn publish_failed(&self) {
        let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
        if *status == IngestStatus::Connecting {
            *status = IngestStatus::Idle;
            drop(status);
            self.notify();
        }
    }

    /// Publish accepted: record the path actually used and go live.
    pub(crate) fn post_publish(&self, app: &str, stream_name: &str) {
        *self.actual_path.write().unwrap_or_else(|e| e.into_inner()) =
            Some(format!("/{app}/{stream_name}"));
        *self.status.write().unwrap_or_else(|e| e.into_inner()) = IngestStatus::Streaming;
        log::info!("Publish started on /{app}/{stream_name}");
        self.notify();
    }

    /// Publisher went away: clear the observed path and fall back to idle.
    pub(crate) fn done_publish(&self, path: &str) {
        {
            let mut actual = self.actual_path.write().unwrap_or_else(|e| e.into_inner());
            let matches = actual
                .as_deref()
                .map(|current| current.trim_start_matches('/') == path)
                .unwrap_or(false);
            if !matches {
                return;
            }
            *actual = None;
        }
        *self.status.write().unwrap_or_else(|e| e.into_inner()) = IngestStatus::Idle;
        log::info!("Publish ended on /{path}");
        self.notify();
    }
}

impl IngestSource for IngestServer {
    fn loopback_url(&self) -> String {
        let config = self.config.read().unwrap_or_else(|e| e.into_inner());
        format!(
            "rtmp://{}:{}{}",
            loopback_host(&config.host),
            config.port,
            self.stream_path()
        )
    }
}

/// Lifecycle wrapper: activation binds the listener (port conflicts fail
/// activation), deactivation tears it down.
pub struct IngestModule {
    ingest: Arc<IngestServer>,
}

impl IngestModule {
    pub fn new(ingest: Arc<IngestServer>) -> Self {
        Self { ingest }
    }
}

#[async_trait]
impl Module for IngestModule {
    async fn activate(&self) -> RelayResult<()> {
        if self.ingest.config().enabled {
            self.ingest.start_listener().await?;
        }
        Ok(())
    }

    async fn deactivate(&self) -> RelayResult<()> {
        self.ingest.stop_listener();
        Ok(())
    }

    fn status(&self) -> Value {
        json!({
            "listening": self.ingest.is_listening(),
            "ingest": self.ingest.info(),
        })
    }
}
