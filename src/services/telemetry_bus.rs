// Telemetry Bus
// WebSocket hub: status/statistics/log broadcast with batching and debounce

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::models::StreamStats;
use crate::services::{Module, RelayResult};

/// Batch drain cadence and per-tick budget.
const BATCH_INTERVAL: Duration = Duration::from_millis(50);
const BATCH_SIZE: usize = 10;

/// Statistics are debounced: one broadcast per window, changed ids only.
const STATS_DEBOUNCE: Duration = Duration::from_millis(100);

/// Wire envelope for every bus message.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    /// Milliseconds since the epoch
    pub timestamp: i64,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// The WebSocket hub. Exclusively owns the client table; every outbound
/// message passes through the process-global queue and the 50 ms batch
/// drain, except direct per-client replies (`connected`, `pong`).
pub struct TelemetryBus {
    clients: Mutex<HashMap<String, mpsc::UnboundedSender<String>>>,
    queue: Mutex<VecDeque<Envelope>>,
    pending_stats: Mutex<HashMap<String, StreamStats>>,
    changed: Mutex<HashSet<String>>,
    debounce_scheduled: AtomicBool,
    drain_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    /// Captured at construction so child reader threads can schedule the
    /// debounce without a task context of their own.
    runtime: tokio::runtime::Handle,
}

impl TelemetryBus {
    /// Must be constructed inside the tokio runtime.
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            pending_stats: Mutex::new(HashMap::new()),
            changed: Mutex::new(HashSet::new()),
            debounce_scheduled: AtomicBool::new(false),
            drain_task: Mutex::new(None),
            runtime: tokio::runtime::Handle::current(),
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Queue an envelope for broadcast to every connected client.
    pub fn broadcast(&self, envelope: Envelope) {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(envelope);
    }

    pub fn publish_status(&self, status: Value) {
        self.broadcast(Envelope::new("status", status));
    }

    pub fn publish_log(
        &self,
        level: &str,
        message: &str,
        source: Option<&str>,
        platform_id: Option<&str>,
    ) {
        self.broadcast(Envelope::new(
            "log",
            json!({
                "level": level,
                "message": message,
                "source": source,
                "platformId": platform_id,
                "timestamp": chrono::Utc::now().timestamp_millis(),
            }),
        ));
    }

    /// Record fresh statistics for a destination and schedule the debounced
    /// broadcast. Called from child reader threads.
    pub fn publish_stats(self: &Arc<Self>, stats: StreamStats) {
        let id = stats.destination_id.clone();
        self.pending_stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), stats);
        self.changed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id);

        if !self.debounce_scheduled.swap(true, Ordering::SeqCst) {
            let bus = Arc::clone(self);
            self.runtime.spawn(async move {
                tokio::time::sleep(STATS_DEBOUNCE).await;
                bus.flush_stats();
            });
        }
    }

    /// Emit one `statistics` envelope carrying only destinations whose stats
    /// changed since the previous flush, then clear the changed set.
    fn flush_stats(&self) {
        self.debounce_scheduled.store(false, Ordering::SeqCst);

        let changed: Vec<String> = {
            let mut changed = self.changed.lock().unwrap_or_else(|e| e.into_inner());
            changed.drain().collect()
        };
        if changed.is_empty() {
            return;
        }

        let stats: Vec<StreamStats> = {
            let pending = self.pending_stats.lock().unwrap_or_else(|e| e.into_inner());
            changed
                .iter()
                .filter_map(|id| pending.get(id).cloned())
                .collect()
        };
        if stats.is_empty() {
            return;
        }

        match serde_json::to_value(&stats) {
            Ok(data) => self.broadcast(Envelope::new("statistics", data)),
            Err(err) => log::warn!("Failed to serialize statistics batch: {err}"),
        }
    }

    /// Forget a destination's pending statistics (after its session ends).
    pub fn clear_stats(&self, destination_id: &str) {
        self.pending_stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(destination_id);
        self.changed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(destination_id);
    }

    /// One drain tick: up to `BATCH_SIZE` envelopes to every client, dead
    /// clients dropped from the table.
    fn drain_once(&self) {
        let batch: Vec<Envelope> = {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            let take = queue.len().min(BATCH_SIZE);
            queue.drain(..take).collect()
        };
        if batch.is_empty() {
            return;
        }

        let payloads: Vec<String> = batch
            .iter()
            .filter_map(|envelope| serde_json::to_string(envelope).ok())
            .collect();

        let mut dead = Vec::new();
        {
            let clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
            for (client_id, sender) in clients.iter() {
                for payload in &payloads {
                    if sender.send(payload.clone()).is_err() {
                        dead.push(client_id.clone());
                        break;
                    }
                }
            }
        }
        if !dead.is_empty() {
            let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
            for client_id in dead {
                clients.remove(&client_id);
                log::debug!("Dropped dead telemetry client {client_id}");
            }
        }
    }

    /// Serve one WebSocket connection until it closes.
    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let client_id = uuid::Uuid::new_v4().to_string();
        let (mut sink, mut stream) = socket.split();

        let hello = Envelope::new("connected", json!({ "clientId": client_id }));
        if let Ok(payload) = serde_json::to_string(&hello) {
            if sink.send(Message::Text(payload)).await.is_err() {
                return;
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(client_id.clone(), tx.clone());
        log::debug!("Telemetry client {client_id} connected");

        loop {
            tokio::select! {
                outbound = rx.recv() => {
                    match outbound {
                        Some(payload) => {
                            if sink.send(Message::Text(payload)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                inbound = stream.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_client_message(&tx, &text);
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(_)) => break,
                    }
                }
            }
        }

        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&client_id);
        log::debug!("Telemetry client {client_id} disconnected");
    }

    /// Heartbeats and subscription requests. Subscriptions are acknowledged
    /// but the hub does not filter by topic yet.
    fn handle_client_message(&self, reply: &mpsc::UnboundedSender<String>, text: &str) {
        let Ok(message) = serde_json::from_str::<Value>(text) else {
            return;
        };
        let kind = message.get("type").and_then(Value::as_str).unwrap_or("");
        let response = match kind {
            "ping" => Some(Envelope::new("pong", json!({}))),
            "subscribe" => Some(Envelope::new(
                "subscribed",
                json!({ "topics": message.get("topics").cloned().unwrap_or(Value::Null) }),
            )),
            _ => None,
        };
        if let Some(envelope) = response {
            if let Ok(payload) = serde_json::to_string(&envelope) {
                let _ = reply.send(payload);
            }
        }
    }
}

/// Lifecycle: activation starts the batch drain timer, deactivation stops it
/// and forgets the clients.
pub struct TelemetryBusModule {
    bus: Arc<TelemetryBus>,
}

impl TelemetryBusModule {
    pub fn new(bus: Arc<TelemetryBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Module for TelemetryBusModule {
    async fn activate(&self) -> RelayResult<()> {
        let bus = Arc::clone(&self.bus);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(BATCH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                bus.drain_once();
            }
        });
        *self
            .bus
            .drain_task
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    async fn deactivate(&self) -> RelayResult<()> {
        if let Some(handle) = self
            .bus
            .drain_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        self.bus
            .clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }

    fn status(&self) -> Value {
        json!({
            "clients": self.bus.client_count(),
            "queued": self.bus.queue.lock().unwrap_or_else(|e| e.into_inner()).len(),
        })
    }
}
