// Relay Events
// Seam between the supervisor and whoever is observing it

use crate::models::StreamStats;

/// Log severity carried on relay events (maps onto `log::Level` but stays
/// serializable and ordering-free).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayLogLevel {
    Info,
    Warn,
    Error,
}

impl RelayLogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            RelayLogLevel::Info => "info",
            RelayLogLevel::Warn => "warn",
            RelayLogLevel::Error => "error",
        }
    }
}

/// Events the relay supervisor raises while sessions come and go.
///
/// Implementations must not block: these are invoked from supervisor state
/// changes and from child stderr reader threads.
pub trait RelayEvents: Send + Sync {
    /// Per-destination state changed; observers should re-derive and publish
    /// a status snapshot.
    fn status_changed(&self);

    /// Fresh statistics were parsed for a destination.
    fn stats_updated(&self, stats: StreamStats);

    /// A noteworthy per-destination event (child spawn, exit, error).
    fn relay_log(&self, level: RelayLogLevel, message: String, destination_id: Option<String>);
}

/// Sink that drops everything; used before wiring and in tests.
pub struct NoopRelayEvents;

impl RelayEvents for NoopRelayEvents {
    fn status_changed(&self) {}
    fn stats_updated(&self, _stats: StreamStats) {}
    fn relay_log(&self, _level: RelayLogLevel, _message: String, _destination_id: Option<String>) {}
}
