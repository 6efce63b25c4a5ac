// Relay Supervisor
// Per-destination transcoder child processes: spawn, observe, stop

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use crate::models::{parse_stats_line, Destination, StreamStats};
use crate::services::{
    compose_publish_url, redact_text, resolve_stream_key, NoopRelayEvents, RelayError,
    RelayEvents, RelayLogLevel, RelayResult,
};

// Windows: hide console windows for spawned processes
#[cfg(windows)]
use std::os::windows::process::CommandExt;
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Grace window between asking the child to quit and killing it.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Reader counters roll over at this threshold; bytes are counted, never
/// buffered.
const OUTPUT_COUNTER_ROLLOVER: u64 = 1024 * 1024;

/// Where relay children read the ingest stream from.
pub trait IngestSource: Send + Sync {
    /// Loopback RTMP URL covering the currently observed publish path.
    fn loopback_url(&self) -> String;
}

/// Projected state for one destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationStatus {
    Idle,
    Connected,
    Streaming,
}

/// Per-destination entry of `status_snapshot`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationSnapshot {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub url: String,
    pub enabled: bool,
    pub status: DestinationStatus,
    pub connected: bool,
    pub streaming: bool,
}

/// One destination's active transfer. Exclusively owns the child process;
/// the handle leaves the table before anything waits on the child.
struct RelaySession {
    child: Child,
    flags: Arc<SessionFlags>,
}

/// Supervisor-owned state flags, shared with the stderr reader thread.
struct SessionFlags {
    connected: AtomicBool,
    streaming: AtomicBool,
}

impl SessionFlags {
    fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            streaming: AtomicBool::new(false),
        }
    }

    fn clear(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.streaming.store(false, Ordering::SeqCst);
    }
}

/// Supervises one relay child per started destination.
///
/// All session state is keyed by destination id; two destinations sharing a
/// platform name never share a session, a child, or reported state.
pub struct RelaySupervisor {
    transcoder_path: String,
    ingest: Arc<dyn IngestSource>,
    destinations: RwLock<DestinationTable>,
    sessions: Arc<Mutex<HashMap<String, RelaySession>>>,
    stopping: Arc<Mutex<HashSet<String>>>,
    latest_stats: Arc<Mutex<HashMap<String, StreamStats>>>,
    events: Arc<RwLock<Arc<dyn RelayEvents>>>,
}

#[derive(Default)]
struct DestinationTable {
    by_id: HashMap<String, Destination>,
    /// Platform name → first destination id carrying it
    by_name: HashMap<String, String>,
    /// Registration order, for stable snapshots
    order: Vec<String>,
}

impl DestinationTable {
    fn rebuild(&mut self, destinations: Vec<Destination>) {
        self.by_id.clear();
        self.by_name.clear();
        self.order.clear();
        for dest in destinations {
            self.by_name.entry(dest.name.clone()).or_insert_with(|| dest.id.clone());
            self.order.push(dest.id.clone());
            self.by_id.insert(dest.id.clone(), dest);
        }
    }

    fn find(&self, id_or_name: &str) -> Option<&Destination> {
        if let Some(dest) = self.by_id.get(id_or_name) {
            return Some(dest);
        }
        self.by_name
            .get(id_or_name)
            .and_then(|id| self.by_id.get(id))
    }
}

impl RelaySupervisor {
    pub fn new(transcoder_path: impl Into<String>, ingest: Arc<dyn IngestSource>) -> Self {
        Self {
            transcoder_path: transcoder_path.into(),
            ingest,
            destinations: RwLock::new(DestinationTable::default()),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            stopping: Arc::new(Mutex::new(HashSet::new())),
            latest_stats: Arc::new(Mutex::new(HashMap::new())),
            events: Arc::new(RwLock::new(Arc::new(NoopRelayEvents) as Arc<dyn RelayEvents>)),
        }
    }

    /// Wire the observer after construction (the observer usually needs a
    /// handle back to the supervisor to compose status snapshots).
    pub fn set_events(&self, events: Arc<dyn RelayEvents>) {
        *self.events.write().unwrap_or_else(|e| e.into_inner()) = events;
    }

    fn events(&self) -> Arc<dyn RelayEvents> {
        Arc::clone(&self.events.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn transcoder_path(&self) -> &str {
        &self.transcoder_path
    }

    /// Replace the destination set. Running sessions keep their ids; a
    /// session whose destination disappeared simply stops being reported.
    pub fn configure(&self, destinations: Vec<Destination>) {
        self.destinations
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .rebuild(destinations);
        self.events().status_changed();
    }

    /// Start relaying to a destination, by id or platform name. Starting an
    /// already-running destination succeeds without touching its session.
    pub fn start(&self, id_or_name: &str) -> RelayResult<()> {
        let dest = {
            let table = self.destinations.read().unwrap_or_else(|e| e.into_inner());
            table
                .find(id_or_name)
                .cloned()
                .ok_or_else(|| RelayError::NotFound(id_or_name.to_string()))?
        };

        {
            let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            if sessions.contains_key(&dest.id) {
                return Ok(());
            }
        }

        if !dest.enabled {
            return Err(RelayError::DestinationDisabled(dest.id));
        }

        ensure_transcoder_available(&self.transcoder_path)?;

        let input_url = self.ingest.loopback_url();
        let output_url =
            compose_publish_url(&dest.rtmp_url, &resolve_stream_key(&dest.stream_key));
        let args = build_relay_args(&input_url, &output_url);

        log::info!(
            "Starting relay child for destination {}: {} {}",
            dest.id,
            self.transcoder_path,
            redact_text(&args.join(" "))
        );

        let mut cmd = Command::new(&self.transcoder_path);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);
        let mut child = cmd.spawn()?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let flags = Arc::new(SessionFlags::new());

        {
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            if sessions.contains_key(&dest.id) {
                // Lost a start race; the session that got there first wins
                drop(sessions);
                let _ = child.kill();
                let _ = child.wait();
                return Ok(());
            }
            sessions.insert(
                dest.id.clone(),
                RelaySession {
                    child,
                    flags: Arc::clone(&flags),
                },
            );
        }

        if let Some(stdout) = stdout {
            thread::spawn(move || consume_counted(stdout));
        }
        if let Some(stderr) = stderr {
            let reader_ctx = StderrReaderContext {
                destination_id: dest.id.clone(),
                flags,
                sessions: Arc::clone(&self.sessions),
                stopping: Arc::clone(&self.stopping),
                latest_stats: Arc::clone(&self.latest_stats),
                events: Arc::clone(&self.events),
            };
            thread::spawn(move || stderr_reader(stderr, reader_ctx));
        }

        let events = self.events();
        events.relay_log(
            RelayLogLevel::Info,
            format!("Relay started for destination {}", dest.id),
            Some(dest.id.clone()),
        );
        events.status_changed();
        Ok(())
    }

    /// Stop relaying to a destination. The session leaves the table and the
    /// flags drop before the child is signaled, so status queries reflect
    /// intent immediately; the child's exit is handled asynchronously.
    pub fn stop(&self, id_or_name: &str) -> RelayResult<()> {
        let id = {
            let table = self.destinations.read().unwrap_or_else(|e| e.into_inner());
            table
                .find(id_or_name)
                .map(|d| d.id.clone())
                .unwrap_or_else(|| id_or_name.to_string())
        };

        let removed = {
            let mut stopping = self.stopping.lock().unwrap_or_else(|e| e.into_inner());
            stopping.insert(id.clone());
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions.remove(&id)
        };

        self.latest_stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);

        let Some(session) = removed else {
            // Already stopped; nothing left to signal
            self.stopping
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id);
            return Ok(());
        };

        session.flags.clear();
        self.events().status_changed();

        let events = Arc::clone(&self.events);
        let destination_id = id.clone();
        let mut child = session.child;
        thread::spawn(move || {
            let code = shutdown_child(&mut child);
            let events = Arc::clone(&events.read().unwrap_or_else(|e| e.into_inner()));
            match code {
                Some(0) => {
                    log::info!("Relay child for {destination_id} exited cleanly");
                    events.relay_log(
                        RelayLogLevel::Info,
                        format!("Relay stopped for destination {destination_id}"),
                        Some(destination_id.clone()),
                    );
                }
                code => {
                    let err = RelayError::ChildExit {
                        destination_id: destination_id.clone(),
                        code,
                    };
                    log::error!("{err}");
                    events.relay_log(RelayLogLevel::Error, err.to_string(), Some(destination_id.clone()));
                }
            }
        });

        Ok(())
    }

    /// Start every enabled destination, best effort; failures are logged and
    /// do not stop the sweep.
    pub fn start_all(&self) -> usize {
        let ids: Vec<String> = {
            let table = self.destinations.read().unwrap_or_else(|e| e.into_inner());
            table
                .order
                .iter()
                .filter(|id| table.by_id.get(*id).map(|d| d.enabled).unwrap_or(false))
                .cloned()
                .collect()
        };

        let mut started = 0;
        for id in ids {
            match self.start(&id) {
                Ok(()) => started += 1,
                Err(err) => log::warn!("Failed to start destination {id}: {err}"),
            }
        }
        started
    }

    /// Stop every running session.
    pub fn stop_all(&self) {
        let ids: Vec<String> = {
            let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions.keys().cloned().collect()
        };
        for id in ids {
            let _ = self.stop(&id);
        }
    }

    /// Number of live sessions.
    pub fn active_count(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    /// Latest parsed statistics for every destination that has some.
    pub fn stats_snapshot(&self) -> Vec<StreamStats> {
        self.latest_stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Project per-destination status from the supervisor's own flags. The
    /// child's exit code never enters into it: once `stop` has run, the
    /// destination reads `idle` even while the child is still exiting.
    pub fn status_snapshot(&self) -> Vec<DestinationSnapshot> {
        let table = self.destinations.read().unwrap_or_else(|e| e.into_inner());
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());

        table
            .order
            .iter()
            .filter_map(|id| table.by_id.get(id))
            .map(|dest| {
                let session = sessions.get(&dest.id);
                let connected = session
                    .map(|s| s.flags.connected.load(Ordering::SeqCst))
                    .unwrap_or(false);
                let streaming = session
                    .map(|s| s.flags.streaming.load(Ordering::SeqCst))
                    .unwrap_or(false);
                let alive = session.is_some();

                let status = if !streaming && !connected {
                    DestinationStatus::Idle
                } else if alive && streaming {
                    DestinationStatus::Streaming
                } else if alive && connected {
                    DestinationStatus::Connected
                } else {
                    DestinationStatus::Idle
                };

                DestinationSnapshot {
                    id: dest.id.clone(),
                    name: dest.name.clone(),
                    display_name: dest.display_name.clone(),
                    url: dest.rtmp_url.clone(),
                    enabled: dest.enabled,
                    status,
                    connected,
                    streaming,
                }
            })
            .collect()
    }
}

struct StderrReaderContext {
    destination_id: String,
    flags: Arc<SessionFlags>,
    sessions: Arc<Mutex<HashMap<String, RelaySession>>>,
    stopping: Arc<Mutex<HashSet<String>>>,
    latest_stats: Arc<Mutex<HashMap<String, StreamStats>>>,
    events: Arc<RwLock<Arc<dyn RelayEvents>>>,
}

/// Reads child stderr line by line, feeding the telemetry parser and the
/// event sink, then handles the child's end of stream.
fn stderr_reader(stderr: std::process::ChildStderr, ctx: StderrReaderContext) {
    let reader = BufReader::new(stderr);
    let mut counted: u64 = 0;

    for line in reader.lines().map_while(Result::ok) {
        counted += line.len() as u64 + 1;
        if counted > OUTPUT_COUNTER_ROLLOVER {
            counted = 0;
        }

        if let Some(parsed) = parse_stats_line(&line) {
            // Progress fields mean bytes are flowing; codec/resolution info
            // lines alone do not.
            if parsed.frame.is_some()
                || parsed.fps.is_some()
                || parsed.bitrate.is_some()
                || parsed.time_seconds.is_some()
                || parsed.speed.is_some()
                || parsed.size.is_some()
            {
                ctx.flags.streaming.store(true, Ordering::SeqCst);
            }
            let snapshot = {
                let mut stats = ctx.latest_stats.lock().unwrap_or_else(|e| e.into_inner());
                let entry = stats
                    .entry(ctx.destination_id.clone())
                    .or_insert_with(|| StreamStats::new(ctx.destination_id.clone()));
                entry.apply(&parsed);
                entry.clone()
            };
            let events = Arc::clone(&ctx.events.read().unwrap_or_else(|e| e.into_inner()));
            events.stats_updated(snapshot);
            continue;
        }

        if line.contains("error") || line.contains("Error") || line.contains("failed") {
            log::warn!("[relay:{}] {}", ctx.destination_id, redact_text(&line));
        }
    }

    // Child closed its stderr: either a stop is in flight or the child died
    // on its own.
    let was_stopping = ctx
        .stopping
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&ctx.destination_id);
    if was_stopping {
        return;
    }

    let removed = ctx
        .sessions
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&ctx.destination_id);
    let Some(mut session) = removed else {
        // Session already gone; a concurrent stop owns the child now
        return;
    };

    session.flags.clear();
    let code = match session.child.try_wait() {
        Ok(Some(status)) => status.code(),
        _ => session.child.wait().ok().and_then(|s| s.code()),
    };

    ctx.latest_stats
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&ctx.destination_id);

    let err = RelayError::ChildExit {
        destination_id: ctx.destination_id.clone(),
        code,
    };
    log::error!("{err}");

    let events = Arc::clone(&ctx.events.read().unwrap_or_else(|e| e.into_inner()));
    events.relay_log(RelayLogLevel::Error, err.to_string(), Some(ctx.destination_id.clone()));
    events.status_changed();
}

/// Drain a child output stream, counting bytes only. The counter rolls over
/// at 1 MiB; nothing is retained.
fn consume_counted(mut stream: impl Read) {
    let mut buf = [0u8; 8192];
    let mut counted: u64 = 0;
    loop {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                counted += n as u64;
                if counted > OUTPUT_COUNTER_ROLLOVER {
                    counted = 0;
                }
            }
        }
    }
}

/// Ask the child to quit, give it a short grace period, then kill it.
/// Returns the exit code when one could be collected.
fn shutdown_child(child: &mut Child) -> Option<i32> {
    if let Some(stdin) = child.stdin.as_mut() {
        let _ = stdin.write_all(b"q\n");
        let _ = stdin.flush();
    }

    let start = Instant::now();
    while start.elapsed() < STOP_GRACE {
        if let Ok(Some(status)) = child.try_wait() {
            return status.code();
        }
        thread::sleep(Duration::from_millis(100));
    }

    let _ = child.kill();
    child.wait().ok().and_then(|s| s.code())
}

/// Build the stream-copy argv for one relay child.
pub fn build_relay_args(input_url: &str, output_url: &str) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "info".into(),
        "-i".into(),
        input_url.into(),
        "-c:v".into(),
        "copy".into(),
        "-c:a".into(),
        "copy".into(),
        "-threads".into(),
        "2".into(),
        "-stats".into(),
    ];

    if output_url.starts_with("rtmps://") {
        args.extend([
            "-protocol_whitelist".into(),
            "rtmp,rtmps,file,http,https,tcp,tls".into(),
            "-reconnect_at_eof".into(),
            "1".into(),
            "-reconnect_delay_max".into(),
            "2".into(),
            "-bufsize".into(),
            "384k".into(),
        ]);
    }

    args.extend(["-f".into(), "flv".into(), output_url.into()]);
    args
}

/// Verify the transcoder binary can be found before spawning. Absolute and
/// relative paths are checked directly; bare names are searched on PATH.
pub fn ensure_transcoder_available(binary: &str) -> RelayResult<()> {
    if transcoder_available(binary) {
        Ok(())
    } else {
        Err(RelayError::TranscoderMissing {
            binary: binary.to_string(),
        })
    }
}

pub fn transcoder_available(binary: &str) -> bool {
    let path = Path::new(binary);
    if path.components().count() > 1 {
        return path.is_file();
    }

    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| {
        let candidate = dir.join(binary);
        if candidate.is_file() {
            return true;
        }
        #[cfg(windows)]
        {
            return dir.join(format!("{binary}.exe")).is_file();
        }
        #[cfg(not(windows))]
        false
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    struct FixedIngest;

    impl IngestSource for FixedIngest {
        fn loopback_url(&self) -> String {
            "rtmp://127.0.0.1:1935/live/obs".to_string()
        }
    }

    fn destination(id: &str, name: &str, url: &str, key: &str, enabled: bool) -> Destination {
        Destination {
            id: id.to_string(),
            name: name.to_string(),
            display_name: None,
            rtmp_url: url.to_string(),
            stream_key: key.to_string(),
            enabled,
            metadata: StdHashMap::new(),
        }
    }

    /// A fake transcoder that ignores its arguments and sleeps, so session
    /// bookkeeping can be observed without a real transcoder.
    #[cfg(unix)]
    fn fake_transcoder(dir: &std::path::Path) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-transcoder");
        std::fs::write(&path, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    #[test]
    fn test_rtmps_argv_carries_protocol_whitelist() {
        let args = build_relay_args(
            "rtmp://127.0.0.1:1935/live/obs",
            &compose_publish_url("rtmps://fa723.global-contribute.live-video.net", "sk_abc"),
        );

        let joined = args.join(" ");
        assert!(joined.contains(
            "-protocol_whitelist rtmp,rtmps,file,http,https,tcp,tls"
        ));
        assert!(joined
            .contains("rtmps://fa723.global-contribute.live-video.net/app/sk_abc"));
        assert!(joined.contains("-c:v copy"));
        assert!(joined.contains("-c:a copy"));
        assert!(joined.contains("-threads 2"));
        assert!(joined.contains("-f flv"));
    }

    #[test]
    fn test_rtmp_argv_has_no_whitelist() {
        let args = build_relay_args(
            "rtmp://127.0.0.1:1935/live/obs",
            "rtmp://live.twitch.tv/app/key",
        );
        assert!(!args.iter().any(|a| a == "-protocol_whitelist"));
    }

    #[test]
    fn test_unknown_destination() {
        let supervisor = RelaySupervisor::new("ffmpeg", Arc::new(FixedIngest));
        assert!(matches!(
            supervisor.start("nope"),
            Err(RelayError::NotFound(_))
        ));
        // Stop of an unknown/stopped destination is a no-op
        assert!(supervisor.stop("nope").is_ok());
    }

    #[test]
    fn test_disabled_destination_cannot_start() {
        let supervisor = RelaySupervisor::new("ffmpeg", Arc::new(FixedIngest));
        supervisor.configure(vec![destination(
            "a",
            "twitch",
            "rtmp://live.twitch.tv/app",
            "k",
            false,
        )]);
        assert!(matches!(
            supervisor.start("a"),
            Err(RelayError::DestinationDisabled(_))
        ));
    }

    #[test]
    fn test_missing_transcoder_is_fatal_at_start() {
        let supervisor =
            RelaySupervisor::new("definitely-not-a-real-binary-7f3a", Arc::new(FixedIngest));
        supervisor.configure(vec![destination(
            "a",
            "twitch",
            "rtmp://live.twitch.tv/app",
            "k",
            true,
        )]);
        let err = supervisor.start("a").unwrap_err();
        assert!(matches!(err, RelayError::TranscoderMissing { .. }));
        assert!(err.to_string().contains("install"));
    }

    #[cfg(unix)]
    #[test]
    fn test_same_name_destinations_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor =
            RelaySupervisor::new(fake_transcoder(dir.path()), Arc::new(FixedIngest));
        supervisor.configure(vec![
            destination("a", "twitch", "rtmp://live.twitch.tv/app", "X", true),
            destination("b", "twitch", "rtmp://live.twitch.tv/app", "Y", true),
        ]);

        supervisor.start("a").unwrap();
        supervisor.start("b").unwrap();
        assert_eq!(supervisor.active_count(), 2);

        supervisor.stop("b").unwrap();

        assert!(supervisor.is_active("a"));
        assert!(!supervisor.is_active("b"));

        let snapshot = supervisor.status_snapshot();
        let by_id: StdHashMap<&str, &DestinationSnapshot> =
            snapshot.iter().map(|s| (s.id.as_str(), s)).collect();
        assert_ne!(by_id["a"].status, DestinationStatus::Idle);
        assert_eq!(by_id["b"].status, DestinationStatus::Idle);

        supervisor.stop_all();
        assert_eq!(supervisor.active_count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_double_start_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor =
            RelaySupervisor::new(fake_transcoder(dir.path()), Arc::new(FixedIngest));
        supervisor.configure(vec![destination(
            "a",
            "twitch",
            "rtmp://live.twitch.tv/app",
            "X",
            true,
        )]);

        supervisor.start("a").unwrap();
        supervisor.start("a").unwrap();
        assert_eq!(supervisor.active_count(), 1);

        supervisor.stop_all();
    }

    #[cfg(unix)]
    #[test]
    fn test_stop_projects_idle_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor =
            RelaySupervisor::new(fake_transcoder(dir.path()), Arc::new(FixedIngest));
        supervisor.configure(vec![destination(
            "a",
            "twitch",
            "rtmp://live.twitch.tv/app",
            "X",
            true,
        )]);

        supervisor.start("a").unwrap();
        supervisor.stop("a").unwrap();

        // The fake child takes its time to exit; the snapshot must already
        // read idle because the supervisor's own flags say so.
        let snapshot = supervisor.status_snapshot();
        assert_eq!(snapshot[0].status, DestinationStatus::Idle);
        assert!(!snapshot[0].connected);
        assert!(!snapshot[0].streaming);
    }

    #[cfg(unix)]
    #[test]
    fn test_start_by_platform_name() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor =
            RelaySupervisor::new(fake_transcoder(dir.path()), Arc::new(FixedIngest));
        supervisor.configure(vec![
            destination("a", "twitch", "rtmp://live.twitch.tv/app", "X", true),
            destination("b", "twitch", "rtmp://live.twitch.tv/app", "Y", true),
        ]);

        // Name resolves to the first destination carrying it
        supervisor.start("twitch").unwrap();
        assert!(supervisor.is_active("a"));
        assert!(!supervisor.is_active("b"));

        supervisor.stop_all();
    }

    #[test]
    fn test_transcoder_lookup() {
        assert!(!transcoder_available("definitely-not-a-real-binary-7f3a"));
        #[cfg(unix)]
        assert!(transcoder_available("sh"));
    }
}
