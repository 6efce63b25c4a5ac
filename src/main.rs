use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, Path, Query, State},
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use governor::{clock::DefaultClock, state::keyed::DefaultKeyedStateStore, Quota, RateLimiter};
use serde::Deserialize;
use serde_json::{json, Value};
use std::{
    net::{IpAddr, SocketAddr},
    num::NonZeroU32,
    sync::{Arc, Mutex, Weak},
    time::{Duration, Instant},
};
use tower_http::{
    compression::{predicate::SizeAbove, CompressionLayer, Predicate},
    cors::CorsLayer,
};

use fancast_server::ingest::{IngestModule, IngestServer};
use fancast_server::models::{AppConfig, StreamStats};
use fancast_server::services::{
    probe_destination, probe_listen_ports, transcoder_available, transcoder_version,
    validate_config, ConfigStore, Module, ModuleRegistry, RelayError, RelayEvents, RelayLogLevel,
    RelayLogger, RelayResult, RelaySupervisor, TelemetryBus, TelemetryBusModule,
};

// ============================================================================
// Constants
// ============================================================================

const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const TRANSCODER_BINARY: &str = "ffmpeg";

/// Token bucket on the control surface: 100 requests per 15 minutes per
/// source address (one token replenished every 9 seconds).
const RATE_LIMIT_BURST: u32 = 100;
const RATE_LIMIT_REPLENISH: Duration = Duration::from_secs(9);

/// `GET /api/platforms` response cache TTL.
const PLATFORMS_CACHE_TTL: Duration = Duration::from_secs(1);

/// Response bodies below this size are not worth compressing.
const COMPRESSION_MIN_BYTES: u16 = 1024;

type ApiRateLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

// ============================================================================
// Application State
// ============================================================================

#[derive(Clone)]
struct AppState {
    config_store: Arc<ConfigStore>,
    supervisor: Arc<RelaySupervisor>,
    ingest: Arc<IngestServer>,
    bus: Arc<TelemetryBus>,
    registry: Arc<ModuleRegistry>,
    rate_limiter: Arc<ApiRateLimiter>,
    platforms_cache: Arc<Mutex<Option<(Instant, Value)>>>,
}

impl AppState {
    fn invalidate_platforms_cache(&self) {
        *self
            .platforms_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn status_value(&self) -> Value {
        json!({
            "destinations": self.supervisor.status_snapshot(),
            "ingest": self.ingest.info(),
        })
    }
}

// ============================================================================
// Supervisor → Bus fan-out
// ============================================================================

/// Bridges supervisor events onto the telemetry bus, composing full status
/// snapshots (destinations + ingest) on every change.
struct StatusFanout {
    bus: Arc<TelemetryBus>,
    supervisor: Weak<RelaySupervisor>,
    ingest: Arc<IngestServer>,
}

impl StatusFanout {
    fn publish_status(&self) {
        let Some(supervisor) = self.supervisor.upgrade() else {
            return;
        };
        self.bus.publish_status(json!({
            "destinations": supervisor.status_snapshot(),
            "ingest": self.ingest.info(),
        }));
    }
}

impl RelayEvents for StatusFanout {
    fn status_changed(&self) {
        self.publish_status();
    }

    fn stats_updated(&self, stats: StreamStats) {
        self.bus.publish_stats(stats);
    }

    fn relay_log(&self, level: RelayLogLevel, message: String, destination_id: Option<String>) {
        self.bus.publish_log(
            level.as_str(),
            &message,
            Some("relay"),
            destination_id.as_deref(),
        );
    }
}

// ============================================================================
// Lifecycle wrappers for components without their own
// ============================================================================

struct ConfigModule {
    store: Arc<ConfigStore>,
}

#[async_trait::async_trait]
impl Module for ConfigModule {
    async fn initialize(&self) -> RelayResult<()> {
        self.store.load()?;
        Ok(())
    }

    fn status(&self) -> Value {
        json!({ "path": self.store.path().display().to_string() })
    }
}

/// Port + transcoder availability checks, run before the ingest and bus
/// come up. A taken port aborts startup; a missing transcoder is only a
/// warning until the first relay start.
struct PreflightModule {
    bindings: Vec<(String, u16)>,
    transcoder: String,
}

#[async_trait::async_trait]
impl Module for PreflightModule {
    async fn activate(&self) -> RelayResult<()> {
        let bindings: Vec<(&str, u16)> = self
            .bindings
            .iter()
            .map(|(host, port)| (host.as_str(), *port))
            .collect();
        probe_listen_ports(&bindings)?;

        if !transcoder_available(&self.transcoder) {
            log::warn!(
                "Transcoder binary '{}' not found on PATH; starting a relay will fail until it is installed",
                self.transcoder
            );
        }
        Ok(())
    }

    fn status(&self) -> Value {
        json!({
            "ports": self.bindings.iter().map(|(_, p)| p).collect::<Vec<_>>(),
            "transcoderAvailable": transcoder_available(&self.transcoder),
        })
    }
}

struct SupervisorModule {
    supervisor: Arc<RelaySupervisor>,
}

#[async_trait::async_trait]
impl Module for SupervisorModule {
    async fn deactivate(&self) -> RelayResult<()> {
        self.supervisor.stop_all();
        Ok(())
    }

    fn status(&self) -> Value {
        json!({ "activeSessions": self.supervisor.active_count() })
    }
}

// ============================================================================
// Error mapping
// ============================================================================

fn error_response(err: RelayError) -> Response {
    let status = match &err {
        RelayError::NotFound(_) => StatusCode::NOT_FOUND,
        RelayError::ConfigInvalid(_) => StatusCode::BAD_REQUEST,
        RelayError::DestinationDisabled(_) => StatusCode::CONFLICT,
        RelayError::IngestRejected => StatusCode::FORBIDDEN,
        RelayError::PortUnavailable(_) => StatusCode::CONFLICT,
        RelayError::TranscoderMissing { .. } => StatusCode::FAILED_DEPENDENCY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let mut body = json!({ "error": err.summary() });
    if let Some(details) = err.details() {
        body["details"] = details;
    }
    (status, Json(body)).into_response()
}

/// Destination ids arriving as path parameters.
fn validate_id_param(id: &str) -> Result<(), Response> {
    if fancast_server::services::is_valid_id(id) {
        Ok(())
    } else {
        Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid destination id" })),
        )
            .into_response())
    }
}

// ============================================================================
// Middleware
// ============================================================================

async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
        .unwrap_or(IpAddr::from([127, 0, 0, 1]));

    match state.rate_limiter.check_key(&ip) {
        Ok(_) => next.run(request).await,
        Err(_) => (
            StatusCode::TOO_MANY_REQUESTS,
            [("retry-after", "9")],
            Json(json!({ "error": "Rate limit exceeded. Please try again later." })),
        )
            .into_response(),
    }
}

// ============================================================================
// Request handlers
// ============================================================================

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().timestamp_millis(),
    }))
}

async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    match state.config_store.load() {
        Ok(_) => Json(json!({ "ready": true })).into_response(),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "ready": false, "error": err.summary() })),
        )
            .into_response(),
    }
}

async fn stream_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.status_value())
}

async fn stream_start(State(state): State<AppState>) -> impl IntoResponse {
    let started = state.supervisor.start_all();
    Json(json!({ "started": started }))
}

async fn stream_stop(State(state): State<AppState>) -> impl IntoResponse {
    state.supervisor.stop_all();
    Json(json!({ "stopped": true }))
}

async fn stream_connect(State(state): State<AppState>) -> Response {
    match state.ingest.start_listener().await {
        Ok(()) => Json(json!({ "connected": true })).into_response(),
        Err(err) => error_response(err),
    }
}

async fn stream_disconnect(State(state): State<AppState>) -> impl IntoResponse {
    state.ingest.stop_listener();
    Json(json!({ "disconnected": true }))
}

async fn platforms_list(State(state): State<AppState>) -> Response {
    {
        let cache = state
            .platforms_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some((at, value)) = cache.as_ref() {
            if at.elapsed() < PLATFORMS_CACHE_TTL {
                return Json(value.clone()).into_response();
            }
        }
    }

    let config = match state.config_store.load() {
        Ok(config) => config,
        Err(err) => return error_response(err),
    };
    let masked: Vec<_> = config
        .stream_manager
        .platforms
        .iter()
        .map(|platform| platform.masked())
        .collect();
    let value = json!({ "platforms": masked });

    *state
        .platforms_cache
        .lock()
        .unwrap_or_else(|e| e.into_inner()) = Some((Instant::now(), value.clone()));
    Json(value).into_response()
}

async fn platform_connect(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    if let Err(response) = validate_id_param(&id) {
        return response;
    }
    match state.supervisor.start(&id) {
        Ok(()) => {
            state.invalidate_platforms_cache();
            Json(json!({ "id": id, "started": true })).into_response()
        }
        Err(err) => error_response(err),
    }
}

async fn platform_disconnect(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    if let Err(response) = validate_id_param(&id) {
        return response;
    }
    match state.supervisor.stop(&id) {
        Ok(()) => {
            state.invalidate_platforms_cache();
            Json(json!({ "id": id, "stopped": true })).into_response()
        }
        Err(err) => error_response(err),
    }
}

async fn platform_test(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if let Err(response) = validate_id_param(&id) {
        return response;
    }
    let config = match state.config_store.load() {
        Ok(config) => config,
        Err(err) => return error_response(err),
    };
    let Some(platform) = config
        .stream_manager
        .platforms
        .iter()
        .find(|p| p.id == id)
    else {
        return error_response(RelayError::NotFound(id));
    };

    match probe_destination(&platform.rtmp_url).await {
        Ok(result) => Json(json!(result)).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct ConfigQuery {
    #[serde(default, alias = "includeKeys")]
    include_keys: bool,
}

async fn config_get(
    State(state): State<AppState>,
    Query(query): Query<ConfigQuery>,
) -> Response {
    match state.config_store.load() {
        Ok(mut config) => {
            if !query.include_keys {
                mask_config(&mut config);
            }
            Json(json!(config)).into_response()
        }
        Err(err) => error_response(err),
    }
}

async fn config_post(State(state): State<AppState>, Json(mut config): Json<AppConfig>) -> Response {
    for platform in &mut config.stream_manager.platforms {
        platform.ensure_id();
    }
    if let Err(err) = validate_config(&config) {
        return error_response(err);
    }

    let previous_ingest = state.ingest.config();

    if let Err(err) = state.config_store.save(&config).await {
        return error_response(err);
    }
    state.invalidate_platforms_cache();

    state
        .supervisor
        .configure(config.stream_manager.platforms.clone());

    // The ingest restarts only when its binding or publish path changed
    let new_ingest = config.stream_manager.rtmp_server.clone();
    if new_ingest != previous_ingest {
        if let Err(err) = state.ingest.reconfigure(new_ingest).await {
            return error_response(err);
        }
    }

    let mut saved = config;
    mask_config(&mut saved);
    Json(json!(saved)).into_response()
}

async fn system_transcoder() -> Response {
    match transcoder_version(TRANSCODER_BINARY) {
        Ok(version) => Json(json!({ "available": true, "version": version })).into_response(),
        Err(err) => error_response(err),
    }
}

async fn system_modules(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.status_snapshot())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let bus = Arc::clone(&state.bus);
    ws.on_upgrade(move |socket| bus.handle_socket(socket))
}

/// Hide stream keys in an outbound config document.
fn mask_config(config: &mut AppConfig) {
    if !config.stream_manager.rtmp_server.stream_key.is_empty() {
        config.stream_manager.rtmp_server.stream_key = "********".to_string();
    }
    for platform in &mut config.stream_manager.platforms {
        if !platform.stream_key.is_empty() {
            platform.stream_key = "********".to_string();
        }
    }
}

// ============================================================================
// Wiring
// ============================================================================

fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/stream/status", get(stream_status))
        .route("/stream/start", post(stream_start))
        .route("/stream/stop", post(stream_stop))
        .route("/stream/connect", post(stream_connect))
        .route("/stream/disconnect", post(stream_disconnect))
        .route("/platforms", get(platforms_list))
        .route("/platforms/:id/connect", post(platform_connect))
        .route("/platforms/:id/disconnect", post(platform_disconnect))
        .route("/platforms/:id/test", post(platform_test))
        .route("/config", get(config_get).post(config_post))
        .route("/system/transcoder", get(system_transcoder))
        .route("/system/modules", get(system_modules));

    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/ws", get(ws_handler))
        .nest("/api", api)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .layer(
            CompressionLayer::new()
                .compress_when(SizeAbove::new(COMPRESSION_MIN_BYTES).and(
                    tower_http::compression::predicate::NotForContentType::new("text/event-stream"),
                )),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() {
    let config_path = ConfigStore::path_from_env(DEFAULT_CONFIG_PATH);
    let config_store = Arc::new(ConfigStore::new(config_path));

    let config = match config_store.load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Fatal: failed to load configuration: {err}");
            std::process::exit(1);
        }
    };

    let bus = Arc::new(TelemetryBus::new());
    let debug = config.ui.debug;
    if let Err(err) = RelayLogger::init(Arc::clone(&bus), debug) {
        eprintln!("Fatal: failed to install logger: {err}");
        std::process::exit(1);
    }

    let ingest = Arc::new(IngestServer::new(config.stream_manager.rtmp_server.clone()));
    let supervisor = Arc::new(RelaySupervisor::new(
        TRANSCODER_BINARY,
        Arc::clone(&ingest) as Arc<dyn fancast_server::services::IngestSource>,
    ));
    supervisor.configure(config.stream_manager.platforms.clone());

    let fanout = Arc::new(StatusFanout {
        bus: Arc::clone(&bus),
        supervisor: Arc::downgrade(&supervisor),
        ingest: Arc::clone(&ingest),
    });
    supervisor.set_events(Arc::clone(&fanout) as Arc<dyn RelayEvents>);

    // Ingest status changes ride the same status envelope
    {
        let fanout = Arc::clone(&fanout);
        ingest.subscribe(move |_info| fanout.publish_status());
    }

    // Module registry: registration order is dependency order; teardown runs
    // in reverse.
    let registry = Arc::new(ModuleRegistry::new());
    let register_result = (|| {
        let store = Arc::clone(&config_store);
        registry.register("config-store", &[], &["config"], move || {
            Arc::new(ConfigModule {
                store: Arc::clone(&store),
            }) as Arc<dyn Module>
        })?;

        let bindings = vec![
            (config.ui.host.clone(), config.ui.port),
            (
                config.stream_manager.rtmp_server.host.clone(),
                config.stream_manager.rtmp_server.port,
            ),
        ];
        registry.register("preflight", &["config"], &["preflight"], move || {
            Arc::new(PreflightModule {
                bindings: bindings.clone(),
                transcoder: TRANSCODER_BINARY.to_string(),
            }) as Arc<dyn Module>
        })?;

        let bus_handle = Arc::clone(&bus);
        registry.register(
            "telemetry-bus",
            &["config", "preflight"],
            &["telemetry-bus"],
            move || Arc::new(TelemetryBusModule::new(Arc::clone(&bus_handle))) as Arc<dyn Module>,
        )?;

        let ingest_handle = Arc::clone(&ingest);
        registry.register(
            "rtmp-ingest",
            &["config", "preflight"],
            &["ingest"],
            move || Arc::new(IngestModule::new(Arc::clone(&ingest_handle))) as Arc<dyn Module>,
        )?;

        let supervisor_handle = Arc::clone(&supervisor);
        registry.register(
            "relay-supervisor",
            &["ingest", "telemetry-bus"],
            &["supervisor"],
            move || {
                Arc::new(SupervisorModule {
                    supervisor: Arc::clone(&supervisor_handle),
                }) as Arc<dyn Module>
            },
        )?;
        Ok::<(), RelayError>(())
    })();
    if let Err(err) = register_result {
        eprintln!("Fatal: module registration failed: {err}");
        std::process::exit(1);
    }

    if let Err(err) = registry.initialize_all().await {
        eprintln!("Fatal: initialization failed: {err}");
        std::process::exit(1);
    }
    if let Err(err) = registry.activate_all().await {
        eprintln!("Fatal: activation failed: {err}");
        std::process::exit(1);
    }

    // Hot-reload: mtime watcher re-applies destinations and the ingest
    // binding on external edits.
    {
        let supervisor = Arc::clone(&supervisor);
        let ingest = Arc::clone(&ingest);
        let runtime = tokio::runtime::Handle::current();
        config_store.watch(move |new_config| {
            log::info!("Configuration file changed, applying");
            supervisor.configure(new_config.stream_manager.platforms.clone());
            let ingest = Arc::clone(&ingest);
            let rtmp = new_config.stream_manager.rtmp_server.clone();
            runtime.spawn(async move {
                if let Err(err) = ingest.reconfigure(rtmp).await {
                    log::error!("Failed to apply new ingest configuration: {err}");
                }
            });
        });
    }

    let state = AppState {
        config_store: Arc::clone(&config_store),
        supervisor: Arc::clone(&supervisor),
        ingest: Arc::clone(&ingest),
        bus: Arc::clone(&bus),
        registry: Arc::clone(&registry),
        rate_limiter: Arc::new(RateLimiter::keyed(
            Quota::with_period(RATE_LIMIT_REPLENISH)
                .expect("non-zero replenish period")
                .allow_burst(NonZeroU32::new(RATE_LIMIT_BURST).expect("non-zero burst")),
        )),
        platforms_cache: Arc::new(Mutex::new(None)),
    };

    let app = build_router(state);
    let bind_addr = format!("{}:{}", config.ui.host, config.ui.port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("Fatal: cannot bind control listener on {bind_addr}: {err}");
            std::process::exit(1);
        }
    };
    log::info!("Control plane listening on http://{bind_addr}");

    let serve_result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    log::info!("Shutting down");
    for err in registry.deactivate_all().await {
        log::warn!("Deactivation error: {err}");
    }
    for err in registry.destroy_all().await {
        log::warn!("Destroy error: {err}");
    }

    if let Err(err) = serve_result {
        eprintln!("Control listener error: {err}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fancast_server::models::Destination;
    use std::collections::HashMap;

    #[test]
    fn test_mask_config_hides_all_keys() {
        let mut config = AppConfig::default();
        config.stream_manager.rtmp_server.stream_key = "ingest-secret".to_string();
        config.stream_manager.platforms.push(Destination {
            id: "a".to_string(),
            name: "twitch".to_string(),
            display_name: None,
            rtmp_url: "rtmp://live.twitch.tv/app".to_string(),
            stream_key: "live_secret".to_string(),
            enabled: true,
            metadata: HashMap::new(),
        });

        mask_config(&mut config);
        assert_eq!(config.stream_manager.rtmp_server.stream_key, "********");
        assert_eq!(config.stream_manager.platforms[0].stream_key, "********");
    }

    #[test]
    fn test_error_mapping() {
        let not_found = error_response(RelayError::NotFound("x".to_string()));
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let invalid = error_response(RelayError::ConfigInvalid(vec![]));
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
    }
}
