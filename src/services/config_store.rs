// Config Store
// Handles the persisted YAML configuration: load/save/watch with caching

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant, SystemTime};

use crate::models::AppConfig;
use crate::services::{FieldError, RelayError, RelayResult};

/// How long a cached snapshot stays valid without re-parsing.
const CACHE_TTL: Duration = Duration::from_secs(1);

/// Poll interval for `watch`.
const WATCH_INTERVAL: Duration = Duration::from_secs(1);

struct CacheEntry {
    mtime: Option<SystemTime>,
    loaded_at: Instant,
    config: AppConfig,
}

/// Owns the on-disk configuration document.
///
/// The config path is injected (first-run scaffolding is an installer
/// concern); an absent file is treated as the built-in defaults. Reads go
/// through an `(absolute path, mtime)`-keyed cache with a 1 s TTL so hot
/// callers never re-parse an unchanged file.
pub struct ConfigStore {
    path: PathBuf,
    cache: Mutex<Option<CacheEntry>>,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(None),
        }
    }

    /// Resolve the config path from `CONFIG_PATH`, falling back to the given
    /// default.
    pub fn path_from_env(default: &str) -> PathBuf {
        std::env::var("CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(default))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the configuration, consulting the cache first.
    pub fn load(&self) -> RelayResult<AppConfig> {
        let mtime = file_mtime(&self.path);

        {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = cache.as_ref() {
                if entry.mtime == mtime && entry.loaded_at.elapsed() < CACHE_TTL {
                    return Ok(entry.config.clone());
                }
            }
        }

        let mut config = if self.path.exists() {
            let content = std::fs::read_to_string(&self.path)?;
            serde_yaml::from_str::<AppConfig>(&content)?
        } else {
            AppConfig::default()
        };

        // Ids generated here must stay stable across reloads, so a load that
        // had to mint ids writes the document back.
        let ids_generated = sanitize(&mut config);
        if ids_generated && self.path.exists() {
            self.save_sync(&config)?;
        }

        apply_env_overrides(&mut config);

        let mtime = file_mtime(&self.path);
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        *cache = Some(CacheEntry {
            mtime,
            loaded_at: Instant::now(),
            config: config.clone(),
        });
        Ok(config)
    }

    /// Blocking variant of `save` used on the load path when generated ids
    /// must be persisted.
    fn save_sync(&self, config: &AppConfig) -> RelayResult<()> {
        let content = serde_yaml::to_string(config)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp_path = self.path.with_extension("yaml.tmp");
        std::fs::write(&tmp_path, content.as_bytes())?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Persist the configuration atomically: write a sibling temp file, then
    /// rename over the target. Creates the containing directory, invalidates
    /// the cache.
    pub async fn save(&self, config: &AppConfig) -> RelayResult<()> {
        let content = serde_yaml::to_string(config)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let tmp_path = self.path.with_extension("yaml.tmp");
        tokio::fs::write(&tmp_path, content.as_bytes()).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;

        self.invalidate();
        Ok(())
    }

    /// Drop the cached snapshot; the next `load` re-reads the file.
    pub fn invalidate(&self) {
        *self.cache.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Watch the file's mtime at a one-second interval; on change, reload and
    /// invoke the callback with the fresh configuration.
    pub fn watch<F>(self: &Arc<Self>, callback: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn(AppConfig) + Send + Sync + 'static,
    {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut last_mtime = file_mtime(&store.path);
            let mut ticker = tokio::time::interval(WATCH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let mtime = file_mtime(&store.path);
                if mtime == last_mtime {
                    continue;
                }
                last_mtime = mtime;
                store.invalidate();
                match store.load() {
                    Ok(config) => callback(config),
                    Err(err) => log::warn!("Config reload failed: {err}"),
                }
            }
        })
    }
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Environment variables override the corresponding fields at load time.
fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(host) = std::env::var("OBS_HOST") {
        config.stream_manager.obs.host = host;
    }
    if let Ok(port) = std::env::var("OBS_PORT") {
        if let Ok(port) = port.parse() {
            config.stream_manager.obs.port = port;
        }
    }
    if let Ok(password) = std::env::var("OBS_PASSWORD") {
        config.stream_manager.obs.password = Some(password);
    }
    if let Ok(host) = std::env::var("UI_HOST") {
        config.ui.host = host;
    }
    if let Ok(port) = std::env::var("UI_PORT") {
        if let Ok(port) = port.parse() {
            config.ui.port = port;
        }
    }
    if let Ok(debug) = std::env::var("UI_DEBUG") {
        config.ui.debug = matches!(debug.as_str(), "1" | "true" | "yes");
    }
}

/// Drop unusable destinations and make sure every survivor has an id.
/// Returns true when at least one id had to be generated.
fn sanitize(config: &mut AppConfig) -> bool {
    config
        .stream_manager
        .platforms
        .retain(|platform| platform.is_complete());

    let mut generated = false;
    for platform in &mut config.stream_manager.platforms {
        if platform.id.is_empty() {
            generated = true;
        }
        platform.ensure_id();
    }
    generated
}

fn id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,100}$").expect("id regex"))
}

/// Identifier charset shared by destination ids and API path parameters.
pub fn is_valid_id(id: &str) -> bool {
    id_re().is_match(id)
}

/// Validate a configuration document. Never mutates state; failures carry a
/// structured field list.
pub fn validate_config(config: &AppConfig) -> RelayResult<()> {
    let mut fields = Vec::new();

    let rtmp = &config.stream_manager.rtmp_server;
    if rtmp.port == 0 {
        fields.push(FieldError::new(
            "stream_manager.rtmp_server.port",
            "must be non-zero",
        ));
    }
    if rtmp.app_name.trim().is_empty() {
        fields.push(FieldError::new(
            "stream_manager.rtmp_server.app_name",
            "must not be empty",
        ));
    }
    if config.ui.port == 0 {
        fields.push(FieldError::new("ui.port", "must be non-zero"));
    }

    for (index, platform) in config.stream_manager.platforms.iter().enumerate() {
        let prefix = format!("stream_manager.platforms[{index}]");
        if !platform.id.is_empty() && !is_valid_id(&platform.id) {
            fields.push(FieldError::new(
                format!("{prefix}.id"),
                "must match ^[A-Za-z0-9_-]{1,100}$",
            ));
        }
        if platform.name.trim().is_empty() {
            fields.push(FieldError::new(format!("{prefix}.name"), "must not be empty"));
        }
        let url = platform.rtmp_url.trim();
        if !url.is_empty() && !url.starts_with("rtmp://") && !url.starts_with("rtmps://") {
            fields.push(FieldError::new(
                format!("{prefix}.rtmp_url"),
                "scheme must be rtmp:// or rtmps://",
            ));
        }
    }

    // Duplicate ids break session independence
    for (index, platform) in config.stream_manager.platforms.iter().enumerate() {
        if platform.id.is_empty() {
            continue;
        }
        let first = config
            .stream_manager
            .platforms
            .iter()
            .position(|p| p.id == platform.id);
        if first != Some(index) {
            fields.push(FieldError::new(
                format!("stream_manager.platforms[{index}].id"),
                "duplicate destination id",
            ));
        }
    }

    if fields.is_empty() {
        Ok(())
    } else {
        Err(RelayError::ConfigInvalid(fields))
    }
}
