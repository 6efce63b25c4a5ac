// Configuration Model
// The persisted YAML document (snake_case canonical, camelCase accepted)

use serde::{Deserialize, Serialize};

use super::Destination;

/// Root of the persisted configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub version: String,

    #[serde(alias = "streamManager")]
    pub stream_manager: StreamManagerConfig,

    pub ui: UiConfig,
}

/// Everything the relay core needs: ingest binding, destinations,
/// and the reserved reconnection policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamManagerConfig {
    /// Reserved: OBS WebSocket integration endpoint
    pub obs: ObsConfig,

    #[serde(alias = "rtmpServer")]
    pub rtmp_server: RtmpServerConfig,

    /// Reserved for a higher-level reconnection policy; the core does not
    /// exercise these (relay children carry their own reconnect flags).
    #[serde(alias = "autoReconnect")]
    pub auto_reconnect: bool,
    #[serde(alias = "reconnectDelay")]
    pub reconnect_delay: u64,
    #[serde(alias = "maxReconnectAttempts")]
    pub max_reconnect_attempts: u32,

    #[serde(alias = "destinations")]
    pub platforms: Vec<Destination>,
}

impl Default for StreamManagerConfig {
    fn default() -> Self {
        Self {
            obs: ObsConfig::default(),
            rtmp_server: RtmpServerConfig::default(),
            auto_reconnect: true,
            reconnect_delay: 5,
            max_reconnect_attempts: 10,
            platforms: Vec::new(),
        }
    }
}

/// Reserved OBS WebSocket endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObsConfig {
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Default for ObsConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 4455,
            password: None,
        }
    }
}

/// The inbound RTMP listener the publisher pushes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RtmpServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(alias = "appName")]
    pub app_name: String,
    #[serde(alias = "streamKey")]
    pub stream_key: String,
    pub enabled: bool,
}

impl Default for RtmpServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 1935,
            app_name: "live".to_string(),
            stream_key: "obs".to_string(),
            enabled: true,
        }
    }
}

impl RtmpServerConfig {
    /// Configured publish path, `/app/streamKey`.
    pub fn stream_path(&self) -> String {
        format!("/{}/{}", self.app_name, self.stream_key)
    }

    /// The ingest URL with a host relay children (and humans) can reach.
    /// A wildcard bind address is rewritten to the loopback interface so
    /// local consumers can connect back over it.
    pub fn loopback_url(&self) -> String {
        format!("rtmp://{}:{}{}", loopback_host(&self.host), self.port, self.stream_path())
    }
}

/// Rewrite a wildcard bind host to the loopback address. Applied wherever an
/// ingest URL is surfaced, including to child transcoders; a deliberately
/// bound non-loopback host is passed through untouched.
pub fn loopback_host(host: &str) -> String {
    if host == "0.0.0.0" {
        "127.0.0.1".to_string()
    } else {
        host.to_string()
    }
}

/// Control-plane binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    pub host: String,
    pub port: u16,
    pub debug: bool,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8008,
            debug: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.stream_manager.rtmp_server.port, 1935);
        assert_eq!(cfg.stream_manager.rtmp_server.app_name, "live");
        assert_eq!(cfg.ui.port, 8008);
        assert!(cfg.stream_manager.platforms.is_empty());
    }

    #[test]
    fn test_loopback_rewrite() {
        assert_eq!(loopback_host("0.0.0.0"), "127.0.0.1");
        assert_eq!(loopback_host("127.0.0.1"), "127.0.0.1");
        assert_eq!(loopback_host("10.0.0.8"), "10.0.0.8");
    }

    #[test]
    fn test_loopback_url() {
        let rtmp = RtmpServerConfig::default();
        assert_eq!(rtmp.loopback_url(), "rtmp://127.0.0.1:1935/live/obs");
    }

    #[test]
    fn test_yaml_snake_and_camel_case() {
        let snake = r#"
version: "1.0"
stream_manager:
  rtmp_server:
    host: 0.0.0.0
    port: 1935
    app_name: live
    stream_key: obs
    enabled: true
  platforms: []
ui:
  host: 127.0.0.1
  port: 8008
  debug: false
"#;
        let camel = r#"
version: "1.0"
streamManager:
  rtmpServer:
    host: 0.0.0.0
    port: 1935
    appName: live
    streamKey: obs
    enabled: true
  platforms: []
ui:
  host: 127.0.0.1
  port: 8008
  debug: false
"#;
        let a: AppConfig = serde_yaml::from_str(snake).unwrap();
        let b: AppConfig = serde_yaml::from_str(camel).unwrap();
        assert_eq!(a.stream_manager.rtmp_server, b.stream_manager.rtmp_server);
    }
}
