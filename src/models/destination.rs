// Destination Model
// A named downstream target the ingest stream is fanned out to

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A fan-out destination: one RTMP/RTMPS endpoint plus its stream key.
///
/// Destinations are identified by `id`; `name` is a platform label
/// (e.g. "twitch") and may repeat across destinations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Destination {
    /// Stable opaque identifier, unique within the destination set.
    /// Generated when the configuration omits it.
    #[serde(default)]
    pub id: String,

    /// Short logical platform name (non-unique)
    pub name: String,

    /// Optional human-readable label
    #[serde(default, alias = "displayName")]
    pub display_name: Option<String>,

    /// Base publish URL; `rtmp://` or `rtmps://`
    #[serde(alias = "rtmpUrl", alias = "url")]
    pub rtmp_url: String,

    /// Credential appended to the URL to form the publish target.
    /// Supports `${ENV_VAR}` indirection, resolved at spawn time.
    #[serde(alias = "streamKey")]
    pub stream_key: String,

    /// Disabled destinations exist but cannot be started
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Opaque platform-specific hints; ignored by the relay core
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl Destination {
    /// Assign a generated id if the configuration left it empty.
    pub fn ensure_id(&mut self) {
        if self.id.is_empty() {
            self.id = uuid::Uuid::new_v4().to_string();
        }
    }

    /// A destination with no URL or no key can never be published to;
    /// such entries are silently dropped at config load.
    pub fn is_complete(&self) -> bool {
        !self.rtmp_url.trim().is_empty() && !self.stream_key.trim().is_empty()
    }

    /// Summary safe to expose over the API: the stream key is masked.
    pub fn masked(&self) -> Destination {
        let mut masked = self.clone();
        if !masked.stream_key.is_empty() {
            masked.stream_key = "********".to_string();
        }
        masked
    }
}

fn default_enabled() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_id_generates_once() {
        let mut dest = Destination {
            id: String::new(),
            name: "twitch".to_string(),
            display_name: None,
            rtmp_url: "rtmp://live.twitch.tv/app".to_string(),
            stream_key: "secret".to_string(),
            enabled: true,
            metadata: HashMap::new(),
        };

        dest.ensure_id();
        assert!(!dest.id.is_empty());

        let first = dest.id.clone();
        dest.ensure_id();
        assert_eq!(dest.id, first);
    }

    #[test]
    fn test_incomplete_destination() {
        let dest = Destination {
            id: "a".to_string(),
            name: "twitch".to_string(),
            display_name: None,
            rtmp_url: String::new(),
            stream_key: "secret".to_string(),
            enabled: true,
            metadata: HashMap::new(),
        };
        assert!(!dest.is_complete());
    }

    #[test]
    fn test_masked_hides_key() {
        let dest = Destination {
            id: "a".to_string(),
            name: "twitch".to_string(),
            display_name: None,
            rtmp_url: "rtmp://live.twitch.tv/app".to_string(),
            stream_key: "live_123456".to_string(),
            enabled: true,
            metadata: HashMap::new(),
        };
        let masked = dest.masked();
        assert_eq!(masked.stream_key, "********");
        assert_eq!(masked.rtmp_url, dest.rtmp_url);
    }

    #[test]
    fn test_accepts_camel_case_keys() {
        let json = r#"{
            "name": "youtube",
            "displayName": "YouTube Main",
            "rtmpUrl": "rtmp://a.rtmp.youtube.com/live2",
            "streamKey": "abcd-efgh",
            "enabled": false
        }"#;
        let dest: Destination = serde_json::from_str(json).unwrap();
        assert_eq!(dest.display_name.as_deref(), Some("YouTube Main"));
        assert_eq!(dest.rtmp_url, "rtmp://a.rtmp.youtube.com/live2");
        assert_eq!(dest.stream_key, "abcd-efgh");
        assert!(!dest.enabled);
    }
}
