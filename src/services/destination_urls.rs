// Destination URLs
// Publish URL composition, stream-key resolution and log redaction

/// Compose the full publish target for a destination.
///
/// `rtmp://` bases simply get the key appended. `rtmps://` gateways expect an
/// application path, so the base is normalized to end in `/app` before the
/// key: a base already ending in `/app` or `/app/` keeps it, anything else
/// gets `/app` inserted.
pub fn compose_publish_url(base_url: &str, stream_key: &str) -> String {
    let base = base_url.trim();

    if base.starts_with("rtmps://") {
        if base.ends_with("/app") {
            return format!("{base}/{stream_key}");
        }
        if base.ends_with("/app/") {
            return format!("{base}{stream_key}");
        }
        let trimmed = base.trim_end_matches('/');
        return format!("{trimmed}/app/{stream_key}");
    }

    let trimmed = base.trim_end_matches('/');
    format!("{trimmed}/{stream_key}")
}

/// Resolve `${ENV_VAR}` indirection in a stream key. A plain key is returned
/// as-is; an unresolvable variable falls back to the literal text.
pub fn resolve_stream_key(key: &str) -> String {
    if key.starts_with("${") && key.ends_with('}') && key.len() > 3 {
        let var_name = &key[2..key.len() - 1];
        match std::env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                log::warn!("Environment variable for stream key not set, using literal value");
                key.to_string()
            }
        }
    } else {
        key.to_string()
    }
}

/// Redact the stream key from a publish URL for logging.
///
/// Keeps the first path segment (the application path) and replaces the rest
/// with `***`. Non-RTMP text passes through untouched.
pub fn redact_url(url: &str) -> String {
    if !(url.starts_with("rtmp://") || url.starts_with("rtmps://")) {
        return url.to_string();
    }

    let (scheme, rest) = match url.split_once("://") {
        Some(parts) => parts,
        None => return url.to_string(),
    };
    let (host, path) = match rest.split_once('/') {
        Some(parts) => parts,
        None => return url.to_string(),
    };

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() < 2 {
        return url.to_string();
    }

    format!("{scheme}://{host}/{}/***", segments[0])
}

/// Redact every RTMP URL appearing inside a larger string (an argv line, a
/// diagnostic message).
pub fn redact_text(text: &str) -> String {
    if !(text.contains("rtmp://") || text.contains("rtmps://")) {
        return text.to_string();
    }

    let pos = text
        .find("rtmp://")
        .into_iter()
        .chain(text.find("rtmps://"))
        .min();
    let Some(pos) = pos else {
        return text.to_string();
    };

    let prefix = &text[..pos];
    let url_end = text[pos..]
        .find(char::is_whitespace)
        .map(|i| pos + i)
        .unwrap_or(text.len());
    let url = &text[pos..url_end];
    let suffix = &text[url_end..];

    format!("{prefix}{}{}", redact_url(url), redact_text(suffix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtmp_base_appends_key() {
        assert_eq!(
            compose_publish_url("rtmp://live.twitch.tv/app", "live_123"),
            "rtmp://live.twitch.tv/app/live_123"
        );
    }

    #[test]
    fn test_rtmps_bare_host_gains_app_path() {
        assert_eq!(
            compose_publish_url("rtmps://fa723.global-contribute.live-video.net", "sk_abc"),
            "rtmps://fa723.global-contribute.live-video.net/app/sk_abc"
        );
    }

    #[test]
    fn test_rtmps_app_suffix_variants() {
        assert_eq!(
            compose_publish_url("rtmps://host.example.net/app", "k"),
            "rtmps://host.example.net/app/k"
        );
        assert_eq!(
            compose_publish_url("rtmps://host.example.net/app/", "k"),
            "rtmps://host.example.net/app/k"
        );
        assert_eq!(
            compose_publish_url("rtmps://host.example.net/", "k"),
            "rtmps://host.example.net/app/k"
        );
    }

    #[test]
    fn test_env_key_resolution() {
        std::env::set_var("FANCAST_TEST_STREAM_KEY", "resolved_key");
        assert_eq!(resolve_stream_key("${FANCAST_TEST_STREAM_KEY}"), "resolved_key");
        std::env::remove_var("FANCAST_TEST_STREAM_KEY");

        assert_eq!(resolve_stream_key("plain_key"), "plain_key");
        assert_eq!(
            resolve_stream_key("${FANCAST_TEST_KEY_UNSET}"),
            "${FANCAST_TEST_KEY_UNSET}"
        );
    }

    #[test]
    fn test_redact_url() {
        assert_eq!(
            redact_url("rtmp://live.twitch.tv/app/live_123456_secret"),
            "rtmp://live.twitch.tv/app/***"
        );
        assert_eq!(
            redact_url("rtmps://host.example.net/app/sk_secret"),
            "rtmps://host.example.net/app/***"
        );
        // No key segment yet: nothing to hide
        assert_eq!(redact_url("rtmp://live.twitch.tv/app"), "rtmp://live.twitch.tv/app");
        assert_eq!(redact_url("not a url"), "not a url");
    }

    #[test]
    fn test_redact_text_handles_argv_lines() {
        let line = "-f flv rtmp://live.twitch.tv/app/live_secret -threads 2";
        let redacted = redact_text(line);
        assert!(redacted.contains("rtmp://live.twitch.tv/app/***"));
        assert!(!redacted.contains("live_secret"));
        assert!(redacted.contains("-threads 2"));
    }
}
