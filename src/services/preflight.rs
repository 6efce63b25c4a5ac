// Availability Preflight
// Startup-time port probes and external transcoder discovery

use serde::Serialize;
use std::net::TcpListener;
use std::process::Command;
use std::time::{Duration, Instant};

use crate::services::{transcoder_available, RelayError, RelayResult};

// Windows: hide console windows for spawned processes
#[cfg(windows)]
use std::os::windows::process::CommandExt;
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Outbound reachability probes give up after this long.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Try a transient bind on every listening port, releasing immediately.
/// Any port already in use aborts startup with the full list of offenders.
pub fn probe_listen_ports(bindings: &[(&str, u16)]) -> RelayResult<()> {
    let mut in_use = Vec::new();
    for (host, port) in bindings {
        match TcpListener::bind((*host, *port)) {
            Ok(listener) => drop(listener),
            Err(_) => in_use.push(*port),
        }
    }
    if in_use.is_empty() {
        Ok(())
    } else {
        Err(RelayError::PortUnavailable(in_use))
    }
}

/// Result of probing one destination endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub success: bool,
    pub message: String,
    pub latency_ms: u64,
}

/// TCP-connect to the host behind an RTMP/RTMPS URL with a short timeout.
/// Verifies reachability only; no RTMP exchange is attempted.
pub async fn probe_destination(url: &str) -> RelayResult<ProbeResult> {
    let (host, port) = parse_rtmp_host(url)?;
    let start = Instant::now();

    let attempt = tokio::time::timeout(
        PROBE_TIMEOUT,
        tokio::net::TcpStream::connect((host.as_str(), port)),
    )
    .await;

    let latency_ms = start.elapsed().as_millis() as u64;
    let result = match attempt {
        Ok(Ok(_)) => ProbeResult {
            success: true,
            message: format!("{host}:{port} is reachable"),
            latency_ms,
        },
        Ok(Err(err)) => ProbeResult {
            success: false,
            message: format!("Cannot reach {host}:{port} - {err}"),
            latency_ms,
        },
        Err(_) => ProbeResult {
            success: false,
            message: format!("Connection to {host}:{port} timed out"),
            latency_ms,
        },
    };
    Ok(result)
}

/// Extract `(host, port)` from an RTMP/RTMPS URL, defaulting the port by
/// scheme (1935 for rtmp, 443 for rtmps).
pub fn parse_rtmp_host(url: &str) -> RelayResult<(String, u16)> {
    let url = url.trim();
    let (secure, rest) = if let Some(rest) = url.strip_prefix("rtmps://") {
        (true, rest)
    } else if let Some(rest) = url.strip_prefix("rtmp://") {
        (false, rest)
    } else {
        return Err(RelayError::ConfigInvalid(vec![crate::services::FieldError::new(
            "url",
            "scheme must be rtmp:// or rtmps://",
        )]));
    };

    let host_port = rest.split('/').next().unwrap_or(rest);
    if host_port.is_empty() {
        return Err(RelayError::ConfigInvalid(vec![crate::services::FieldError::new(
            "url",
            "missing host",
        )]));
    }

    match host_port.split_once(':') {
        Some((host, port)) => {
            let port: u16 = port.parse().map_err(|_| {
                RelayError::ConfigInvalid(vec![crate::services::FieldError::new(
                    "url",
                    format!("invalid port '{port}'"),
                )])
            })?;
            Ok((host.to_string(), port))
        }
        None => Ok((host_port.to_string(), if secure { 443 } else { 1935 })),
    }
}

/// Probe the transcoder binary and return its `-version` banner line.
/// Used by the startup preflight (warning only) and the system endpoint.
pub fn transcoder_version(binary: &str) -> RelayResult<String> {
    if !transcoder_available(binary) {
        return Err(RelayError::TranscoderMissing {
            binary: binary.to_string(),
        });
    }

    let mut cmd = Command::new(binary);
    cmd.arg("-version");
    #[cfg(windows)]
    cmd.creation_flags(CREATE_NO_WINDOW);
    let output = cmd.output()?;

    if !output.status.success() {
        return Err(RelayError::TranscoderMissing {
            binary: binary.to_string(),
        });
    }

    let text = String::from_utf8_lossy(&output.stdout);
    Ok(text.lines().next().unwrap_or("unknown version").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_free_ports() {
        // An ephemeral listener tells us a port that is definitely taken
        let taken = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let taken_port = taken.local_addr().unwrap().port();

        let err = probe_listen_ports(&[("127.0.0.1", taken_port)]).unwrap_err();
        match err {
            RelayError::PortUnavailable(ref ports) => assert_eq!(ports, &vec![taken_port]),
            other => panic!("expected PortUnavailable, got {other:?}"),
        }
        // The error message names the specific port
        assert!(err.to_string().contains(&taken_port.to_string()));

        drop(taken);
    }

    #[test]
    fn test_probe_releases_the_bind() {
        // Find a free port, probe it, then bind it for real
        let probe = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        probe_listen_ports(&[("127.0.0.1", port)]).unwrap();
        TcpListener::bind(("127.0.0.1", port)).expect("probe must release the port");
    }

    #[test]
    fn test_parse_rtmp_host() {
        assert_eq!(
            parse_rtmp_host("rtmp://live.twitch.tv/app").unwrap(),
            ("live.twitch.tv".to_string(), 1935)
        );
        assert_eq!(
            parse_rtmp_host("rtmps://live-api-s.facebook.com:443/rtmp").unwrap(),
            ("live-api-s.facebook.com".to_string(), 443)
        );
        assert_eq!(
            parse_rtmp_host("rtmps://host.example.net").unwrap(),
            ("host.example.net".to_string(), 443)
        );
        assert!(parse_rtmp_host("http://example.com").is_err());
    }

    #[tokio::test]
    async fn test_probe_destination_unreachable() {
        // A port we just freed is almost certainly closed
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = probe_destination(&format!("rtmp://127.0.0.1:{port}/app"))
            .await
            .unwrap();
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_probe_destination_reachable() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        let result = probe_destination(&format!("rtmp://127.0.0.1:{port}/app"))
            .await
            .unwrap();
        assert!(result.success);
        drop(listener);
    }

    #[test]
    fn test_transcoder_version_missing_binary() {
        assert!(matches!(
            transcoder_version("definitely-not-a-real-binary-7f3a"),
            Err(RelayError::TranscoderMissing { .. })
        ));
    }
}
