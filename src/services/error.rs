// Relay Error Types
// Structured error kinds surfaced across module boundaries and the API

use serde::Serialize;

use crate::services::ModuleState;

/// Result type for relay service operations
pub type RelayResult<T> = Result<T, RelayError>;

/// A single field that failed configuration validation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Errors that can occur in the relay core.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("configuration invalid: {}", format_fields(.0))]
    ConfigInvalid(Vec<FieldError>),

    #[error("port(s) already in use: {}", format_ports(.0))]
    PortUnavailable(Vec<u16>),

    #[error("invalid lifecycle transition for module '{module}': {from:?} -> {requested:?}")]
    StateMismatch {
        module: String,
        from: ModuleState,
        requested: ModuleState,
    },

    #[error("transcoder binary '{binary}' not found on PATH; install FFmpeg and make sure it is on PATH (e.g. apt install ffmpeg / brew install ffmpeg)")]
    TranscoderMissing { binary: String },

    #[error("relay child for destination '{destination_id}' exited{}", format_exit_code(.code))]
    ChildExit {
        destination_id: String,
        code: Option<i32>,
    },

    #[error("publish rejected: stream key mismatch")]
    IngestRejected,

    #[error("destination '{0}' not found")]
    NotFound(String),

    #[error("destination '{0}' is disabled")]
    DestinationDisabled(String),

    #[error("module '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("no module registered under '{0}'")]
    UnknownModule(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl RelayError {
    /// Leading one-line summary for API error bodies; multi-line detail is
    /// preserved separately in `details`.
    pub fn summary(&self) -> String {
        let text = self.to_string();
        text.lines().next().unwrap_or_default().to_string()
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            RelayError::ConfigInvalid(fields) => serde_json::to_value(fields).ok(),
            RelayError::PortUnavailable(ports) => serde_json::to_value(ports).ok(),
            _ => {
                let text = self.to_string();
                if text.lines().count() > 1 {
                    Some(serde_json::Value::String(text))
                } else {
                    None
                }
            }
        }
    }
}

fn format_fields(fields: &[FieldError]) -> String {
    fields
        .iter()
        .map(|f| format!("{}: {}", f.field, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

fn format_ports(ports: &[u16]) -> String {
    ports
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_exit_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" with code {code}"),
        None => " without an exit code".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_invalid_lists_fields() {
        let err = RelayError::ConfigInvalid(vec![
            FieldError::new("platforms[0].rtmp_url", "must start with rtmp:// or rtmps://"),
            FieldError::new("ui.port", "must be non-zero"),
        ]);
        let text = err.to_string();
        assert!(text.contains("platforms[0].rtmp_url"));
        assert!(text.contains("ui.port"));
    }

    #[test]
    fn test_port_unavailable_names_ports() {
        let err = RelayError::PortUnavailable(vec![1935, 8008]);
        assert!(err.to_string().contains("1935"));
        assert!(err.to_string().contains("8008"));
    }

    #[test]
    fn test_summary_is_single_line() {
        let err = RelayError::TranscoderMissing {
            binary: "ffmpeg".to_string(),
        };
        assert_eq!(err.summary().lines().count(), 1);
    }
}
