//! Error taxonomy shared by every component of the engine.

use crate::config::ConfigError;
use crate::device::AudioError;
use serde::Serialize;
use std::time::Duration;
use voice_protocol::{ProtocolError, ServiceKind};

/// Every failure the engine can report.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// A connection-level failure. Retried locally before it surfaces.
    #[error("transport error on {channel} channel: {message}")]
    Transport { channel: ServiceKind, message: String },
    /// A malformed or unexpected message, or an error reported by the service.
    #[error("protocol error on {channel} channel: {message}")]
    Protocol {
        channel: ServiceKind,
        message: String,
        code: Option<String>,
    },
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),
    #[error("no activity for {0:?}")]
    Timeout(Duration),
    #[error("function call `{id}` failed: {message}")]
    FunctionCall { id: String, message: String },
    /// A capture or playback device failed. Reported like a transport failure.
    #[error("audio device error: {0}")]
    Audio(#[from] AudioError),
    /// The session task is gone; no further operations can be served.
    #[error("session has shut down")]
    Shutdown,
}

impl EngineError {
    pub fn protocol(channel: ServiceKind, err: &ProtocolError) -> Self {
        EngineError::Protocol {
            channel,
            message: err.to_string(),
            code: Some(err.code().to_string()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Transport { .. } | EngineError::Audio(_) | EngineError::Shutdown => {
                ErrorKind::Transport
            }
            EngineError::Protocol { .. } => ErrorKind::Protocol,
            EngineError::Configuration(_) => ErrorKind::Configuration,
            EngineError::Timeout(_) => ErrorKind::Timeout,
            EngineError::FunctionCall { .. } => ErrorKind::FunctionCall,
        }
    }

    pub fn channel(&self) -> Option<ServiceKind> {
        match self {
            EngineError::Transport { channel, .. } | EngineError::Protocol { channel, .. } => {
                Some(*channel)
            }
            EngineError::FunctionCall { .. } => Some(ServiceKind::Agent),
            _ => None,
        }
    }

    /// Flattens the error into the event shape hosts receive.
    pub fn to_event(&self) -> ErrorEvent {
        let (code, details) = match self {
            EngineError::Protocol { code, .. } => (code.clone(), None),
            EngineError::FunctionCall { id, .. } => (None, Some(format!("function_call_id={id}"))),
            EngineError::Configuration(e) => (Some(e.code().to_string()), None),
            _ => (None, None),
        };
        ErrorEvent {
            channel: self.channel(),
            kind: self.kind(),
            message: self.to_string(),
            code,
            details,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    Protocol,
    Configuration,
    Timeout,
    FunctionCall,
}

/// The single shape every surfaced error takes on the event stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEvent {
    pub channel: Option<ServiceKind>,
    pub kind: ErrorKind,
    pub message: String,
    pub code: Option<String>,
    pub details: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_event_carries_code() {
        let err = EngineError::protocol(
            ServiceKind::Transcription,
            &ProtocolError::UnknownType("Bogus".into()),
        );
        let event = err.to_event();

        assert_eq!(event.kind, ErrorKind::Protocol);
        assert_eq!(event.channel, Some(ServiceKind::Transcription));
        assert_eq!(event.code.as_deref(), Some("unknown_type"));
        assert!(event.message.contains("Bogus"));
    }

    #[test]
    fn test_transport_error_display() {
        let err = EngineError::Transport {
            channel: ServiceKind::Agent,
            message: "connection reset".into(),
        };
        assert_eq!(
            err.to_string(),
            "transport error on agent channel: connection reset"
        );
        assert_eq!(err.to_event().channel, Some(ServiceKind::Agent));
    }

    #[test]
    fn test_configuration_error_has_no_channel() {
        let err = EngineError::from(ConfigError::MissingTarget);
        let event = err.to_event();
        assert_eq!(event.kind, ErrorKind::Configuration);
        assert_eq!(event.channel, None);
        assert_eq!(event.code.as_deref(), Some("missing_target"));
    }
}
