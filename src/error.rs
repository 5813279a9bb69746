//! Error taxonomy for the voice agent client
//!
//! Capture and transport failures propagate up to the state machine, which is
//! the only place that decides session-level outcomes. Renderers never return
//! these; they mark their own turn as failed instead.

use thiserror::Error;

/// Errors raised while acquiring or running the microphone.
#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("No audio input device found")]
    NoInputDevice,
    #[error("No supported audio configuration")]
    NoSupportedConfig,
    #[error("Failed to create audio stream: {0}")]
    StreamCreationFailed(String),
    #[error("Failed to start audio stream: {0}")]
    StreamStartFailed(String),
    #[error("Failed to write capture recording: {0}")]
    RecordingFailed(String),
}

/// Connection-level failures of the streaming transport.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),
    #[error("Failed to connect to voice agent server: {0}")]
    ConnectionFailed(String),
    #[error("Failed to send message: {0}")]
    SendFailed(String),
    #[error("Connection closed: {0}")]
    Closed(String),
    #[error("WebSocket error: {0}")]
    Socket(String),
    #[error("No live connection")]
    NotConnected,
}

/// Failures turning a base64 audio chunk into samples or playing them.
#[derive(Debug, Clone, Error)]
pub enum PlaybackError {
    #[error("Invalid base64 audio payload: {0}")]
    InvalidBase64(String),
    #[error("No audio output device found")]
    NoOutputDevice,
    #[error("Failed to open audio output: {0}")]
    OutputFailed(String),
}

/// Top-level error taxonomy surfaced to the caller of the client.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Microphone permission denied or device unavailable
    #[error("Microphone unavailable: {0}")]
    CaptureUnavailable(#[from] CaptureError),
    /// Connection-level failure, never retried automatically
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Malformed or unexpected inbound message
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// Explicit `*_error` message from the backend
    #[error("Upstream generation error: {0}")]
    UpstreamGeneration(String),
    /// Required backend keys or configuration are absent
    #[error("Backend configuration required (missing: {})", .missing_keys.join(", "))]
    MissingCapability {
        message: String,
        missing_keys: Vec<String>,
    },
}

impl From<PlaybackError> for ClientError {
    fn from(err: PlaybackError) -> Self {
        ClientError::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_capability_display_lists_keys() {
        let err = ClientError::MissingCapability {
            message: "Please provide your API keys".to_string(),
            missing_keys: vec!["GEMINI_API_KEY".to_string(), "MURF_API_KEY".to_string()],
        };
        let text = err.to_string();
        assert!(text.contains("GEMINI_API_KEY"));
        assert!(text.contains("MURF_API_KEY"));
    }

    #[test]
    fn test_capture_error_converts() {
        let err: ClientError = CaptureError::NoInputDevice.into();
        assert!(matches!(err, ClientError::CaptureUnavailable(_)));
        assert!(err.to_string().contains("No audio input device"));
    }

    #[test]
    fn test_playback_error_is_protocol_error() {
        let err: ClientError = PlaybackError::InvalidBase64("bad".to_string()).into();
        assert!(matches!(err, ClientError::Protocol(_)));
    }
}
