//! Error taxonomy for the voice session.

use thiserror::Error;

/// Session-level errors.
///
/// Device, credential and transport failures end the session and surface through the
/// connection state. Malformed server messages are logged and dropped.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Audio device unavailable: {0}")]
    DeviceAcquisition(String),

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Credential not configured")]
    CredentialMissing,

    #[error("Malformed server message: {0}")]
    MalformedServerMessage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for SessionError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        SessionError::Transport(e.to_string())
    }
}

impl From<alsa::Error> for SessionError {
    fn from(e: alsa::Error) -> Self {
        SessionError::DeviceAcquisition(e.to_string())
    }
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;
