//! Error types for the voice pipeline.

use thiserror::Error;

/// Result type for voice session operations.
pub type Result<T> = std::result::Result<T, VoiceError>;

/// Errors that can occur across the voice session pipeline.
#[derive(Error, Debug)]
pub enum VoiceError {
    /// Microphone access was refused.
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    /// The authorization collaborator rejected the session.
    #[error("session not authorized: {0}")]
    AuthorizationRejected(String),

    /// Any stream-level transport failure (socket, handshake, framing).
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed PCM16 or base64 payload. Non-fatal; chunks are dropped.
    #[error("audio decode error: {0}")]
    Decode(String),

    /// An audio device could not be opened or refused samples. Non-fatal
    /// during playback; fatal when no device exists at session start.
    #[error("audio device error: {0}")]
    Device(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl VoiceError {
    /// Create a new permission error.
    pub fn permission<S: Into<String>>(msg: S) -> Self {
        Self::PermissionDenied(msg.into())
    }

    /// Create a new authorization rejection.
    pub fn rejected<S: Into<String>>(msg: S) -> Self {
        Self::AuthorizationRejected(msg.into())
    }

    /// Create a new transport error.
    pub fn transport<S: Into<String>>(msg: S) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a new decode error.
    pub fn decode<S: Into<String>>(msg: S) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a new device error.
    pub fn device<S: Into<String>>(msg: S) -> Self {
        Self::Device(msg.into())
    }

    /// Create a new configuration error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }
}
