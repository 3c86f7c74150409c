//! Error types for the live voice engine.

/// Top-level error type for a live voice session.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    /// Microphone access denied or no input device available. Carries the
    /// platform's message unchanged.
    #[error("{0}")]
    Permission(String),

    /// Audio device or stream error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Connecting to the voice service failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// Error reported by the voice service during a session.
    #[error("service error: {0}")]
    Service(String),

    /// Malformed or unexpected wire message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Inbound audio payload could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, VoiceError>;

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn permission_message_is_not_prefixed() {
        let err = VoiceError::Permission("Permission denied by the system".into());
        assert_eq!(err.to_string(), "Permission denied by the system");
    }

    #[test]
    fn other_variants_name_their_subsystem() {
        assert_eq!(
            VoiceError::Service("quota exceeded".into()).to_string(),
            "service error: quota exceeded"
        );
    }
}
