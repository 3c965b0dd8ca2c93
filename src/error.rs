//! Error types for the signaling core

use crate::protocol::SessionId;

/// Result type alias using the signaling [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in signaling operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Transport connect/send/receive failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Send attempted on a channel that is not connected
    #[error("Signaling channel is closed")]
    ChannelClosed,

    /// Operation not valid in the session's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Malformed or out-of-place signaling message
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Media engine operation failure (always fatal to the session)
    #[error("Media engine error: {0}")]
    MediaEngine(String),

    /// Session did not reach Connected within the configured window
    #[error("Negotiation timeout for session {0}")]
    NegotiationTimeout(SessionId),

    /// No active session with the given identifier
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    /// Session identifier was retired and may never be reused
    #[error("Session identifier retired: {0}")]
    SessionRetired(SessionId),

    /// Maximum concurrent session count reached
    #[error("Session limit reached ({0})")]
    SessionLimit(usize),

    /// Wire message serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is recoverable by reconnecting the channel
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::ChannelClosed | Error::Io(_)
        )
    }

    /// Check if this error is fatal to the session it occurred on
    ///
    /// Fatal errors force the session to `Failed`; the application must
    /// start a new session with a fresh identifier.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            Error::MediaEngine(_) | Error::NegotiationTimeout(_)
        )
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }
}
