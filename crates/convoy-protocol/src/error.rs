//! Protocol error types.

use thiserror::Error;

/// Errors raised while decoding or validating protocol data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame was not valid JSON or did not match any message shape.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// A `chat` message arrived with no text.
    #[error("chat message must not be empty")]
    EmptyChat,

    /// The frame type is not supported on this connection.
    #[error("unsupported frame: {0}")]
    UnsupportedFrame(String),

    /// A history record violates a structural invariant.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}
