//! Error types for pipe messaging

use serde_json::Value;
use thiserror::Error;

/// Framing errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The payload does not fit the 16-bit length prefix.
    #[error("Payload of {len} bytes exceeds the {max} byte frame limit")]
    PayloadTooLarge { len: usize, max: usize },

    /// A received payload was not UTF-8.
    #[error("Frame payload is not valid UTF-8")]
    InvalidUtf8,
}

/// Transport errors raised by a session. Every one of them closes the stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The peer announced a different session type.
    #[error("Unexpected client session type {received}")]
    SessionTypeMismatch { received: String },

    /// A frame could not be decoded.
    #[error("Malformed frame: {0}")]
    Frame(#[from] FrameError),

    /// A frame after the handshake was not JSON.
    #[error("Malformed message: {0}")]
    InvalidJson(String),

    /// Reading or writing the stream failed.
    #[error("Stream error: {0}")]
    Io(String),

    /// The session is already closed.
    #[error("Session closed")]
    Closed,
}

/// Why an outbound request did not produce a response value.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RequestError {
    /// The peer answered with an error envelope; this is its `data`.
    #[error("Request rejected by peer: {0}")]
    Rejected(Value),

    /// The session closed before a reply arrived.
    #[error("Session closed before a reply arrived")]
    SessionClosed,

    /// The request could not be sent.
    #[error("Request not sent: {0}")]
    NotSent(SessionError),

    /// Requests must be JSON objects.
    #[error("Request payload must be a JSON object")]
    InvalidPayload,
}

impl From<SessionError> for RequestError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Closed => Self::SessionClosed,
            other => Self::NotSent(other),
        }
    }
}
