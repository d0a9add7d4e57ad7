//! Error types for the Orderly WebSocket client

use thiserror::Error;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when using the Orderly WebSocket client
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Socket-level failure; the session recovers from these via reconnect
    #[error("transport error: {0}")]
    Transport(String),

    /// The server rejected the credentials; the session is closed and will
    /// not reconnect
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// The signed timestamp was stale; retried once with a fresh timestamp
    #[error("authentication token expired")]
    AuthExpiredToken,

    /// The server refused a topic subscription
    #[error("subscription rejected for topic {topic}: {message}")]
    SubscribeRejected {
        /// Topic that was refused
        topic: String,
        /// Server-reported reason
        message: String,
    },

    /// An inbound frame could not be parsed; logged and dropped
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// No message arrived within the receive window; a signal, not a failure
    #[error("no message received within the timeout window")]
    ReceiveTimeout,

    /// The session (or the topic inbox) has been closed
    #[error("session closed")]
    SessionClosed,

    /// Key material could not be decoded or used for signing
    #[error("credentials error: {0}")]
    Credentials(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err.to_string())
    }
}

impl Error {
    /// Whether this error terminates the session rather than triggering a
    /// reconnect attempt.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::AuthRejected(_) | Error::SessionClosed)
    }
}
