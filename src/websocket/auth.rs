//! Private-session login handshake
//!
//! The login frame signs the current millisecond timestamp with the
//! session's Ed25519 key. A rejection caused by timestamp skew is worth
//! one retry with a fresh timestamp; any other rejection is fatal, since
//! repeating the handshake with unchanged credentials cannot succeed.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::credentials::Credentials;
use crate::websocket::frame::{AuthParams, OutboundFrame};

/// Current time in milliseconds since the Unix epoch
pub(crate) fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Build a signed login frame with a fresh timestamp
pub(crate) fn login_frame(client_id: &str, credentials: &Credentials) -> OutboundFrame {
    let timestamp = timestamp_ms();
    OutboundFrame::auth(
        client_id,
        AuthParams {
            orderly_key: credentials.orderly_key(),
            sign: credentials.sign_timestamp(timestamp),
            timestamp: timestamp.to_string(),
        },
    )
}

/// How an auth rejection should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rejection {
    /// Timestamp skew; retryable once with a fresh timestamp
    ExpiredToken,
    /// Credentials refused; fatal
    Fatal,
}

/// Classify a rejection message from the server
pub(crate) fn classify_rejection(message: Option<&str>) -> Rejection {
    let message = message.unwrap_or_default().to_ascii_lowercase();
    if message.contains("timestamp") || message.contains("expire") {
        Rejection::ExpiredToken
    } else {
        Rejection::Fatal
    }
}
