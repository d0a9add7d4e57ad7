//! Orderly WebSocket SDK
//!
//! A Rust client for the Orderly Network streaming API, including:
//! - Public market-data sessions (trades, orderbooks, klines, tickers)
//! - Private account sessions with Ed25519 login (positions, balances,
//!   orders, executions)
//! - Managed subscriptions with bounded per-topic inboxes, heartbeats and
//!   automatic reconnection with full replay

pub mod credentials;
pub mod error;
pub mod types;
pub mod websocket;

pub use credentials::Credentials;
pub use error::{Error, Result};
pub use types::KlineInterval;
pub use websocket::{
    ConnectionState, HeartbeatConfig, InboxHandle, Message, Network, ReconnectConfig,
    SessionConfig, SessionKind, Topic, WsSession,
};
