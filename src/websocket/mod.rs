//! WebSocket session layer for Orderly streaming endpoints
//!
//! [`session`] owns the connection lifecycle and message routing,
//! [`topic`] names the streams, [`frame`] speaks the wire protocol,
//! [`registry`] holds the desired subscriptions and their inboxes, and
//! [`heartbeat`] detects silently dead connections.

mod auth;
pub mod frame;
pub mod heartbeat;
pub mod registry;
pub mod session;
pub mod topic;

pub use frame::Message;
pub use heartbeat::HeartbeatConfig;
pub use registry::{InboxHandle, SubscriptionRegistry, TopicInbox};
pub use session::{
    ConnectionState, Network, ReconnectConfig, SessionConfig, SessionKind, WsSession,
};
pub use topic::Topic;
