//! Session lifecycle and message routing
//!
//! A [`WsSession`] owns one logical connection to an Orderly streaming
//! endpoint. A single supervisor task owns the socket: it drives the
//! connect/authenticate/subscribe sequence, reads every inbound frame,
//! routes data frames into topic inboxes, answers pings, and reconnects
//! with jittered exponential backoff when the transport fails or the
//! heartbeat goes silent. Because the supervisor is the only socket owner,
//! a superseded connection is dropped before a new one is opened and its
//! late frames can never reach a consumer.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{interval, timeout_at, Instant, MissedTickBehavior};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::credentials::Credentials;
use crate::error::{Error, Result};
use crate::websocket::auth;
use crate::websocket::frame::{classify, Frame, Message, OutboundFrame};
use crate::websocket::heartbeat::{HeartbeatConfig, HeartbeatMonitor};
use crate::websocket::registry::{InboxHandle, SubscriptionRegistry};
use crate::websocket::topic::Topic;

/// Public streaming endpoint for mainnet
pub const MAINNET_PUBLIC_WS_URL: &str = "wss://ws-evm.orderly.org/ws/stream/";

/// Private streaming endpoint for mainnet
pub const MAINNET_PRIVATE_WS_URL: &str = "wss://ws-private-evm.orderly.org/v2/ws/private/stream/";

/// Public streaming endpoint for testnet
pub const TESTNET_PUBLIC_WS_URL: &str = "wss://testnet-ws-evm.orderly.org/ws/stream/";

/// Private streaming endpoint for testnet
pub const TESTNET_PRIVATE_WS_URL: &str =
    "wss://testnet-ws-private-evm.orderly.org/v2/ws/private/stream/";

/// Network configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Network {
    /// Mainnet environment
    #[default]
    Mainnet,
    /// Testnet environment
    Testnet,
}

impl Network {
    /// Base URL of the public streaming endpoint; the account id is
    /// appended to form the session endpoint
    pub fn public_ws_url(&self) -> &'static str {
        match self {
            Network::Mainnet => MAINNET_PUBLIC_WS_URL,
            Network::Testnet => TESTNET_PUBLIC_WS_URL,
        }
    }

    /// Base URL of the private streaming endpoint
    pub fn private_ws_url(&self) -> &'static str {
        match self {
            Network::Mainnet => MAINNET_PRIVATE_WS_URL,
            Network::Testnet => TESTNET_PRIVATE_WS_URL,
        }
    }
}

/// Kind of a session: public market data or authenticated account data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Public market data; no authentication
    Public,
    /// Private account data; requires credentials
    Private,
}

/// Connection state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Opening the socket
    Connecting,
    /// Socket open, login handshake in flight (private sessions only)
    Authenticating,
    /// Replaying topic subscriptions
    Subscribing,
    /// Connected; data frames are being delivered
    Ready,
    /// Connection lost, waiting to retry
    Reconnecting,
    /// Session has been closed and will not reconnect
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Authenticating => write!(f, "Authenticating"),
            ConnectionState::Subscribing => write!(f, "Subscribing"),
            ConnectionState::Ready => write!(f, "Ready"),
            ConnectionState::Reconnecting => write!(f, "Reconnecting"),
            ConnectionState::Closed => write!(f, "Closed"),
        }
    }
}

/// Configuration for automatic reconnection
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Whether to automatically reconnect on failure
    pub enabled: bool,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Cap on the delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Random jitter fraction added to each delay (0.0 disables jitter)
    pub jitter: f64,
    /// Maximum number of attempts (None for unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: 0.2,
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Create a reconnect config with reconnection disabled
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// The deterministic (pre-jitter) delay for an attempt number (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let multiplier = self.backoff_multiplier.powi(attempt as i32);
        let delay_ms = (self.initial_delay.as_millis() as f64 * multiplier) as u64;
        let delay = Duration::from_millis(delay_ms);

        std::cmp::min(delay, self.max_delay)
    }

    /// The delay for an attempt with random jitter applied, capped at
    /// `max_delay`
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let factor = rand::rng().random_range(0.0..self.jitter);
        std::cmp::min(base + base.mul_f64(factor), self.max_delay)
    }

    /// Check if another reconnect attempt should be made
    pub fn should_attempt(&self, attempt: u32) -> bool {
        if !self.enabled {
            return false;
        }
        match self.max_attempts {
            Some(max) => attempt < max,
            None => true,
        }
    }
}

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Client identifier stamped on outbound frames
    pub client_id: String,
    /// Heartbeat timing
    pub heartbeat: HeartbeatConfig,
    /// Reconnect behavior
    pub reconnect: ReconnectConfig,
    /// Per-topic inbox capacity
    pub inbox_capacity: usize,
    /// How long to wait for the auth acknowledgement
    pub auth_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_id: "WS_PUBLIC".to_string(),
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
            inbox_capacity: 1024,
            auth_timeout: Duration::from_secs(10),
        }
    }
}

/// Commands forwarded to the supervisor task, which is the only socket
/// writer
#[derive(Debug)]
enum Command {
    Subscribe(Topic),
    Unsubscribe(String),
    RequestOrderbook(String),
}

/// Why a connection run ended without an error
enum ConnExit {
    Shutdown,
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

struct SessionInner {
    kind: SessionKind,
    endpoint: String,
    config: SessionConfig,
    credentials: Option<Credentials>,
    registry: SubscriptionRegistry,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    command_tx: mpsc::UnboundedSender<Command>,
    command_rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    reconnect_attempts: AtomicU32,
    started: AtomicBool,
    last_error: std::sync::Mutex<Option<Error>>,
}

impl SessionInner {
    /// Transition the state machine; `Closed` is terminal and never
    /// overwritten
    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == ConnectionState::Closed || *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    fn record_error(&self, error: Error) {
        if let Ok(mut slot) = self.last_error.lock() {
            *slot = Some(error);
        }
    }
}

/// One logical streaming session to an Orderly endpoint
///
/// Cloning the handle shares the session. Construct with
/// [`WsSession::public`] or [`WsSession::private`], call
/// [`start`](WsSession::start), subscribe to topics, and drain messages
/// with [`recv`](WsSession::recv). Transient disconnects are handled
/// internally; a patient consumer only ever observes its own receive
/// timeouts.
#[derive(Clone)]
pub struct WsSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for WsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsSession")
            .field("kind", &self.inner.kind)
            .field("endpoint", &self.inner.endpoint)
            .field("state", &self.inner.state())
            .finish_non_exhaustive()
    }
}

impl WsSession {
    /// Create a public market-data session for a network and account id
    pub fn public(network: Network, account_id: impl Into<String>) -> Self {
        let endpoint = format!("{}{}", network.public_ws_url(), account_id.into());
        Self::with_endpoint(SessionKind::Public, endpoint, None, SessionConfig::default())
    }

    /// Create an authenticated private session for a network
    pub fn private(network: Network, credentials: Credentials) -> Self {
        let endpoint = format!("{}{}", network.private_ws_url(), credentials.account_id());
        let config = SessionConfig {
            client_id: "WS_PRIVATE".to_string(),
            ..Default::default()
        };
        Self::with_endpoint(SessionKind::Private, endpoint, Some(credentials), config)
    }

    /// Create a session against an explicit endpoint URL
    ///
    /// `credentials` must be `Some` for private sessions.
    pub fn with_endpoint(
        kind: SessionKind,
        endpoint: impl Into<String>,
        credentials: Option<Credentials>,
        config: SessionConfig,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let registry = SubscriptionRegistry::new(config.inbox_capacity);

        Self {
            inner: Arc::new(SessionInner {
                kind,
                endpoint: endpoint.into(),
                config,
                credentials,
                registry,
                state_tx,
                state_rx,
                command_tx,
                command_rx: Mutex::new(Some(command_rx)),
                shutdown_tx,
                shutdown_rx,
                reconnect_attempts: AtomicU32::new(0),
                started: AtomicBool::new(false),
                last_error: std::sync::Mutex::new(None),
            }),
        }
    }

    /// The session kind
    pub fn kind(&self) -> SessionKind {
        self.inner.kind
    }

    /// The endpoint URL this session connects to
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Subscribe to state changes
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_rx.clone()
    }

    /// Number of reconnect attempts since the last successful connection
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts.load(Ordering::Relaxed)
    }

    /// The error that terminated the session, if any
    pub fn last_error(&self) -> Option<Error> {
        self.inner
            .last_error
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
    }

    /// Start the session: spawns the supervisor task and returns
    /// immediately.
    ///
    /// Connection progress is observable through
    /// [`state_receiver`](WsSession::state_receiver). Calling `start` on a
    /// running session is a no-op; calling it after [`close`] returns
    /// [`Error::SessionClosed`].
    ///
    /// [`close`]: WsSession::close
    pub async fn start(&self) -> Result<()> {
        if self.inner.state() == ConnectionState::Closed {
            return Err(Error::SessionClosed);
        }
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let command_rx = match self.inner.command_rx.lock().await.take() {
            Some(rx) => rx,
            None => return Ok(()),
        };
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            supervisor(inner, command_rx).await;
        });
        Ok(())
    }

    /// Subscribe to a topic, returning its inbox handle.
    ///
    /// Idempotent: subscribing an already-active topic returns the
    /// existing inbox and sends no duplicate frame. When the session is
    /// `Ready` the subscribe frame is sent immediately; otherwise the
    /// topic is applied automatically once `Ready` is reached, including
    /// after every reconnect.
    pub async fn subscribe(&self, topic: Topic) -> Result<InboxHandle> {
        if self.inner.state() == ConnectionState::Closed {
            return Err(Error::SessionClosed);
        }
        if topic.requires_auth() && self.inner.kind == SessionKind::Public {
            warn!(topic = %topic, "private topic subscribed on a public session");
        }
        let (inbox, newly_added) = self.inner.registry.subscribe(topic.clone()).await;
        if newly_added {
            let _ = self.inner.command_tx.send(Command::Subscribe(topic));
        }
        Ok(inbox)
    }

    /// Unsubscribe from a topic; its inbox is closed and drained
    pub async fn unsubscribe(&self, topic: &Topic) -> Result<()> {
        if self.inner.state() == ConnectionState::Closed {
            return Err(Error::SessionClosed);
        }
        let name = topic.name();
        if self.inner.registry.unsubscribe(&name).await {
            let _ = self.inner.command_tx.send(Command::Unsubscribe(name));
        }
        Ok(())
    }

    /// Request a one-off orderbook snapshot for a symbol.
    ///
    /// The reply is routed into the `<symbol>@orderbook` inbox.
    pub fn request_orderbook(&self, symbol: impl Into<String>) -> Result<()> {
        if self.inner.state() == ConnectionState::Closed {
            return Err(Error::SessionClosed);
        }
        let _ = self
            .inner
            .command_tx
            .send(Command::RequestOrderbook(symbol.into()));
        Ok(())
    }

    /// Wait for the next message on a topic, up to `timeout`.
    ///
    /// Returns [`Error::ReceiveTimeout`] when no message arrives in the
    /// window; the session keeps waiting through transient reconnects, so
    /// a patient consumer never observes them.
    pub async fn recv(&self, topic: &Topic, timeout: Duration) -> Result<Message> {
        self.recv_topic(&topic.name(), timeout).await
    }

    /// [`recv`](WsSession::recv) by topic identifier string.
    ///
    /// A topic with no subscription yet is waited on: a `subscribe` issued
    /// during the window is picked up, and `close()` resolves the wait
    /// with [`Error::SessionClosed`] immediately.
    pub async fn recv_topic(&self, name: &str, timeout: Duration) -> Result<Message> {
        let deadline = Instant::now() + timeout;
        let mut state_rx = self.inner.state_rx.clone();
        let mut membership_rx = self.inner.registry.membership_receiver();
        loop {
            if *state_rx.borrow_and_update() == ConnectionState::Closed {
                return Err(Error::SessionClosed);
            }
            membership_rx.borrow_and_update();
            if let Some(inbox) = self.inner.registry.inbox(name).await {
                let remaining = deadline.saturating_duration_since(Instant::now());
                return inbox.recv(remaining).await;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return Err(Error::ReceiveTimeout),
                _ = state_rx.changed() => {}
                _ = membership_rx.changed() => {}
            }
        }
    }

    /// Close the session permanently. Idempotent.
    ///
    /// The supervisor task is stopped, the socket released, and every
    /// pending or future `recv` resolves to [`Error::SessionClosed`].
    pub async fn close(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        let _ = self.inner.state_tx.send(ConnectionState::Closed);
        self.inner.registry.close_all().await;
    }
}

// ============================================================================
// Supervisor: owns the socket, drives the state machine
// ============================================================================

async fn supervisor(inner: Arc<SessionInner>, mut command_rx: mpsc::UnboundedReceiver<Command>) {
    let mut shutdown_rx = inner.shutdown_rx.clone();

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // Stale commands are superseded by the registry replay below
        while command_rx.try_recv().is_ok() {}

        inner.set_state(ConnectionState::Connecting);
        match run_connection(&inner, &mut command_rx, &mut shutdown_rx).await {
            Ok(ConnExit::Shutdown) => break,
            Err(e) if e.is_fatal() => {
                error!(endpoint = %inner.endpoint, error = %e, "fatal session error");
                inner.record_error(e);
                let _ = inner.state_tx.send(ConnectionState::Closed);
                inner.registry.close_all().await;
                return;
            }
            Err(e) => {
                let attempt = inner.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
                if !inner.config.reconnect.should_attempt(attempt) {
                    error!(
                        endpoint = %inner.endpoint,
                        attempts = attempt,
                        "giving up on reconnection"
                    );
                    inner.record_error(e);
                    inner.set_state(ConnectionState::Disconnected);
                    inner.started.store(false, Ordering::Release);
                    return;
                }

                inner.set_state(ConnectionState::Reconnecting);
                let delay = inner.config.reconnect.jittered_delay(attempt);
                warn!(
                    endpoint = %inner.endpoint,
                    error = %e,
                    attempt,
                    ?delay,
                    "connection lost, reconnecting"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.changed() => {}
                }
            }
        }
    }
    inner.set_state(ConnectionState::Disconnected);
}

/// One connection lifetime: connect, authenticate, replay subscriptions,
/// then serve the read loop until shutdown or failure
async fn run_connection(
    inner: &SessionInner,
    command_rx: &mut mpsc::UnboundedReceiver<Command>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<ConnExit> {
    debug!(endpoint = %inner.endpoint, "connecting");
    let (ws_stream, _response) = connect_async(inner.endpoint.as_str())
        .await
        .map_err(|e| Error::Transport(e.to_string()))?;
    let (mut sink, mut stream) = ws_stream.split();

    if let Some(credentials) = &inner.credentials {
        inner.set_state(ConnectionState::Authenticating);
        authenticate(inner, credentials, &mut sink, &mut stream).await?;
    }

    inner.set_state(ConnectionState::Subscribing);
    // Tracks topics already subscribed on this connection; commands queued
    // while the handshake was in flight cover topics the replay just sent
    let mut subscribed = HashSet::new();
    for topic in inner.registry.topics().await {
        send_frame(
            &mut sink,
            &OutboundFrame::subscribe(&inner.config.client_id, &topic),
        )
        .await?;
        subscribed.insert(topic.name());
    }

    inner.reconnect_attempts.store(0, Ordering::Relaxed);
    inner.set_state(ConnectionState::Ready);
    info!(endpoint = %inner.endpoint, "session ready");

    let mut monitor = HeartbeatMonitor::new(inner.config.heartbeat.clone());
    let mut heartbeat = interval(inner.config.heartbeat.interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick fires immediately; skip it so a fresh connection is
    // not pinged before any traffic
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return Ok(ConnExit::Shutdown);
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        monitor.record_traffic();
                        dispatch(inner, text.as_str(), &mut sink, &mut subscribed).await?;
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        monitor.record_traffic();
                        sink.send(WsMessage::Pong(data))
                            .await
                            .map_err(|e| Error::Transport(e.to_string()))?;
                    }
                    Some(Ok(WsMessage::Pong(_))) => {
                        monitor.record_traffic();
                    }
                    Some(Ok(WsMessage::Close(_))) => {
                        return Err(Error::Transport("connection closed by server".to_string()));
                    }
                    Some(Ok(_)) => {
                        // Binary and raw frames are not part of the protocol
                        monitor.record_traffic();
                    }
                    Some(Err(e)) => return Err(Error::Transport(e.to_string())),
                    None => return Err(Error::Transport("stream ended".to_string())),
                }
            }
            cmd = command_rx.recv() => {
                if let Some(cmd) = cmd {
                    handle_command(inner, cmd, &mut sink, &mut subscribed).await?;
                }
            }
            _ = heartbeat.tick() => {
                if monitor.is_stale() {
                    return Err(Error::Transport(format!(
                        "no traffic within {:?}",
                        inner.config.heartbeat.liveness_timeout()
                    )));
                }
                send_frame(&mut sink, &OutboundFrame::Ping).await?;
            }
        }
    }
}

/// Complete the private login handshake on a fresh connection.
///
/// A timestamp-skew rejection is retried once with a fresh timestamp;
/// everything else is fatal.
async fn authenticate(
    inner: &SessionInner,
    credentials: &Credentials,
    sink: &mut WsSink,
    stream: &mut WsStream,
) -> Result<()> {
    let mut retried = false;
    loop {
        send_frame(sink, &auth::login_frame(&inner.config.client_id, credentials)).await?;
        let deadline = Instant::now() + inner.config.auth_timeout;

        loop {
            let item = match timeout_at(deadline, stream.next()).await {
                Ok(Some(Ok(msg))) => msg,
                Ok(Some(Err(e))) => return Err(Error::Transport(e.to_string())),
                Ok(None) => {
                    return Err(Error::Transport(
                        "connection closed during authentication".to_string(),
                    ))
                }
                Err(_) => {
                    return Err(Error::Transport(
                        "timed out waiting for auth acknowledgement".to_string(),
                    ))
                }
            };

            match item {
                WsMessage::Text(text) => match classify(text.as_str()) {
                    Ok(Frame::AuthAck { success: true, .. }) => {
                        debug!(endpoint = %inner.endpoint, "authenticated");
                        return Ok(());
                    }
                    Ok(Frame::AuthAck {
                        success: false,
                        message,
                    }) => match auth::classify_rejection(message.as_deref()) {
                        auth::Rejection::ExpiredToken if !retried => {
                            warn!("auth timestamp rejected, retrying with a fresh one");
                            inner.record_error(Error::AuthExpiredToken);
                            retried = true;
                            break;
                        }
                        auth::Rejection::ExpiredToken => {
                            return Err(Error::AuthRejected(
                                "timestamp rejected twice".to_string(),
                            ));
                        }
                        auth::Rejection::Fatal => {
                            return Err(Error::AuthRejected(
                                message.unwrap_or_else(|| "credentials refused".to_string()),
                            ));
                        }
                    },
                    Ok(Frame::Ping) => {
                        send_frame(sink, &OutboundFrame::Pong).await?;
                    }
                    Ok(_) => {
                        // Not Ready yet; frames from a previous life of the
                        // server-side session are dropped
                    }
                    Err(e) => {
                        warn!(error = %e, "dropping malformed frame during auth");
                    }
                },
                WsMessage::Ping(data) => {
                    sink.send(WsMessage::Pong(data))
                        .await
                        .map_err(|e| Error::Transport(e.to_string()))?;
                }
                WsMessage::Close(_) => {
                    return Err(Error::Transport(
                        "connection closed during authentication".to_string(),
                    ));
                }
                _ => {}
            }
        }
    }
}

/// Classify one inbound text frame and route it
async fn dispatch(
    inner: &SessionInner,
    text: &str,
    sink: &mut WsSink,
    subscribed: &mut HashSet<String>,
) -> Result<()> {
    let frame = match classify(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "dropping malformed frame");
            return Ok(());
        }
    };

    match frame {
        Frame::Ping => {
            send_frame(sink, &OutboundFrame::Pong).await?;
        }
        Frame::Pong => {}
        Frame::AuthAck { success, .. } => {
            // The handshake already completed; a stray ack is informational
            debug!(success, "auth acknowledgement outside handshake");
        }
        Frame::SubscribeAck {
            topic,
            success: true,
            ..
        } => {
            debug!(topic = topic.as_deref().unwrap_or("?"), "subscription confirmed");
        }
        Frame::SubscribeAck {
            topic,
            success: false,
            message,
        } => {
            let topic = topic.unwrap_or_default();
            let message = message.unwrap_or_else(|| "refused by server".to_string());
            warn!(%topic, %message, "subscription rejected, removing topic");
            inner.record_error(Error::SubscribeRejected {
                topic: topic.clone(),
                message,
            });
            subscribed.remove(&topic);
            inner.registry.unsubscribe(&topic).await;
        }
        Frame::UnsubscribeAck { topic, success } => {
            debug!(topic = topic.as_deref().unwrap_or("?"), success, "unsubscribe acknowledged");
        }
        Frame::ServerError { code, message } => {
            warn!(?code, %message, "server reported an error");
        }
        Frame::OrderbookSnapshot { symbol, ts, data } => {
            deliver(inner, format!("{symbol}@orderbook"), ts, data).await;
        }
        Frame::Data { topic, ts, data } => {
            deliver(inner, topic, ts, data).await;
        }
    }
    Ok(())
}

/// Enqueue a data payload into its topic inbox; frames for inactive
/// topics (e.g. late frames after an unsubscribe) are dropped
async fn deliver(inner: &SessionInner, topic: String, ts: Option<u64>, data: serde_json::Value) {
    match inner.registry.inbox(&topic).await {
        Some(inbox) => {
            inbox
                .push(Message {
                    topic,
                    ts,
                    data,
                    received_at: Instant::now(),
                })
                .await;
        }
        None => {
            debug!(%topic, "dropping frame for inactive topic");
        }
    }
}

async fn handle_command(
    inner: &SessionInner,
    command: Command,
    sink: &mut WsSink,
    subscribed: &mut HashSet<String>,
) -> Result<()> {
    match command {
        Command::Subscribe(topic) => {
            // Skipped when the topic was unsubscribed while the command was
            // queued, or when the replay already sent it on this connection
            let name = topic.name();
            if inner.registry.contains(&name).await && subscribed.insert(name) {
                send_frame(
                    sink,
                    &OutboundFrame::subscribe(&inner.config.client_id, &topic),
                )
                .await?;
            }
        }
        Command::Unsubscribe(name) => {
            subscribed.remove(&name);
            send_frame(sink, &OutboundFrame::unsubscribe(&inner.config.client_id, &name)).await?;
        }
        Command::RequestOrderbook(symbol) => {
            send_frame(
                sink,
                &OutboundFrame::request_orderbook(&inner.config.client_id, &symbol),
            )
            .await?;
        }
    }
    Ok(())
}

async fn send_frame(sink: &mut WsSink, frame: &OutboundFrame) -> Result<()> {
    let text = serde_json::to_string(frame)?;
    if !frame.is_heartbeat() {
        debug!(frame = %text, "sending frame");
    }
    sink.send(WsMessage::Text(text.into()))
        .await
        .map_err(|e| Error::Transport(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ============ ConnectionState ============

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Disconnected.to_string(), "Disconnected");
        assert_eq!(ConnectionState::Connecting.to_string(), "Connecting");
        assert_eq!(ConnectionState::Authenticating.to_string(), "Authenticating");
        assert_eq!(ConnectionState::Subscribing.to_string(), "Subscribing");
        assert_eq!(ConnectionState::Ready.to_string(), "Ready");
        assert_eq!(ConnectionState::Reconnecting.to_string(), "Reconnecting");
        assert_eq!(ConnectionState::Closed.to_string(), "Closed");
    }

    // ============ ReconnectConfig ============

    #[test]
    fn test_reconnect_config_default() {
        let config = ReconnectConfig::default();
        assert!(config.enabled);
        assert_eq!(config.initial_delay, Duration::from_millis(500));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert_eq!(config.backoff_multiplier, 2.0);
        assert!(config.max_attempts.is_none());
    }

    #[test]
    fn test_reconnect_config_disabled() {
        let config = ReconnectConfig::disabled();
        assert!(!config.enabled);
        assert!(!config.should_attempt(0));
    }

    #[test]
    fn test_reconnect_delay_progression() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            ..Default::default()
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(800));
    }

    #[test]
    fn test_reconnect_delay_capped_at_max() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 10.0,
            ..Default::default()
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(config.delay_for_attempt(6), Duration::from_secs(5));
    }

    #[test]
    fn test_jittered_delay_stays_in_bounds() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: 0.5,
            ..Default::default()
        };

        for _ in 0..50 {
            let delay = config.jittered_delay(2);
            assert!(delay >= Duration::from_millis(400));
            assert!(delay <= Duration::from_millis(600));
        }
    }

    #[test]
    fn test_zero_jitter_is_deterministic() {
        let config = ReconnectConfig {
            jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(config.jittered_delay(1), config.delay_for_attempt(1));
    }

    #[test]
    fn test_should_attempt_limits() {
        let unlimited = ReconnectConfig::default();
        assert!(unlimited.should_attempt(0));
        assert!(unlimited.should_attempt(10_000));

        let limited = ReconnectConfig {
            max_attempts: Some(3),
            ..Default::default()
        };
        assert!(limited.should_attempt(2));
        assert!(!limited.should_attempt(3));
    }

    // ============ Network / SessionConfig ============

    #[test]
    fn test_network_urls() {
        assert_eq!(Network::Mainnet.public_ws_url(), MAINNET_PUBLIC_WS_URL);
        assert_eq!(Network::Mainnet.private_ws_url(), MAINNET_PRIVATE_WS_URL);
        assert_eq!(Network::Testnet.public_ws_url(), TESTNET_PUBLIC_WS_URL);
        assert_eq!(Network::Testnet.private_ws_url(), TESTNET_PRIVATE_WS_URL);
    }

    #[test]
    fn test_session_config_default() {
        let config = SessionConfig::default();
        assert_eq!(config.client_id, "WS_PUBLIC");
        assert_eq!(config.inbox_capacity, 1024);
        assert_eq!(config.auth_timeout, Duration::from_secs(10));
    }

    // ============ WsSession construction ============

    fn test_credentials() -> Credentials {
        let key = bs58::encode([1u8; 32]).into_string();
        let secret = bs58::encode([7u8; 32]).into_string();
        Credentials::new("acct-1", &key, &secret).unwrap()
    }

    #[test]
    fn test_public_session_endpoint() {
        let session = WsSession::public(Network::Testnet, "acct-1");
        assert_eq!(session.kind(), SessionKind::Public);
        assert_eq!(
            session.endpoint(),
            "wss://testnet-ws-evm.orderly.org/ws/stream/acct-1"
        );
    }

    #[test]
    fn test_private_session_endpoint() {
        let session = WsSession::private(Network::Mainnet, test_credentials());
        assert_eq!(session.kind(), SessionKind::Private);
        assert_eq!(
            session.endpoint(),
            "wss://ws-private-evm.orderly.org/v2/ws/private/stream/acct-1"
        );
    }

    #[tokio::test]
    async fn test_initial_state() {
        let session = WsSession::public(Network::Testnet, "acct");
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(session.reconnect_attempts(), 0);
        assert!(session.last_error().is_none());
    }

    #[test]
    fn test_state_receiver() {
        let session = WsSession::public(Network::Testnet, "acct");
        let rx = session.state_receiver();
        assert_eq!(*rx.borrow(), ConnectionState::Disconnected);
    }

    // ============ Subscribe / recv without a connection ============

    #[tokio::test]
    async fn test_subscribe_before_start_is_queued() {
        let session = WsSession::public(Network::Testnet, "acct");
        let first = session.subscribe(Topic::bbos()).await.unwrap();
        let second = session.subscribe(Topic::bbos()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_unknown_topic_times_out() {
        let session = WsSession::public(Network::Testnet, "acct");
        let start = Instant::now();
        let result = session
            .recv(&Topic::bbos(), Duration::from_secs(3))
            .await;
        assert!(matches!(result, Err(Error::ReceiveTimeout)));
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_picks_up_topic_subscribed_mid_wait() {
        let session = WsSession::public(Network::Testnet, "acct");
        let waiter = {
            let session = session.clone();
            tokio::spawn(
                async move { session.recv_topic("bbos", Duration::from_secs(5)).await },
            )
        };
        tokio::task::yield_now().await;

        let inbox = session.subscribe(Topic::bbos()).await.unwrap();
        inbox
            .push(Message {
                topic: "bbos".to_string(),
                ts: Some(7),
                data: serde_json::json!({}),
                received_at: Instant::now(),
            })
            .await;

        let msg = waiter.await.unwrap().unwrap();
        assert_eq!(msg.ts, Some(7));
    }

    #[tokio::test]
    async fn test_close_wakes_recv_on_unknown_topic() {
        let session = WsSession::public(Network::Testnet, "acct");
        let waiter = {
            let session = session.clone();
            tokio::spawn(
                async move { session.recv_topic("bbos", Duration::from_secs(60)).await },
            )
        };
        tokio::task::yield_now().await;

        session.close().await;
        assert!(matches!(
            waiter.await.unwrap(),
            Err(Error::SessionClosed)
        ));
    }

    // ============ Close semantics ============

    #[tokio::test]
    async fn test_close_is_idempotent_and_terminal() {
        let session = WsSession::public(Network::Testnet, "acct");
        let inbox = session.subscribe(Topic::bbos()).await.unwrap();

        session.close().await;
        session.close().await;

        assert_eq!(session.state(), ConnectionState::Closed);
        assert!(matches!(
            inbox.recv(Duration::from_millis(1)).await,
            Err(Error::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_operations_after_close() {
        let session = WsSession::public(Network::Testnet, "acct");
        session.close().await;

        assert!(matches!(
            session.subscribe(Topic::bbos()).await,
            Err(Error::SessionClosed)
        ));
        assert!(matches!(
            session.unsubscribe(&Topic::bbos()).await,
            Err(Error::SessionClosed)
        ));
        assert!(matches!(
            session.recv(&Topic::bbos(), Duration::from_millis(1)).await,
            Err(Error::SessionClosed)
        ));
        assert!(matches!(
            session.request_orderbook("PERP_ETH_USDC"),
            Err(Error::SessionClosed)
        ));
        assert!(matches!(session.start().await, Err(Error::SessionClosed)));
    }

    #[tokio::test]
    async fn test_closed_state_is_never_overwritten() {
        let session = WsSession::public(Network::Testnet, "acct");
        session.close().await;
        session.inner.set_state(ConnectionState::Ready);
        assert_eq!(session.state(), ConnectionState::Closed);
    }

    // ============ Send/Sync ============

    #[test]
    fn test_session_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<WsSession>();
        assert_sync::<WsSession>();
    }

    #[test]
    fn test_session_debug() {
        let session = WsSession::public(Network::Testnet, "acct");
        let debug_str = format!("{session:?}");
        assert!(debug_str.contains("WsSession"));
        assert!(debug_str.contains("Public"));
    }
}
