//! Authenticated channel sockets with lifecycle and reconnect supervision.
//!
//! A [`Connection`] owns one WebSocket to one channel (inbox, a room, or
//! presence). A background supervisor task performs the handshake, pumps
//! frames in both directions, and reconnects after unexpected closes as
//! decided by [`lifecycle::Lifecycle`].
//!
//! ```text
//! owner ── send(Outbound) ──► outbound slot ──► socket
//!       ◄── ConnectionEvent ── supervisor  ◄── socket
//! ```
//!
//! Outbound frames are only accepted while the socket is open. There is no
//! offline queue: `send` returns `false` and the frame is dropped.

pub mod lifecycle;

use std::fmt;
use std::future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;
use uuid::Uuid;

use courier_proto::codec;
use courier_proto::event::{Inbound, Outbound};

pub use lifecycle::{AfterClose, CloseCause, ConnectionState, Lifecycle, ReconnectConfig};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default handshake timeout.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default capacity of the event channel handed to the owner.
const DEFAULT_EVENT_BUFFER: usize = 256;

/// How long an explicit close waits for the close frame to flush.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Which server channel a connection targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Thread summary updates for the local user.
    Inbox,
    /// The one-to-one room with `peer`.
    Room {
        /// Username of the other participant.
        peer: String,
    },
    /// The presence heartbeat socket.
    Presence,
}

impl Channel {
    /// Room channel for `peer`.
    #[must_use]
    pub fn room(peer: impl Into<String>) -> Self {
        Self::Room { peer: peer.into() }
    }

    /// Path segments below the socket base URL, trailing slash included.
    fn segments(&self) -> Vec<&str> {
        match self {
            Self::Inbox => vec!["inbox", ""],
            Self::Room { peer } => vec!["chat", peer.as_str(), ""],
            Self::Presence => vec!["presence", ""],
        }
    }

    /// Frames sent immediately after every successful handshake.
    fn on_open_frames(&self) -> Vec<Outbound> {
        match self {
            Self::Room { .. } => vec![Outbound::SeenAll],
            Self::Inbox | Self::Presence => Vec::new(),
        }
    }

    /// Builds the authenticated socket URL for this channel.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::InvalidUrl`] if `base` cannot carry a path.
    pub fn url(&self, base: &Url, token: &str) -> Result<Url, ConnectionError> {
        let mut url = base.clone();
        url.path_segments_mut()
            .map_err(|()| ConnectionError::InvalidUrl(base.to_string()))?
            .pop_if_empty()
            .extend(self.segments());
        url.query_pairs_mut().clear().append_pair("token", token);
        Ok(url)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbox => write!(f, "inbox"),
            Self::Room { peer } => write!(f, "chat/{peer}"),
            Self::Presence => write!(f, "presence"),
        }
    }
}

/// Unique identity of one [`Connection`] instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn generate() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Supplies the current access credential.
///
/// Read on every connection attempt so a refreshed token is picked up by
/// reconnects.
pub trait CredentialSource: Send + Sync {
    /// The current access token, or `None` when signed out.
    fn access_token(&self) -> Option<String>;
}

/// A fixed access token.
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

impl CredentialSource for StaticToken {
    fn access_token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Errors from establishing a channel socket.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The socket base URL cannot be extended with a channel path.
    #[error("invalid socket base url: {0}")]
    InvalidUrl(String),
    /// No access token is available.
    #[error("no access token available")]
    MissingCredentials,
    /// The server refused the credential during the handshake.
    #[error("handshake rejected with status {0}")]
    AuthRejected(u16),
    /// The handshake did not finish in time.
    #[error("connection timed out")]
    Timeout,
    /// Network or protocol failure.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ConnectionError {
    const fn close_cause(&self) -> CloseCause {
        match self {
            Self::AuthRejected(_) | Self::MissingCredentials => CloseCause::AuthRejected,
            Self::InvalidUrl(_) | Self::Timeout | Self::Transport(_) => CloseCause::Transport,
        }
    }
}

/// Notifications from a connection's supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The lifecycle state changed.
    StateChanged(ConnectionState),
    /// A decoded server event.
    Inbound(Inbound),
    /// The socket closed unexpectedly and one reconnect is pending.
    ReconnectScheduled {
        /// 1-based attempt number.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// The reconnect budget ran out; the connection stays closed.
    ReconnectExhausted {
        /// Attempts that were made.
        attempts: u32,
    },
    /// The server rejected the credential; the connection stays closed.
    AuthRejected,
}

/// Per-connection behaviour knobs.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Reconnect policy, `None` to stay closed after a failure.
    pub reconnect: Option<ReconnectConfig>,
    /// Send a `ping` frame at this interval while open. Zero disables it.
    pub keepalive: Option<Duration>,
    /// Handshake timeout.
    pub connect_timeout: Duration,
    /// Capacity of the event channel.
    pub event_buffer: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            reconnect: None,
            keepalive: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

/// State shared between the owner handle, sender handles and the supervisor.
struct Shared {
    id: ConnectionId,
    channel: Channel,
    lifecycle: Mutex<Lifecycle>,
    /// Present only while the socket is open.
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    state_tx: watch::Sender<ConnectionState>,
}

impl Shared {
    fn publish(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    fn send(&self, event: &Outbound) -> bool {
        let slot = self.outbound.lock();
        let Some(tx) = slot.as_ref() else {
            tracing::debug!(
                channel = %self.channel,
                kind = event.kind(),
                "connection not open, dropping outbound event"
            );
            return false;
        };
        let frame = match codec::encode_outbound(event) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(channel = %self.channel, err = %e, "failed to encode outbound event");
                return false;
            }
        };
        tx.send(frame).is_ok()
    }
}

/// Cloneable handle that can send on a connection without owning it.
#[derive(Clone)]
pub struct ConnectionSender {
    shared: Arc<Shared>,
}

impl ConnectionSender {
    /// Sends `event` if the connection is open. Returns `false` if dropped.
    pub fn send(&self, event: &Outbound) -> bool {
        self.shared.send(event)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.lifecycle.lock().state()
    }
}

impl fmt::Debug for ConnectionSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSender")
            .field("id", &self.shared.id)
            .field("channel", &self.shared.channel)
            .finish_non_exhaustive()
    }
}

/// An owned channel connection.
///
/// Dropping the handle closes the socket and cancels any pending reconnect.
pub struct Connection {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Connection {
    /// Opens `channel` against `ws_base` and starts supervising it.
    ///
    /// Returns immediately in the `Connecting` state; progress is reported
    /// on the returned event receiver. Must be called within a tokio runtime.
    pub fn open(
        channel: Channel,
        ws_base: Url,
        credentials: Arc<dyn CredentialSource>,
        options: ConnectionOptions,
    ) -> (Self, mpsc::Receiver<ConnectionEvent>) {
        let (events_tx, events_rx) = mpsc::channel(options.event_buffer.max(1));
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            id: ConnectionId::generate(),
            channel,
            lifecycle: Mutex::new(Lifecycle::new(options.reconnect.clone())),
            outbound: Mutex::new(None),
            state_tx,
        });

        tracing::debug!(id = %shared.id, channel = %shared.channel, "opening connection");

        let supervisor = Supervisor {
            shared: Arc::clone(&shared),
            ws_base,
            credentials,
            options,
            events: events_tx,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(supervisor.run());

        (
            Self {
                shared,
                shutdown_tx,
                task: Some(task),
            },
            events_rx,
        )
    }

    /// This connection's unique id.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.lifecycle.lock().state()
    }

    /// Subscribes to lifecycle state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Whether a reconnect attempt is currently pending.
    #[must_use]
    pub fn is_reconnect_scheduled(&self) -> bool {
        self.shared.lifecycle.lock().is_reconnect_scheduled()
    }

    /// Sends `event` if the connection is open. Returns `false` if dropped.
    pub fn send(&self, event: &Outbound) -> bool {
        self.shared.send(event)
    }

    /// A cloneable sending handle.
    #[must_use]
    pub fn sender(&self) -> ConnectionSender {
        ConnectionSender {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Requests an explicit close.
    ///
    /// Synchronous: after this returns no reconnect will ever be attempted
    /// and no further outbound frame is accepted. The socket itself is torn
    /// down by the supervisor.
    pub fn close(&self) {
        let tearing_down = {
            let mut lifecycle = self.shared.lifecycle.lock();
            let active = lifecycle.request_close();
            self.shared.publish(lifecycle.state());
            active
        };
        self.shared.outbound.lock().take();
        self.shutdown_tx.send_replace(true);
        if tearing_down {
            tracing::debug!(id = %self.shared.id, channel = %self.shared.channel, "close requested");
        }
    }

    /// Closes the connection and waits for the supervisor to finish.
    pub async fn shutdown(mut self) {
        self.close();
        if let Some(task) = self.task.take() {
            let abort = task.abort_handle();
            if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT * 2, task).await.is_err() {
                abort.abort();
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("channel", &self.shared.channel)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        let mut lifecycle = self.shared.lifecycle.lock();
        lifecycle.mark_closed();
        self.shared.publish(lifecycle.state());
    }
}

/// Background task owning the socket for one [`Connection`].
struct Supervisor {
    shared: Arc<Shared>,
    ws_base: Url,
    credentials: Arc<dyn CredentialSource>,
    options: ConnectionOptions,
    events: mpsc::Sender<ConnectionEvent>,
    shutdown: watch::Receiver<bool>,
}

impl Supervisor {
    async fn run(mut self) {
        loop {
            if !self.transition(Lifecycle::begin_connect).await {
                break;
            }

            let attempt = tokio::select! {
                biased;
                () = shutdown_requested(&mut self.shutdown) => None,
                result = connect(
                    &self.shared.channel,
                    &self.ws_base,
                    self.credentials.as_ref(),
                    self.options.connect_timeout,
                ) => Some(result),
            };

            let cause = match attempt {
                None => CloseCause::Requested,
                Some(Ok(ws)) => self.pump(ws).await,
                Some(Err(e)) => {
                    tracing::warn!(
                        id = %self.shared.id,
                        channel = %self.shared.channel,
                        err = %e,
                        "connection attempt failed"
                    );
                    e.close_cause()
                }
            };

            let after = {
                let mut lifecycle = self.shared.lifecycle.lock();
                let after = lifecycle.on_closed(cause, Instant::now());
                self.shared.publish(lifecycle.state());
                after
            };
            self.emit(ConnectionEvent::StateChanged(ConnectionState::Closed))
                .await;

            match after {
                AfterClose::Reconnect { attempt, delay } => {
                    tracing::info!(
                        channel = %self.shared.channel,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "reconnect scheduled"
                    );
                    self.emit(ConnectionEvent::ReconnectScheduled { attempt, delay })
                        .await;
                    tokio::select! {
                        biased;
                        () = shutdown_requested(&mut self.shutdown) => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                AfterClose::Exhausted { attempts } => {
                    tracing::warn!(channel = %self.shared.channel, attempts, "reconnect attempts exhausted");
                    self.emit(ConnectionEvent::ReconnectExhausted { attempts })
                        .await;
                    break;
                }
                AfterClose::AuthRejected => {
                    tracing::warn!(channel = %self.shared.channel, "credential rejected, not reconnecting");
                    self.emit(ConnectionEvent::AuthRejected).await;
                    break;
                }
                AfterClose::Stay => break,
            }
        }
        tracing::debug!(id = %self.shared.id, channel = %self.shared.channel, "supervisor exiting");
    }

    /// Applies a lifecycle transition, publishing and emitting the new state
    /// if it changed. Returns the transition's verdict.
    async fn transition(&self, f: impl FnOnce(&mut Lifecycle) -> bool) -> bool {
        let (allowed, before, after) = {
            let mut lifecycle = self.shared.lifecycle.lock();
            let before = lifecycle.state();
            let allowed = f(&mut lifecycle);
            let after = lifecycle.state();
            self.shared.publish(after);
            (allowed, before, after)
        };
        if before != after {
            self.emit(ConnectionEvent::StateChanged(after)).await;
        }
        allowed
    }

    async fn emit(&self, event: ConnectionEvent) {
        if self.events.send(event).await.is_err() {
            tracing::trace!(channel = %self.shared.channel, "event receiver dropped");
        }
    }

    /// Runs an open socket until it closes. Returns why it closed.
    async fn pump(&mut self, ws: WsStream) -> CloseCause {
        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

        let opened = {
            let mut lifecycle = self.shared.lifecycle.lock();
            if lifecycle.is_close_requested() {
                false
            } else {
                lifecycle.on_open(Instant::now());
                *self.shared.outbound.lock() = Some(out_tx);
                self.shared.publish(lifecycle.state());
                true
            }
        };
        if !opened {
            let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, sink.close()).await;
            return CloseCause::Requested;
        }

        tracing::info!(id = %self.shared.id, channel = %self.shared.channel, "connection open");
        self.emit(ConnectionEvent::StateChanged(ConnectionState::Open))
            .await;
        for event in self.shared.channel.on_open_frames() {
            self.shared.send(&event);
        }

        let mut keepalive = self.options.keepalive.filter(|p| !p.is_zero()).map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        let cause = loop {
            tokio::select! {
                biased;
                () = shutdown_requested(&mut self.shutdown) => {
                    let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, sink.close()).await;
                    break CloseCause::Requested;
                }
                Some(frame) = out_rx.recv() => {
                    if let Err(e) = sink.send(WsMessage::Text(frame.into())).await {
                        tracing::warn!(channel = %self.shared.channel, err = %e, "socket write failed");
                        break CloseCause::Transport;
                    }
                }
                msg = stream.next() => match msg {
                    Some(Ok(WsMessage::Text(text))) => self.dispatch(&text).await,
                    Some(Ok(WsMessage::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => self.dispatch(text).await,
                        Err(e) => {
                            tracing::warn!(channel = %self.shared.channel, err = %e, "non-utf8 binary frame, skipping");
                        }
                    },
                    Some(Ok(WsMessage::Close(_))) | None => {
                        tracing::info!(channel = %self.shared.channel, "socket closed by server");
                        break CloseCause::Transport;
                    }
                    Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => {}
                    Some(Err(e)) => {
                        tracing::warn!(channel = %self.shared.channel, err = %e, "socket read error");
                        break CloseCause::Transport;
                    }
                },
                () = next_tick(keepalive.as_mut()) => {
                    self.shared.send(&Outbound::Ping);
                }
            }
        };

        self.shared.outbound.lock().take();
        cause
    }

    /// Decodes one frame and forwards it. Malformed frames are skipped.
    async fn dispatch(&self, frame: &str) {
        match codec::decode_inbound(frame) {
            Ok(Inbound::Unknown) => {
                tracing::debug!(channel = %self.shared.channel, "ignoring unknown event kind");
            }
            Ok(event) => {
                tracing::trace!(channel = %self.shared.channel, kind = event.kind(), "inbound event");
                self.emit(ConnectionEvent::Inbound(event)).await;
            }
            Err(e) => {
                tracing::warn!(channel = %self.shared.channel, err = %e, "malformed frame, skipping");
            }
        }
    }
}

/// Performs one authenticated handshake for `channel`.
async fn connect(
    channel: &Channel,
    ws_base: &Url,
    credentials: &dyn CredentialSource,
    timeout: Duration,
) -> Result<WsStream, ConnectionError> {
    let token = credentials
        .access_token()
        .ok_or(ConnectionError::MissingCredentials)?;
    let url = channel.url(ws_base, &token)?;

    let (ws, _response) = tokio::time::timeout(timeout, connect_async(url.as_str()))
        .await
        .map_err(|_| ConnectionError::Timeout)?
        .map_err(map_ws_connect_error)?;
    Ok(ws)
}

/// Resolves once the owner requested shutdown or dropped its handle.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

/// Waits for the next keepalive tick, or forever if there is no keepalive.
async fn next_tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending().await,
    }
}

/// Map a `tokio_tungstenite` handshake error to a [`ConnectionError`].
fn map_ws_connect_error(err: tokio_tungstenite::tungstenite::Error) -> ConnectionError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Http(response) => classify_handshake_status(response.status()),
        WsError::Tls(_) => ConnectionError::Transport(format!("TLS error: {err}")),
        other => ConnectionError::Transport(other.to_string()),
    }
}

/// Credential rejections surface as 401/403 before the upgrade.
fn classify_handshake_status(status: StatusCode) -> ConnectionError {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        ConnectionError::AuthRejected(status.as_u16())
    } else {
        ConnectionError::Transport(format!("handshake failed with status {status}"))
    }
}
