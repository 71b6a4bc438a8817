//! Per-client owner of every realtime resource.
//!
//! A [`Session`] holds the inbox and presence connections for the signed-in
//! user and at most one open [`Room`]. Logging out or dropping the session
//! closes all of them.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use url::Url;

use courier_proto::event::Inbound;
use courier_proto::message::PeerUserInfo;
use courier_proto::thread::ThreadSummary;

use crate::api::{ApiError, ChatApi};
use crate::connection::{
    Channel, Connection, ConnectionEvent, ConnectionOptions, ConnectionState, CredentialSource,
    ReconnectConfig,
};
use crate::inbox::Inbox;
use crate::presence::{DEFAULT_POLL_INTERVAL, PresenceState, PresenceTracker};
use crate::room::{Room, RoomEvent};
use crate::typing::TypingConfig;

/// Presence keepalive interval; the server expires online state without it.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(25);

/// Realtime settings shared by every channel of a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Socket base URL, e.g. `ws://host/ws/`.
    pub ws_base: Url,
    /// Backoff used by reconnecting channels.
    pub reconnect: ReconnectConfig,
    /// Whether the inbox channel reconnects after a drop.
    pub inbox_reconnect: bool,
    /// Presence keepalive interval.
    pub keepalive: Duration,
    /// Handshake timeout.
    pub connect_timeout: Duration,
    /// Capacity of event channels.
    pub event_buffer: usize,
    /// Capacity of room command channels.
    pub command_buffer: usize,
    /// Typing windows.
    pub typing: TypingConfig,
    /// Presence poll interval while a room is open.
    pub presence_interval: Duration,
}

impl SessionConfig {
    /// Defaults for everything but the socket base.
    #[must_use]
    pub fn new(ws_base: Url) -> Self {
        Self {
            ws_base,
            reconnect: ReconnectConfig::default(),
            inbox_reconnect: true,
            keepalive: DEFAULT_KEEPALIVE,
            connect_timeout: Duration::from_secs(10),
            event_buffer: 256,
            command_buffer: 64,
            typing: TypingConfig::default(),
            presence_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Connection options for one channel.
    #[must_use]
    pub fn connection_options(&self, reconnect: bool, keepalive: Option<Duration>) -> ConnectionOptions {
        ConnectionOptions {
            reconnect: reconnect.then(|| self.reconnect.clone()),
            keepalive,
            connect_timeout: self.connect_timeout,
            event_buffer: self.event_buffer,
        }
    }
}

/// Session-level notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A thread changed and the list was re-sorted.
    ThreadUpdated(ThreadSummary),
    /// The inbox socket changed state.
    InboxConnection(ConnectionState),
    /// The presence socket changed state.
    PresenceConnection(ConnectionState),
    /// A pushed presence change.
    Presence(PresenceState),
    /// A channel's credential was rejected.
    AuthRejected(Channel),
}

/// Errors from session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// An HTTP call failed.
    #[error(transparent)]
    Api(#[from] ApiError),
    /// No credentials are stored.
    #[error("not signed in")]
    NotSignedIn,
    /// The session was logged out.
    #[error("session has been logged out")]
    LoggedOut,
    /// The peer name is empty.
    #[error("invalid peer name: {0:?}")]
    InvalidPeer(String),
}

/// The signed-in user's realtime session.
pub struct Session<A: ChatApi> {
    api: Arc<A>,
    config: SessionConfig,
    me: PeerUserInfo,
    inbox: Arc<Mutex<Inbox>>,
    presence: Arc<Mutex<PresenceTracker>>,
    inbox_conn: Connection,
    presence_conn: Connection,
    driver: JoinHandle<()>,
    room: Option<Room>,
    logged_out: bool,
}

impl<A: ChatApi> Session<A> {
    /// Fetches identity and threads, then opens the inbox and presence
    /// channels.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotSignedIn`] without credentials, or
    /// [`SessionError::Api`] if a fetch fails.
    pub async fn start(
        api: Arc<A>,
        config: SessionConfig,
    ) -> Result<(Self, mpsc::Receiver<SessionEvent>), SessionError> {
        if !api.credentials().is_signed_in() {
            return Err(SessionError::NotSignedIn);
        }
        let me = api.me().await?;
        let threads = api.threads().await?;

        let mut inbox = Inbox::new();
        inbox.load(threads);
        tracing::info!(user = %me.username, threads = inbox.len(), "session starting");
        let inbox = Arc::new(Mutex::new(inbox));
        let presence = Arc::new(Mutex::new(PresenceTracker::new()));

        let credentials = Arc::new(api.credentials().clone());
        let (inbox_conn, inbox_events) = Connection::open(
            Channel::Inbox,
            config.ws_base.clone(),
            Arc::clone(&credentials) as Arc<dyn CredentialSource>,
            config.connection_options(config.inbox_reconnect, None),
        );
        let (presence_conn, presence_events) = Connection::open(
            Channel::Presence,
            config.ws_base.clone(),
            credentials,
            config.connection_options(true, Some(config.keepalive)),
        );

        let (events_tx, events_rx) = mpsc::channel(config.event_buffer);
        let driver = tokio::spawn(
            SessionDriver {
                inbox: Arc::clone(&inbox),
                presence: Arc::clone(&presence),
                inbox_events,
                presence_events,
                events: events_tx,
            }
            .run(),
        );

        Ok((
            Self {
                api,
                config,
                me,
                inbox,
                presence,
                inbox_conn,
                presence_conn,
                driver,
                room: None,
                logged_out: false,
            },
            events_rx,
        ))
    }

    /// The signed-in user.
    #[must_use]
    pub const fn me(&self) -> &PeerUserInfo {
        &self.me
    }

    /// Threads in display order.
    #[must_use]
    pub fn threads(&self) -> Vec<ThreadSummary> {
        self.inbox.lock().threads().to_vec()
    }

    /// Total unread messages across threads.
    #[must_use]
    pub fn total_unread(&self) -> u32 {
        self.inbox.lock().total_unread()
    }

    /// Threads matching `query` by username or name.
    #[must_use]
    pub fn search(&self, query: &str) -> Vec<ThreadSummary> {
        self.inbox.lock().search(query).into_iter().cloned().collect()
    }

    /// Known presence of `peer`.
    #[must_use]
    pub fn presence_of(&self, peer: &str) -> Option<PresenceState> {
        self.presence.lock().get(peer).cloned()
    }

    /// Inbox socket state.
    #[must_use]
    pub fn inbox_state(&self) -> ConnectionState {
        self.inbox_conn.state()
    }

    /// Presence socket state.
    #[must_use]
    pub fn presence_state(&self) -> ConnectionState {
        self.presence_conn.state()
    }

    /// Opens the room with `peer`, closing any room already open.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::LoggedOut`] after logout,
    /// [`SessionError::InvalidPeer`] for an empty name, or
    /// [`SessionError::Api`] if the history fetch fails.
    pub async fn open_room(&mut self, peer: &str) -> Result<mpsc::Receiver<RoomEvent>, SessionError> {
        if self.logged_out {
            return Err(SessionError::LoggedOut);
        }
        let peer = peer.trim();
        if peer.is_empty() {
            return Err(SessionError::InvalidPeer(peer.to_owned()));
        }
        self.close_room();

        let (room, events) = Room::open(
            Arc::clone(&self.api),
            peer,
            Some(self.me.username.clone()),
            Arc::clone(&self.presence),
            &self.config,
        )
        .await?;
        self.room = Some(room);
        Ok(events)
    }

    /// The open room, if any.
    #[must_use]
    pub const fn room(&self) -> Option<&Room> {
        self.room.as_ref()
    }

    /// Closes the open room, if any.
    pub fn close_room(&mut self) {
        if let Some(room) = self.room.take() {
            room.close();
        }
    }

    /// Closes every connection, cancels every timer and clears credentials.
    pub fn logout(&mut self) {
        self.teardown();
        self.api.credentials().clear();
        tracing::info!(user = %self.me.username, "logged out");
    }

    /// Whether [`logout`](Self::logout) was called.
    #[must_use]
    pub const fn is_logged_out(&self) -> bool {
        self.logged_out
    }

    fn teardown(&mut self) {
        self.close_room();
        self.inbox_conn.close();
        self.presence_conn.close();
        self.driver.abort();
        self.logged_out = true;
    }
}

impl<A: ChatApi> std::fmt::Debug for Session<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("me", &self.me.username)
            .field("room", &self.room)
            .field("logged_out", &self.logged_out)
            .finish_non_exhaustive()
    }
}

impl<A: ChatApi> Drop for Session<A> {
    fn drop(&mut self) {
        if !self.logged_out {
            self.teardown();
        }
    }
}

/// Routes inbox and presence channel events into shared state.
struct SessionDriver {
    inbox: Arc<Mutex<Inbox>>,
    presence: Arc<Mutex<PresenceTracker>>,
    inbox_events: mpsc::Receiver<ConnectionEvent>,
    presence_events: mpsc::Receiver<ConnectionEvent>,
    events: mpsc::Sender<SessionEvent>,
}

impl SessionDriver {
    async fn run(mut self) {
        loop {
            let out = tokio::select! {
                Some(event) = self.inbox_events.recv() => self.on_inbox(event),
                Some(event) = self.presence_events.recv() => self.on_presence(event),
                else => break,
            };
            if let Some(event) = out {
                match self.events.try_send(event) {
                    Ok(()) => {}
                    Err(TrySendError::Full(event)) => {
                        tracing::debug!(?event, "session event receiver lagging, notification dropped");
                    }
                    Err(TrySendError::Closed(_)) => {
                        tracing::trace!("session event receiver dropped");
                    }
                }
            }
        }
        tracing::debug!("session driver exiting");
    }

    fn on_inbox(&self, event: ConnectionEvent) -> Option<SessionEvent> {
        match event {
            ConnectionEvent::StateChanged(state) => Some(SessionEvent::InboxConnection(state)),
            ConnectionEvent::AuthRejected => Some(SessionEvent::AuthRejected(Channel::Inbox)),
            ConnectionEvent::Inbound(Inbound::ThreadUpdate(update)) => {
                let username = update.user.as_ref()?.username.clone();
                let mut inbox = self.inbox.lock();
                if !inbox.apply_update(update) {
                    return None;
                }
                inbox.thread(&username).cloned().map(SessionEvent::ThreadUpdated)
            }
            ConnectionEvent::Inbound(other) => {
                tracing::trace!(kind = other.kind(), "inbox event ignored");
                None
            }
            ConnectionEvent::ReconnectScheduled { .. } | ConnectionEvent::ReconnectExhausted { .. } => None,
        }
    }

    fn on_presence(&self, event: ConnectionEvent) -> Option<SessionEvent> {
        match event {
            ConnectionEvent::StateChanged(state) => Some(SessionEvent::PresenceConnection(state)),
            ConnectionEvent::AuthRejected => Some(SessionEvent::AuthRejected(Channel::Presence)),
            ConnectionEvent::Inbound(Inbound::PresenceUpdate {
                user,
                online,
                last_seen,
            }) => self
                .presence
                .lock()
                .apply_push(&user, online, last_seen)
                .map(SessionEvent::Presence),
            ConnectionEvent::Inbound(other) => {
                tracing::trace!(kind = other.kind(), "presence event ignored");
                None
            }
            ConnectionEvent::ReconnectScheduled { .. } | ConnectionEvent::ReconnectExhausted { .. } => None,
        }
    }
}
