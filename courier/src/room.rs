//! One open conversation: history, live receipts, typing and presence.
//!
//! [`Room::open`] loads history, connects the room channel and spawns a
//! driver task that routes every inbound event to its state slice:
//!
//! ```text
//! room socket ──► driver ──► ReceiptLedger ──► RoomEvent::MessageAdded / ReceiptChanged
//!                        ──► PeerTyping    ──► RoomEvent::PeerTyping
//!                        ──► PresenceTracker ► RoomEvent::Presence
//! input_changed ─► driver ──► TypingThrottle ─► typing.start / typing.stop
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use courier_proto::event::{Inbound, Outbound};
use courier_proto::message::{self, Message, MessageId, MessageStatus, ValidationError};

use crate::api::{ApiError, ChatApi};
use crate::connection::{
    Channel, Connection, ConnectionEvent, ConnectionSender, ConnectionState,
};
use crate::presence::{PresencePoller, PresenceState, PresenceTracker};
use crate::receipts::{ReceiptLedger, ReceiptOutcome};
use crate::session::SessionConfig;
use crate::typing::{PeerTyping, TypingState, TypingThrottle};

/// Something the presentation layer should react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    /// The room socket changed state.
    Connection(ConnectionState),
    /// The room socket dropped and will retry.
    Reconnecting {
        /// 1-based attempt number.
        attempt: u32,
        /// Delay before the attempt.
        delay: std::time::Duration,
    },
    /// A message not seen before arrived.
    MessageAdded(Message),
    /// A message's receipt status moved forward.
    ReceiptChanged {
        /// The message.
        message_id: MessageId,
        /// Its new status.
        status: MessageStatus,
    },
    /// The peer's typing indicator turned on or off.
    PeerTyping(bool),
    /// The peer's presence changed.
    Presence(PresenceState),
    /// The server rejected the access credential.
    AuthRejected,
    /// Reconnecting gave up.
    ReconnectExhausted,
}

/// Errors from room commands.
#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    /// The text is empty or too long.
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

#[derive(Debug)]
enum RoomCommand {
    Input(String),
}

struct RoomState {
    ledger: ReceiptLedger,
    peer_typing: PeerTyping,
    throttle: TypingThrottle,
}

impl RoomState {
    fn next_deadline(&self) -> Option<Instant> {
        match (self.throttle.deadline(), self.peer_typing.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// An open room with one peer.
///
/// Closing or dropping the room closes its socket and stops its driver,
/// timers and presence polling.
pub struct Room {
    peer: String,
    connection: Connection,
    state: Arc<Mutex<RoomState>>,
    presence: Arc<Mutex<PresenceTracker>>,
    commands: mpsc::Sender<RoomCommand>,
    driver: JoinHandle<()>,
    poller: PresencePoller,
}

impl Room {
    /// Loads history with `peer`, then connects the room.
    ///
    /// `me` is the signed-in username; when unknown, inbound messages are not
    /// acknowledged.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] if the history fetch fails; no socket is opened
    /// in that case.
    pub async fn open<A: ChatApi>(
        api: Arc<A>,
        peer: &str,
        me: Option<String>,
        presence: Arc<Mutex<PresenceTracker>>,
        config: &SessionConfig,
    ) -> Result<(Self, mpsc::Receiver<RoomEvent>), ApiError> {
        let history = api.history(peer).await?;
        tracing::debug!(peer, messages = history.len(), "history loaded");

        let mut ledger = ReceiptLedger::new();
        ledger.load_history(history);
        let state = Arc::new(Mutex::new(RoomState {
            ledger,
            peer_typing: PeerTyping::new(&config.typing),
            throttle: TypingThrottle::new(&config.typing),
        }));

        let (connection, connection_events) = Connection::open(
            Channel::room(peer),
            config.ws_base.clone(),
            Arc::new(api.credentials().clone()),
            config.connection_options(true, None),
        );

        let (presence_tx, presence_rx) = mpsc::channel(config.event_buffer);
        let poller = PresencePoller::spawn(
            Arc::clone(&api),
            peer.to_owned(),
            config.presence_interval,
            Arc::clone(&presence),
            presence_tx,
        );

        let (commands_tx, commands_rx) = mpsc::channel(config.command_buffer);
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer);

        let driver = Driver {
            peer: peer.to_owned(),
            me,
            sender: connection.sender(),
            state: Arc::clone(&state),
            presence: Arc::clone(&presence),
            commands: commands_rx,
            connection_events,
            presence_updates: presence_rx,
            events: events_tx,
        };
        let driver = tokio::spawn(driver.run());

        tracing::info!(peer, connection = %connection.id(), "room opened");

        Ok((
            Self {
                peer: peer.to_owned(),
                connection,
                state,
                presence,
                commands: commands_tx,
                driver,
                poller,
            },
            events_rx,
        ))
    }

    /// The peer's username.
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Sends a text message.
    ///
    /// The text is trimmed. Returns `Ok(false)` when the socket is not open
    /// and the message was dropped. The input is treated as cleared
    /// afterwards, which ends any typing burst.
    ///
    /// # Errors
    ///
    /// Returns [`RoomError::Validation`] for empty or oversized text.
    pub fn send_text(&self, text: &str) -> Result<bool, RoomError> {
        let text = message::validate_text(text)?;
        let sent = self.connection.send(&Outbound::SendMessage {
            text: text.to_owned(),
        });
        if !sent {
            tracing::debug!(peer = %self.peer, "room not open, message dropped");
        }
        self.input_changed("");
        Ok(sent)
    }

    /// Reports the current contents of the input box.
    pub fn input_changed(&self, text: &str) {
        if let Err(e) = self.commands.try_send(RoomCommand::Input(text.to_owned())) {
            tracing::debug!(peer = %self.peer, err = %e, "input change not delivered");
        }
    }

    /// Closes the room. Idempotent.
    pub fn close(&self) {
        self.connection.close();
        self.poller.stop();
        self.driver.abort();
    }

    /// All messages, oldest first.
    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        self.state.lock().ledger.messages().to_vec()
    }

    /// One message by id.
    #[must_use]
    pub fn message(&self, id: MessageId) -> Option<Message> {
        self.state.lock().ledger.get(id).cloned()
    }

    /// Whether the peer is typing right now.
    #[must_use]
    pub fn peer_typing(&self) -> bool {
        self.state.lock().peer_typing.is_active(Instant::now())
    }

    /// Peer typing indicator with its expiry.
    #[must_use]
    pub fn typing_state(&self) -> TypingState {
        self.state.lock().peer_typing.state(Instant::now())
    }

    /// Last known presence of the peer.
    #[must_use]
    pub fn presence(&self) -> Option<PresenceState> {
        self.presence.lock().get(&self.peer).cloned()
    }

    /// Current room socket state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Subscribes to room socket state changes.
    #[must_use]
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("peer", &self.peer)
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        self.close();
        tracing::debug!(peer = %self.peer, "room closed");
    }
}

/// Task that owns event routing and timers for one room.
struct Driver {
    peer: String,
    me: Option<String>,
    sender: ConnectionSender,
    state: Arc<Mutex<RoomState>>,
    presence: Arc<Mutex<PresenceTracker>>,
    commands: mpsc::Receiver<RoomCommand>,
    connection_events: mpsc::Receiver<ConnectionEvent>,
    presence_updates: mpsc::Receiver<PresenceState>,
    events: mpsc::Sender<RoomEvent>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let deadline = self.state.lock().next_deadline();
            let out = tokio::select! {
                Some(command) = self.commands.recv() => self.on_command(command),
                Some(event) = self.connection_events.recv() => self.on_connection_event(event),
                Some(state) = self.presence_updates.recv() => vec![RoomEvent::Presence(state)],
                () = sleep_until(deadline) => self.on_timer(),
                else => break,
            };
            for event in out {
                match self.events.try_send(event) {
                    Ok(()) => {}
                    Err(TrySendError::Full(event)) => {
                        tracing::debug!(peer = %self.peer, ?event, "room event receiver lagging, notification dropped");
                    }
                    Err(TrySendError::Closed(_)) => {
                        tracing::trace!(peer = %self.peer, "room event receiver dropped");
                    }
                }
            }
        }
        tracing::debug!(peer = %self.peer, "room driver exiting");
    }

    fn on_command(&self, command: RoomCommand) -> Vec<RoomEvent> {
        match command {
            RoomCommand::Input(text) => {
                let signal = self.state.lock().throttle.on_input(&text, Instant::now());
                if let Some(signal) = signal {
                    self.sender.send(&signal.into());
                }
            }
        }
        Vec::new()
    }

    fn on_timer(&self) -> Vec<RoomEvent> {
        let now = Instant::now();
        let (stop, expired) = {
            let mut state = self.state.lock();
            (state.throttle.poll(now), state.peer_typing.poll(now))
        };
        if let Some(signal) = stop {
            self.sender.send(&signal.into());
        }
        if expired {
            vec![RoomEvent::PeerTyping(false)]
        } else {
            Vec::new()
        }
    }

    fn on_connection_event(&self, event: ConnectionEvent) -> Vec<RoomEvent> {
        match event {
            ConnectionEvent::StateChanged(state) => vec![RoomEvent::Connection(state)],
            ConnectionEvent::ReconnectScheduled { attempt, delay } => {
                vec![RoomEvent::Reconnecting { attempt, delay }]
            }
            ConnectionEvent::ReconnectExhausted { .. } => vec![RoomEvent::ReconnectExhausted],
            ConnectionEvent::AuthRejected => vec![RoomEvent::AuthRejected],
            ConnectionEvent::Inbound(inbound) => self.on_inbound(inbound),
        }
    }

    fn on_inbound(&self, inbound: Inbound) -> Vec<RoomEvent> {
        let now = chrono::Utc::now();
        match inbound {
            Inbound::MessageNew { message } => {
                let (fresh, acks) = {
                    let mut state = self.state.lock();
                    let fresh = state.ledger.get(message.id).is_none();
                    let acks = state
                        .ledger
                        .apply_new(message.clone(), self.me.as_deref(), true);
                    (fresh, acks)
                };
                for ack in &acks {
                    self.sender.send(ack);
                }
                if fresh {
                    vec![RoomEvent::MessageAdded(message)]
                } else {
                    tracing::debug!(message_id = %message.id, "duplicate message merged");
                    Vec::new()
                }
            }
            Inbound::ReceiptUpdate {
                message_id,
                status,
                ts,
            } => {
                let mut state = self.state.lock();
                let before = state.ledger.status(message_id);
                match state.ledger.apply_update(message_id, status, ts, now) {
                    ReceiptOutcome::Applied if before != Some(status) => {
                        vec![RoomEvent::ReceiptChanged { message_id, status }]
                    }
                    ReceiptOutcome::Stale => {
                        tracing::debug!(message_id = %message_id, %status, "stale receipt ignored");
                        Vec::new()
                    }
                    ReceiptOutcome::Applied | ReceiptOutcome::Unknown => Vec::new(),
                }
            }
            Inbound::BulkSeen { items } => self
                .state
                .lock()
                .ledger
                .apply_bulk_seen(&items, now)
                .into_iter()
                .map(|message_id| RoomEvent::ReceiptChanged {
                    message_id,
                    status: MessageStatus::Seen,
                })
                .collect(),
            Inbound::Typing { from, active } => {
                if self.me.as_deref() == Some(from.as_str()) || from != self.peer {
                    return Vec::new();
                }
                let changed = self
                    .state
                    .lock()
                    .peer_typing
                    .on_signal(active, Instant::now());
                if changed {
                    vec![RoomEvent::PeerTyping(active)]
                } else {
                    Vec::new()
                }
            }
            Inbound::PresenceUpdate {
                user,
                online,
                last_seen,
            } if user == self.peer => self
                .presence
                .lock()
                .apply_push(&user, online, last_seen)
                .map(RoomEvent::Presence)
                .into_iter()
                .collect(),
            other => {
                tracing::trace!(peer = %self.peer, kind = other.kind(), "event not handled by room");
                Vec::new()
            }
        }
    }
}

/// Sleeps until `deadline`, or forever if there is none.
async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
