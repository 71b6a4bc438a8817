//! Tagged realtime events exchanged over a channel socket.
//!
//! Every frame is one JSON object whose `type` field selects the variant.
//! Inbound tags this client does not know decode as [`Inbound::Unknown`] so
//! newer servers can add event kinds without breaking older clients.

use serde::{Deserialize, Serialize};

use crate::message::{Message, MessageId, MessageStatus, Timestamp};
use crate::thread::ThreadUpdate;

/// One entry of a `receipt.bulk_seen` batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenItem {
    /// The message that was seen.
    pub id: MessageId,
    /// When it was seen, if the server reported it.
    #[serde(default)]
    pub ts: Option<Timestamp>,
}

/// Events pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Inbound {
    /// A new message in the room (sent by either participant).
    #[serde(rename = "message.new")]
    MessageNew {
        /// The message as stored by the server.
        message: Message,
    },
    /// A single message changed receipt status.
    #[serde(rename = "receipt.update")]
    ReceiptUpdate {
        /// The message whose status changed.
        message_id: MessageId,
        /// The new status.
        status: MessageStatus,
        /// When the transition happened.
        #[serde(default)]
        ts: Option<Timestamp>,
    },
    /// A batch of messages was seen at once (peer opened the room).
    #[serde(rename = "receipt.bulk_seen")]
    BulkSeen {
        /// The messages that were seen.
        items: Vec<SeenItem>,
    },
    /// The peer started or stopped typing.
    #[serde(rename = "typing")]
    Typing {
        /// Username of the typist.
        from: String,
        /// `true` while typing.
        active: bool,
    },
    /// A thread summary changed (inbox channel).
    #[serde(rename = "thread.update")]
    ThreadUpdate(ThreadUpdate),
    /// A peer's presence changed (pushed variant of the presence poll).
    #[serde(rename = "presence.update")]
    PresenceUpdate {
        /// Username of the peer.
        user: String,
        /// Whether the peer is online.
        online: bool,
        /// Last time the peer was observed.
        #[serde(default)]
        last_seen: Option<Timestamp>,
    },
    /// Any event kind this client does not understand.
    #[serde(other)]
    Unknown,
}

impl Inbound {
    /// Short name of the event kind for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::MessageNew { .. } => "message.new",
            Self::ReceiptUpdate { .. } => "receipt.update",
            Self::BulkSeen { .. } => "receipt.bulk_seen",
            Self::Typing { .. } => "typing",
            Self::ThreadUpdate(_) => "thread.update",
            Self::PresenceUpdate { .. } => "presence.update",
            Self::Unknown => "unknown",
        }
    }
}

/// Events sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Outbound {
    /// Send a text message to the room's peer.
    #[serde(rename = "message.send")]
    SendMessage {
        /// Message text.
        text: String,
    },
    /// Acknowledge delivery of one message.
    #[serde(rename = "receipt.delivered")]
    Delivered {
        /// The delivered message.
        message_id: MessageId,
    },
    /// Mark every message from the peer as seen.
    #[serde(rename = "receipt.seen_all")]
    SeenAll,
    /// The local user started typing.
    #[serde(rename = "typing.start")]
    TypingStart,
    /// The local user stopped typing.
    #[serde(rename = "typing.stop")]
    TypingStop,
    /// Presence keepalive.
    #[serde(rename = "ping")]
    Ping,
}

impl Outbound {
    /// Short name of the event kind for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SendMessage { .. } => "message.send",
            Self::Delivered { .. } => "receipt.delivered",
            Self::SeenAll => "receipt.seen_all",
            Self::TypingStart => "typing.start",
            Self::TypingStop => "typing.stop",
            Self::Ping => "ping",
        }
    }
}
