//! Message list of an open room and receipt status reconciliation.
//!
//! Status only ever moves forward (`sent` → `delivered` → `seen`). Updates
//! may arrive late, duplicated or out of order; merging is idempotent and
//! never regresses a message.

use std::collections::HashMap;

use courier_proto::event::{Outbound, SeenItem};
use courier_proto::message::{Message, MessageId, MessageStatus, Timestamp};

/// Result of applying a receipt update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptOutcome {
    /// The status is now at least the reported one.
    Applied,
    /// The message already had a later status; nothing changed.
    Stale,
    /// No message with that id is known.
    Unknown,
}

/// The ordered messages of one room, indexed by id.
#[derive(Debug, Default)]
pub struct ReceiptLedger {
    messages: Vec<Message>,
    index: HashMap<MessageId, usize>,
}

impl ReceiptLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the ledger contents with a loaded history, oldest first.
    ///
    /// Duplicate ids are merged into their first occurrence.
    pub fn load_history(&mut self, history: impl IntoIterator<Item = Message>) {
        self.messages.clear();
        self.index.clear();
        for message in history {
            self.insert_or_merge(message);
        }
    }

    /// Adds a message pushed by the server.
    ///
    /// Returns the acknowledgement frames to send: a `receipt.delivered`
    /// followed by `receipt.seen_all` when the message is new, addressed to
    /// `me`, and the room is on screen.
    pub fn apply_new(&mut self, message: Message, me: Option<&str>, room_open: bool) -> Vec<Outbound> {
        let id = message.id;
        let addressed_to_me = me.is_some_and(|me| message.is_received_by(me));
        let fresh = self.insert_or_merge(message);
        if fresh && addressed_to_me && room_open {
            vec![Outbound::Delivered { message_id: id }, Outbound::SeenAll]
        } else {
            Vec::new()
        }
    }

    /// Applies one `receipt.update`. A missing `ts` falls back to `now`.
    pub fn apply_update(
        &mut self,
        id: MessageId,
        status: MessageStatus,
        ts: Option<Timestamp>,
        now: Timestamp,
    ) -> ReceiptOutcome {
        let Some(&pos) = self.index.get(&id) else {
            tracing::debug!(message_id = %id, "receipt for unknown message");
            return ReceiptOutcome::Unknown;
        };
        if advance(&mut self.messages[pos], status, ts.unwrap_or(now)) {
            ReceiptOutcome::Applied
        } else {
            ReceiptOutcome::Stale
        }
    }

    /// Applies a `receipt.bulk_seen` batch. Returns the ids that changed.
    pub fn apply_bulk_seen(&mut self, items: &[SeenItem], now: Timestamp) -> Vec<MessageId> {
        let mut changed = Vec::new();
        for item in items {
            let Some(&pos) = self.index.get(&item.id) else {
                continue;
            };
            let message = &mut self.messages[pos];
            let before = (message.status, message.delivered_at, message.seen_at);
            advance(message, MessageStatus::Seen, item.ts.unwrap_or(now));
            if (message.status, message.delivered_at, message.seen_at) != before {
                changed.push(item.id);
            }
        }
        changed
    }

    /// Looks up a message by id.
    #[must_use]
    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.index.get(&id).map(|&pos| &self.messages[pos])
    }

    /// Current status of a message.
    #[must_use]
    pub fn status(&self, id: MessageId) -> Option<MessageStatus> {
        self.get(id).map(|m| m.status)
    }

    /// All messages in arrival order.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the ledger is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Inserts a message, or merges it into the existing entry with the same
    /// id. Returns `true` if it was new.
    fn insert_or_merge(&mut self, incoming: Message) -> bool {
        if let Some(&pos) = self.index.get(&incoming.id) {
            merge(&mut self.messages[pos], incoming);
            return false;
        }
        self.index.insert(incoming.id, self.messages.len());
        self.messages.push(incoming);
        true
    }
}

/// Moves `message` forward to `status`, stamping transition times that are
/// still unset with `at`. Returns `false` if `status` is behind.
fn advance(message: &mut Message, status: MessageStatus, at: Timestamp) -> bool {
    if status < message.status {
        return false;
    }
    if status >= MessageStatus::Delivered && message.delivered_at.is_none() {
        message.delivered_at = Some(at);
    }
    if status == MessageStatus::Seen && message.seen_at.is_none() {
        message.seen_at = Some(at);
    }
    message.status = status;
    true
}

/// Folds a re-delivered copy of a message into the stored one.
fn merge(existing: &mut Message, incoming: Message) {
    existing.status = existing.status.max(incoming.status);
    if existing.delivered_at.is_none() {
        existing.delivered_at = incoming.delivered_at;
    }
    if existing.seen_at.is_none() {
        existing.seen_at = incoming.seen_at;
    }
}
