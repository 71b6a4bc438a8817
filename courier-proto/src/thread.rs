//! Conversation thread summaries as listed in the inbox.

use serde::{Deserialize, Serialize};

use crate::message::{Message, PeerUserInfo, Timestamp};

/// The most recent message of a thread, as the inbox sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMessage {
    /// The message itself.
    #[serde(flatten)]
    pub message: Message,
    /// Whether the inbox owner authored it.
    #[serde(default)]
    pub from_me: bool,
}

/// One conversation in the inbox, keyed by the peer's username.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadSummary {
    /// The other participant.
    #[serde(rename = "user")]
    pub peer: PeerUserInfo,
    /// Messages from the peer the owner has not read yet.
    #[serde(default)]
    pub unread_count: u32,
    /// Most recent message in either direction, if any.
    #[serde(default)]
    pub last_message: Option<LastMessage>,
}

impl ThreadSummary {
    /// Creates an empty thread for `peer`.
    #[must_use]
    pub const fn empty(peer: PeerUserInfo) -> Self {
        Self {
            peer,
            unread_count: 0,
            last_message: None,
        }
    }

    /// Sort key for recency ordering; threads without messages sort as the epoch.
    #[must_use]
    pub fn last_activity(&self) -> Timestamp {
        self.last_message
            .as_ref()
            .map(|last| last.message.created_at)
            .unwrap_or_default()
    }
}

/// One entry of the thread-list endpoint.
///
/// Some server versions return full summaries, others bare user records;
/// both are accepted and normalized into a [`ThreadSummary`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ThreadListEntry {
    /// A full thread summary.
    Summary(ThreadSummary),
    /// A bare user record with no conversation state.
    User(PeerUserInfo),
}

impl From<ThreadListEntry> for ThreadSummary {
    fn from(entry: ThreadListEntry) -> Self {
        match entry {
            ThreadListEntry::Summary(summary) => summary,
            ThreadListEntry::User(peer) => Self::empty(peer),
        }
    }
}

/// Payload of a `thread.update` inbox event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadUpdate {
    /// The thread's peer. The server sends `null` when the peer no longer exists.
    #[serde(default)]
    pub user: Option<PeerUserInfo>,
    /// New unread count.
    #[serde(default)]
    pub unread_count: u32,
    /// New last message.
    #[serde(default)]
    pub last_message: Option<LastMessage>,
}
