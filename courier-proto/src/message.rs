//! Message data model shared by every Courier channel.
//!
//! These types mirror the JSON objects the chat server puts on the wire and
//! returns from its history endpoint. Decoding is deliberately lenient about
//! fields the server omits in some frames (status, `created_at`, peer ids).

use serde::{Deserialize, Serialize};

/// Maximum allowed message text size in bytes (64 KB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// UTC timestamp as carried on the wire (RFC 3339 strings).
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Server-assigned message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(i64);

impl MessageId {
    /// Wraps a raw server id.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw server id.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Delivery lifecycle of a message.
///
/// The variant order is the receipt order: `Sent < Delivered < Seen`.
/// Stored statuses only ever move forward along this order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Accepted by the server, not yet delivered to the receiver.
    #[default]
    Sent,
    /// Delivered to one of the receiver's clients.
    Delivered,
    /// Seen by the receiver.
    Seen,
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sent => write!(f, "sent"),
            Self::Delivered => write!(f, "delivered"),
            Self::Seen => write!(f, "seen"),
        }
    }
}

/// Immutable reference to a user as embedded in messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerRef {
    /// Server user id (0 when the frame omitted it).
    #[serde(default)]
    pub id: i64,
    /// Unique username.
    pub username: String,
}

impl PeerRef {
    /// Creates a peer reference.
    pub fn new(id: i64, username: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
        }
    }
}

/// Public user record returned for thread peers and the current identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerUserInfo {
    /// Server user id.
    #[serde(default)]
    pub id: i64,
    /// Unique username.
    pub username: String,
    /// Optional first name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    /// Optional last name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
}

impl PeerUserInfo {
    /// Creates a user record with only id and username.
    pub fn new(id: i64, username: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
            first_name: None,
            last_name: None,
        }
    }

    /// Returns `"first last"`, or an empty string when neither is set.
    #[must_use]
    pub fn full_name(&self) -> String {
        let first = self.first_name.as_deref().unwrap_or_default();
        let last = self.last_name.as_deref().unwrap_or_default();
        format!("{first} {last}").trim().to_string()
    }
}

/// A chat message with its receipt state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Server-assigned id.
    pub id: MessageId,
    /// Message text.
    pub text: String,
    /// Creation time on the server.
    #[serde(default)]
    pub created_at: Timestamp,
    /// Current receipt status.
    #[serde(default)]
    pub status: MessageStatus,
    /// When the message was first delivered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<Timestamp>,
    /// When the message was first seen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seen_at: Option<Timestamp>,
    /// Author of the message.
    pub sender: PeerRef,
    /// Recipient of the message.
    pub receiver: PeerRef,
}

impl Message {
    /// Returns `true` if `username` is the receiver of this message.
    #[must_use]
    pub fn is_received_by(&self, username: &str) -> bool {
        self.receiver.username == username
    }

    /// Returns `true` if `username` authored this message.
    #[must_use]
    pub fn is_sent_by(&self, username: &str) -> bool {
        self.sender.username == username
    }
}

/// Error returned when outgoing message text fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Text is empty after trimming.
    #[error("message text is empty")]
    Empty,
    /// Text exceeds the maximum allowed size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the text in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
}

/// Trims `text` and checks it is sendable.
///
/// # Errors
///
/// Returns [`ValidationError::Empty`] for blank input, or
/// [`ValidationError::TooLarge`] if the trimmed text exceeds
/// [`MAX_MESSAGE_SIZE`].
pub fn validate_text(text: &str) -> Result<&str, ValidationError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Empty);
    }
    let size = trimmed.len();
    if size > MAX_MESSAGE_SIZE {
        return Err(ValidationError::TooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(trimmed)
}
