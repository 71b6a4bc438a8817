//! Presence snapshot returned by the presence endpoint.

use serde::{Deserialize, Serialize};

use crate::message::Timestamp;

/// Online state of one peer at poll time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceSnapshot {
    /// Whether the peer currently holds a live presence connection.
    pub online: bool,
    /// Last time the peer was observed, if ever.
    #[serde(default)]
    pub last_seen: Option<Timestamp>,
}
