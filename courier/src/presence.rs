//! Peer presence: polled snapshots, pushed updates and the display label.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use courier_proto::message::Timestamp;
use courier_proto::presence::PresenceSnapshot;

use crate::api::ChatApi;

/// How often the viewed peer's presence is polled.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(20);

/// Known presence of one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceState {
    /// The peer's username.
    pub peer: String,
    /// Whether the peer is online.
    pub online: bool,
    /// Last time the peer was observed.
    pub last_seen: Option<Timestamp>,
}

impl PresenceState {
    /// Human-readable status line relative to `now`.
    #[must_use]
    pub fn label(&self, now: Timestamp) -> String {
        if self.online {
            return "online".to_owned();
        }
        let Some(last_seen) = self.last_seen else {
            return "offline".to_owned();
        };
        let secs = (now - last_seen).num_seconds().max(0);
        if secs < 60 {
            return "last seen just now".to_owned();
        }
        let mins = secs / 60;
        if mins < 60 {
            return format!("last seen {mins} min{} ago", plural(mins));
        }
        let hours = mins / 60;
        if hours < 24 {
            return format!("last seen {hours} hour{} ago", plural(hours));
        }
        format!("last seen on {}", last_seen.format("%Y-%m-%d"))
    }
}

const fn plural(n: i64) -> &'static str {
    if n > 1 { "s" } else { "" }
}

/// Presence of every peer observed this session.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    peers: HashMap<String, PresenceState>,
}

impl PresenceTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a poll result, overwriting whatever was known.
    ///
    /// Returns the new state if it differs from the previous one.
    pub fn apply_snapshot(&mut self, peer: &str, snapshot: PresenceSnapshot) -> Option<PresenceState> {
        let state = PresenceState {
            peer: peer.to_owned(),
            online: snapshot.online,
            last_seen: snapshot.last_seen,
        };
        self.replace(state)
    }

    /// Stores a pushed update if it is at least as recent as the known state.
    ///
    /// Returns the new state if it was accepted and changed anything.
    pub fn apply_push(
        &mut self,
        peer: &str,
        online: bool,
        last_seen: Option<Timestamp>,
    ) -> Option<PresenceState> {
        if let Some(known) = self.peers.get(peer)
            && last_seen < known.last_seen
        {
            tracing::debug!(peer, "ignoring stale presence push");
            return None;
        }
        self.replace(PresenceState {
            peer: peer.to_owned(),
            online,
            last_seen,
        })
    }

    /// Known state of `peer`.
    #[must_use]
    pub fn get(&self, peer: &str) -> Option<&PresenceState> {
        self.peers.get(peer)
    }

    fn replace(&mut self, state: PresenceState) -> Option<PresenceState> {
        let previous = self.peers.insert(state.peer.clone(), state.clone());
        (previous.as_ref() != Some(&state)).then_some(state)
    }
}

/// Background task polling one peer's presence.
///
/// The first poll runs immediately. The task stops when the poller is
/// dropped or [`stop`](Self::stop) is called.
#[derive(Debug)]
pub struct PresencePoller {
    task: JoinHandle<()>,
}

impl PresencePoller {
    /// Starts polling `peer` every `interval`. A zero interval falls back to
    /// [`DEFAULT_POLL_INTERVAL`].
    ///
    /// Results land in `tracker`; changes are also sent on `updates`.
    pub fn spawn<A: ChatApi>(
        api: Arc<A>,
        peer: String,
        interval: Duration,
        tracker: Arc<Mutex<PresenceTracker>>,
        updates: mpsc::Sender<PresenceState>,
    ) -> Self {
        let interval = if interval.is_zero() {
            tracing::warn!(peer = %peer, "zero presence poll interval, using default");
            DEFAULT_POLL_INTERVAL
        } else {
            interval
        };
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match api.presence(&peer).await {
                    Ok(snapshot) => {
                        let changed = tracker.lock().apply_snapshot(&peer, snapshot);
                        if let Some(state) = changed
                            && updates.send(state).await.is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(peer = %peer, err = %e, "presence poll failed");
                    }
                }
            }
        });
        Self { task }
    }

    /// Stops polling.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for PresencePoller {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Label for `state` against the wall clock.
#[must_use]
pub fn label_now(state: &PresenceState) -> String {
    state.label(Utc::now())
}
