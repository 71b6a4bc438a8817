//! Typing indicator: outbound throttling and inbound expiry.

use std::time::Duration;

use tokio::time::Instant;

use courier_proto::event::Outbound;

/// Typing timing knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingConfig {
    /// Minimum gap between two `typing.start` frames while typing continues.
    pub start_interval: Duration,
    /// Idle time after the last keystroke before `typing.stop` is sent.
    pub stop_delay: Duration,
    /// A peer's typing indicator clears after this long without a new signal.
    pub peer_expiry: Duration,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            start_interval: Duration::from_secs(2),
            stop_delay: Duration::from_secs(2),
            peer_expiry: Duration::from_secs(5),
        }
    }
}

/// Outbound typing frame decided by the throttle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingSignal {
    /// Send `typing.start`.
    Start,
    /// Send `typing.stop`.
    Stop,
}

impl From<TypingSignal> for Outbound {
    fn from(signal: TypingSignal) -> Self {
        match signal {
            TypingSignal::Start => Self::TypingStart,
            TypingSignal::Stop => Self::TypingStop,
        }
    }
}

/// Turns local input changes into throttled start/stop signals.
///
/// A burst of typing produces one `Start` per `start_interval` and exactly
/// one `Stop`, either after `stop_delay` of inactivity or as soon as the
/// input is emptied.
#[derive(Debug)]
pub struct TypingThrottle {
    start_interval: Duration,
    stop_delay: Duration,
    /// Time of the last `Start` of the current burst, `None` outside a burst.
    last_start: Option<Instant>,
    stop_deadline: Option<Instant>,
}

impl TypingThrottle {
    /// Creates an idle throttle.
    #[must_use]
    pub const fn new(config: &TypingConfig) -> Self {
        Self {
            start_interval: config.start_interval,
            stop_delay: config.stop_delay,
            last_start: None,
            stop_deadline: None,
        }
    }

    /// Records the current input text.
    pub fn on_input(&mut self, text: &str, now: Instant) -> Option<TypingSignal> {
        if text.is_empty() {
            self.stop_deadline = None;
            return self.last_start.take().map(|_| TypingSignal::Stop);
        }
        self.stop_deadline = Some(now + self.stop_delay);
        let due = self
            .last_start
            .is_none_or(|last| now.saturating_duration_since(last) >= self.start_interval);
        if due {
            self.last_start = Some(now);
            Some(TypingSignal::Start)
        } else {
            None
        }
    }

    /// Fires the idle stop if its deadline has passed.
    pub fn poll(&mut self, now: Instant) -> Option<TypingSignal> {
        match self.stop_deadline {
            Some(deadline) if now >= deadline => {
                self.stop_deadline = None;
                self.last_start.take().map(|_| TypingSignal::Stop)
            }
            _ => None,
        }
    }

    /// When [`poll`](Self::poll) next needs to run.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.stop_deadline
    }

    /// Whether a `Start` is outstanding.
    #[must_use]
    pub const fn is_typing(&self) -> bool {
        self.last_start.is_some()
    }
}

/// Snapshot of the peer's typing indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypingState {
    /// Whether the indicator is shown.
    pub peer_active: bool,
    /// When it clears on its own.
    pub expires_at: Option<Instant>,
}

/// The peer's typing indicator with automatic expiry.
#[derive(Debug)]
pub struct PeerTyping {
    expiry: Duration,
    expires_at: Option<Instant>,
}

impl PeerTyping {
    /// Creates a cleared indicator.
    #[must_use]
    pub const fn new(config: &TypingConfig) -> Self {
        Self {
            expiry: config.peer_expiry,
            expires_at: None,
        }
    }

    /// Applies an inbound typing signal. Returns `true` if the visible
    /// state changed.
    pub fn on_signal(&mut self, active: bool, now: Instant) -> bool {
        let was_active = self.is_active(now);
        self.expires_at = active.then(|| now + self.expiry);
        was_active != active
    }

    /// Clears an expired indicator. Returns `true` if it just cleared.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.expires_at {
            Some(at) if now >= at => {
                self.expires_at = None;
                true
            }
            _ => false,
        }
    }

    /// Whether the indicator is shown at `now`.
    #[must_use]
    pub fn is_active(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now < at)
    }

    /// When [`poll`](Self::poll) next needs to run.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.expires_at
    }

    /// Snapshot at `now`.
    #[must_use]
    pub fn state(&self, now: Instant) -> TypingState {
        let peer_active = self.is_active(now);
        TypingState {
            peer_active,
            expires_at: if peer_active { self.expires_at } else { None },
        }
    }

    /// Clears the indicator.
    pub const fn clear(&mut self) {
        self.expires_at = None;
    }
}
