//! Per-connection lifecycle state machine and reconnect policy.
//!
//! [`Lifecycle`] holds the single authoritative "reconnect scheduled" flag
//! for one connection. The socket supervisor drives it; it never performs
//! I/O itself, so every transition is unit-testable with explicit instants.

use std::fmt;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// Lifecycle state of a channel connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Created, no attempt made yet.
    Idle,
    /// Socket handshake in progress.
    Connecting,
    /// Handshake done; frames flow both ways.
    Open,
    /// Close requested, socket being torn down.
    Closing,
    /// No socket. May move back to `Connecting` if a reconnect is scheduled.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Why a socket ended up closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// Socket error, server close, or failed handshake.
    Transport,
    /// The server rejected the access credential at handshake time.
    AuthRejected,
    /// The owner called `close()`.
    Requested,
}

/// What the supervisor must do after a socket closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterClose {
    /// Exactly one reconnect attempt is scheduled after `delay`.
    Reconnect {
        /// 1-based number of this attempt since the last stable connection.
        attempt: u32,
        /// How long to wait before the attempt.
        delay: Duration,
    },
    /// The attempt budget is used up; stay closed.
    Exhausted {
        /// Number of attempts that were made.
        attempts: u32,
    },
    /// Credential rejected; stay closed and report upward.
    AuthRejected,
    /// Stay closed (explicit close or non-reconnecting channel).
    Stay,
}

/// Reconnect backoff settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt.
    pub initial_delay: Duration,
    /// Upper bound for the exponential delay.
    pub max_delay: Duration,
    /// Give up after this many consecutive attempts (`None` = never).
    pub max_attempts: Option<u32>,
    /// A connection open at least this long resets the attempt counter.
    pub stability_threshold: Duration,
    /// Random spread applied to each delay, as a fraction (0.0 disables).
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
            stability_threshold: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl ReconnectConfig {
    /// A constant-delay policy with no jitter and no attempt limit.
    #[must_use]
    pub fn constant(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            max_attempts: None,
            stability_threshold: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Exponential delay for a 1-based `attempt`, before jitter.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Delay for `attempt` with jitter applied.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let spread = self.jitter.min(1.0);
        let factor = rand::rng().random_range((1.0 - spread)..=(1.0 + spread));
        base.mul_f64(factor).min(self.max_delay)
    }
}

/// Lifecycle of a single connection instance.
#[derive(Debug)]
pub struct Lifecycle {
    state: ConnectionState,
    reconnect: Option<ReconnectConfig>,
    close_requested: bool,
    reconnect_scheduled: bool,
    attempts: u32,
    opened_at: Option<Instant>,
}

impl Lifecycle {
    /// Creates an idle lifecycle. `reconnect` is `None` for channels that
    /// must stay closed after a failure.
    #[must_use]
    pub const fn new(reconnect: Option<ReconnectConfig>) -> Self {
        Self {
            state: ConnectionState::Idle,
            reconnect,
            close_requested: false,
            reconnect_scheduled: false,
            attempts: 0,
            opened_at: None,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether a reconnect attempt is pending.
    #[must_use]
    pub const fn is_reconnect_scheduled(&self) -> bool {
        self.reconnect_scheduled
    }

    /// Whether the owner asked for the connection to close.
    #[must_use]
    pub const fn is_close_requested(&self) -> bool {
        self.close_requested
    }

    /// Starts a connection attempt.
    ///
    /// Allowed from `Idle`, and from `Closed` only when a reconnect was
    /// scheduled (consuming it). Returns `false` when the attempt must not
    /// happen.
    pub fn begin_connect(&mut self) -> bool {
        if self.close_requested {
            return false;
        }
        let allowed = match self.state {
            ConnectionState::Idle => true,
            ConnectionState::Closed => self.reconnect_scheduled,
            ConnectionState::Connecting | ConnectionState::Open | ConnectionState::Closing => false,
        };
        if allowed {
            self.reconnect_scheduled = false;
            self.state = ConnectionState::Connecting;
        }
        allowed
    }

    /// Records a completed handshake.
    pub fn on_open(&mut self, now: Instant) {
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Open;
            self.opened_at = Some(now);
        }
    }

    /// Records that the socket is gone and decides what happens next.
    pub fn on_closed(&mut self, cause: CloseCause, now: Instant) -> AfterClose {
        if let (Some(opened_at), Some(cfg)) = (self.opened_at.take(), &self.reconnect)
            && now.saturating_duration_since(opened_at) >= cfg.stability_threshold
        {
            self.attempts = 0;
        }
        self.state = ConnectionState::Closed;

        if self.close_requested || cause == CloseCause::Requested {
            self.reconnect_scheduled = false;
            return AfterClose::Stay;
        }
        if cause == CloseCause::AuthRejected {
            self.reconnect_scheduled = false;
            return AfterClose::AuthRejected;
        }
        if self.reconnect_scheduled {
            return AfterClose::Stay;
        }
        let Some(cfg) = &self.reconnect else {
            return AfterClose::Stay;
        };
        if let Some(max) = cfg.max_attempts
            && self.attempts >= max
        {
            return AfterClose::Exhausted {
                attempts: self.attempts,
            };
        }
        self.attempts += 1;
        self.reconnect_scheduled = true;
        AfterClose::Reconnect {
            attempt: self.attempts,
            delay: cfg.delay_for(self.attempts),
        }
    }

    /// Records an explicit close request and cancels any pending reconnect.
    ///
    /// Returns `true` if a live or pending socket needs tearing down.
    pub fn request_close(&mut self) -> bool {
        self.close_requested = true;
        self.reconnect_scheduled = false;
        match self.state {
            ConnectionState::Connecting | ConnectionState::Open => {
                self.state = ConnectionState::Closing;
                true
            }
            ConnectionState::Idle => {
                self.state = ConnectionState::Closed;
                false
            }
            ConnectionState::Closing | ConnectionState::Closed => false,
        }
    }

    /// Forces the terminal `Closed` state after teardown.
    pub const fn mark_closed(&mut self) {
        self.state = ConnectionState::Closed;
        self.opened_at = None;
    }
}
