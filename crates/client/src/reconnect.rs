//! Reconnect policy with exponential back-off, and the controller that owns
//! connection state.

use std::time::Duration;

use tokio::time::Instant;

use crate::connection::Connection;
use crate::types::deadline_after;

/// Lifecycle of the backend connection.  Owned by [`ReconnectController`];
/// everything else only reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
        })
    }
}

/// Controls how the client reconnects after a connection drop.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    /// Delay before the first automatic attempt.  Doubles on every attempt.
    pub base_delay: Duration,
    /// Automatic attempts allowed between two successful opens.
    pub max_attempts: u32,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_attempts: 5,
        }
    }
}

impl ReconnectBackoff {
    /// Delay before attempt `attempt` (1-indexed): `base_delay * 2^(attempt-1)`.
    /// Uncapped and unjittered.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << exp)
    }
}

/// What the controller decided after losing (or failing to get) a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    /// Attempt `attempt` is scheduled after `delay`.
    After { attempt: u32, delay: Duration },
    /// `max_attempts` reached; no further automatic attempts.
    Exhausted { attempts: u32 },
}

/// Owns [`ConnectionState`], the attempt counter, the scheduled retry, and
/// the single active [`Connection`].
#[derive(Debug)]
pub struct ReconnectController {
    policy: ReconnectBackoff,
    state: ConnectionState,
    attempt_count: u32,
    retry_at: Option<Instant>,
    exhausted: bool,
    active: Option<Connection>,
}

impl ReconnectController {
    pub fn new(policy: ReconnectBackoff) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            attempt_count: 0,
            retry_at: None,
            exhausted: false,
            active: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn policy(&self) -> &ReconnectBackoff {
        &self.policy
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// When the next automatic attempt is due, if one is scheduled.
    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    pub fn retry_due(&self, now: Instant) -> bool {
        self.retry_at.is_some_and(|at| at <= now)
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.active.as_ref()
    }

    /// Caller asked to connect: forget earlier failures.
    pub fn manual_connect(&mut self) {
        self.attempt_count = 0;
        self.exhausted = false;
        self.retry_at = None;
    }

    /// An attempt (manual or scheduled) is starting.
    pub fn begin_connect(&mut self) {
        self.retry_at = None;
        self.state = ConnectionState::Connecting;
    }

    /// The attempt succeeded.  Replaces any previous connection.
    pub fn on_open(&mut self, conn: Connection) {
        if let Some(mut old) = self.active.replace(conn) {
            old.close();
        }
        self.attempt_count = 0;
        self.exhausted = false;
        self.retry_at = None;
        self.state = ConnectionState::Open;
    }

    /// The attempt failed before opening.
    pub fn on_connect_failed(&mut self, now: Instant) -> Retry {
        self.schedule_retry(now)
    }

    /// An open connection dropped without the caller asking.
    pub fn on_unexpected_close(&mut self, now: Instant) -> Retry {
        if let Some(mut conn) = self.active.take() {
            conn.close();
        }
        self.schedule_retry(now)
    }

    /// Caller-initiated shutdown, first half: close the active connection.
    pub fn begin_closing(&mut self) {
        self.state = ConnectionState::Closing;
        self.retry_at = None;
        if let Some(mut conn) = self.active.take() {
            conn.close();
        }
    }

    /// Caller-initiated shutdown, second half: terminal `Disconnected`
    /// that never re-arms on its own.
    pub fn finish_closing(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.attempt_count = 0;
        self.exhausted = false;
        self.retry_at = None;
    }

    fn schedule_retry(&mut self, now: Instant) -> Retry {
        self.state = ConnectionState::Disconnected;
        if self.attempt_count >= self.policy.max_attempts {
            self.exhausted = true;
            self.retry_at = None;
            return Retry::Exhausted {
                attempts: self.attempt_count,
            };
        }
        self.attempt_count += 1;
        let delay = self.policy.delay_for_attempt(self.attempt_count);
        self.retry_at = Some(deadline_after(now, delay));
        Retry::After {
            attempt: self.attempt_count,
            delay,
        }
    }
}
