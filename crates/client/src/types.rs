//! Core types shared by the client components: request ids, completion
//! handles, and errors.

use std::time::Duration;

use ll_protocol::ServerMessage;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Identifier assigned to every request at submission time.  Unique for
/// the lifetime of one [`Client`](crate::Client).
pub type RequestId = u64;

/// Outcome delivered to a caller.  `Ok` always carries a `Detection` or
/// `Transcription`; every other shape is mapped to a [`ClientError`].
pub type Outcome = Result<ServerMessage, ClientError>;

/// Single-use completion handle.  Sending consumes it, so a request can
/// only ever be fulfilled once.
pub type Completion = oneshot::Sender<Outcome>;

/// Fulfil a completion handle.  A caller that dropped its future is not
/// an error.
pub(crate) fn complete(completion: Completion, outcome: Outcome) {
    if completion.send(outcome).is_err() {
        tracing::trace!("caller dropped its response future");
    }
}

/// Roughly 30 years.  Stands in for "never" when a deadline overflows.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `at + after`, clamped so huge configured durations cannot overflow.
pub(crate) fn deadline_after(at: Instant, after: Duration) -> Instant {
    at.checked_add(after.min(FAR_FUTURE)).unwrap_or(at)
}

/// Whole milliseconds in `d`, saturating at `u64::MAX`.
pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Every error a client operation can fail with.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    /// Socket-level open failure.  Triggers backoff.
    #[error("connect failed: {0}")]
    ConnectFailure(String),
    /// The connection dropped after being open.  Triggers backoff.
    #[error("connection closed unexpectedly: {0}")]
    UnexpectedClose(String),
    /// `send` on a connection that is not open.
    #[error("connection is not open")]
    NotOpen,
    /// No matching response within the deadline.
    #[error("no response within {0:?}")]
    Timeout(Duration),
    /// Malformed or undecodable inbound message.
    #[error("protocol error: {0}")]
    ProtocolError(String),
    /// The connection dropped again while the queue was being drained.
    #[error("connection lost while draining the request queue")]
    QueueDrainInterrupted,
    /// Caller-initiated disconnect.
    #[error("cancelled by disconnect")]
    Cancelled,
    /// The backend answered with an error message.
    #[error("backend error: {0}")]
    Backend(String),
    #[error("request queue is full ({0} requests)")]
    QueueFull(usize),
    #[error("reconnect exhausted after {0} attempts")]
    ReconnectExhausted(u32),
    #[error("config: {0}")]
    Config(String),
    /// The client event loop is gone.
    #[error("client shut down")]
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_after_clamps_huge_durations() {
        let now = Instant::now();
        assert_eq!(deadline_after(now, Duration::from_secs(5)), now + Duration::from_secs(5));
        let far = deadline_after(now, Duration::MAX);
        assert!(far > now + Duration::from_secs(86_400 * 365));
    }

    #[test]
    fn millis_saturates() {
        assert_eq!(millis(Duration::from_secs(2)), 2_000);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }
}
