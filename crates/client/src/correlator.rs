//! Matches inbound messages to outstanding requests.
//!
//! The backend echoes no request id, so correlation is positional: each
//! request category has a single in-flight slot, a categorised response
//! resolves the request in that slot, and an uncategorised one (an error,
//! a failure, an undecodable frame) resolves the oldest outstanding request.
//! Callers must keep at most one request per category on the wire; the
//! client enforces this with its backlog.
//!
//! A request that times out still has an answer coming.  Its slot frees
//! at once, but the correlator remembers the owed reply and swallows the
//! first matching frame, so the late answer never lands on the request
//! sent after it.  An owed reply is forgotten after one more request
//! timeout.

use std::collections::BTreeMap;
use std::time::Duration;

use ll_protocol::{DecodeError, RequestKind, ServerMessage};
use tokio::time::Instant;

use crate::types::{complete, deadline_after, millis, ClientError, Completion, Outcome, RequestId};

/// One request on the wire, waiting for its response.
#[derive(Debug)]
pub struct PendingRequest {
    pub id: RequestId,
    pub kind: RequestKind,
    pub submitted_at: chrono::DateTime<chrono::Utc>,
    pub sent_at: Instant,
    pub timeout: Duration,
    pub deadline: Instant,
    completion: Completion,
}

impl PendingRequest {
    fn finish(self, outcome: Outcome) {
        match &outcome {
            Ok(msg) => tracing::debug!(
                request_id = self.id,
                kind = %self.kind,
                response = msg.label(),
                elapsed_ms = millis(self.sent_at.elapsed()),
                "request resolved"
            ),
            Err(e) => tracing::debug!(
                request_id = self.id,
                kind = %self.kind,
                error = %e,
                "request failed"
            ),
        }
        complete(self.completion, outcome);
    }
}

/// A reply the backend still owes for a request that already timed out.
#[derive(Debug, Clone, Copy)]
struct OwedReply {
    kind: RequestKind,
    forget_at: Instant,
}

#[derive(Debug, Default)]
pub struct Correlator {
    // Keyed by id, so iteration order is submission order.
    pending: BTreeMap<RequestId, PendingRequest>,
    owed: BTreeMap<RequestId, OwedReply>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Late replies still expected for timed-out requests.
    pub fn owed_replies(&self) -> usize {
        self.owed.len()
    }

    /// Whether the category's single in-flight slot is taken.
    pub fn is_busy(&self, kind: RequestKind) -> bool {
        self.pending.values().any(|p| p.kind == kind)
    }

    /// Register a request that was just sent.
    pub fn await_response(
        &mut self,
        id: RequestId,
        kind: RequestKind,
        submitted_at: chrono::DateTime<chrono::Utc>,
        sent_at: Instant,
        timeout: Duration,
        completion: Completion,
    ) {
        debug_assert!(!self.is_busy(kind), "{kind} slot already taken");
        self.pending.insert(
            id,
            PendingRequest {
                id,
                kind,
                submitted_at,
                sent_at,
                timeout,
                deadline: deadline_after(sent_at, timeout),
                completion,
            },
        );
    }

    /// Resolve the pending request an inbound message answers.  Returns the
    /// category whose slot was freed, or `None` if nothing matched (the
    /// message is dropped).
    pub fn resolve(&mut self, inbound: Result<ServerMessage, DecodeError>) -> Option<RequestKind> {
        let kind = match &inbound {
            Ok(msg) => msg.kind(),
            Err(_) => None,
        };

        let owed = self.oldest_owed(kind);
        let target = self.oldest_of(kind);
        if let Some(owed_id) = owed {
            if target.map_or(true, |id| owed_id < id) {
                self.owed.remove(&owed_id);
                tracing::debug!(
                    request_id = owed_id,
                    "late response for timed-out request dropped"
                );
                return None;
            }
        }

        let Some(id) = target else {
            match &inbound {
                Ok(msg) => tracing::warn!(response = msg.label(), "unsolicited response dropped"),
                Err(e) => tracing::warn!(error = %e, "undecodable message with nothing pending"),
            }
            return None;
        };

        let pending = self.pending.remove(&id)?;
        let kind = pending.kind;
        let outcome = match inbound {
            Ok(msg @ (ServerMessage::Detection(_) | ServerMessage::Transcription(_))) => Ok(msg),
            Ok(ServerMessage::Failure { error }) => Err(ClientError::Backend(error)),
            Ok(ServerMessage::Error { message }) => Err(ClientError::Backend(message)),
            Ok(ServerMessage::Pong) => {
                Err(ClientError::ProtocolError("pong is not a response".into()))
            }
            Err(e) => Err(ClientError::ProtocolError(e.to_string())),
        };
        pending.finish(outcome);
        Some(kind)
    }

    /// Fail every request whose deadline has passed and remember the reply
    /// each one still owes.  Returns the freed categories.
    pub fn expire(&mut self, now: Instant) -> Vec<RequestKind> {
        self.owed.retain(|id, owed| {
            let keep = owed.forget_at > now;
            if !keep {
                tracing::debug!(
                    request_id = *id,
                    kind = %owed.kind,
                    "stopped waiting for late response"
                );
            }
            keep
        });

        let expired: Vec<RequestId> = self
            .pending
            .values()
            .filter(|p| p.deadline <= now)
            .map(|p| p.id)
            .collect();

        let mut freed = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(p) = self.pending.remove(&id) {
                tracing::warn!(request_id = p.id, kind = %p.kind, "request timed out");
                freed.push(p.kind);
                self.owed.insert(
                    p.id,
                    OwedReply {
                        kind: p.kind,
                        forget_at: deadline_after(p.deadline, p.timeout),
                    },
                );
                let timeout = p.timeout;
                p.finish(Err(ClientError::Timeout(timeout)));
            }
        }
        freed
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        let pending = self.pending.values().map(|p| p.deadline);
        let owed = self.owed.values().map(|o| o.forget_at);
        pending.chain(owed).min()
    }

    /// Fail every pending request.  The connection is gone, so nothing
    /// owed will arrive either.
    pub fn fail_all(&mut self, err: impl Fn() -> ClientError) -> usize {
        self.owed.clear();
        let n = self.pending.len();
        for (_, p) in std::mem::take(&mut self.pending) {
            p.finish(Err(err()));
        }
        n
    }

    fn oldest_owed(&self, kind: Option<RequestKind>) -> Option<RequestId> {
        self.owed
            .iter()
            .find(|(_, o)| kind.map_or(true, |k| o.kind == k))
            .map(|(id, _)| *id)
    }

    fn oldest_of(&self, kind: Option<RequestKind>) -> Option<RequestId> {
        self.pending
            .values()
            .find(|p| kind.map_or(true, |k| p.kind == k))
            .map(|p| p.id)
    }
}
