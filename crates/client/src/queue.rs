//! FIFO of requests that are waiting to be sent.
//!
//! The client keeps two of these: the outbound queue, filled while no
//! connection is open, and the backlog, which holds requests whose category
//! already has a response outstanding.

use std::collections::VecDeque;
use std::time::Duration;

use ll_protocol::{ClientMessage, RequestKind};
use tokio::time::Instant;

use crate::types::{complete, deadline_after, ClientError, Completion, RequestId};

/// A request accepted by the client but not yet on the wire.
#[derive(Debug)]
pub struct QueuedRequest {
    pub id: RequestId,
    pub kind: RequestKind,
    pub message: ClientMessage,
    pub submitted_at: chrono::DateTime<chrono::Utc>,
    pub enqueued_at: Instant,
    pub completion: Completion,
}

impl QueuedRequest {
    pub fn fail(self, err: ClientError) {
        tracing::debug!(request_id = self.id, kind = %self.kind, error = %err, "queued request failed");
        complete(self.completion, Err(err));
    }
}

#[derive(Debug)]
pub struct OutboundQueue {
    items: VecDeque<QueuedRequest>,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Append at the tail.  A full queue fails the request with
    /// [`ClientError::QueueFull`].
    pub fn enqueue(&mut self, req: QueuedRequest) {
        if self.items.len() >= self.capacity {
            req.fail(ClientError::QueueFull(self.capacity));
            return;
        }
        self.items.push_back(req);
    }

    /// Move every entry of `other` to the tail, keeping both orders.
    /// Capacity is not checked: these requests were already accepted.
    pub fn append(&mut self, other: &mut OutboundQueue) {
        self.items.append(&mut other.items);
    }

    /// Remove the oldest request of the given category.
    pub fn take_next(&mut self, kind: RequestKind) -> Option<QueuedRequest> {
        let pos = self.items.iter().position(|r| r.kind == kind)?;
        self.items.remove(pos)
    }

    /// Pop requests head-first and hand each to `send`.  When `send` gives a
    /// request back, that request and everything still queued fail with
    /// [`ClientError::QueueDrainInterrupted`].  Returns how many were sent.
    pub fn drain<F>(&mut self, mut send: F) -> usize
    where
        F: FnMut(QueuedRequest) -> Result<(), QueuedRequest>,
    {
        let mut sent = 0;
        while let Some(req) = self.items.pop_front() {
            if let Err(req) = send(req) {
                let interrupted = self.items.len() + 1;
                tracing::warn!(interrupted, "queue drain interrupted");
                req.fail(ClientError::QueueDrainInterrupted);
                for rest in self.items.drain(..) {
                    rest.fail(ClientError::QueueDrainInterrupted);
                }
                break;
            }
            sent += 1;
        }
        sent
    }

    /// Fail every queued request with the error `err` builds, and empty the queue.
    pub fn flush(&mut self, err: impl Fn() -> ClientError) -> usize {
        let n = self.items.len();
        for req in self.items.drain(..) {
            req.fail(err());
        }
        n
    }

    /// Fail requests that have waited `ttl` or longer.
    pub fn expire(&mut self, now: Instant, ttl: Duration) -> usize {
        let mut expired = 0;
        let mut i = 0;
        while i < self.items.len() {
            if now.duration_since(self.items[i].enqueued_at) >= ttl {
                if let Some(req) = self.items.remove(i) {
                    tracing::warn!(request_id = req.id, kind = %req.kind, "request expired in queue");
                    req.fail(ClientError::Timeout(ttl));
                    expired += 1;
                }
            } else {
                i += 1;
            }
        }
        expired
    }

    /// When the oldest entry will expire.
    pub fn next_expiry(&self, ttl: Duration) -> Option<Instant> {
        self.items
            .iter()
            .map(|r| deadline_after(r.enqueued_at, ttl))
            .min()
    }
}
