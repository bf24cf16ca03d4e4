//! Client facade and the event loop behind it.
//!
//! A [`Client`] is a cheap handle.  All connection, queue, and correlation
//! state lives in one spawned task that processes commands, socket events,
//! and timers in a single `select!` loop, so a timer firing can never race
//! a send.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use ll_protocol::{
    ClientMessage, DecodeError, DetectionResult, RequestKind, ServerMessage, TermRecording,
    TranscriptionResult,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;

use crate::builder::ClientBuilder;
use crate::connection::{Connection, ConnectionEvent, ConnectionEvents};
use crate::correlator::Correlator;
use crate::queue::{OutboundQueue, QueuedRequest};
use crate::reconnect::{ConnectionState, ReconnectBackoff, ReconnectController, Retry};
use crate::types::{deadline_after, millis, ClientError, Completion, Outcome, RequestId};

/// Resolved builder settings.
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub(crate) url: String,
    pub(crate) reconnect_backoff: ReconnectBackoff,
    pub(crate) connect_timeout: Duration,
    pub(crate) request_timeout: Duration,
    pub(crate) queue_timeout: Duration,
    pub(crate) max_queued: usize,
    pub(crate) heartbeat_interval: Option<Duration>,
    pub(crate) max_message_bytes: usize,
}

enum Command {
    Connect {
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Submit {
        kind: RequestKind,
        message: ClientMessage,
        completion: Completion,
    },
}

/// Handle to the backend client.
///
/// Create via [`ClientBuilder`].  Clones share the same connection.  When
/// the last clone is dropped the event loop shuts down as if
/// [`disconnect`](Self::disconnect) had been called.
#[derive(Clone)]
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl Client {
    /// Start a new builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub(crate) fn spawn(settings: Settings) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let event_loop = EventLoop::new(settings, state_tx);
        tokio::spawn(event_loop.run(commands_rx));
        Self {
            commands: commands_tx,
            state: state_rx,
        }
    }

    /// Open the connection.  Resolves once the connection is open, or with
    /// [`ClientError::ConnectFailure`] if this attempt fails; automatic
    /// retries continue in the background either way.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect { reply: tx })
            .map_err(|_| ClientError::Shutdown)?;
        rx.await.map_err(|_| ClientError::Shutdown)?
    }

    /// Close the connection and stop reconnecting.  Every pending and
    /// queued request has failed with [`ClientError::Cancelled`] by the
    /// time this returns.
    pub async fn disconnect(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect { reply: tx }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Run object detection on an image.
    ///
    /// The request is submitted when this is called, not when the returned
    /// future is first polled, so calls are sent in call order.
    pub fn detect(
        &self,
        image: impl Into<String>,
    ) -> impl Future<Output = Result<DetectionResult, ClientError>> + Send + 'static {
        let rx = self.submit(
            RequestKind::Detect,
            ClientMessage::Detect {
                image: image.into(),
            },
        );
        async move {
            match receive(rx).await? {
                ServerMessage::Detection(result) => Ok(result),
                other => Err(unexpected(RequestKind::Detect, &other)),
            }
        }
    }

    /// Transcribe a recorded term.  Submitted on call, like [`detect`](Self::detect).
    pub fn record_term(
        &self,
        recording: TermRecording,
    ) -> impl Future<Output = Result<TranscriptionResult, ClientError>> + Send + 'static {
        let rx = self.submit(RequestKind::RecordTerm, recording.into());
        async move {
            match receive(rx).await? {
                ServerMessage::Transcription(result) => Ok(result),
                other => Err(unexpected(RequestKind::RecordTerm, &other)),
            }
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Subscribe to connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    fn submit(
        &self,
        kind: RequestKind,
        message: ClientMessage,
    ) -> Result<oneshot::Receiver<Outcome>, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Submit {
                kind,
                message,
                completion: tx,
            })
            .map_err(|_| ClientError::Shutdown)?;
        Ok(rx)
    }
}

async fn receive(
    rx: Result<oneshot::Receiver<Outcome>, ClientError>,
) -> Result<ServerMessage, ClientError> {
    rx?.await.map_err(|_| ClientError::Shutdown)?
}

fn unexpected(kind: RequestKind, got: &ServerMessage) -> ClientError {
    ClientError::ProtocolError(format!("unexpected {} response to {kind}", got.label()))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type Attempt = JoinHandle<Result<(Connection, ConnectionEvents), ClientError>>;

struct EventLoop {
    settings: Settings,
    controller: ReconnectController,
    /// Requests accepted while not connected.
    queue: OutboundQueue,
    /// Requests waiting for their category's in-flight slot.
    backlog: OutboundQueue,
    correlator: Correlator,
    events: Option<ConnectionEvents>,
    attempt: Option<Attempt>,
    connect_waiters: Vec<oneshot::Sender<Result<(), ClientError>>>,
    next_heartbeat: Option<Instant>,
    next_id: RequestId,
    state_tx: watch::Sender<ConnectionState>,
}

impl EventLoop {
    fn new(settings: Settings, state_tx: watch::Sender<ConnectionState>) -> Self {
        Self {
            controller: ReconnectController::new(settings.reconnect_backoff.clone()),
            queue: OutboundQueue::new(settings.max_queued),
            backlog: OutboundQueue::new(settings.max_queued),
            correlator: Correlator::new(),
            events: None,
            attempt: None,
            connect_waiters: Vec::new(),
            next_heartbeat: None,
            next_id: 0,
            state_tx,
            settings,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        tracing::debug!(url = %self.settings.url, "client event loop started");

        loop {
            let wake = self.next_wakeup();
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                event = next_event(&mut self.events) => match event {
                    Some(event) => self.handle_event(event),
                    None => self.on_connection_lost("event stream ended".into()),
                },
                joined = join_attempt(&mut self.attempt) => {
                    self.attempt = None;
                    self.handle_attempt(joined);
                }
                _ = sleep_until(wake) => self.handle_timers(Instant::now()),
            }
            self.publish_state();
        }

        tracing::debug!("all client handles dropped, shutting down");
        self.disconnect();
    }

    // ── Commands ─────────────────────────────────────────────────────

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { reply } => self.connect(reply),
            Command::Disconnect { reply } => {
                self.disconnect();
                let _ = reply.send(());
            }
            Command::Submit {
                kind,
                message,
                completion,
            } => self.submit(kind, message, completion),
        }
    }

    fn connect(&mut self, reply: oneshot::Sender<Result<(), ClientError>>) {
        match self.controller.state() {
            ConnectionState::Open => {
                let _ = reply.send(Ok(()));
            }
            ConnectionState::Connecting => self.connect_waiters.push(reply),
            ConnectionState::Disconnected | ConnectionState::Closing => {
                self.controller.manual_connect();
                self.connect_waiters.push(reply);
                self.start_attempt();
            }
        }
    }

    /// Caller-initiated shutdown.  Fails everything with `Cancelled` and
    /// leaves the controller in a terminal `Disconnected`.
    fn disconnect(&mut self) {
        self.controller.begin_closing();
        self.publish_state();

        if let Some(attempt) = self.attempt.take() {
            attempt.abort();
        }
        self.events = None;
        self.next_heartbeat = None;

        let pending = self.correlator.fail_all(|| ClientError::Cancelled);
        let queued = self.backlog.flush(|| ClientError::Cancelled)
            + self.queue.flush(|| ClientError::Cancelled);
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(ClientError::Cancelled));
        }

        self.controller.finish_closing();
        self.publish_state();
        tracing::info!(url = %self.settings.url, pending, queued, "disconnected from backend");
    }

    fn submit(&mut self, kind: RequestKind, message: ClientMessage, completion: Completion) {
        self.next_id += 1;
        let req = QueuedRequest {
            id: self.next_id,
            kind,
            message,
            submitted_at: Utc::now(),
            enqueued_at: Instant::now(),
            completion,
        };

        if self.controller.is_exhausted() {
            req.fail(ClientError::ReconnectExhausted(self.controller.attempt_count()));
            return;
        }

        match self.controller.state() {
            ConnectionState::Open => self.send_now(req),
            state => {
                tracing::debug!(request_id = req.id, kind = %kind, state = %state, "not connected, queueing request");
                self.queue.enqueue(req);
            }
        }
    }

    // ── Sending ──────────────────────────────────────────────────────

    fn send_now(&mut self, req: QueuedRequest) {
        let Some(conn) = self.controller.connection() else {
            self.queue.enqueue(req);
            return;
        };
        let timeout = self.settings.request_timeout;
        if let Err(req) = dispatch(conn, &mut self.correlator, &mut self.backlog, timeout, req) {
            // The socket died before its close event reached us.  Hold the
            // request; the loss handler moves the backlog back to the queue.
            self.backlog.enqueue(req);
            self.on_connection_lost("send failed".into());
        }
    }

    fn drain_queue(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        let Some(conn) = self.controller.connection() else {
            return;
        };
        let timeout = self.settings.request_timeout;
        let queued = self.queue.len();
        let correlator = &mut self.correlator;
        let backlog = &mut self.backlog;
        let sent = self
            .queue
            .drain(|req| dispatch(conn, correlator, backlog, timeout, req));
        tracing::info!(queued, sent, "drained request queue");

        if !conn.is_open() {
            self.on_connection_lost("connection dropped during drain".into());
        }
    }

    /// Send the next held request of `kind`, now that its slot is free.
    fn release_backlog(&mut self, kind: RequestKind) {
        if self.controller.state() != ConnectionState::Open {
            return;
        }
        if let Some(req) = self.backlog.take_next(kind) {
            self.send_now(req);
        }
    }

    // ── Connection lifecycle ─────────────────────────────────────────

    fn start_attempt(&mut self) {
        self.controller.begin_connect();
        let url = self.settings.url.clone();
        let timeout = self.settings.connect_timeout;
        tracing::info!(url = %url, attempt = self.controller.attempt_count(), "connecting to backend");

        let handle = tokio::spawn(async move { Connection::open(&url, timeout).await });
        if let Some(old) = self.attempt.replace(handle) {
            old.abort();
        }
    }

    fn handle_attempt(
        &mut self,
        joined: Result<Result<(Connection, ConnectionEvents), ClientError>, JoinError>,
    ) {
        let result = joined.unwrap_or_else(|e| Err(ClientError::ConnectFailure(e.to_string())));
        match result {
            Ok((conn, events)) => self.on_open(conn, events),
            Err(err) => self.on_connect_failed(err),
        }
    }

    fn on_open(&mut self, conn: Connection, events: ConnectionEvents) {
        tracing::info!(url = %self.settings.url, connection = conn.id(), "connected to backend");
        self.controller.on_open(conn);
        self.events = Some(events);
        self.next_heartbeat = self
            .settings
            .heartbeat_interval
            .map(|d| deadline_after(Instant::now(), d));
        self.publish_state();
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        self.drain_queue();
    }

    fn on_connect_failed(&mut self, err: ClientError) {
        tracing::warn!(
            url = %self.settings.url,
            attempt = self.controller.attempt_count(),
            error = %err,
            "connect attempt failed"
        );
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
        let retry = self.controller.on_connect_failed(Instant::now());
        self.apply_retry(retry);
    }

    fn on_connection_lost(&mut self, reason: String) {
        tracing::warn!(url = %self.settings.url, reason = %reason, "backend connection lost");
        self.events = None;
        self.next_heartbeat = None;

        let retry = self.controller.on_unexpected_close(Instant::now());
        self.correlator
            .fail_all(|| ClientError::UnexpectedClose(reason.clone()));
        self.queue.append(&mut self.backlog);
        self.apply_retry(retry);
    }

    fn apply_retry(&mut self, retry: Retry) {
        match retry {
            Retry::After { attempt, delay } => {
                tracing::info!(
                    attempt,
                    max_attempts = self.controller.policy().max_attempts,
                    delay_ms = millis(delay),
                    "reconnect scheduled"
                );
            }
            Retry::Exhausted { attempts } => {
                let failed = self.queue.flush(|| ClientError::ReconnectExhausted(attempts));
                tracing::error!(
                    url = %self.settings.url,
                    attempts,
                    failed,
                    "max reconnect attempts exhausted"
                );
            }
        }
    }

    // ── Inbound ──────────────────────────────────────────────────────

    fn handle_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Message(text) => self.on_message(&text),
            ConnectionEvent::Closed { reason } => self.on_connection_lost(reason),
        }
    }

    fn on_message(&mut self, text: &str) {
        let limit = self.settings.max_message_bytes;
        let inbound = if text.len() > limit {
            Err(DecodeError::TooLarge {
                bytes: text.len(),
                limit,
            })
        } else {
            ServerMessage::parse(text)
        };

        match &inbound {
            Ok(ServerMessage::Pong) => {
                tracing::trace!("received pong");
                return;
            }
            Ok(msg) => tracing::debug!(response = msg.label(), "received message"),
            Err(e) => tracing::warn!(error = %e, "undecodable message from backend"),
        }

        if let Some(kind) = self.correlator.resolve(inbound) {
            self.release_backlog(kind);
        }
    }

    // ── Timers ───────────────────────────────────────────────────────

    fn next_wakeup(&self) -> Option<Instant> {
        let ttl = self.settings.queue_timeout;
        [
            self.controller.retry_at(),
            self.correlator.next_deadline(),
            self.queue.next_expiry(ttl),
            self.backlog.next_expiry(ttl),
            self.next_heartbeat,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn handle_timers(&mut self, now: Instant) {
        if self.controller.retry_due(now) && self.attempt.is_none() {
            self.start_attempt();
        }

        let ttl = self.settings.queue_timeout;
        self.queue.expire(now, ttl);
        self.backlog.expire(now, ttl);

        for kind in self.correlator.expire(now) {
            self.release_backlog(kind);
        }

        if self.next_heartbeat.is_some_and(|at| at <= now) {
            self.heartbeat(now);
        }
    }

    fn heartbeat(&mut self, now: Instant) {
        let Some(interval) = self.settings.heartbeat_interval else {
            self.next_heartbeat = None;
            return;
        };
        self.next_heartbeat = Some(deadline_after(now, interval));

        let ping = ClientMessage::Ping {
            timestamp: Utc::now().timestamp_millis(),
        };
        let sent = match (self.controller.connection(), serde_json::to_string(&ping)) {
            (Some(conn), Ok(text)) => conn.send(text).is_ok(),
            _ => false,
        };
        if !sent {
            self.on_connection_lost("heartbeat send failed".into());
        }
    }

    fn publish_state(&self) {
        let state = self.controller.state();
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}

/// Put one request on the wire, or hold it if its category is busy.
/// Gives the request back if the connection refused it.
fn dispatch(
    conn: &Connection,
    correlator: &mut Correlator,
    backlog: &mut OutboundQueue,
    timeout: Duration,
    req: QueuedRequest,
) -> Result<(), QueuedRequest> {
    if correlator.is_busy(req.kind) {
        tracing::debug!(request_id = req.id, kind = %req.kind, "slot busy, holding request");
        backlog.enqueue(req);
        return Ok(());
    }

    let text = match serde_json::to_string(&req.message) {
        Ok(text) => text,
        Err(e) => {
            req.fail(ClientError::ProtocolError(format!("encoding request: {e}")));
            return Ok(());
        }
    };
    if conn.send(text).is_err() {
        return Err(req);
    }

    tracing::debug!(request_id = req.id, kind = %req.kind, connection = conn.id(), "request sent");
    correlator.await_response(
        req.id,
        req.kind,
        req.submitted_at,
        Instant::now(),
        timeout,
        req.completion,
    );
    Ok(())
}

async fn next_event(events: &mut Option<ConnectionEvents>) -> Option<ConnectionEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn join_attempt(
    attempt: &mut Option<Attempt>,
) -> Result<Result<(Connection, ConnectionEvents), ClientError>, JoinError> {
    match attempt {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
