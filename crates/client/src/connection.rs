//! A single WebSocket connection to the backend.
//!
//! The connection owns a reader and a writer task.  Writes go through an
//! unbounded channel so [`Connection::send`] never blocks; inbound frames
//! and the final close are reported on the event channel returned by
//! [`Connection::open`].  Retrying is somebody else's job.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::types::ClientError;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle events reported after a successful open.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// One inbound text frame.
    Message(String),
    /// The peer or the network closed the connection.  Emitted at most
    /// once, and never after a caller-initiated [`Connection::close`].
    Closed { reason: String },
}

pub type ConnectionEvents = mpsc::UnboundedReceiver<ConnectionEvent>;

pub struct Connection {
    id: u64,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    /// Open a connection.  Resolves with either the open connection and
    /// its event stream, or a [`ClientError::ConnectFailure`].
    pub async fn open(
        url: &str,
        connect_timeout: Duration,
    ) -> Result<(Self, ConnectionEvents), ClientError> {
        let connect = tokio_tungstenite::connect_async(url);
        let (ws, _response) = match tokio::time::timeout(connect_timeout, connect).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Err(ClientError::ConnectFailure(e.to_string())),
            Err(_) => {
                return Err(ClientError::ConnectFailure(format!(
                    "timed out after {connect_timeout:?}"
                )))
            }
        };

        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let (mut sink, mut stream) = ws.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        // Writer task: drains the outbound channel into the socket.  When it
        // exits the channel closes, which is what makes `send` fail.
        let writer = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = sink.send(msg).await {
                    tracing::debug!(connection = id, error = %e, "write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        // Reader task: forwards text frames, then reports the close exactly once.
        let reader = tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if event_tx.send(ConnectionEvent::Message(text)).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(f) if !f.reason.is_empty() => {
                                format!("closed by peer ({}): {}", f.code, f.reason)
                            }
                            Some(f) => format!("closed by peer ({})", f.code),
                            None => "closed by peer".to_string(),
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break e.to_string(),
                    None => break "stream ended".to_string(),
                }
            };
            let _ = event_tx.send(ConnectionEvent::Closed { reason });
        });

        tracing::debug!(connection = id, url = %url, "websocket open");

        Ok((
            Self {
                id,
                outbound: Some(outbound_tx),
                reader,
                writer,
            },
            event_rx,
        ))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue one text frame for writing.  Fire-and-forget.
    pub fn send(&self, text: String) -> Result<(), ClientError> {
        let tx = self.outbound.as_ref().ok_or(ClientError::NotOpen)?;
        tx.send(Message::Text(text)).map_err(|_| ClientError::NotOpen)
    }

    pub fn is_open(&self) -> bool {
        self.outbound.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Close the connection.  Idempotent, and silent: no `Closed` event
    /// follows a caller-initiated close.
    pub fn close(&mut self) {
        let Some(tx) = self.outbound.take() else {
            return;
        };
        self.reader.abort();
        // The writer flushes the close frame and exits on its own.
        if tx.send(Message::Close(None)).is_err() {
            self.writer.abort();
        }
        tracing::debug!(connection = self.id, "websocket closed by client");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .finish()
    }
}
