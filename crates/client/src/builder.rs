//! Builder pattern for constructing a [`Client`].

use std::time::Duration;

use crate::client::{Client, Settings};
use crate::config::ClientConfig;
use crate::reconnect::ReconnectBackoff;
use crate::types::ClientError;

/// Fluent builder for [`Client`].
///
/// # Example
///
/// ```rust,no_run
/// # use ll_client::ClientBuilder;
/// # async fn demo() -> Result<(), ll_client::ClientError> {
/// let client = ClientBuilder::new()
///     .url("ws://127.0.0.1:8000/ws")
///     .request_timeout(std::time::Duration::from_secs(10))
///     .build()?;
/// client.connect().await?;
/// # Ok(())
/// # }
/// ```
pub struct ClientBuilder {
    pub(crate) url: String,
    pub(crate) reconnect_backoff: ReconnectBackoff,
    pub(crate) connect_timeout: Duration,
    pub(crate) request_timeout: Duration,
    pub(crate) queue_timeout: Duration,
    pub(crate) max_queued: usize,
    pub(crate) heartbeat_interval: Option<Duration>,
    pub(crate) max_message_bytes: usize,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self::from_config(&ClientConfig::default())
    }

    /// Start from a loaded [`ClientConfig`].
    pub fn from_config(cfg: &ClientConfig) -> Self {
        Self {
            url: cfg.url.clone(),
            reconnect_backoff: cfg.reconnect_backoff(),
            connect_timeout: Duration::from_millis(cfg.connect_timeout_ms),
            request_timeout: Duration::from_millis(cfg.request_timeout_ms),
            queue_timeout: Duration::from_millis(cfg.queue_timeout_ms),
            max_queued: cfg.max_queued,
            heartbeat_interval: cfg.heartbeat_interval(),
            max_message_bytes: cfg.max_message_bytes,
        }
    }

    // ── Endpoint ─────────────────────────────────────────────────────

    /// Set the backend WebSocket URL (e.g. `ws://127.0.0.1:8000/ws`).
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    // ── Behavior ─────────────────────────────────────────────────────

    /// Override the reconnect backoff policy.
    pub fn reconnect_backoff(mut self, cfg: ReconnectBackoff) -> Self {
        self.reconnect_backoff = cfg;
        self
    }

    pub fn connect_timeout(mut self, d: Duration) -> Self {
        self.connect_timeout = d;
        self
    }

    /// How long a sent request waits for its response (default 30s).
    pub fn request_timeout(mut self, d: Duration) -> Self {
        self.request_timeout = d;
        self
    }

    /// How long a request may wait unsent (default 30s).
    pub fn queue_timeout(mut self, d: Duration) -> Self {
        self.queue_timeout = d;
        self
    }

    /// Queue capacity while disconnected (default 64).
    pub fn max_queued(mut self, n: usize) -> Self {
        self.max_queued = n;
        self
    }

    /// Heartbeat interval; `None` disables pings (default 30s).
    pub fn heartbeat_interval(mut self, d: Option<Duration>) -> Self {
        self.heartbeat_interval = d;
        self
    }

    // ── Wire limits ──────────────────────────────────────────────────

    /// Maximum inbound frame size (default 1 MB).
    pub fn max_message_bytes(mut self, n: usize) -> Self {
        self.max_message_bytes = n;
        self
    }

    /// Build the [`Client`] and spawn its event loop.  Must be called from
    /// within a Tokio runtime.
    pub fn build(self) -> Result<Client, ClientError> {
        if self.url.is_empty() {
            return Err(ClientError::Config("url is required".into()));
        }
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(ClientError::Config(format!(
                "url must use ws:// or wss://, got {}",
                self.url
            )));
        }
        if self.max_queued == 0 {
            return Err(ClientError::Config("max_queued must be at least 1".into()));
        }

        Ok(Client::spawn(Settings {
            url: self.url,
            reconnect_backoff: self.reconnect_backoff,
            connect_timeout: self.connect_timeout,
            request_timeout: self.request_timeout,
            queue_timeout: self.queue_timeout,
            max_queued: self.max_queued,
            heartbeat_interval: self.heartbeat_interval,
            max_message_bytes: self.max_message_bytes,
        }))
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
