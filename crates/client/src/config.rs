use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::reconnect::ReconnectBackoff;
use crate::types::ClientError;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "LL_CONFIG";
/// Environment variable overriding [`ClientConfig::url`].
pub const BACKEND_URL_ENV: &str = "LL_BACKEND_URL";
const DEFAULT_CONFIG_PATH: &str = "lingualearn.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Backend WebSocket endpoint.
    #[serde(default = "d_url")]
    pub url: String,
    /// Automatic reconnect attempts before giving up.
    #[serde(default = "d_5")]
    pub max_reconnect_attempts: u32,
    /// Delay before the first reconnect attempt; doubles on each attempt.
    #[serde(default = "d_2000")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "d_10000")]
    pub connect_timeout_ms: u64,
    /// How long a sent request waits for its response.
    #[serde(default = "d_30000")]
    pub request_timeout_ms: u64,
    /// How long a request may wait in the queue before it is sent.
    #[serde(default = "d_30000")]
    pub queue_timeout_ms: u64,
    #[serde(default = "d_64")]
    pub max_queued: usize,
    /// `0` disables the heartbeat.
    #[serde(default = "d_30")]
    pub heartbeat_interval_secs: u64,
    /// Inbound frames larger than this are protocol errors.
    #[serde(default = "d_1mib")]
    pub max_message_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: d_url(),
            max_reconnect_attempts: d_5(),
            reconnect_base_delay_ms: d_2000(),
            connect_timeout_ms: d_10000(),
            request_timeout_ms: d_30000(),
            queue_timeout_ms: d_30000(),
            max_queued: d_64(),
            heartbeat_interval_secs: d_30(),
            max_message_bytes: d_1mib(),
        }
    }
}

impl ClientConfig {
    /// Load from the path in `LL_CONFIG` (or `lingualearn.toml`), falling
    /// back to defaults when the file does not exist, then apply
    /// `LL_BACKEND_URL`.
    pub fn load() -> Result<Self, ClientError> {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        let mut config = if Path::new(&path).exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        if let Ok(url) = std::env::var(BACKEND_URL_ENV) {
            if !url.is_empty() {
                config.url = url;
            }
        }
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
            .map_err(|e| ClientError::Config(format!("parsing {}: {e}", path.display())))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn reconnect_backoff(&self) -> ReconnectBackoff {
        ReconnectBackoff {
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_attempts: self.max_reconnect_attempts,
        }
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0).then(|| Duration::from_secs(self.heartbeat_interval_secs))
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_url() -> String {
    ll_protocol::DEFAULT_BACKEND_URL.into()
}
fn d_5() -> u32 {
    5
}
fn d_2000() -> u64 {
    2000
}
fn d_10000() -> u64 {
    10_000
}
fn d_30000() -> u64 {
    30_000
}
fn d_64() -> usize {
    64
}
fn d_30() -> u64 {
    30
}
fn d_1mib() -> usize {
    1024 * 1024
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_toml_gives_defaults() {
        let cfg = ClientConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, ClientConfig::default());
        assert_eq!(cfg.url, "ws://127.0.0.1:8000/ws");
        assert_eq!(cfg.max_reconnect_attempts, 5);
        assert_eq!(cfg.heartbeat_interval(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn partial_toml_overrides() {
        let cfg = ClientConfig::from_toml_str(
            r#"
            url = "ws://10.0.0.5:9000/ws"
            reconnect_base_delay_ms = 500
            heartbeat_interval_secs = 0
        "#,
        )
        .unwrap();
        assert_eq!(cfg.url, "ws://10.0.0.5:9000/ws");
        assert_eq!(cfg.reconnect_backoff().base_delay, Duration::from_millis(500));
        assert_eq!(cfg.reconnect_backoff().max_attempts, 5);
        assert_eq!(cfg.heartbeat_interval(), None);
        assert_eq!(cfg.request_timeout_ms, 30_000);
    }

    #[test]
    fn bad_types_are_rejected() {
        assert!(ClientConfig::from_toml_str("max_queued = \"lots\"").is_err());
    }

    #[test]
    fn from_file_reads_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_queued = 3").unwrap();
        let cfg = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.max_queued, 3);
    }

    #[test]
    fn from_file_reports_path_on_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_queued = [").unwrap();
        let err = ClientConfig::from_file(file.path()).unwrap_err();
        match err {
            ClientError::Config(msg) => assert!(msg.contains("parsing")),
            other => panic!("expected config error, got {other:?}"),
        }
    }
}
