//! Backend protocol: WebSocket message types for the detection and
//! transcription backend.
//!
//! Outbound messages are tagged envelopes (`{"type": "detect", ...}`).
//! Inbound messages are *not* uniformly tagged: a detection answer is
//! `{"success": true, "objects": [...]}`, a transcription is `{"text": ...}`,
//! and only errors and heartbeats carry a `type`.  [`ServerMessage::parse`]
//! classifies a raw text frame into one of the known shapes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Default backend endpoint used when nothing is configured.
pub const DEFAULT_BACKEND_URL: &str = "ws://127.0.0.1:8000/ws";

// ── Request categories ───────────────────────────────────────────────

/// Category of a request.  Responses carry no correlation id, so the
/// category is the only thing that ties a response to its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RequestKind {
    Detect,
    RecordTerm,
}

impl RequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::Detect => "detect",
            RequestKind::RecordTerm => "record_term",
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Outbound ─────────────────────────────────────────────────────────

/// Client → Backend envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Run object detection on one captured frame.
    #[serde(rename = "detect")]
    Detect {
        /// Base64 image, usually a `data:image/...;base64,` URL.
        image: String,
    },

    /// Transcribe a recorded term.
    #[serde(rename = "record_term")]
    RecordTerm {
        /// Base64 encoded audio clip.
        audio: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
    },

    /// Heartbeat.  The backend answers with `{"type": "pong"}`.
    #[serde(rename = "ping")]
    Ping { timestamp: i64 },
}

impl ClientMessage {
    /// The correlation category, or `None` for messages that expect no
    /// correlated response.
    pub fn kind(&self) -> Option<RequestKind> {
        match self {
            ClientMessage::Detect { .. } => Some(RequestKind::Detect),
            ClientMessage::RecordTerm { .. } => Some(RequestKind::RecordTerm),
            ClientMessage::Ping { .. } => None,
        }
    }
}

/// Payload for a `record_term` request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TermRecording {
    pub audio: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl TermRecording {
    pub fn new(audio: impl Into<String>) -> Self {
        Self {
            audio: audio.into(),
            language: None,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

impl From<TermRecording> for ClientMessage {
    fn from(rec: TermRecording) -> Self {
        ClientMessage::RecordTerm {
            audio: rec.audio,
            language: rec.language,
        }
    }
}

// ── Inbound ──────────────────────────────────────────────────────────

/// One object reported by the detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    /// `[x1, y1, x2, y2]` in image pixels.
    pub bbox: [f64; 4],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Detector-specific fields (`id`, `area`, ...), kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Successful answer to a `detect` request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub objects: Vec<DetectedObject>,
}

/// Successful answer to a `record_term` request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionResult {
    pub text: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A classified Backend → Client message.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Detection(DetectionResult),
    Transcription(TranscriptionResult),
    /// `{"success": false, "error": ...}`
    Failure { error: String },
    /// `{"type": "error", "message": ...}`
    Error { message: String },
    Pong,
}

/// An inbound frame that matches none of the known shapes.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(String),
    #[error("expected a JSON object")]
    NotAnObject,
    #[error("malformed {shape} message: {reason}")]
    Malformed { shape: &'static str, reason: String },
    #[error("unrecognized message type: {0}")]
    UnknownType(String),
    #[error("unrecognized message shape")]
    UnknownShape,
    #[error("frame of {bytes} bytes exceeds the {limit} byte limit")]
    TooLarge { bytes: usize, limit: usize },
}

impl ServerMessage {
    /// Classify a raw text frame.
    pub fn parse(text: &str) -> Result<Self, DecodeError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| DecodeError::Json(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let obj = value.as_object().ok_or(DecodeError::NotAnObject)?;

        if let Some(ty) = obj.get("type").and_then(Value::as_str) {
            return match ty {
                "pong" => Ok(ServerMessage::Pong),
                "error" => Ok(ServerMessage::Error {
                    message: obj
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unspecified backend error")
                        .to_string(),
                }),
                other => Err(DecodeError::UnknownType(other.to_string())),
            };
        }

        if obj.get("success").and_then(Value::as_bool) == Some(false) {
            let error = match obj.get("error") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => "unspecified backend failure".to_string(),
            };
            return Ok(ServerMessage::Failure { error });
        }

        if obj.contains_key("objects") {
            return serde_json::from_value(value)
                .map(ServerMessage::Detection)
                .map_err(|e| DecodeError::Malformed {
                    shape: "detection",
                    reason: e.to_string(),
                });
        }

        if obj.contains_key("text") {
            return serde_json::from_value(value)
                .map(ServerMessage::Transcription)
                .map_err(|e| DecodeError::Malformed {
                    shape: "transcription",
                    reason: e.to_string(),
                });
        }

        Err(DecodeError::UnknownShape)
    }

    /// The request category this message answers, if it can be told from
    /// the message alone.  Errors and failures are uncategorised.
    pub fn kind(&self) -> Option<RequestKind> {
        match self {
            ServerMessage::Detection(_) => Some(RequestKind::Detect),
            ServerMessage::Transcription(_) => Some(RequestKind::RecordTerm),
            ServerMessage::Failure { .. } | ServerMessage::Error { .. } | ServerMessage::Pong => {
                None
            }
        }
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            ServerMessage::Detection(_) => "detection",
            ServerMessage::Transcription(_) => "transcription",
            ServerMessage::Failure { .. } => "failure",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Pong => "pong",
        }
    }
}
