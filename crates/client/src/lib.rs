//! `ll-client` — resilient client for the LinguaLearn detection and
//! transcription backend.
//!
//! The backend speaks JSON over one long-lived WebSocket.  This crate keeps
//! that connection alive, queues requests issued while it is down, matches
//! responses back to their callers, and enforces per-request deadlines, so
//! UI code only ever sees one eventual result per call.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  UI layer                                                    │
//! │     client.detect(frame) / client.record_term(clip)          │
//! └──────────────┬───────────────────────────────────────────────┘
//!                │ Command (mpsc)
//! ┌──────────────▼───────────────────────────────────────────────┐
//! │  Event loop (one task, one select!)                          │
//! │    ReconnectController ── owns ConnectionState + Connection  │
//! │    OutboundQueue       ── requests made while disconnected   │
//! │    backlog             ── requests waiting for a free slot   │
//! │    Correlator          ── in-flight requests + deadlines     │
//! └──────────────┬───────────────────────────────────────────────┘
//!                │ text frames
//!          Connection (reader + writer tasks) ── ws://host:8000/ws
//! ```
//!
//! # Lifecycle
//!
//! 1. `connect()` opens the socket; the queue drains in submission order.
//! 2. On an unexpected close, attempts follow `base * 2^(k-1)` (2s, 4s, ...)
//!    up to `max_attempts`; the counter resets on every successful open.
//! 3. Once attempts are exhausted, queued requests fail with
//!    `ReconnectExhausted` and the client stays down until `connect()`.
//! 4. `disconnect()` cancels every pending and queued request and never
//!    reconnects on its own.
//!
//! # Correlation
//!
//! Responses carry no request id.  Each category (`detect`, `record_term`)
//! has one in-flight slot; further requests of a busy category wait in the
//! backlog and go out as soon as the slot frees.

pub mod builder;
pub mod client;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod queue;
pub mod reconnect;
pub mod types;

// ── Re-exports for ergonomic imports ─────────────────────────────────

pub use builder::ClientBuilder;
pub use client::Client;
pub use config::ClientConfig;
pub use reconnect::{ConnectionState, ReconnectBackoff};
pub use types::{ClientError, RequestId};

// Re-export protocol types so callers never need to import ll-protocol directly.
pub use ll_protocol::{
    DetectedObject, DetectionResult, RequestKind, TermRecording, TranscriptionResult,
};
