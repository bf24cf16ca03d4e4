//! Integration test: boots an in-process WebSocket server that plays the
//! detection backend, connects a real [`Client`], and checks the queueing,
//! correlation, timeout, cancellation, and reconnect behavior end to end.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{FutureExt, SinkExt, StreamExt};
use ll_client::{
    ClientBuilder, ClientError, ConnectionState, ReconnectBackoff, TermRecording,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

// ── Mini backend: in-process WS server ──────────────────────────────────

/// What the backend does with one request.
enum Reply {
    Send(Value),
    Raw(String),
    Delayed(Duration, Value),
    Silent,
    Hangup,
}

type Responder = Arc<dyn Fn(usize, &Value) -> Reply + Send + Sync>;

struct MiniBackend {
    addr: SocketAddr,
    /// Every non-ping message the backend received, in arrival order.
    received: mpsc::UnboundedReceiver<Value>,
    connections: Arc<AtomicUsize>,
}

impl MiniBackend {
    async fn next_received(&mut self) -> Value {
        tokio::time::timeout(Duration::from_secs(5), self.received.recv())
            .await
            .expect("timeout waiting for a request at the backend")
            .expect("backend stopped")
    }

    fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// Boots a backend on an ephemeral port.  `respond` gets the 0-based
/// connection index and the decoded request.  Pings are always answered
/// with a pong and never reach `respond`.
async fn start_backend<F>(respond: F) -> MiniBackend
where
    F: Fn(usize, &Value) -> Reply + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let respond: Responder = Arc::new(respond);
    let (received_tx, received_rx) = mpsc::unbounded_channel();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = connections.clone();

    tokio::spawn(async move {
        while let Ok((stream, _peer)) = listener.accept().await {
            let index = counter.fetch_add(1, Ordering::SeqCst);
            let respond = respond.clone();
            let received_tx = received_tx.clone();
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    let Message::Text(text) = msg else {
                        continue;
                    };
                    let Ok(value) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    if value["type"] == "ping" {
                        let pong = json!({"type": "pong"}).to_string();
                        if ws.send(Message::Text(pong)).await.is_err() {
                            return;
                        }
                        continue;
                    }

                    let reply = respond(index, &value);
                    let _ = received_tx.send(value);
                    let out = match reply {
                        Reply::Send(v) => v.to_string(),
                        Reply::Raw(s) => s,
                        Reply::Delayed(delay, v) => {
                            tokio::time::sleep(delay).await;
                            v.to_string()
                        }
                        Reply::Silent => continue,
                        Reply::Hangup => {
                            let _ = ws.close(None).await;
                            return;
                        }
                    };
                    if ws.send(Message::Text(out)).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    MiniBackend {
        addr,
        received: received_rx,
        connections,
    }
}

/// Answers `detect` with one object named after the image and
/// `record_term` with a transcription of the audio.
fn echo_backend(_conn: usize, msg: &Value) -> Reply {
    match msg["type"].as_str() {
        Some("detect") => Reply::Send(json!({
            "success": true,
            "objects": [{"name": msg["image"], "bbox": [0, 0, 10, 10], "confidence": 0.9}],
        })),
        Some("record_term") => Reply::Send(json!({
            "text": format!("heard {}", msg["audio"].as_str().unwrap_or_default()),
        })),
        _ => Reply::Silent,
    }
}

fn client_for(addr: SocketAddr) -> ClientBuilder {
    ClientBuilder::new()
        .url(format!("ws://{addr}/ws"))
        .heartbeat_interval(None)
        .request_timeout(Duration::from_secs(5))
        .reconnect_backoff(ReconnectBackoff {
            base_delay: Duration::from_millis(20),
            max_attempts: 5,
        })
}

fn object_name(result: &ll_client::DetectionResult) -> Option<&str> {
    result.objects.first().and_then(|o| o.name.as_deref())
}

// ── Tests ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn detect_roundtrip() {
    let mut backend = start_backend(|_, _| {
        Reply::Send(json!({"success": true, "objects": [{"name": "cup", "bbox": [1, 2, 3, 4]}]}))
    })
    .await;
    let client = client_for(backend.addr).build().unwrap();

    client.connect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Open);

    let result = client.detect("abc").await.unwrap();
    assert_eq!(result.objects.len(), 1);
    let cup = &result.objects[0];
    assert_eq!(cup.name.as_deref(), Some("cup"));
    assert_eq!(cup.bbox, [1.0, 2.0, 3.0, 4.0]);
    assert_eq!(cup.confidence, None);
    assert!(cup.extra.is_empty());

    assert_eq!(
        backend.next_received().await,
        json!({"type": "detect", "image": "abc"})
    );
}

#[tokio::test]
async fn record_term_roundtrip() {
    let mut backend = start_backend(echo_backend).await;
    let client = client_for(backend.addr).build().unwrap();
    client.connect().await.unwrap();

    let result = client
        .record_term(TermRecording::new("clip").with_language("es"))
        .await
        .unwrap();
    assert_eq!(result.text, "heard clip");

    assert_eq!(
        backend.next_received().await,
        json!({"type": "record_term", "audio": "clip", "language": "es"})
    );
}

#[tokio::test]
async fn requests_made_while_disconnected_are_sent_in_order() {
    let mut backend = start_backend(echo_backend).await;
    let client = client_for(backend.addr).build().unwrap();

    // Submitted before any connection exists.
    let a = client.detect("a");
    let r = client.record_term(TermRecording::new("r"));
    let b = client.detect("b");
    let c = client.detect("c");
    assert_eq!(client.state(), ConnectionState::Disconnected);

    client.connect().await.unwrap();
    let (a, r, b, c) = tokio::join!(a, r, b, c);
    assert_eq!(object_name(&a.unwrap()), Some("a"));
    assert_eq!(r.unwrap().text, "heard r");
    assert_eq!(object_name(&b.unwrap()), Some("b"));
    assert_eq!(object_name(&c.unwrap()), Some("c"));

    let mut order = Vec::new();
    for _ in 0..4 {
        let msg = backend.next_received().await;
        let payload = msg
            .get("image")
            .or_else(|| msg.get("audio"))
            .and_then(Value::as_str)
            .unwrap()
            .to_string();
        order.push(payload);
    }
    assert_eq!(order, vec!["a", "r", "b", "c"]);
}

#[tokio::test]
async fn concurrent_detects_are_serialized() {
    let mut backend = start_backend(|_, msg| {
        Reply::Delayed(
            Duration::from_millis(30),
            json!({"success": true, "objects": [{"name": msg["image"], "bbox": [0, 0, 1, 1]}]}),
        )
    })
    .await;
    let client = client_for(backend.addr).build().unwrap();
    client.connect().await.unwrap();

    let first = client.detect("one");
    let second = client.detect("two");
    let (first, second) = tokio::join!(first, second);
    assert_eq!(object_name(&first.unwrap()), Some("one"));
    assert_eq!(object_name(&second.unwrap()), Some("two"));

    assert_eq!(backend.next_received().await["image"], "one");
    assert_eq!(backend.next_received().await["image"], "two");
}

#[tokio::test]
async fn request_times_out_and_late_response_is_dropped() {
    let backend = start_backend(|_, msg| {
        if msg["image"] == "slow" {
            Reply::Delayed(
                Duration::from_millis(300),
                json!({"success": true, "objects": [{"name": "stale", "bbox": [0, 0, 1, 1]}]}),
            )
        } else {
            echo_backend(0, msg)
        }
    })
    .await;
    let client = client_for(backend.addr)
        .request_timeout(Duration::from_millis(100))
        .build()
        .unwrap();
    client.connect().await.unwrap();

    let err = client.detect("slow").await.unwrap_err();
    assert_eq!(err, ClientError::Timeout(Duration::from_millis(100)));

    // Let the stale answer arrive while nothing is pending.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let fresh = client.detect("fresh").await.unwrap();
    assert_eq!(object_name(&fresh), Some("fresh"));
}

#[tokio::test]
async fn late_answer_is_not_given_to_the_next_request() {
    let backend = start_backend(|_, msg| {
        if msg["image"] == "slow" {
            Reply::Delayed(
                Duration::from_millis(400),
                json!({"success": true, "objects": [{"name": "stale", "bbox": [0, 0, 1, 1]}]}),
            )
        } else {
            echo_backend(0, msg)
        }
    })
    .await;
    let client = client_for(backend.addr)
        .request_timeout(Duration::from_millis(300))
        .build()
        .unwrap();
    client.connect().await.unwrap();

    // `fresh` is held behind `slow` and goes out the moment `slow` times out,
    // before the backend's answer to `slow` arrives.
    let slow = client.detect("slow");
    let fresh = client.detect("fresh");
    let (slow, fresh) = tokio::join!(slow, fresh);

    assert_eq!(slow.unwrap_err(), ClientError::Timeout(Duration::from_millis(300)));
    assert_eq!(object_name(&fresh.unwrap()), Some("fresh"));
}

#[tokio::test]
async fn disconnect_cancels_pending_and_held_requests() {
    let mut backend = start_backend(|_, _| Reply::Silent).await;
    let client = client_for(backend.addr).build().unwrap();
    client.connect().await.unwrap();

    let a = client.detect("a");
    let r = client.record_term(TermRecording::new("r"));
    let b = client.detect("b"); // held: the detect slot is taken by `a`
    backend.next_received().await;
    backend.next_received().await;

    client.disconnect().await;

    // Everything is already resolved; no further scheduling needed.
    assert_eq!(a.now_or_never(), Some(Err(ClientError::Cancelled)));
    assert_eq!(r.now_or_never(), Some(Err(ClientError::Cancelled)));
    assert_eq!(b.now_or_never(), Some(Err(ClientError::Cancelled)));
    assert_eq!(client.state(), ConnectionState::Disconnected);

    // A manual disconnect never re-arms reconnection.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(backend.connection_count(), 1);
}

#[tokio::test]
async fn disconnect_cancels_queued_requests() {
    let backend = start_backend(echo_backend).await;
    let client = client_for(backend.addr).build().unwrap();

    let queued = client.detect("never sent");
    client.disconnect().await;
    assert_eq!(queued.now_or_never(), Some(Err(ClientError::Cancelled)));
    assert_eq!(backend.connection_count(), 0);
}

#[tokio::test]
async fn unreachable_backend_fails_queued_requests() {
    // Grab a free port, then release it so nothing is listening.
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let client = ClientBuilder::new()
        .url(format!("ws://{addr}/ws"))
        .heartbeat_interval(None)
        .reconnect_backoff(ReconnectBackoff {
            base_delay: Duration::from_millis(10),
            max_attempts: 2,
        })
        .build()
        .unwrap();

    let queued = client.detect("lost");
    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, ClientError::ConnectFailure(_)), "got {err:?}");

    let err = tokio::time::timeout(Duration::from_secs(5), queued)
        .await
        .expect("queued request must not hang")
        .unwrap_err();
    assert_eq!(err, ClientError::ReconnectExhausted(2));
    assert_eq!(client.state(), ConnectionState::Disconnected);

    // Stays down until an explicit connect.
    assert_eq!(
        client.detect("later").await.unwrap_err(),
        ClientError::ReconnectExhausted(2)
    );
}

#[tokio::test]
async fn backend_errors_reach_the_caller() {
    let backend = start_backend(|_, msg| match msg["image"].as_str() {
        Some("broken") => Reply::Send(json!({"success": false, "error": "cannot decode image"})),
        _ => Reply::Send(json!({"type": "error", "message": "model not loaded"})),
    })
    .await;
    let client = client_for(backend.addr).build().unwrap();
    client.connect().await.unwrap();

    assert_eq!(
        client.detect("broken").await.unwrap_err(),
        ClientError::Backend("cannot decode image".into())
    );
    assert_eq!(
        client.detect("anything").await.unwrap_err(),
        ClientError::Backend("model not loaded".into())
    );
}

#[tokio::test]
async fn malformed_response_is_a_protocol_error() {
    let backend = start_backend(|_, _| Reply::Raw("this is not json".into())).await;
    let client = client_for(backend.addr).build().unwrap();
    client.connect().await.unwrap();

    let err = client.detect("x").await.unwrap_err();
    assert!(matches!(err, ClientError::ProtocolError(_)), "got {err:?}");
}

#[tokio::test]
async fn oversized_response_is_a_protocol_error() {
    let backend = start_backend(|_, _| {
        Reply::Send(json!({"text": "x".repeat(4096)}))
    })
    .await;
    let client = client_for(backend.addr)
        .max_message_bytes(1024)
        .build()
        .unwrap();
    client.connect().await.unwrap();

    let err = client.record_term(TermRecording::new("a")).await.unwrap_err();
    assert!(matches!(err, ClientError::ProtocolError(_)), "got {err:?}");
}

#[tokio::test]
async fn reconnects_after_server_hangup() {
    let backend = start_backend(|conn, msg| {
        if conn == 0 {
            Reply::Hangup
        } else {
            echo_backend(conn, msg)
        }
    })
    .await;
    let client = client_for(backend.addr).build().unwrap();
    client.connect().await.unwrap();

    let err = client.detect("first").await.unwrap_err();
    assert!(matches!(err, ClientError::UnexpectedClose(_)), "got {err:?}");

    // Queued while the client backs off, sent once it is open again.
    let second = tokio::time::timeout(Duration::from_secs(5), client.detect("second"))
        .await
        .expect("reconnect took too long")
        .unwrap();
    assert_eq!(object_name(&second), Some("second"));
    assert_eq!(client.state(), ConnectionState::Open);
    assert_eq!(backend.connection_count(), 2);
}

#[tokio::test]
async fn pongs_are_not_mistaken_for_responses() {
    let backend = start_backend(|_, msg| {
        Reply::Delayed(
            Duration::from_millis(150),
            json!({"success": true, "objects": [{"name": msg["image"], "bbox": [0, 0, 1, 1]}]}),
        )
    })
    .await;
    let client = client_for(backend.addr)
        .heartbeat_interval(Some(Duration::from_millis(20)))
        .build()
        .unwrap();
    client.connect().await.unwrap();

    let result = client.detect("steady").await.unwrap();
    assert_eq!(object_name(&result), Some("steady"));
}

#[tokio::test]
async fn queued_request_expires_when_never_connected() {
    let backend = start_backend(echo_backend).await;
    let client = client_for(backend.addr)
        .queue_timeout(Duration::from_millis(50))
        .build()
        .unwrap();

    let err = client.detect("idle").await.unwrap_err();
    assert_eq!(err, ClientError::Timeout(Duration::from_millis(50)));
}

#[tokio::test]
async fn dropping_every_handle_cancels_requests() {
    let backend = start_backend(|_, _| Reply::Silent).await;
    let client = client_for(backend.addr).build().unwrap();
    client.connect().await.unwrap();

    let pending = client.detect("orphan");
    drop(client);

    let err = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .expect("event loop did not shut down")
        .unwrap_err();
    assert_eq!(err, ClientError::Cancelled);
}
