//! The three transports speak the same protocol, plus the admin contract.
//!
//! - SSE: server-push stream with the NDJSON POST ingress.
//! - HTTP stream: one full-duplex NDJSON POST; handshake is the first line.
//! - WebSocket binary continuation frames round-trip through the echo tool.
//! - `/health` and `/stats` expose the frozen camelCase shapes.

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use haip_client::{ClientConfig, ClientSession};
use haip_protocol::*;
use haip_server::ServerConfig;
use haip_test_utils::{RawFrame, RawWsClient, TestServer};
use serde_json::{Value, json};
use std::pin::Pin;
use std::time::Duration;

const RECV_TIMEOUT: Duration = Duration::from_secs(3);

fn client_envelope(
    session: &str,
    event: EventType,
    channel: Channel,
    seq: u64,
    payload: Value,
) -> Envelope {
    let mut envelope = Envelope::new(event, channel)
        .with_session(session)
        .with_seq(seq);
    envelope.payload = payload;
    envelope
}

fn hai_payload() -> Value {
    json!({
        "haip_version": "1.1.2",
        "accept_major": [1],
        "accept_events": [],
        "auth": {"token": "T"}
    })
}

fn ndjson_line(envelope: &Envelope) -> Bytes {
    let mut text = encode_envelope(envelope);
    text.push('\n');
    Bytes::from(text)
}

/// Reads envelopes out of a streaming HTTP response body: one JSON document
/// per line, with SSE `data: ` framing stripped when present.
struct LineReader {
    stream: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    buffer: String,
}

impl LineReader {
    fn new(response: reqwest::Response) -> Self {
        LineReader {
            stream: Box::pin(response.bytes_stream()),
            buffer: String::new(),
        }
    }

    async fn next_envelope(&mut self) -> Option<Envelope> {
        loop {
            while let Some(pos) = self.buffer.find('\n') {
                let line: String = self.buffer.drain(..=pos).collect();
                let line = line.trim_end();
                let data = line.strip_prefix("data: ").unwrap_or(line);
                if data.is_empty() || data.starts_with(':') {
                    continue;
                }
                if let Ok(envelope) = parse_envelope(data) {
                    return Some(envelope);
                }
            }
            let chunk = self.stream.next().await?.ok()?;
            self.buffer.push_str(&String::from_utf8_lossy(&chunk));
        }
    }

    async fn expect_envelope(&mut self) -> Envelope {
        tokio::time::timeout(RECV_TIMEOUT, self.next_envelope())
            .await
            .expect("envelope within the test timeout")
            .expect("stream ended unexpectedly")
    }

    async fn expect_event(&mut self, event: EventType) -> Envelope {
        loop {
            let envelope = self.expect_envelope().await;
            if envelope.event == event {
                return envelope;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// SSE
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sse_stream_and_post_ingress_complete_a_round_trip() {
    let server = TestServer::start(ServerConfig::default()).await;
    let http = reqwest::Client::new();

    let response = http
        .get(format!("{}?token=T", server.sse_url()))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let mut reader = LineReader::new(response);

    // The first event is the server HAI carrying the session id.
    let hello = reader.expect_event(EventType::Hai).await;
    let session_id = hello.session.clone();
    assert!(!session_id.is_empty());

    // Authenticate and ping through the paired ingress.
    let ingress = server.sse_ingress_url(&session_id);
    let mut body = String::from_utf8(
        ndjson_line(&client_envelope(
            &session_id,
            EventType::Hai,
            Channel::System,
            1,
            hai_payload(),
        ))
        .to_vec(),
    )
    .unwrap();
    body.push_str(
        &String::from_utf8(
            ndjson_line(&client_envelope(
                &session_id,
                EventType::Ping,
                Channel::System,
                2,
                json!({"nonce": "over-sse"}),
            ))
            .to_vec(),
        )
        .unwrap(),
    );
    let accepted = http.post(&ingress).body(body).send().await.unwrap();
    assert_eq!(accepted.status(), reqwest::StatusCode::ACCEPTED);

    let pong = reader.expect_event(EventType::Pong).await;
    assert_eq!(
        pong.decode_payload::<PongPayload>().unwrap().nonce,
        "over-sse"
    );
}

#[tokio::test]
async fn sse_ingress_rejects_unknown_sessions() {
    let server = TestServer::start(ServerConfig::default()).await;
    let response = reqwest::Client::new()
        .post(server.sse_ingress_url("no-such-session"))
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    let error: Value = response.json().await.unwrap();
    assert_eq!(error["code"], json!("SESSION_NOT_FOUND"));
}

// ---------------------------------------------------------------------------
// HTTP stream
// ---------------------------------------------------------------------------

#[tokio::test]
async fn http_stream_is_full_duplex_with_the_handshake_first() {
    let server = TestServer::start(ServerConfig::default()).await;
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(8);
    let body = reqwest::Body::wrap_stream(tokio_stream::wrappers::ReceiverStream::new(rx));

    let response = reqwest::Client::new()
        .post(server.stream_url())
        .header("authorization", "Bearer T")
        .body(body)
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let mut reader = LineReader::new(response);

    // Handshake is the first response line.
    let hello = reader.expect_event(EventType::Hai).await;
    let session_id = hello.session.clone();

    tx.send(Ok(ndjson_line(&client_envelope(
        &session_id,
        EventType::Hai,
        Channel::System,
        1,
        hai_payload(),
    ))))
    .await
    .unwrap();
    tx.send(Ok(ndjson_line(&client_envelope(
        &session_id,
        EventType::Ping,
        Channel::System,
        2,
        json!({"nonce": "over-stream"}),
    ))))
    .await
    .unwrap();

    let pong = reader.expect_event(EventType::Pong).await;
    assert_eq!(
        pong.decode_payload::<PongPayload>().unwrap().nonce,
        "over-stream"
    );

    // Tool traffic works over the same connection.
    tx.send(Ok(ndjson_line(&client_envelope(
        &session_id,
        EventType::ToolList,
        Channel::System,
        3,
        json!({}),
    ))))
    .await
    .unwrap();
    let list = reader.expect_event(EventType::ToolList).await;
    let payload: ToolListPayload = list.decode_payload().unwrap();
    assert_eq!(payload.tools.len(), 2);
}

// ---------------------------------------------------------------------------
// WebSocket binary frames
// ---------------------------------------------------------------------------

#[tokio::test]
async fn websocket_binary_continuation_round_trips_through_echo() {
    let server = TestServer::start(ServerConfig::default()).await;
    let mut client = RawWsClient::connect(&server.ws_url()).await.unwrap();

    let hello = client.recv_envelope_timeout(RECV_TIMEOUT).await.unwrap();
    let session_id = hello.session.clone();
    client
        .send_envelope(&client_envelope(
            &session_id,
            EventType::Hai,
            Channel::System,
            1,
            hai_payload(),
        ))
        .await
        .unwrap();

    let mut start = client_envelope(
        &session_id,
        EventType::TransactionStart,
        Channel::System,
        2,
        json!({"tool_name": "echo"}),
    );
    start.transaction = Some("tmp-bin".to_owned());
    client.send_envelope(&start).await.unwrap();
    let reply = client
        .recv_until(RECV_TIMEOUT, |envelope| {
            envelope.event == EventType::TransactionStart
        })
        .await
        .unwrap();
    let transaction_id = reply.transaction.unwrap();

    // Header then raw frame.
    let mut chunk = client_envelope(
        &session_id,
        EventType::AudioChunk,
        Channel::AudioIn,
        1,
        json!({}),
    );
    chunk.transaction = Some(transaction_id.clone());
    chunk.bin_len = Some(4);
    chunk.bin_mime = Some("audio/pcm".to_owned());
    client.send_envelope(&chunk).await.unwrap();
    client.send_binary(&[9, 8, 7, 6]).await.unwrap();

    // Echo reflects the bytes on AUDIO_OUT: header first, then the frame.
    let header = loop {
        match tokio::time::timeout(RECV_TIMEOUT, client.recv_frame())
            .await
            .expect("frame within the test timeout")
            .unwrap()
        {
            RawFrame::Envelope(envelope) if envelope.event == EventType::AudioChunk => {
                break envelope;
            }
            _ => {}
        }
    };
    assert_eq!(header.channel, Channel::AudioOut);
    assert_eq!(header.bin_len, Some(4));
    assert_eq!(header.bin_mime.as_deref(), Some("audio/pcm"));
    match tokio::time::timeout(RECV_TIMEOUT, client.recv_frame())
        .await
        .expect("binary frame within the test timeout")
        .unwrap()
    {
        RawFrame::Binary(bytes) => assert_eq!(bytes, vec![9, 8, 7, 6]),
        other => panic!("expected the binary continuation, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Admin contract
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_and_stats_expose_the_frozen_shapes() {
    let server = TestServer::start(ServerConfig::default()).await;
    let http = reqwest::Client::new();

    let health: Value = http
        .get(server.health_url())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], json!("ok"));
    assert_eq!(health["activeConnections"], json!(0));
    assert_eq!(health["totalConnections"], json!(0));
    assert!(health["uptime"].is_u64());

    // One live session changes the counters.
    let mut client =
        ClientSession::connect(ClientConfig::new(server.ws_url()).with_token("T"))
            .await
            .unwrap();
    tokio::time::timeout(RECV_TIMEOUT, client.ping("for-stats"))
        .await
        .expect("pong")
        .unwrap();

    let health: Value = http
        .get(server.health_url())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["activeConnections"], json!(1));
    assert_eq!(health["totalConnections"], json!(1));

    let stats: Value = http
        .get(server.stats_url())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["activeConnections"], json!(1));
    assert_eq!(stats["registeredTools"], json!(["add", "echo"]));
    assert!(stats["totalMessages"].as_u64().unwrap() >= 1);
    let sessions = stats["sessions"].as_array().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["userId"], json!("user-1"));
    assert_eq!(sessions[0]["transport"], json!("websocket"));
}
