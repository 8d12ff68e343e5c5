//! Heartbeats, liveness, and credit-based flow control, end to end.
//!
//! - PING/PONG round-trip (client-initiated).
//! - Server heartbeats close a peer that never answers.
//! - A peer that answers heartbeats stays connected.
//! - Credit exhaustion reports INSUFFICIENT_CREDITS; FLOW_UPDATE recovers.
//! - Paused channels queue outbound envelopes and resume in order.

use haip_client::{ClientConfig, ClientSession};
use haip_protocol::*;
use haip_server::ServerConfig;
use haip_test_utils::{RawWsClient, TestServer};
use serde_json::{Value, json};
use std::time::Duration;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

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

/// Raw-client handshake: consume the server HAI, authenticate, return the
/// session id.
async fn raw_handshake(client: &mut RawWsClient) -> String {
    let hello = client.recv_envelope_timeout(RECV_TIMEOUT).await.unwrap();
    assert_eq!(hello.event, EventType::Hai);
    let session_id = hello.session;
    client
        .send_envelope(&client_envelope(
            &session_id,
            EventType::Hai,
            Channel::System,
            1,
            json!({
                "haip_version": "1.1.2",
                "accept_major": [1],
                "accept_events": [],
                "auth": {"token": "T"}
            }),
        ))
        .await
        .unwrap();
    session_id
}

#[tokio::test]
async fn ping_pong_round_trips_with_latency_under_the_test_timeout() {
    let server = TestServer::start(ServerConfig::default()).await;
    let mut client =
        ClientSession::connect(ClientConfig::new(server.ws_url()).with_token("T"))
            .await
            .unwrap();
    tokio::time::timeout(RECV_TIMEOUT, client.ping("abc"))
        .await
        .expect("pong within the test timeout")
        .unwrap();
}

#[tokio::test]
async fn unanswered_server_heartbeats_close_the_session() {
    let mut config = ServerConfig::default();
    config.heartbeat_interval = Duration::from_millis(150);
    config.heartbeat_timeout = Duration::from_millis(100);
    let server = TestServer::start(config).await;

    let mut client = RawWsClient::connect(&server.ws_url()).await.unwrap();
    raw_handshake(&mut client).await;

    // Never answer the PING; the liveness timer must fire.
    let outcome = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if client.recv_envelope().await.is_err() {
                break;
            }
        }
    })
    .await;
    assert!(
        outcome.is_ok(),
        "session should close within interval + timeout"
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.state.active_connections().await, 0);
}

#[tokio::test]
async fn a_peer_that_answers_heartbeats_stays_connected() {
    let mut config = ServerConfig::default();
    config.heartbeat_interval = Duration::from_millis(150);
    config.heartbeat_timeout = Duration::from_millis(100);
    let server = TestServer::start(config).await;

    let mut client =
        ClientSession::connect(ClientConfig::new(server.ws_url()).with_token("T"))
            .await
            .unwrap();

    // The client answers heartbeats transparently while receiving; nothing
    // else arrives, so this times out quietly after several intervals.
    let _ = tokio::time::timeout(Duration::from_millis(700), client.recv_envelope()).await;

    tokio::time::timeout(RECV_TIMEOUT, client.ping("still-alive"))
        .await
        .expect("session survived several heartbeat cycles")
        .unwrap();
}

#[tokio::test]
async fn credit_exhaustion_denies_and_flow_update_recovers() {
    let mut config = ServerConfig::default();
    config.initial_credit_messages = 2;
    let server = TestServer::start(config).await;

    let mut client = RawWsClient::connect(&server.ws_url()).await.unwrap();
    let session_id = raw_handshake(&mut client).await;

    // Two envelopes fit the initial USER credit; INFO draws no reply so the
    // ledger stays legible.
    for seq in 2..=3u64 {
        client
            .send_envelope(&client_envelope(
                &session_id,
                EventType::Info,
                Channel::User,
                seq,
                json!({"message": "m"}),
            ))
            .await
            .unwrap();
    }

    // The third is denied.
    client
        .send_envelope(&client_envelope(
            &session_id,
            EventType::Info,
            Channel::User,
            4,
            json!({"message": "m"}),
        ))
        .await
        .unwrap();
    let error = client
        .recv_until(RECV_TIMEOUT, |envelope| envelope.event == EventType::Error)
        .await
        .unwrap();
    assert_eq!(
        error.decode_payload::<ErrorPayload>().unwrap().code,
        error_codes::INSUFFICIENT_CREDITS
    );

    // Grant five more and spend them; the closing PING must come back with
    // no interleaved error.
    client
        .send_envelope(&client_envelope(
            &session_id,
            EventType::FlowUpdate,
            Channel::System,
            5,
            json!({"channel": "USER", "add_messages": 5}),
        ))
        .await
        .unwrap();
    for seq in 6..=10u64 {
        client
            .send_envelope(&client_envelope(
                &session_id,
                EventType::Info,
                Channel::User,
                seq,
                json!({"message": "m"}),
            ))
            .await
            .unwrap();
    }
    client
        .send_envelope(&client_envelope(
            &session_id,
            EventType::Ping,
            Channel::System,
            11,
            json!({"nonce": "after-grant"}),
        ))
        .await
        .unwrap();
    let next = client
        .recv_until(RECV_TIMEOUT, |envelope| {
            envelope.event == EventType::Pong || envelope.event == EventType::Error
        })
        .await
        .unwrap();
    assert_eq!(
        next.event,
        EventType::Pong,
        "five more envelopes fit the fresh grant without errors"
    );
}

#[tokio::test]
async fn paused_channel_queues_outbound_and_resume_preserves_order() {
    let server = TestServer::start(ServerConfig::default()).await;
    let mut client =
        ClientSession::connect(ClientConfig::new(server.ws_url()).with_token("T"))
            .await
            .unwrap();
    let transaction_id = client.start_transaction("echo").await.unwrap();

    client
        .send_event(
            EventType::PauseChannel,
            Channel::System,
            json!({"channel": "USER"}),
        )
        .await
        .unwrap();

    // The echo tool mirrors on USER, which is paused: replies must queue.
    for n in 1..=3u64 {
        client
            .send_on_transaction(
                &transaction_id,
                EventType::MessagePart,
                Channel::User,
                json!({"n": n}),
            )
            .await
            .unwrap();
    }
    let early = tokio::time::timeout(
        Duration::from_millis(250),
        client.recv_matching(|envelope| envelope.event == EventType::MessagePart),
    )
    .await;
    assert!(early.is_err(), "nothing may leave a paused channel");

    client
        .send_event(
            EventType::ResumeChannel,
            Channel::System,
            json!({"channel": "USER"}),
        )
        .await
        .unwrap();

    for expected in 1..=3u64 {
        let part = tokio::time::timeout(
            RECV_TIMEOUT,
            client.recv_matching(|envelope| envelope.event == EventType::MessagePart),
        )
        .await
        .expect("queued envelope after resume")
        .unwrap();
        assert_eq!(
            part.payload["n"],
            json!(expected),
            "drained envelopes keep their enqueue order"
        );
    }
}
