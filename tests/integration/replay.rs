//! Replay window behavior, end to end.
//!
//! - REPLAY_REQUEST re-emits exactly the stored envelopes, verbatim and in
//!   seq order (matched here by the original envelope ids).
//! - Requests reaching below the eviction horizon yield REPLAY_TOO_OLD.
//! - Redelivered duplicates are absorbed silently on re-send.

use haip_client::{ClientConfig, ClientSession};
use haip_protocol::*;
use haip_server::ServerConfig;
use haip_test_utils::TestServer;
use serde_json::json;
use std::time::Duration;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

async fn connect(server: &TestServer) -> ClientSession {
    ClientSession::connect(ClientConfig::new(server.ws_url()).with_token("T"))
        .await
        .expect("client handshake")
}

/// Sends `count` MESSAGE_PARTs on the transaction and drains the echo
/// replies.  Returns the envelopes as sent (ids included).
async fn send_parts(
    client: &mut ClientSession,
    transaction_id: &str,
    count: u64,
) -> Vec<Envelope> {
    let mut sent = Vec::new();
    for n in 1..=count {
        let envelope = client
            .send_on_transaction(
                transaction_id,
                EventType::MessagePart,
                Channel::User,
                json!({"n": n}),
            )
            .await
            .unwrap();
        sent.push(envelope);
    }
    for _ in 0..count {
        tokio::time::timeout(
            RECV_TIMEOUT,
            client.recv_matching(|envelope| envelope.event == EventType::MessagePart),
        )
        .await
        .expect("echo reply")
        .unwrap();
    }
    sent
}

#[tokio::test]
async fn replay_redelivers_the_requested_range_verbatim_and_in_order() {
    let server = TestServer::start(ServerConfig::default()).await;
    let mut client = connect(&server).await;
    let transaction_id = client.start_transaction("echo").await.unwrap();

    let sent = send_parts(&mut client, &transaction_id, 5).await;

    client
        .replay_request(&transaction_id, 3, Some(5))
        .await
        .unwrap();
    for expected in &sent[2..5] {
        let replayed = tokio::time::timeout(
            RECV_TIMEOUT,
            client.recv_matching(|envelope| envelope.event == EventType::MessagePart),
        )
        .await
        .expect("replayed envelope")
        .unwrap();
        assert_eq!(replayed.id, expected.id, "redelivery is verbatim");
        assert_eq!(replayed.seq, expected.seq);
        assert_eq!(replayed.payload, expected.payload);
    }
}

#[tokio::test]
async fn open_ended_replay_runs_to_the_newest_entry() {
    let server = TestServer::start(ServerConfig::default()).await;
    let mut client = connect(&server).await;
    let transaction_id = client.start_transaction("echo").await.unwrap();

    let sent = send_parts(&mut client, &transaction_id, 4).await;

    client.replay_request(&transaction_id, 2, None).await.unwrap();
    let mut replayed_ids = Vec::new();
    for _ in 0..3 {
        let replayed = tokio::time::timeout(
            RECV_TIMEOUT,
            client.recv_matching(|envelope| envelope.event == EventType::MessagePart),
        )
        .await
        .expect("replayed envelope")
        .unwrap();
        replayed_ids.push(replayed.id);
    }
    let expected_ids: Vec<String> = sent[1..4].iter().map(|e| e.id.clone()).collect();
    assert_eq!(replayed_ids, expected_ids);
}

#[tokio::test]
async fn replay_below_the_window_reports_replay_too_old() {
    let mut config = ServerConfig::default();
    config.replay_window_size = 3;
    let server = TestServer::start(config).await;
    let mut client = connect(&server).await;
    let transaction_id = client.start_transaction("echo").await.unwrap();

    send_parts(&mut client, &transaction_id, 5).await;

    client.replay_request(&transaction_id, 1, None).await.unwrap();
    let error = tokio::time::timeout(
        RECV_TIMEOUT,
        client.recv_matching(|envelope| envelope.event == EventType::Error),
    )
    .await
    .expect("error within the test timeout")
    .unwrap();
    assert_eq!(
        error.decode_payload::<ErrorPayload>().unwrap().code,
        error_codes::REPLAY_TOO_OLD
    );
}

#[tokio::test]
async fn re_sending_a_replayed_envelope_is_idempotent() {
    let server = TestServer::start(ServerConfig::default()).await;
    let mut client = connect(&server).await;
    let transaction_id = client.start_transaction("echo").await.unwrap();

    let sent = send_parts(&mut client, &transaction_id, 3).await;

    // Pretend a gap was suspected and re-send seq 2 wholesale: the server
    // already delivered it, so no echo and no error comes back.
    client.send_envelope(&sent[1]).await.unwrap();
    client
        .send_on_transaction(
            &transaction_id,
            EventType::MessagePart,
            Channel::User,
            json!({"n": 4}),
        )
        .await
        .unwrap();

    let next = tokio::time::timeout(
        RECV_TIMEOUT,
        client.recv_matching(|envelope| {
            envelope.event == EventType::MessagePart || envelope.event == EventType::Error
        }),
    )
    .await
    .expect("envelope within the test timeout")
    .unwrap();
    assert_eq!(next.event, EventType::MessagePart);
    assert_eq!(next.payload, json!({"n": 4}), "the duplicate was dropped silently");
}
