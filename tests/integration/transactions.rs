//! Transaction lifecycle and tool routing, end to end.
//!
//! - TRANSACTION_START binds a tool and rebinds the peer's temporary id.
//! - Message events route to the bound tool; replies carry the server id.
//! - Unknown tools and ended transactions are rejected without closing.
//! - TOOL_CANCEL produces the terminal TOOL_DONE{CANCELLED}.

use haip_client::{ClientConfig, ClientError, ClientSession};
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

async fn recv_event(client: &mut ClientSession, event: EventType) -> Envelope {
    tokio::time::timeout(
        RECV_TIMEOUT,
        client.recv_matching(|envelope| envelope.event == event),
    )
    .await
    .expect("envelope within the test timeout")
    .unwrap()
}

#[tokio::test]
async fn transaction_binding_routes_messages_to_the_bound_tool() {
    let server = TestServer::start(ServerConfig::default()).await;
    let mut client = connect(&server).await;

    let transaction_id = client.start_transaction("echo").await.unwrap();
    assert!(!transaction_id.is_empty());
    assert!(!transaction_id.starts_with("tmp-"));

    client
        .send_on_transaction(
            &transaction_id,
            EventType::MessageStart,
            Channel::User,
            json!({"text": "hel"}),
        )
        .await
        .unwrap();
    client
        .send_on_transaction(
            &transaction_id,
            EventType::MessagePart,
            Channel::User,
            json!({"text": "lo"}),
        )
        .await
        .unwrap();
    client
        .send_on_transaction(
            &transaction_id,
            EventType::MessageEnd,
            Channel::User,
            json!({}),
        )
        .await
        .unwrap();

    let start = recv_event(&mut client, EventType::MessageStart).await;
    assert_eq!(start.transaction.as_deref(), Some(transaction_id.as_str()));
    assert_eq!(start.payload, json!({"text": "hel"}));
    let part = recv_event(&mut client, EventType::MessagePart).await;
    assert_eq!(part.payload, json!({"text": "lo"}));
    let end = recv_event(&mut client, EventType::MessageEnd).await;
    assert_eq!(end.transaction.as_deref(), Some(transaction_id.as_str()));
}

#[tokio::test]
async fn unknown_tool_is_rejected_and_the_session_stays_open() {
    let server = TestServer::start(ServerConfig::default()).await;
    let mut client = connect(&server).await;

    match client.start_transaction("nope").await {
        Err(ClientError::Server { code, .. }) => {
            assert_eq!(code, error_codes::TOOL_NOT_FOUND);
        }
        other => panic!("expected TOOL_NOT_FOUND, got {other:?}"),
    }

    tokio::time::timeout(RECV_TIMEOUT, client.ping("still-open"))
        .await
        .expect("session survives a lifecycle error")
        .unwrap();
}

#[tokio::test]
async fn transaction_start_without_tool_name_is_missing_tool_name() {
    let server = TestServer::start(ServerConfig::default()).await;
    let mut client = connect(&server).await;

    client
        .send_event(EventType::TransactionStart, Channel::System, json!({}))
        .await
        .unwrap();
    let error = recv_event(&mut client, EventType::Error).await;
    assert_eq!(
        error.decode_payload::<ErrorPayload>().unwrap().code,
        error_codes::MISSING_TOOL_NAME
    );
}

#[tokio::test]
async fn ended_transactions_reject_further_envelopes() {
    let server = TestServer::start(ServerConfig::default()).await;
    let mut client = connect(&server).await;
    let transaction_id = client.start_transaction("echo").await.unwrap();

    client
        .send_on_transaction(
            &transaction_id,
            EventType::TransactionEnd,
            Channel::System,
            json!({}),
        )
        .await
        .unwrap();
    client
        .send_on_transaction(
            &transaction_id,
            EventType::MessagePart,
            Channel::User,
            json!({"text": "late"}),
        )
        .await
        .unwrap();

    let error = recv_event(&mut client, EventType::Error).await;
    assert_eq!(
        error.decode_payload::<ErrorPayload>().unwrap().code,
        error_codes::TRANSACTION_NOT_FOUND
    );
}

#[tokio::test]
async fn add_tool_reports_the_sum_in_tool_done() {
    let server = TestServer::start(ServerConfig::default()).await;
    let mut client = connect(&server).await;
    let transaction_id = client.start_transaction("add").await.unwrap();

    client
        .send_on_transaction(
            &transaction_id,
            EventType::MessageEnd,
            Channel::User,
            json!({"a": 19, "b": 23}),
        )
        .await
        .unwrap();
    let done = recv_event(&mut client, EventType::ToolDone).await;
    let payload: ToolDonePayload = done.decode_payload().unwrap();
    assert_eq!(payload.status, "OK");
    assert_eq!(payload.result.unwrap()["sum"], json!(42.0));
}

#[tokio::test]
async fn tool_cancel_yields_terminal_cancelled_tool_done() {
    let server = TestServer::start(ServerConfig::default()).await;
    let mut client = connect(&server).await;
    let transaction_id = client.start_transaction("echo").await.unwrap();

    client
        .send_on_transaction(
            &transaction_id,
            EventType::ToolCancel,
            Channel::System,
            json!({}),
        )
        .await
        .unwrap();
    let done = recv_event(&mut client, EventType::ToolDone).await;
    let payload: ToolDonePayload = done.decode_payload().unwrap();
    assert_eq!(payload.status, "CANCELLED");
    assert_eq!(done.transaction.as_deref(), Some(transaction_id.as_str()));
}

#[tokio::test]
async fn concurrent_transactions_keep_their_tool_bindings_apart() {
    let server = TestServer::start(ServerConfig::default()).await;
    let mut client = connect(&server).await;

    let echo_txn = client.start_transaction("echo").await.unwrap();
    let add_txn = client.start_transaction("add").await.unwrap();
    assert_ne!(echo_txn, add_txn);

    client
        .send_on_transaction(
            &add_txn,
            EventType::MessageEnd,
            Channel::User,
            json!({"a": 1, "b": 2}),
        )
        .await
        .unwrap();
    client
        .send_on_transaction(
            &echo_txn,
            EventType::MessagePart,
            Channel::User,
            json!({"text": "ping"}),
        )
        .await
        .unwrap();

    let done = recv_event(&mut client, EventType::ToolDone).await;
    assert_eq!(done.transaction.as_deref(), Some(add_txn.as_str()));
    let part = recv_event(&mut client, EventType::MessagePart).await;
    assert_eq!(part.transaction.as_deref(), Some(echo_txn.as_str()));
    assert_eq!(part.payload, json!({"text": "ping"}));
}
