//! HAIP WebSocket client session.
//!
//! Connects to a server, performs the HAI handshake, and provides typed
//! helpers for the common operations (transactions, pings, flow updates,
//! replay requests).
//!
//! # Protocol
//! 1. Connect to `server_url` (ws:// or wss://, token in the query string)
//! 2. Receive the server `HAI` -- extract `session` id and capabilities
//! 3. Send the client `HAI` carrying the `auth` object
//! 4. Exchange envelopes; the session assigns `seq` per transaction
//! 5. Server `PING`s are answered transparently while receiving

use futures_util::{SinkExt, StreamExt};
use haip_protocol::{
    Capabilities, Channel, Envelope, ErrorPayload, EventType, HAIP_VERSION, HandshakePayload,
    PingPayload, PongPayload, ReplayRequestPayload, SUPPORTED_MAJORS,
    TransactionAcceptedPayload, codec, format_seq,
};
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Configuration for a client session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the server root, e.g. `ws://127.0.0.1:8080/`.
    pub server_url: String,
    /// Bearer token; sent in the query string and as the handshake `auth`
    /// object.
    pub token: Option<String>,
    /// Event names to advertise in `accept_events`; empty advertises the
    /// full vocabulary.
    pub accept_events: Vec<String>,
    /// Capabilities to advertise; `None` accepts the server's defaults.
    pub capabilities: Option<Capabilities>,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        ClientConfig {
            server_url: server_url.into(),
            token: None,
            accept_events: Vec::new(),
            capabilities: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connect: {0}")]
    Connect(String),
    #[error("WS: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("envelope: {0}")]
    Envelope(#[from] haip_protocol::ParseError),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("server error {code}: {message}")]
    Server { code: String, message: String },
    #[error("connection closed")]
    Disconnected,
}

// ---------------------------------------------------------------------------
// ClientSession
// ---------------------------------------------------------------------------

/// An authenticated HAIP session over WebSocket.
pub struct ClientSession {
    ws: WsStream,
    session_id: String,
    server_version: String,
    server_capabilities: Option<Capabilities>,
    next_session_seq: u64,
    transaction_seqs: HashMap<String, u64>,
    pending: VecDeque<Envelope>,
}

impl ClientSession {
    /// Connects and completes the handshake: the server speaks first, then
    /// the client's HAI authenticates.  Authentication failures surface on
    /// the next receive as a server `ERROR`.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let url = match &config.token {
            Some(token) => format!("{}?token={token}", config.server_url),
            None => config.server_url.clone(),
        };
        let (ws, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;

        let mut session = ClientSession {
            ws,
            session_id: String::new(),
            server_version: String::new(),
            server_capabilities: None,
            next_session_seq: 1,
            transaction_seqs: HashMap::new(),
            pending: VecDeque::new(),
        };

        let server_hello = session.recv_envelope().await?;
        if server_hello.event != EventType::Hai {
            return Err(ClientError::Protocol(format!(
                "expected server HAI, got {}",
                server_hello.event
            )));
        }
        let hello: HandshakePayload = server_hello
            .decode_payload()
            .map_err(|e| ClientError::Protocol(format!("malformed server HAI: {e}")))?;
        session.session_id = server_hello.session.clone();
        session.server_version = hello.haip_version;
        session.server_capabilities = hello.capabilities;

        let client_hello = HandshakePayload {
            haip_version: HAIP_VERSION.to_owned(),
            accept_major: SUPPORTED_MAJORS.to_vec(),
            accept_events: config.accept_events.clone(),
            capabilities: config.capabilities.clone(),
            last_rx_seq: None,
            auth: config.token.as_ref().map(|token| json!({"token": token})),
        };
        session
            .send_event(EventType::Hai, Channel::System, json!(client_hello))
            .await?;
        info!(session_id = %session.session_id, "client session established");
        Ok(session)
    }

    /// The session id assigned by the server (carried in its HAI).
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    pub fn server_capabilities(&self) -> Option<&Capabilities> {
        self.server_capabilities.as_ref()
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Builds, stamps, and sends a session-scoped envelope.  Returns the
    /// envelope as sent so callers can correlate replies by id.
    pub async fn send_event(
        &mut self,
        event: EventType,
        channel: Channel,
        payload: Value,
    ) -> Result<Envelope, ClientError> {
        let seq = self.next_session_seq;
        self.next_session_seq += 1;
        let mut envelope = Envelope::new(event, channel)
            .with_session(self.session_id.clone())
            .with_seq(seq);
        envelope.payload = payload;
        self.send_envelope(&envelope).await?;
        Ok(envelope)
    }

    /// Like [`send_event`](Self::send_event) but scoped to a transaction,
    /// with its own seq counter starting at `"1"`.
    pub async fn send_on_transaction(
        &mut self,
        transaction_id: &str,
        event: EventType,
        channel: Channel,
        payload: Value,
    ) -> Result<Envelope, ClientError> {
        let counter = self
            .transaction_seqs
            .entry(transaction_id.to_owned())
            .or_insert(1);
        let seq = *counter;
        *counter += 1;
        let mut envelope = Envelope::new(event, channel)
            .with_session(self.session_id.clone())
            .with_transaction(transaction_id)
            .with_seq(seq);
        envelope.payload = payload;
        self.send_envelope(&envelope).await?;
        Ok(envelope)
    }

    /// Sends a pre-built envelope verbatim.
    pub async fn send_envelope(&mut self, envelope: &Envelope) -> Result<(), ClientError> {
        let text = codec::encode_envelope(envelope);
        self.ws.send(Message::Text(text.into())).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Receiving
    // -----------------------------------------------------------------------

    /// Next envelope from the server.  Transport pings and server HAIP
    /// `PING`s are answered transparently and never surfaced.
    pub async fn recv_envelope(&mut self) -> Result<Envelope, ClientError> {
        if let Some(envelope) = self.pending.pop_front() {
            return Ok(envelope);
        }
        loop {
            match self.ws.next().await {
                None => return Err(ClientError::Disconnected),
                Some(Err(e)) => return Err(ClientError::Ws(e)),
                Some(Ok(Message::Text(text))) => {
                    let envelope = codec::parse_envelope(text.as_str())?;
                    if envelope.event == EventType::Ping {
                        self.answer_ping(&envelope).await?;
                        continue;
                    }
                    return Ok(envelope);
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = self.ws.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) => return Err(ClientError::Disconnected),
                Some(Ok(_)) => {}
            }
        }
    }

    /// Receives until `matches` accepts an envelope; everything skipped is
    /// buffered and handed out by later receives in arrival order.
    pub async fn recv_matching<F>(&mut self, mut matches: F) -> Result<Envelope, ClientError>
    where
        F: FnMut(&Envelope) -> bool,
    {
        let mut skipped = Vec::new();
        loop {
            let envelope = self.recv_envelope().await?;
            if matches(&envelope) {
                self.pending.extend(skipped);
                return Ok(envelope);
            }
            debug!(event = %envelope.event, "buffering non-matching envelope");
            skipped.push(envelope);
        }
    }

    // -----------------------------------------------------------------------
    // Typed operations
    // -----------------------------------------------------------------------

    /// Opens a transaction bound to `tool_name` and returns the server-side
    /// transaction id after the rebind.
    pub async fn start_transaction(&mut self, tool_name: &str) -> Result<String, ClientError> {
        let temporary_id = format!("tmp-{}", uuid::Uuid::new_v4());
        let seq = self.next_session_seq;
        self.next_session_seq += 1;
        let mut request = Envelope::new(EventType::TransactionStart, Channel::System)
            .with_session(self.session_id.clone())
            .with_transaction(temporary_id.clone())
            .with_seq(seq);
        request.payload = json!({"tool_name": tool_name});
        let request_id = request.id.clone();
        self.send_envelope(&request).await?;

        let reply = self
            .recv_matching(|envelope| match envelope.event {
                EventType::TransactionStart => envelope
                    .decode_payload::<TransactionAcceptedPayload>()
                    .is_ok_and(|accepted| accepted.reference_id == temporary_id),
                EventType::Error => envelope
                    .decode_payload::<ErrorPayload>()
                    .is_ok_and(|error| error.related_id.as_deref() == Some(&request_id)),
                _ => false,
            })
            .await?;
        if reply.event == EventType::Error {
            let error: ErrorPayload = reply
                .decode_payload()
                .map_err(|e| ClientError::Protocol(e.to_string()))?;
            return Err(ClientError::Server {
                code: error.code,
                message: error.message,
            });
        }
        reply
            .transaction
            .ok_or_else(|| ClientError::Protocol("transaction reply without id".to_owned()))
    }

    /// Round-trips a PING and waits for the matching PONG.
    pub async fn ping(&mut self, nonce: &str) -> Result<(), ClientError> {
        self.send_event(
            EventType::Ping,
            Channel::System,
            json!(PingPayload {
                nonce: nonce.to_owned()
            }),
        )
        .await?;
        let nonce = nonce.to_owned();
        self.recv_matching(|envelope| {
            envelope.event == EventType::Pong
                && envelope
                    .decode_payload::<PongPayload>()
                    .is_ok_and(|pong| pong.nonce == nonce)
        })
        .await?;
        Ok(())
    }

    /// Grants credit on a channel.
    pub async fn flow_update(
        &mut self,
        channel: Channel,
        add_messages: Option<u64>,
        add_bytes: Option<u64>,
    ) -> Result<(), ClientError> {
        let mut payload = serde_json::Map::new();
        payload.insert("channel".to_owned(), json!(channel));
        if let Some(messages) = add_messages {
            payload.insert("add_messages".to_owned(), json!(messages));
        }
        if let Some(bytes) = add_bytes {
            payload.insert("add_bytes".to_owned(), json!(bytes));
        }
        self.send_event(EventType::FlowUpdate, Channel::System, Value::Object(payload))
            .await?;
        Ok(())
    }

    /// Asks the server to redeliver a seq range from a transaction's replay
    /// window.
    pub async fn replay_request(
        &mut self,
        transaction_id: &str,
        from_seq: u64,
        to_seq: Option<u64>,
    ) -> Result<(), ClientError> {
        self.send_on_transaction(
            transaction_id,
            EventType::ReplayRequest,
            Channel::System,
            json!(ReplayRequestPayload {
                from_seq: format_seq(from_seq),
                to_seq: to_seq.map(format_seq),
            }),
        )
        .await?;
        Ok(())
    }

    pub async fn close(&mut self) -> Result<(), ClientError> {
        self.ws.send(Message::Close(None)).await?;
        Ok(())
    }

    async fn answer_ping(&mut self, ping: &Envelope) -> Result<(), ClientError> {
        let Ok(payload) = ping.decode_payload::<PingPayload>() else {
            return Ok(());
        };
        let seq = self.next_session_seq;
        self.next_session_seq += 1;
        let mut pong = Envelope::new(EventType::Pong, Channel::System)
            .with_session(self.session_id.clone())
            .with_seq(seq);
        pong.payload = json!(PongPayload {
            nonce: payload.nonce
        });
        self.send_envelope(&pong).await
    }
}
