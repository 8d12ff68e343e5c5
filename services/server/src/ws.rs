// WebSocket adapter: full duplex, one envelope per text frame.  A binary
// frame is associated with the preceding envelope that announced it via
// `bin_len`.  Transport-level ping/pong is answered reflexively and is
// independent of HAIP PING/PONG, which stays authoritative for liveness.

use crate::auth::extract_bearer;
use crate::session::run_session;
use crate::state::AppState;
use crate::transport::{Frame, SessionTransport, TransportError};
use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::HeaderMap,
    response::IntoResponse,
};
use bytes::Bytes;
use haip_protocol::{Envelope, codec};
use std::collections::HashMap;

pub fn extract_token(params: &HashMap<String, String>, headers: &HeaderMap) -> Option<String> {
    params.get("token").cloned().or_else(|| {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(extract_bearer)
            .map(ToOwned::to_owned)
    })
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    // The query/header token is supplementary; authentication happens in the
    // HAI handshake via the injected authenticator.
    let _token = extract_token(&params, &headers);
    ws.on_upgrade(move |socket| async move {
        let session_id = uuid::Uuid::new_v4().to_string();
        run_session(WsTransport::new(socket), state, session_id).await;
    })
}

pub struct WsTransport {
    socket: WebSocket,
}

impl WsTransport {
    pub fn new(socket: WebSocket) -> Self {
        WsTransport { socket }
    }
}

impl SessionTransport for WsTransport {
    fn kind(&self) -> &'static str {
        "websocket"
    }

    fn binary_capable(&self) -> bool {
        true
    }

    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            match self.socket.recv().await {
                None => return None,
                Some(Err(e)) => return Some(Err(TransportError::Io(e.to_string()))),
                Some(Ok(Message::Text(text))) => {
                    let wire_len = text.len();
                    return Some(Ok(match codec::parse_envelope(text.as_str()) {
                        Ok(envelope) => Frame::Envelope {
                            envelope: Box::new(envelope),
                            wire_len,
                        },
                        Err(error) => Frame::Malformed(error),
                    }));
                }
                Some(Ok(Message::Binary(bytes))) => return Some(Ok(Frame::Binary(bytes))),
                Some(Ok(Message::Ping(data))) => {
                    let _ = self.socket.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) => return None,
            }
        }
    }

    async fn send(
        &mut self,
        envelope: &Envelope,
        binary: Option<&Bytes>,
    ) -> Result<(), TransportError> {
        let text = codec::encode_envelope(envelope);
        self.socket
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        if let Some(bytes) = binary {
            self.socket
                .send(Message::Binary(bytes.clone()))
                .await
                .map_err(|e| TransportError::Io(e.to_string()))?;
        }
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.socket.send(Message::Close(None)).await;
    }
}
