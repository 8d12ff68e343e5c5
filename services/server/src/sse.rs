// SSE adapter: server-push event stream plus a paired NDJSON POST ingress.
//
// `GET /haip/sse` opens the downstream; every server envelope is one
// `data: <json>` event.  The session id travels in the server HAI (the
// first event on the stream), and the peer posts its envelopes to
// `POST /haip/sse/{session_id}` as newline-delimited JSON.  Binary is
// base64 inside payloads; this transport has no binary framing.

use crate::http::response::json_error;
use crate::session::run_session;
use crate::state::AppState;
use crate::transport::{Frame, SessionTransport, TransportError};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
};
use bytes::Bytes;
use futures_util::stream::Stream;
use haip_protocol::{Envelope, codec};
use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::{StreamExt, wrappers::ReceiverStream};

const INGRESS_BUFFER: usize = 64;

pub async fn sse_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let _token = params.get("token").cloned();
    let session_id = uuid::Uuid::new_v4().to_string();
    let (ingress_tx, ingress_rx) = mpsc::channel::<String>(INGRESS_BUFFER);
    let (event_tx, event_rx) = mpsc::channel::<Event>(INGRESS_BUFFER);
    state.register_sse_ingress(&session_id, ingress_tx).await;

    let transport = SseTransport {
        ingress: ingress_rx,
        events: event_tx,
    };
    tokio::spawn({
        let state = state.clone();
        let session_id = session_id.clone();
        async move {
            run_session(transport, state.clone(), session_id.clone()).await;
            state.unregister_sse_ingress(&session_id).await;
        }
    });

    let stream = ReceiverStream::new(event_rx).map(Ok::<Event, Infallible>);
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}

/// NDJSON ingress for an SSE session.  Each non-empty line is one envelope.
pub async fn sse_ingress(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    body: String,
) -> impl IntoResponse {
    let Some(ingress) = state.sse_ingress(&session_id).await else {
        return json_error(
            StatusCode::NOT_FOUND,
            "SESSION_NOT_FOUND",
            "no live SSE session with that id",
        );
    };
    for line in body.lines().filter(|line| !line.trim().is_empty()) {
        if ingress.send(line.to_owned()).await.is_err() {
            return json_error(
                StatusCode::GONE,
                "SESSION_CLOSED",
                "the session closed while the batch was in flight",
            );
        }
    }
    StatusCode::ACCEPTED.into_response()
}

pub struct SseTransport {
    ingress: mpsc::Receiver<String>,
    events: mpsc::Sender<Event>,
}

impl SessionTransport for SseTransport {
    fn kind(&self) -> &'static str {
        "sse"
    }

    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        let line = self.ingress.recv().await?;
        let wire_len = line.len();
        Some(Ok(match codec::parse_envelope(&line) {
            Ok(envelope) => Frame::Envelope {
                envelope: Box::new(envelope),
                wire_len,
            },
            Err(error) => Frame::Malformed(error),
        }))
    }

    async fn send(
        &mut self,
        envelope: &Envelope,
        binary: Option<&Bytes>,
    ) -> Result<(), TransportError> {
        let text = match binary {
            Some(bytes) => codec::encode_envelope(&codec::fold_binary_into_payload(
                envelope.clone(),
                bytes,
            )),
            None => codec::encode_envelope(envelope),
        };
        self.events
            .send(Event::default().data(text))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) {
        // Dropping the event sender ends the downstream; the ingress entry
        // is removed by the spawner.
        self.ingress.close();
    }
}
