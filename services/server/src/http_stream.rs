// HTTP streaming adapter: one long-lived POST carrying newline-delimited
// JSON envelopes in both directions.  The server HAI is the first response
// line.  Binary is base64 inside payloads, as on SSE.

use crate::auth::extract_bearer;
use crate::session::run_session;
use crate::state::AppState;
use crate::transport::{Frame, SessionTransport, TransportError};
use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt, stream::BoxStream};
use haip_protocol::{Envelope, codec};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;

const LINE_LIMIT: usize = 1 << 20;
const OUTBOUND_BUFFER: usize = 64;

pub async fn stream_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let _token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer)
        .map(ToOwned::to_owned);

    let reader = StreamReader::new(
        body.into_data_stream()
            .map_err(std::io::Error::other),
    );
    let lines = FramedRead::new(reader, LinesCodec::new_with_max_length(LINE_LIMIT)).boxed();
    let (out_tx, out_rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);

    let session_id = uuid::Uuid::new_v4().to_string();
    tokio::spawn(run_session(
        HttpStreamTransport {
            lines,
            out: out_tx,
        },
        state,
        session_id,
    ));

    let body = Body::from_stream(
        ReceiverStream::new(out_rx).map(|line| Ok::<_, std::convert::Infallible>(Bytes::from(line))),
    );
    ([(header::CONTENT_TYPE, "application/x-ndjson")], body).into_response()
}

pub struct HttpStreamTransport {
    lines: BoxStream<'static, Result<String, LinesCodecError>>,
    out: mpsc::Sender<String>,
}

impl SessionTransport for HttpStreamTransport {
    fn kind(&self) -> &'static str {
        "http-stream"
    }

    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            match self.lines.next().await? {
                Ok(line) if line.trim().is_empty() => {}
                Ok(line) => {
                    let wire_len = line.len();
                    return Some(Ok(match codec::parse_envelope(&line) {
                        Ok(envelope) => Frame::Envelope {
                            envelope: Box::new(envelope),
                            wire_len,
                        },
                        Err(error) => Frame::Malformed(error),
                    }));
                }
                Err(e) => return Some(Err(TransportError::Io(e.to_string()))),
            }
        }
    }

    async fn send(
        &mut self,
        envelope: &Envelope,
        binary: Option<&Bytes>,
    ) -> Result<(), TransportError> {
        let mut text = match binary {
            Some(bytes) => codec::encode_envelope(&codec::fold_binary_into_payload(
                envelope.clone(),
                bytes,
            )),
            None => codec::encode_envelope(envelope),
        };
        text.push('\n');
        self.out
            .send(text)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) {
        // Dropping the sender ends the response body stream.
    }
}
