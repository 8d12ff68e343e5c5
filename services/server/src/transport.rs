use bytes::Bytes;
use haip_protocol::{Envelope, ParseError};
use tokio::sync::mpsc;

/// One inbound unit from a transport adapter.
///
/// Adapters parse each text unit themselves so the session sees the parse
/// outcome: a malformed unit still counts as a frame (it draws an `ERROR`
/// reply), it just never becomes an envelope.
pub enum Frame {
    Envelope {
        envelope: Box<Envelope>,
        /// Length of the text unit on the wire, for byte-credit accounting.
        wire_len: usize,
    },
    /// Raw continuation frame following a `bin_len` header (WebSocket only).
    Binary(Bytes),
    Malformed(ParseError),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("peer is gone")]
    Closed,
    #[error("transport I/O: {0}")]
    Io(String),
}

/// The uniform face the session state machine sees over WebSocket, SSE, and
/// HTTP streaming.  Adapters own framing: one envelope per text unit, binary
/// continuations associated with the preceding header, base64 fallback on
/// text-only transports.
#[allow(async_fn_in_trait)]
pub trait SessionTransport: Send {
    fn kind(&self) -> &'static str;

    /// Whether this transport frames binary natively.  Text-only transports
    /// carry binary base64-encoded inside payloads instead.
    fn binary_capable(&self) -> bool {
        false
    }

    /// Next inbound frame; `None` when the peer closed the connection.
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>>;

    /// Writes one envelope, plus its binary continuation when the transport
    /// can frame it natively.  Text-only transports fold `binary` into the
    /// payload as base64.
    async fn send(&mut self, envelope: &Envelope, binary: Option<&Bytes>)
    -> Result<(), TransportError>;

    async fn close(&mut self);
}

/// One envelope queued for emission, together with any binary continuation.
///
/// `preserve_seq` marks envelopes that must go out verbatim (replay
/// redelivery, credit-drained entries that were already finalised); for
/// everything else the session stamps `session` and `seq` just before the
/// flow-control gate.
#[derive(Debug)]
pub struct OutboundItem {
    pub envelope: Envelope,
    pub binary: Option<Bytes>,
    pub preserve_seq: bool,
}

impl OutboundItem {
    pub fn new(envelope: Envelope) -> Self {
        OutboundItem {
            envelope,
            binary: None,
            preserve_seq: false,
        }
    }

    pub fn verbatim(envelope: Envelope) -> Self {
        OutboundItem {
            envelope,
            binary: None,
            preserve_seq: true,
        }
    }
}

pub type OutboundSender = mpsc::UnboundedSender<OutboundItem>;
pub type OutboundReceiver = mpsc::UnboundedReceiver<OutboundItem>;
