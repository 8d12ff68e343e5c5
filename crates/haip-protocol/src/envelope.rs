use crate::event::{Channel, EventType};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

/// The unit of transfer.
///
/// One envelope per text frame (WebSocket) or NDJSON line (SSE ingress and
/// HTTP stream).  `seq` is a decimal string that strictly increases within a
/// transaction, starting at `"1"`; `ts` is producer wall-clock milliseconds,
/// also as a decimal string.  Binary continuation frames are announced by
/// `bin_len`/`bin_mime` on binary-capable transports; text transports carry
/// binary base64-encoded in `payload.data` instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub session: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
    pub seq: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<String>,
    pub ts: String,
    pub channel: Channel,
    #[serde(rename = "type")]
    pub event: EventType,
    #[serde(default = "empty_object")]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pv: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crit: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin_len: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin_mime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

impl Envelope {
    /// Fresh envelope with a minted id and current timestamp.  `session` and
    /// `seq` are filled in by whoever owns the session before serialisation.
    pub fn new(event: EventType, channel: Channel) -> Self {
        Envelope {
            id: mint_id(),
            session: String::new(),
            transaction: None,
            seq: String::new(),
            ack: None,
            ts: now_ms().to_string(),
            channel,
            event,
            payload: empty_object(),
            pv: None,
            crit: None,
            bin_len: None,
            bin_mime: None,
            run_id: None,
            thread_id: None,
        }
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = session.into();
        self
    }

    pub fn with_transaction(mut self, transaction: impl Into<String>) -> Self {
        self.transaction = Some(transaction.into());
        self
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = format_seq(seq);
        self
    }

    /// Serialises `payload` into the envelope.  Panics only if the payload
    /// type itself cannot serialise, which is a programming error.
    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Self {
        self.payload = serde_json::to_value(payload).expect("payload serialisation");
        self
    }

    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Numeric sequence number, if well-formed.
    pub fn seq_number(&self) -> Option<u64> {
        parse_seq(&self.seq)
    }
}

/// Opaque unique envelope id.
pub fn mint_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Producer wall-clock in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Parses a `seq` decimal string.  Sequence numbers start at 1; `"0"`,
/// empty, signs, and non-digits are all invalid.
pub fn parse_seq(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match s.parse::<u64>() {
        Ok(0) => None,
        Ok(n) => Some(n),
        Err(_) => None,
    }
}

pub fn format_seq(seq: u64) -> String {
    seq.to_string()
}
