// Envelope codec: exactly one envelope per text unit.
//
// Parsing is staged over a raw JSON value so failures map onto distinct
// protocol error codes instead of one opaque serde error: malformed JSON and
// missing fields are INVALID_MESSAGE, an unknown `type` is UNSUPPORTED_TYPE,
// a channel outside the closed set is PROTOCOL_VIOLATION, and a bad `seq` is
// SEQ_VIOLATION.

use crate::envelope::{Envelope, parse_seq};
use crate::error_codes;
use crate::event::{Channel, EventType};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Value;

/// Top-level envelope fields.  With `crit=true`, anything outside this set
/// rejects the envelope.
const KNOWN_FIELDS: &[&str] = &[
    "id", "session", "transaction", "seq", "ack", "ts", "channel", "type", "payload", "pv", "crit",
    "bin_len", "bin_mime", "run_id", "thread_id",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("envelope is not a JSON object")]
    NotAnObject,
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("unknown event type `{0}`")]
    UnknownType(String),
    #[error("unknown channel `{0}`")]
    UnknownChannel(String),
    #[error("payload is not a JSON object")]
    PayloadNotObject,
    #[error("invalid seq `{0}`")]
    SeqInvalid(String),
    #[error("crit envelope carries unknown field `{0}`")]
    CritUnknownField(String),
}

impl ParseError {
    /// The protocol error code this failure is reported as.
    pub fn code(&self) -> &'static str {
        match self {
            ParseError::InvalidJson(_)
            | ParseError::NotAnObject
            | ParseError::MissingField(_)
            | ParseError::PayloadNotObject => error_codes::INVALID_MESSAGE,
            ParseError::UnknownType(_) | ParseError::CritUnknownField(_) => {
                error_codes::UNSUPPORTED_TYPE
            }
            ParseError::UnknownChannel(_) => error_codes::PROTOCOL_VIOLATION,
            ParseError::SeqInvalid(_) => error_codes::SEQ_VIOLATION,
        }
    }
}

/// Parses and validates exactly one envelope from a text unit.
pub fn parse_envelope(text: &str) -> Result<Envelope, ParseError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ParseError::InvalidJson(e.to_string()))?;
    let obj = value.as_object().ok_or(ParseError::NotAnObject)?;

    for field in ["id", "session", "seq", "ts"] {
        match obj.get(field) {
            Some(Value::String(_)) => {}
            _ => return Err(ParseError::MissingField(field)),
        }
    }

    let channel_str = obj
        .get("channel")
        .and_then(Value::as_str)
        .ok_or(ParseError::MissingField("channel"))?;
    if Channel::from_wire(channel_str).is_none() {
        return Err(ParseError::UnknownChannel(channel_str.to_owned()));
    }

    let type_str = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ParseError::MissingField("type"))?;
    if EventType::from_wire(type_str).is_none() {
        return Err(ParseError::UnknownType(type_str.to_owned()));
    }

    if let Some(payload) = obj.get("payload") {
        if !payload.is_object() {
            return Err(ParseError::PayloadNotObject);
        }
    }

    let seq = obj.get("seq").and_then(Value::as_str).unwrap_or_default();
    if parse_seq(seq).is_none() {
        return Err(ParseError::SeqInvalid(seq.to_owned()));
    }

    if obj.get("crit").and_then(Value::as_bool) == Some(true) {
        for key in obj.keys() {
            if !KNOWN_FIELDS.contains(&key.as_str()) {
                return Err(ParseError::CritUnknownField(key.clone()));
            }
        }
        // Unknown-field rejection applies at payload level too, against the
        // closed field set of this kind.  Tool-defined payloads have no
        // closed set and stay open.
        if let Some(fields) = EventType::from_wire(type_str)
            .and_then(EventType::known_payload_fields)
        {
            if let Some(Value::Object(payload)) = obj.get("payload") {
                for key in payload.keys() {
                    if !fields.contains(&key.as_str()) {
                        return Err(ParseError::CritUnknownField(format!("payload.{key}")));
                    }
                }
            }
        }
    }

    serde_json::from_value(value).map_err(|e| ParseError::InvalidJson(e.to_string()))
}

/// Serialises one envelope to its wire text.
pub fn encode_envelope(envelope: &Envelope) -> String {
    serde_json::to_string(envelope).expect("envelope serialisation")
}

/// The size an envelope counts for against byte credits: the wire length of
/// the text unit plus any announced binary continuation.
pub fn effective_size(envelope: &Envelope, wire_len: usize) -> u64 {
    wire_len as u64 + envelope.bin_len.unwrap_or(0)
}

/// Rewrites an envelope carrying a binary continuation for a text-only
/// transport: the bytes move into `payload.data` as base64 and the
/// `bin_len` announcement is dropped (`bin_mime` moves into the payload).
pub fn fold_binary_into_payload(mut envelope: Envelope, bytes: &[u8]) -> Envelope {
    if let Value::Object(map) = &mut envelope.payload {
        map.insert("data".to_owned(), Value::String(BASE64.encode(bytes)));
        if let Some(mime) = envelope.bin_mime.take() {
            map.insert("mime".to_owned(), Value::String(mime));
        }
    }
    envelope.bin_len = None;
    envelope
}

/// Decodes base64 binary carried in `payload.data`, if any.  Returns `None`
/// both when there is no `data` field and when it does not decode.
pub fn take_binary_payload(envelope: &Envelope) -> Option<Vec<u8>> {
    let data = envelope.payload.get("data")?.as_str()?;
    BASE64.decode(data).ok()
}
