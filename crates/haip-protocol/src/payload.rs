// Typed payload structs for the envelope kinds the engine interprets.
//
// Envelopes carry payloads as raw JSON objects; handlers decode into these
// with `Envelope::decode_payload` so unknown extra fields pass through
// untouched (unless the envelope is marked `crit`).

use crate::event::Channel;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// `HAI` payload.  Sent by both sides; the server's advertises its supported
/// majors, full event set, and capabilities, the client's carries the `auth`
/// object handed to the authenticator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakePayload {
    pub haip_version: String,
    pub accept_major: Vec<u64>,
    pub accept_events: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capabilities>,
    /// Highest seq the peer saw on a previous connection, for resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_rx_seq: Option<String>,
    /// Opaque object passed verbatim to the injected authenticator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub binary_frames: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_control: Option<FlowControlCaps>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_runs: Option<usize>,
    /// Advertised only; the signing mechanism is out of scope.
    #[serde(default)]
    pub signed_envelopes: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowControlCaps {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_credit_messages: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_credit_bytes: Option<u64>,
}

// ---------------------------------------------------------------------------
// Liveness
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingPayload {
    pub nonce: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongPayload {
    pub nonce: String,
}

// ---------------------------------------------------------------------------
// Errors and info
// ---------------------------------------------------------------------------

/// `ERROR` payload, emitted on channel SYSTEM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// One of the frozen codes in [`crate::error_codes`].
    pub code: String,
    pub message: String,
    /// Envelope id that triggered the error, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoPayload {
    pub message: String,
}

// ---------------------------------------------------------------------------
// Flow control
// ---------------------------------------------------------------------------

/// `FLOW_UPDATE` payload: grants credit on one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowUpdatePayload {
    pub channel: Channel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_messages: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_bytes: Option<u64>,
}

/// `PAUSE_CHANNEL` / `RESUME_CHANNEL` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelControlPayload {
    pub channel: Channel,
}

// ---------------------------------------------------------------------------
// Transactions and replay
// ---------------------------------------------------------------------------

/// Client side of `TRANSACTION_START`.  The envelope's `transaction` field
/// carries the peer's temporary id; the payload names the tool to bind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionStartPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

/// Server reply to `TRANSACTION_START`.  The envelope carries the fresh
/// server-side transaction id; `referenceId` echoes the peer's temporary id
/// so it can rebind.  The field is camelCase on the wire (frozen contract).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionAcceptedPayload {
    #[serde(rename = "referenceId")]
    pub reference_id: String,
    pub tool_name: String,
}

/// `REPLAY_REQUEST` payload.  `to_seq` absent means "to the newest entry".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayRequestPayload {
    pub from_seq: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_seq: Option<String>,
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStartedPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunFinishedPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunCancelPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunErrorPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

/// One entry in a `TOOL_LIST` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolListPayload {
    pub tools: Vec<ToolDescriptor>,
}

/// `TOOL_SCHEMA` request payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolSchemaRequestPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

/// `TOOL_SCHEMA` reply payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchemaPayload {
    pub tool_name: String,
    pub input_schema: Value,
    pub output_schema: Value,
}

/// Terminal `TOOL_DONE` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDonePayload {
    /// `OK`, `CANCELLED`, or `ERROR`.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

// ---------------------------------------------------------------------------
// Audio
// ---------------------------------------------------------------------------

/// `AUDIO_CHUNK` payload for text transports: base64 bytes in `data`.
/// Binary transports leave the payload empty and announce a continuation
/// frame via `bin_len`/`bin_mime` on the envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioChunkPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}
