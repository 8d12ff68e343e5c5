use serde::{Deserialize, Serialize};

/// Logical streams inside a session.  Channels are the unit of credit
/// accounting and pause/resume; they do not affect routing by themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    User,
    Agent,
    System,
    AudioIn,
    AudioOut,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::User,
        Channel::Agent,
        Channel::System,
        Channel::AudioIn,
        Channel::AudioOut,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::User => "USER",
            Channel::Agent => "AGENT",
            Channel::System => "SYSTEM",
            Channel::AudioIn => "AUDIO_IN",
            Channel::AudioOut => "AUDIO_OUT",
        }
    }

    pub fn from_wire(s: &str) -> Option<Channel> {
        Channel::ALL.into_iter().find(|c| c.as_str() == s)
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All envelope kinds in the v1 protocol.
///
/// The handshake negotiates a subset of these (`accept_events`); anything
/// outside the negotiated set is rejected with `UNSUPPORTED_TYPE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Hai,
    Ping,
    Pong,
    Error,
    Info,
    FlowUpdate,
    TransactionStart,
    TransactionEnd,
    ReplayRequest,
    MessageStart,
    MessagePart,
    MessageEnd,
    AudioChunk,
    ToolList,
    ToolSchema,
    RunStarted,
    RunFinished,
    RunCancel,
    RunError,
    ToolCall,
    ToolUpdate,
    ToolDone,
    ToolCancel,
    PauseChannel,
    ResumeChannel,
}

impl EventType {
    pub const ALL: [EventType; 25] = [
        EventType::Hai,
        EventType::Ping,
        EventType::Pong,
        EventType::Error,
        EventType::Info,
        EventType::FlowUpdate,
        EventType::TransactionStart,
        EventType::TransactionEnd,
        EventType::ReplayRequest,
        EventType::MessageStart,
        EventType::MessagePart,
        EventType::MessageEnd,
        EventType::AudioChunk,
        EventType::ToolList,
        EventType::ToolSchema,
        EventType::RunStarted,
        EventType::RunFinished,
        EventType::RunCancel,
        EventType::RunError,
        EventType::ToolCall,
        EventType::ToolUpdate,
        EventType::ToolDone,
        EventType::ToolCancel,
        EventType::PauseChannel,
        EventType::ResumeChannel,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Hai => "HAI",
            EventType::Ping => "PING",
            EventType::Pong => "PONG",
            EventType::Error => "ERROR",
            EventType::Info => "INFO",
            EventType::FlowUpdate => "FLOW_UPDATE",
            EventType::TransactionStart => "TRANSACTION_START",
            EventType::TransactionEnd => "TRANSACTION_END",
            EventType::ReplayRequest => "REPLAY_REQUEST",
            EventType::MessageStart => "MESSAGE_START",
            EventType::MessagePart => "MESSAGE_PART",
            EventType::MessageEnd => "MESSAGE_END",
            EventType::AudioChunk => "AUDIO_CHUNK",
            EventType::ToolList => "TOOL_LIST",
            EventType::ToolSchema => "TOOL_SCHEMA",
            EventType::RunStarted => "RUN_STARTED",
            EventType::RunFinished => "RUN_FINISHED",
            EventType::RunCancel => "RUN_CANCEL",
            EventType::RunError => "RUN_ERROR",
            EventType::ToolCall => "TOOL_CALL",
            EventType::ToolUpdate => "TOOL_UPDATE",
            EventType::ToolDone => "TOOL_DONE",
            EventType::ToolCancel => "TOOL_CANCEL",
            EventType::PauseChannel => "PAUSE_CHANNEL",
            EventType::ResumeChannel => "RESUME_CHANNEL",
        }
    }

    pub fn from_wire(s: &str) -> Option<EventType> {
        EventType::ALL.into_iter().find(|e| e.as_str() == s)
    }

    /// Wire names of every event kind, in declaration order.  This is what a
    /// peer advertises in its handshake `accept_events` when it supports the
    /// full protocol.
    pub fn all_names() -> Vec<String> {
        EventType::ALL.iter().map(|e| e.as_str().to_owned()).collect()
    }

    /// Whether envelopes of this kind must carry a `transaction` id.
    ///
    /// Handshake, liveness, and SYSTEM control kinds are session-scoped;
    /// everything that reaches a tool is transaction-scoped.
    pub fn requires_transaction(self) -> bool {
        matches!(
            self,
            EventType::TransactionEnd
                | EventType::ReplayRequest
                | EventType::MessageStart
                | EventType::MessagePart
                | EventType::MessageEnd
                | EventType::AudioChunk
                | EventType::ToolCall
                | EventType::ToolUpdate
                | EventType::ToolDone
                | EventType::ToolCancel
        )
    }

    /// The closed payload field set for this kind, used by the codec when a
    /// `crit` envelope demands unknown-field rejection at payload level.
    ///
    /// `None` means the payload is open: message and tool events carry
    /// tool-defined content the engine cannot enumerate.
    pub fn known_payload_fields(self) -> Option<&'static [&'static str]> {
        match self {
            EventType::Hai => Some(&[
                "haip_version",
                "accept_major",
                "accept_events",
                "capabilities",
                "last_rx_seq",
                "auth",
            ]),
            EventType::Ping | EventType::Pong => Some(&["nonce"]),
            EventType::Error => Some(&["code", "message", "related_id", "detail"]),
            EventType::Info => Some(&["message"]),
            EventType::FlowUpdate => Some(&["channel", "add_messages", "add_bytes"]),
            EventType::TransactionStart => Some(&["tool_name", "params", "referenceId"]),
            EventType::TransactionEnd => Some(&[]),
            EventType::ReplayRequest => Some(&["from_seq", "to_seq"]),
            EventType::PauseChannel | EventType::ResumeChannel => Some(&["channel"]),
            EventType::RunStarted => Some(&["run_id", "thread_id"]),
            EventType::RunFinished => Some(&["run_id", "summary"]),
            EventType::RunCancel => Some(&["run_id"]),
            EventType::RunError => Some(&["run_id", "message"]),
            EventType::ToolList => Some(&["tools"]),
            EventType::ToolSchema => Some(&["tool_name", "input_schema", "output_schema"]),
            EventType::AudioChunk => Some(&["mime", "data"]),
            EventType::MessageStart
            | EventType::MessagePart
            | EventType::MessageEnd
            | EventType::ToolCall
            | EventType::ToolUpdate
            | EventType::ToolDone
            | EventType::ToolCancel => None,
        }
    }

    /// Control-plane kinds that bypass credit admission.  If `FLOW_UPDATE`
    /// itself could be denied for lack of credit, an exhausted channel could
    /// never be replenished.
    pub fn is_flow_exempt(self) -> bool {
        matches!(
            self,
            EventType::Hai
                | EventType::Ping
                | EventType::Pong
                | EventType::FlowUpdate
                | EventType::PauseChannel
                | EventType::ResumeChannel
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
