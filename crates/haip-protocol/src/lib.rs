// haip-protocol: HAIP envelope model and wire codec.
//
// Everything that crosses a transport is an `Envelope`: a JSON object with a
// closed `type`/`channel` vocabulary and a type-specific structured payload.
// This crate owns the envelope schema, the typed payload structs the engine
// interprets, validation, and the frozen error-code vocabulary.  It knows
// nothing about transports or sessions.

pub mod codec;
pub mod envelope;
pub mod event;
pub mod payload;

pub use codec::{ParseError, effective_size, encode_envelope, parse_envelope};
pub use envelope::{Envelope, format_seq, mint_id, now_ms, parse_seq};
pub use event::{Channel, EventType};
pub use payload::*;

/// Protocol version this implementation speaks.
pub const HAIP_VERSION: &str = "1.1.2";

/// Major versions this implementation can negotiate.
pub const SUPPORTED_MAJORS: &[u64] = &[1];

/// Flow-control and lifecycle defaults advertised in the server handshake.
pub mod defaults {
    use std::time::Duration;

    pub const INITIAL_CREDIT_MESSAGES: u64 = 1000;
    pub const INITIAL_CREDIT_BYTES: u64 = 1_048_576;
    pub const MAX_CONCURRENT_RUNS: usize = 10;
    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
    pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const REPLAY_WINDOW_TIME: Duration = Duration::from_secs(300);
    pub const REPLAY_WINDOW_SIZE: usize = 1000;
}

/// Frozen protocol error codes carried in `ERROR` payloads.
pub mod error_codes {
    pub const PROTOCOL_VIOLATION: &str = "PROTOCOL_VIOLATION";
    pub const INVALID_MESSAGE: &str = "INVALID_MESSAGE";
    pub const UNSUPPORTED_TYPE: &str = "UNSUPPORTED_TYPE";
    pub const VERSION_INCOMPATIBLE: &str = "VERSION_INCOMPATIBLE";
    pub const FAILED_AUTH: &str = "FAILED_AUTH";
    pub const NOT_HAI: &str = "NOT_HAI";
    pub const SEQ_VIOLATION: &str = "SEQ_VIOLATION";
    pub const FLOW_CONTROL_VIOLATION: &str = "FLOW_CONTROL_VIOLATION";
    pub const INSUFFICIENT_CREDITS: &str = "INSUFFICIENT_CREDITS";
    pub const REPLAY_TOO_OLD: &str = "REPLAY_TOO_OLD";
    pub const RESUME_FAILED: &str = "RESUME_FAILED";
    pub const TRANSACTION_NOT_FOUND: &str = "TRANSACTION_NOT_FOUND";
    pub const MISSING_TOOL_NAME: &str = "MISSING_TOOL_NAME";
    pub const TOOL_NOT_FOUND: &str = "TOOL_NOT_FOUND";
    pub const RUN_NOT_FOUND: &str = "RUN_NOT_FOUND";
    pub const RUN_LIMIT_EXCEEDED: &str = "RUN_LIMIT_EXCEEDED";
    pub const MISSING_RUN_ID: &str = "MISSING_RUN_ID";
}
