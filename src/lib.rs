//! HAIP: a transport-agnostic, sequenced, credit-controlled event protocol
//! for streaming multi-modal interactions between clients and agent
//! back-ends.
//!
//! This crate re-exports the wire model; the engine lives in `haip-server`
//! and the client in `haip-client`.

pub use haip_protocol::*;
