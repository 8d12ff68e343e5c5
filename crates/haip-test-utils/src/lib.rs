// haip-test-utils: shared harness for the protocol test suites.
//
// Provides an in-process server bound to an ephemeral port and a raw
// WebSocket client that can send arbitrary text (malformed envelopes
// included), for driving the engine from the outside.

pub mod raw_ws_client;
pub mod test_server;

pub use raw_ws_client::{RawFrame, RawWsClient};
pub use test_server::TestServer;

use serde_json::Value;

/// Authenticator used across the suites: accepts `{"token": "T"}` as
/// `user-1` and `{"token": "U"}` as `user-2`.
pub fn test_authenticator() -> impl haip_server::auth::Authenticator {
    |auth: Option<&Value>| -> Option<String> {
        match auth?.get("token")?.as_str()? {
            "T" => Some("user-1".to_owned()),
            "U" => Some("user-2".to_owned()),
            _ => None,
        }
    }
}
