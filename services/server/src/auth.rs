use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::warn;

/// Injected authenticator.  The engine hands it the opaque `auth` object
/// from the peer's `HAI` payload; `Some(user_id)` authenticates the session,
/// `None` rejects it with `FAILED_AUTH`.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, auth: Option<&Value>) -> Option<String>;
}

/// Closures work as authenticators, which keeps tests and embedders free of
/// boilerplate.
impl<F> Authenticator for F
where
    F: Fn(Option<&Value>) -> Option<String> + Send + Sync,
{
    fn authenticate(&self, auth: Option<&Value>) -> Option<String> {
        self(auth)
    }
}

/// Token authenticator backed by an in-memory digest table.  Raw tokens are
/// never stored; lookups compare sha256 digests.
pub struct StaticTokenAuthenticator {
    tokens: HashMap<[u8; 32], String>,
}

impl StaticTokenAuthenticator {
    pub fn new() -> Self {
        StaticTokenAuthenticator {
            tokens: HashMap::new(),
        }
    }

    pub fn insert(&mut self, user_id: &str, raw_token: &str) {
        self.tokens.insert(digest(raw_token), user_id.to_owned());
    }

    /// Parses a `user:token,user:token` spec, as carried by `HAIP_TOKENS`.
    /// Malformed entries are skipped with a warning rather than aborting
    /// startup.
    pub fn from_spec(spec: &str) -> Self {
        let mut auth = StaticTokenAuthenticator::new();
        for entry in spec.split(',').filter(|e| !e.trim().is_empty()) {
            match entry.trim().split_once(':') {
                Some((user, token)) if !user.is_empty() && !token.is_empty() => {
                    auth.insert(user, token);
                }
                _ => warn!(entry = %entry, "ignoring malformed token spec entry"),
            }
        }
        auth
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Default for StaticTokenAuthenticator {
    fn default() -> Self {
        Self::new()
    }
}

impl Authenticator for StaticTokenAuthenticator {
    fn authenticate(&self, auth: Option<&Value>) -> Option<String> {
        let token = auth?.get("token")?.as_str()?;
        self.tokens.get(&digest(token)).cloned()
    }
}

fn digest(raw_token: &str) -> [u8; 32] {
    Sha256::digest(raw_token.as_bytes()).into()
}

pub fn extract_bearer(authorization: &str) -> Option<&str> {
    authorization.strip_prefix("Bearer ")
}

/// Short digest prefix for logging a token without disclosing it.
pub fn token_fingerprint(raw_token: &str) -> String {
    hex::encode(&digest(raw_token)[..4])
}
