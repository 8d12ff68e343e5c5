use crate::auth::Authenticator;
use crate::config::ServerConfig;
use crate::tools::ToolRegistry;
use haip_protocol::now_ms;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::{RwLock, mpsc};

/// Registry-side view of a connected session.  The mutable protocol state
/// (credits, transactions, timers) lives on the session task; the handle
/// exists for stats and cross-session queries only.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    pub user_id: Option<String>,
    pub transport: &'static str,
    pub connected_ms: i64,
}

/// Process-wide counters surfaced by the admin endpoints.
pub struct Stats {
    started_at: Instant,
    total_connections: AtomicU64,
    total_messages: AtomicU64,
    total_errors: AtomicU64,
}

impl Stats {
    fn new() -> Self {
        Stats {
            started_at: Instant::now(),
            total_connections: AtomicU64::new(0),
            total_messages: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
        }
    }

    pub fn record_connection(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message(&self) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.total_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    pub fn total_messages(&self) -> u64 {
        self.total_messages.load(Ordering::Relaxed)
    }

    pub fn total_errors(&self) -> u64 {
        self.total_errors.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub authenticator: Arc<dyn Authenticator>,
    pub tools: ToolRegistry,
    pub stats: Arc<Stats>,
    sessions: Arc<RwLock<HashMap<String, SessionHandle>>>,
    /// NDJSON ingress senders for SSE sessions, keyed by session id.
    sse_ingress: Arc<RwLock<HashMap<String, mpsc::Sender<String>>>>,
}

impl AppState {
    pub fn new(config: ServerConfig, authenticator: Arc<dyn Authenticator>) -> Self {
        AppState {
            config,
            authenticator,
            tools: ToolRegistry::new(),
            stats: Arc::new(Stats::new()),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            sse_ingress: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn register_session(&self, session_id: &str, transport: &'static str) {
        self.stats.record_connection();
        self.sessions.write().await.insert(
            session_id.to_owned(),
            SessionHandle {
                user_id: None,
                transport,
                connected_ms: now_ms(),
            },
        );
    }

    pub async fn set_session_user(&self, session_id: &str, user_id: &str) {
        if let Some(handle) = self.sessions.write().await.get_mut(session_id) {
            handle.user_id = Some(user_id.to_owned());
        }
    }

    pub async fn unregister_session(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }

    pub async fn active_connections(&self) -> u64 {
        self.sessions.read().await.len() as u64
    }

    pub async fn session_handles(&self) -> Vec<(String, SessionHandle)> {
        self.sessions
            .read()
            .await
            .iter()
            .map(|(id, handle)| (id.clone(), handle.clone()))
            .collect()
    }

    pub async fn register_sse_ingress(&self, session_id: &str, tx: mpsc::Sender<String>) {
        self.sse_ingress
            .write()
            .await
            .insert(session_id.to_owned(), tx);
    }

    pub async fn sse_ingress(&self, session_id: &str) -> Option<mpsc::Sender<String>> {
        self.sse_ingress.read().await.get(session_id).cloned()
    }

    pub async fn unregister_sse_ingress(&self, session_id: &str) {
        self.sse_ingress.write().await.remove(session_id);
    }
}
