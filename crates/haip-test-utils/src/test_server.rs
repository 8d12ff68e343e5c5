use crate::test_authenticator;
use haip_server::tools::{AddTool, EchoTool};
use haip_server::{AppState, ServerConfig, build_router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// An in-process engine bound to an ephemeral port, with the default tools
/// and the fixed test authenticator registered.
pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
}

impl TestServer {
    pub async fn start(config: ServerConfig) -> Self {
        let state = AppState::new(config, Arc::new(test_authenticator()));
        state.tools.register(Arc::new(EchoTool));
        state.tools.register(Arc::new(AddTool));
        Self::with_state(state).await
    }

    pub async fn with_state(state: AppState) -> Self {
        let router = build_router(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind test server");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("server error");
        });
        // Give the acceptor a beat to come up.
        tokio::time::sleep(Duration::from_millis(20)).await;
        TestServer { addr, state }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/", self.addr)
    }

    pub fn sse_url(&self) -> String {
        format!("http://{}/haip/sse", self.addr)
    }

    pub fn sse_ingress_url(&self, session_id: &str) -> String {
        format!("http://{}/haip/sse/{session_id}", self.addr)
    }

    pub fn stream_url(&self) -> String {
        format!("http://{}/haip/stream", self.addr)
    }

    pub fn health_url(&self) -> String {
        format!("http://{}/health", self.addr)
    }

    pub fn stats_url(&self) -> String {
        format!("http://{}/stats", self.addr)
    }
}
