pub mod auth;
pub mod config;
pub mod credit;
pub mod dispatch;
pub mod http;
pub mod http_stream;
pub mod replay;
pub mod runs;
pub mod session;
pub mod sse;
pub mod state;
pub mod tools;
pub mod transaction;
pub mod transport;
pub mod ws;

pub use config::ServerConfig;
pub use state::AppState;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

/// The engine's full HTTP surface: the three protocol transports plus the
/// admin contract.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws::ws_handler))
        .route("/haip/sse", get(sse::sse_handler))
        .route("/haip/sse/{session_id}", post(sse::sse_ingress))
        .route("/haip/stream", post(http_stream::stream_handler))
        .route("/health", get(http::admin::health))
        .route("/stats", get(http::admin::stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
