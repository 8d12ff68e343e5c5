use haip_server::auth::StaticTokenAuthenticator;
use haip_server::tools::{AddTool, EchoTool};
use haip_server::{AppState, ServerConfig, build_router};
use std::env;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_owned());
    let config = ServerConfig::from_env();

    let authenticator = match env::var("HAIP_TOKENS") {
        Ok(spec) => StaticTokenAuthenticator::from_spec(&spec),
        Err(_) => StaticTokenAuthenticator::new(),
    };
    if authenticator.is_empty() {
        warn!("HAIP_TOKENS is empty; every handshake will fail authentication");
    }

    let state = AppState::new(config, Arc::new(authenticator));
    // Default tools are a deployment choice; the engine itself starts with
    // an empty registry.
    state.tools.register(Arc::new(EchoTool));
    state.tools.register(Arc::new(AddTool));

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %bind_addr, "haip server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
    info!("server shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
