// Admin surface (external contract): liveness probe and a statistics
// snapshot.  Field names are camelCase on the wire; the shapes are frozen.

use crate::state::AppState;
use axum::{Json, extract::State};
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime: u64,
    pub active_connections: u64,
    pub total_connections: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub user_id: Option<String>,
    pub transport: &'static str,
    pub connected_ms: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub uptime_seconds: u64,
    pub active_connections: u64,
    pub total_connections: u64,
    pub total_messages: u64,
    pub total_errors: u64,
    pub registered_tools: Vec<String>,
    pub sessions: Vec<SessionSummary>,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime: state.stats.uptime_seconds(),
        active_connections: state.active_connections().await,
        total_connections: state.stats.total_connections(),
    })
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let sessions = state
        .session_handles()
        .await
        .into_iter()
        .map(|(id, handle)| SessionSummary {
            id,
            user_id: handle.user_id,
            transport: handle.transport,
            connected_ms: handle.connected_ms,
        })
        .collect();
    Json(StatsResponse {
        uptime_seconds: state.stats.uptime_seconds(),
        active_connections: state.active_connections().await,
        total_connections: state.stats.total_connections(),
        total_messages: state.stats.total_messages(),
        total_errors: state.stats.total_errors(),
        registered_tools: state.tools.names(),
        sessions,
    })
}
