//! # Health Check Handler

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::web::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub host: String,
    pub uptime_seconds: i64,
    pub running_workflows: usize,
    pub live_masters: usize,
    pub worker_groups: Vec<String>,
}

/// Liveness: GET /health
///
/// Answers as long as the master process is serving requests.
pub async fn basic_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let now = chrono::Utc::now();
    Json(HealthResponse {
        status: "ok".to_string(),
        timestamp: now.to_rfc3339(),
        host: state.master_host.clone(),
        uptime_seconds: (now - state.started_at).num_seconds(),
        running_workflows: state.repository.len(),
        live_masters: state.nodes.master_hosts().len(),
        worker_groups: state.nodes.worker_groups(),
    })
}
