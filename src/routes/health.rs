//! Health check endpoints

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub service: &'static str,
    pub uploads_enabled: bool,
    pub active_sessions: usize,
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        service: "asset-upload-server",
        uploads_enabled: state.config().upload.enabled,
        active_sessions: state.uploads().sessions().session_count(),
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(health_check))
}
