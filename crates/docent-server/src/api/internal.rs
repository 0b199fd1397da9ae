//! Health and operational endpoints.

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use serde_json::json;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub active_sessions: usize,
    pub total_sessions: usize,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        active_sessions: state.registry.active_count(),
        total_sessions: state.registry.total_count(),
    })
}

pub async fn reload_catalog(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let entries = state
        .catalog
        .reload()
        .map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(Json(json!({ "reloaded": true, "entries": entries })))
}
