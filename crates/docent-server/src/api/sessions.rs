//! Session lifecycle endpoints.

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::ApiError;
use crate::sessions::{EndReason, Session};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct StartSessionRequest {
    pub kiosk_id: String,
}

#[derive(Debug, Serialize)]
pub struct StartSessionResponse {
    pub session_id: String,
    pub token: String,
    pub livekit_url: String,
    pub room_name: String,
    pub duration_seconds: u64,
}

pub async fn start_session(
    State(state): State<AppState>,
    Json(req): Json<StartSessionRequest>,
) -> Result<Json<StartSessionResponse>, ApiError> {
    let kiosk_id = req.kiosk_id.trim();
    if kiosk_id.is_empty() {
        return Err(ApiError::bad_request("kiosk_id is required"));
    }

    let created = state
        .registry
        .create(kiosk_id)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;

    Ok(Json(StartSessionResponse {
        session_id: created.session_id,
        token: created.grant.token,
        livekit_url: created.grant.url,
        room_name: created.grant.room_name,
        duration_seconds: created.duration_s,
    }))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    state
        .registry
        .lookup(&session_id)
        .map(Json)
        .ok_or_else(|| ApiError::session_not_found(&session_id))
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if state.registry.lookup(&session_id).is_none() {
        return Err(ApiError::session_not_found(&session_id));
    }
    state.registry.end(&session_id, EndReason::Manual).await;
    Ok(Json(json!({ "ended": true })))
}

/// Explicit activity refresh, for hosts that want to hold a session open
/// without a conversation turn.
pub async fn keepalive(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.registry.lookup(&session_id) {
        Some(session) if session.state == crate::sessions::SessionState::Active => {
            state.registry.refresh(&session_id);
            Ok(Json(json!({ "ok": true })))
        }
        _ => Err(ApiError::session_not_found(&session_id)),
    }
}
