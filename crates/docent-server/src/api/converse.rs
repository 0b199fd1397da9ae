//! The conversation turn endpoint.

use axum::extract::State;
use axum::{Extension, Json};
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::api::request_context::RequestContext;
use crate::error::ApiError;
use crate::pipeline::{self, PipelineError};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ConverseRequest {
    pub session_id: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ConverseResponse {
    pub assistant_response: String,
    pub audio_base64: String,
    pub images_scheduled: usize,
    pub end_chat: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts_error: Option<bool>,
}

pub async fn converse(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Json(req): Json<ConverseRequest>,
) -> Result<Json<ConverseResponse>, ApiError> {
    if req.session_id.trim().is_empty() {
        return Err(ApiError::bad_request("session_id is required"));
    }
    if req.message.trim().is_empty() {
        return Err(ApiError::bad_request("message is required"));
    }

    // Everything the turn logs downstream carries the correlation id.
    let turn_span = info_span!(
        "turn",
        correlation_id = %ctx.correlation_id,
        session_id = %req.session_id
    );
    let outcome = pipeline::converse(&state, &req.session_id, req.message.trim())
        .instrument(turn_span)
        .await
        .map_err(|err| match err {
            PipelineError::SessionNotFound => ApiError::session_not_found(&req.session_id),
            PipelineError::Llm(llm) => ApiError::upstream_llm(llm.to_string()),
        })?;

    let audio_base64 = outcome
        .audio
        .as_ref()
        .map(|artifact| base64::engine::general_purpose::STANDARD.encode(artifact.bytes.as_slice()))
        .unwrap_or_default();

    Ok(Json(ConverseResponse {
        assistant_response: outcome.assistant_text,
        audio_base64,
        images_scheduled: outcome.images_scheduled,
        end_chat: outcome.end_chat,
        tts_error: outcome.tts_error.then_some(true),
    }))
}
