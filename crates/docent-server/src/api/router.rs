use axum::{
    extract::Request,
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info_span;

use crate::api::request_context::{attach_request_context, CORRELATION_HEADER};
use crate::state::AppState;

/// Create the main API router.
pub fn create_router(state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http().make_span_with(|request: &Request| {
        let request_id = request
            .headers()
            .get(CORRELATION_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-");
        info_span!(
            "http_request",
            method = %request.method(),
            uri = %request.uri(),
            correlation_id = %request_id
        )
    });

    Router::new()
        .route("/start_session", post(crate::api::sessions::start_session))
        .route("/converse", post(crate::api::converse::converse))
        .route(
            "/session/{id}",
            get(crate::api::sessions::get_session).delete(crate::api::sessions::delete_session),
        )
        .route(
            "/session/{id}/keepalive",
            post(crate::api::sessions::keepalive),
        )
        .route("/health", get(crate::api::internal::health))
        .route(
            "/catalog/reload",
            post(crate::api::internal::reload_catalog),
        )
        .layer(trace_layer)
        .layer(middleware::from_fn(attach_request_context))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
