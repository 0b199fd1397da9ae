//! Correlation between an HTTP request and the turn it drives.
//!
//! A kiosk turn fans out into LLM, TTS and datachannel work that logs long
//! after the HTTP handler returned; the correlation id ties those lines
//! back to the originating request. Callers may supply their own id; the
//! server mints one otherwise and echoes it on the response either way.

use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use uuid::Uuid;

pub const CORRELATION_HEADER: &str = "x-request-id";

/// Caller-supplied ids longer than this are treated as absent.
const MAX_CORRELATION_ID_LEN: usize = 128;

#[derive(Clone, Debug)]
pub struct RequestContext {
    pub correlation_id: String,
}

impl RequestContext {
    fn minted() -> Self {
        Self {
            correlation_id: format!("req_{}", Uuid::new_v4().simple()),
        }
    }

    fn from_header_value(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.len() > MAX_CORRELATION_ID_LEN {
            return None;
        }
        Some(Self {
            correlation_id: trimmed.to_string(),
        })
    }
}

pub async fn attach_request_context(mut req: Request, next: Next) -> Response {
    let context = req
        .headers()
        .get(CORRELATION_HEADER)
        .and_then(|header| header.to_str().ok())
        .and_then(RequestContext::from_header_value)
        .unwrap_or_else(RequestContext::minted);

    let correlation_id = context.correlation_id.clone();
    req.extensions_mut().insert(context);

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}
