//! Language-model adapter.
//!
//! The wire contract is a plain `POST /chat` returning a `response` string;
//! the upstream keeps per-session context, so only the newest user message
//! travels. The trait still receives the full history so stubbed backends
//! and stateless upstreams can use it.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use docent_core::ChatTurn;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("language model unreachable: {0}")]
    Unreachable(String),
    #[error("language model timed out")]
    Timeout,
    #[error("language model returned an unusable response: {0}")]
    BadResponse(String),
}

#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Produce the raw text reply for one user turn. The caller parses it
    /// into a structured reply or degrades it to prose.
    async fn respond(
        &self,
        session_id: &str,
        history: &[ChatTurn],
        message: &str,
    ) -> Result<String, LlmError>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    session_id: &'a str,
    message: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    response: String,
}

pub struct HttpLlmBackend {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpLlmBackend {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl LlmBackend for HttpLlmBackend {
    async fn respond(
        &self,
        session_id: &str,
        _history: &[ChatTurn],
        message: &str,
    ) -> Result<String, LlmError> {
        let url = format!("{}/chat", self.base_url.trim_end_matches('/'));
        let request = self
            .client
            .post(&url)
            .json(&ChatRequest {
                session_id,
                message,
                stream: false,
            })
            .send();

        let response = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| LlmError::Timeout)?
            .map_err(|err| LlmError::Unreachable(err.to_string()))?
            .error_for_status()
            .map_err(|err| LlmError::Unreachable(err.to_string()))?;

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|err| LlmError::BadResponse(err.to_string()))?;
        Ok(body.response)
    }
}
