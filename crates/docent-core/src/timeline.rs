//! The structured reply contract with the language model.
//!
//! The model is instructed to answer with a JSON object carrying the spoken
//! reply, a timeline of visual events, and an end-of-chat bit. Models being
//! models, the object frequently arrives wrapped in a fenced code block or
//! not at all; the parser strips decoration and either accepts the whole
//! structure or degrades to plain prose with an empty timeline.

use serde::{Deserialize, Serialize};

/// Abstract image reference produced by the language model. The resolver
/// turns it into a concrete catalogue descriptor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageRef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl ImageRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
            category: None,
        }
    }

    /// Search string fed to the catalogue resolver: the id plus any hints.
    pub fn search_string(&self) -> String {
        let mut out = self.id.clone();
        for hint in [self.title.as_deref(), self.category.as_deref()]
            .into_iter()
            .flatten()
        {
            out.push(' ');
            out.push_str(hint);
        }
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimelineAction {
    PreloadImage(ImageRef),
}

/// A planned visual action at an offset from the instant speech playback
/// begins on the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimelineEvent {
    pub time_offset_ms: u64,
    pub action: TimelineAction,
}

/// Sum of "well-formed structured reply" and "plain prose". The parser never
/// guesses on partial structures.
#[derive(Debug, Clone, PartialEq)]
pub enum LlmReply {
    Structured {
        speech_response: String,
        timeline_events: Vec<TimelineEvent>,
        end_chat: bool,
    },
    Degraded {
        text: String,
    },
}

impl LlmReply {
    pub fn speech(&self) -> &str {
        match self {
            Self::Structured {
                speech_response, ..
            } => speech_response,
            Self::Degraded { text } => text,
        }
    }

    pub fn timeline(&self) -> &[TimelineEvent] {
        match self {
            Self::Structured {
                timeline_events, ..
            } => timeline_events,
            Self::Degraded { .. } => &[],
        }
    }

    pub fn end_chat(&self) -> bool {
        match self {
            Self::Structured { end_chat, .. } => *end_chat,
            Self::Degraded { .. } => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawStructuredReply {
    speech_response: String,
    timeline_events: Vec<TimelineEvent>,
    end_chat: bool,
}

/// Parse a raw model reply. Fenced and bare JSON yield the same result; any
/// decode failure yields `Degraded` carrying the raw text.
pub fn parse_llm_reply(raw: &str) -> LlmReply {
    let stripped = strip_code_fences(raw);
    match serde_json::from_str::<RawStructuredReply>(stripped) {
        Ok(reply) => LlmReply::Structured {
            speech_response: reply.speech_response,
            timeline_events: reply.timeline_events,
            end_chat: reply.end_chat,
        },
        Err(err) => {
            tracing::debug!("model reply is not structured JSON ({err}), degrading to prose");
            LlmReply::Degraded {
                text: raw.trim().to_string(),
            }
        }
    }
}

/// Remove a surrounding markdown code fence, with or without a language tag.
fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(body) = rest.strip_suffix("```") else {
        return trimmed;
    };
    // Drop the language tag on the opening fence line, if any.
    let body = match body.split_once('\n') {
        Some((first_line, tail)) if !first_line.trim().starts_with('{') => tail,
        _ => body,
    };
    body.trim()
}
