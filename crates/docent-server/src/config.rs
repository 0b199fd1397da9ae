//! Server configuration from `DOCENT_*` environment variables.
//!
//! Every knob has a default; invalid values warn and fall back rather than
//! aborting startup.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

const DEFAULT_PERSONA_PROMPT: &str = "You are a friendly museum docent at an interactive kiosk. \
     Answer in short spoken sentences. Reply as JSON with fields speech_response, \
     timeline_events and end_chat.";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Inactivity window before a session is ended with reason `timeout`.
    pub session_idle_timeout: Duration,
    /// Hard session duration, independent of activity.
    pub session_duration_s: u64,
    /// Cadence of the ended-session sweep.
    pub session_sweep_interval: Duration,
    /// Grace before an ended session is pruned from memory.
    pub session_retention: Duration,
    /// Pre-roll between scheduling and speech start, absorbing the HTTP
    /// round-trip and client decode.
    pub anchor_lead_ms: u64,
    /// How far ahead of its show instant an image preload is dispatched.
    pub preload_lead_ms: u64,
    pub show_crossfade_ms: u64,
    pub late_show_tolerance_ms: u64,
    pub preload_ttl_ms: u64,
    pub tts_cache_enabled: bool,
    pub tts_cache_dir: PathBuf,
    pub llm_timeout: Duration,
    pub tts_timeout: Duration,
    pub llm_url: String,
    pub tts_primary_url: String,
    pub tts_secondary_url: Option<String>,
    pub sfu_url: String,
    pub catalog_path: PathBuf,
    pub persona_prompt: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            session_idle_timeout: Duration::from_millis(600_000),
            session_duration_s: 300,
            session_sweep_interval: Duration::from_millis(60_000),
            session_retention: Duration::from_secs(3_600),
            anchor_lead_ms: 1_000,
            preload_lead_ms: 1_500,
            show_crossfade_ms: 400,
            late_show_tolerance_ms: 100,
            preload_ttl_ms: 60_000,
            tts_cache_enabled: true,
            tts_cache_dir: default_cache_dir(),
            llm_timeout: Duration::from_millis(15_000),
            tts_timeout: Duration::from_millis(10_000),
            llm_url: "http://127.0.0.1:8090".to_string(),
            tts_primary_url: "http://127.0.0.1:8091".to_string(),
            tts_secondary_url: None,
            sfu_url: "ws://127.0.0.1:7880".to_string(),
            catalog_path: PathBuf::from("catalog.json"),
            persona_prompt: DEFAULT_PERSONA_PROMPT.to_string(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            session_idle_timeout: Duration::from_millis(env_u64(
                "DOCENT_SESSION_IDLE_TIMEOUT_MS",
                600_000,
            )),
            session_duration_s: env_u64("DOCENT_SESSION_DURATION_S", 300),
            session_sweep_interval: Duration::from_millis(env_u64(
                "DOCENT_SESSION_SWEEP_INTERVAL_MS",
                60_000,
            )),
            session_retention: defaults.session_retention,
            anchor_lead_ms: env_u64("DOCENT_ANCHOR_LEAD_MS", 1_000),
            preload_lead_ms: env_u64("DOCENT_PRELOAD_LEAD_MS", 1_500),
            show_crossfade_ms: env_u64("DOCENT_SHOW_CROSSFADE_MS", 400),
            late_show_tolerance_ms: env_u64("DOCENT_LATE_SHOW_TOLERANCE_MS", 100),
            preload_ttl_ms: env_u64("DOCENT_PRELOAD_TTL_MS", 60_000),
            tts_cache_enabled: env_bool("DOCENT_TTS_CACHE_ENABLED", true),
            tts_cache_dir: env_path("DOCENT_TTS_CACHE_DIR").unwrap_or(defaults.tts_cache_dir),
            llm_timeout: Duration::from_millis(env_u64("DOCENT_LLM_TIMEOUT_MS", 15_000)),
            tts_timeout: Duration::from_millis(env_u64("DOCENT_TTS_TIMEOUT_MS", 10_000)),
            llm_url: env_string("DOCENT_LLM_URL").unwrap_or(defaults.llm_url),
            tts_primary_url: env_string("DOCENT_TTS_URL").unwrap_or(defaults.tts_primary_url),
            tts_secondary_url: env_string("DOCENT_TTS_SECONDARY_URL"),
            sfu_url: env_string("DOCENT_SFU_URL").unwrap_or(defaults.sfu_url),
            catalog_path: env_path("DOCENT_CATALOG_PATH").unwrap_or(defaults.catalog_path),
            persona_prompt: env_string("DOCENT_PERSONA_PROMPT").unwrap_or(defaults.persona_prompt),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    if let Some(mut dir) = dirs::data_local_dir() {
        dir.push("docent");
        dir.push("tts-cache");
        return dir;
    }
    PathBuf::from("data/tts-cache")
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().and_then(|raw| {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_path(key: &str) -> Option<PathBuf> {
    env_string(key).map(PathBuf::from)
}

fn env_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!("Invalid {key}='{raw}', falling back to {default}");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            other => {
                warn!("Invalid {key}='{other}', falling back to {default}");
                default
            }
        },
        Err(_) => default,
    }
}
