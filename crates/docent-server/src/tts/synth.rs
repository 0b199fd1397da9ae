//! Speech synthesis tiers.
//!
//! Tiers share one byte-format contract: opaque MP3 or WAV plus a content
//! type. They are tried in declared order until one succeeds; the serving
//! tier travels in the artifact metadata for observability only. The last
//! tier is a constant-sine placeholder that cannot fail, so a kiosk keeps
//! talking (tonelessly) through a full upstream outage.

use std::io::Cursor;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

/// Nominal bitrate assumed when estimating MP3 playback duration.
const MP3_NOMINAL_BITRATE: u64 = 128_000;

#[derive(Debug, Error)]
pub enum SynthError {
    #[error("synthesis tier failed: {0}")]
    Tier(String),
    #[error("synthesis timed out")]
    Timeout,
    #[error("every synthesis tier failed, last error: {0}")]
    AllTiersFailed(String),
    #[error("cache storage error: {0}")]
    Storage(String),
}

/// One synthesised utterance before caching.
#[derive(Debug, Clone)]
pub struct SynthAudio {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub tier: String,
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    fn label(&self) -> &str;

    async fn synthesize(&self, text: &str) -> Result<SynthAudio, SynthError>;
}

#[derive(Debug, Serialize)]
struct SynthesizeRequest<'a> {
    text: &'a str,
}

/// Cloud voice behind `POST /synthesize`.
pub struct HttpVoiceTier {
    label: String,
    client: reqwest::Client,
    base_url: String,
}

impl HttpVoiceTier {
    pub fn new(label: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpVoiceTier {
    fn label(&self) -> &str {
        &self.label
    }

    async fn synthesize(&self, text: &str) -> Result<SynthAudio, SynthError> {
        let url = format!("{}/synthesize", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&SynthesizeRequest { text })
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|err| SynthError::Tier(err.to_string()))?
            .error_for_status()
            .map_err(|err| SynthError::Tier(err.to_string()))?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or(value).trim().to_string())
            .unwrap_or_else(|| "audio/mpeg".to_string());

        let bytes = response
            .bytes()
            .await
            .map_err(|err| SynthError::Tier(err.to_string()))?;
        if bytes.is_empty() {
            return Err(SynthError::Tier("upstream returned empty audio".into()));
        }

        Ok(SynthAudio {
            bytes: bytes.to_vec(),
            content_type,
            tier: self.label.clone(),
        })
    }
}

/// Constant-sine WAV placeholder. Duration scales with text length so the
/// visual timeline still has something to anchor against.
pub struct SineTier {
    sample_rate: u32,
    frequency_hz: f32,
}

impl SineTier {
    pub fn new() -> Self {
        Self {
            sample_rate: 22_050,
            frequency_hz: 440.0,
        }
    }

    fn placeholder_duration_ms(text: &str) -> u64 {
        (text.chars().count() as u64 * 55).clamp(400, 8_000)
    }
}

impl Default for SineTier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SpeechSynthesizer for SineTier {
    fn label(&self) -> &str {
        "sine-placeholder"
    }

    async fn synthesize(&self, text: &str) -> Result<SynthAudio, SynthError> {
        let duration_ms = Self::placeholder_duration_ms(text);
        let total_samples = self.sample_rate as u64 * duration_ms / 1_000;

        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec)
                .map_err(|err| SynthError::Tier(err.to_string()))?;
            let step = self.frequency_hz * std::f32::consts::TAU / self.sample_rate as f32;
            for n in 0..total_samples {
                let sample = (n as f32 * step).sin() * 0.2;
                writer
                    .write_sample((sample * i16::MAX as f32) as i16)
                    .map_err(|err| SynthError::Tier(err.to_string()))?;
            }
            writer
                .finalize()
                .map_err(|err| SynthError::Tier(err.to_string()))?;
        }

        Ok(SynthAudio {
            bytes: cursor.into_inner(),
            content_type: "audio/wav".to_string(),
            tier: self.label().to_string(),
        })
    }
}

/// Tries each tier in declared order until one succeeds.
pub struct TieredSynthesizer {
    tiers: Vec<Box<dyn SpeechSynthesizer>>,
}

impl TieredSynthesizer {
    pub fn new(tiers: Vec<Box<dyn SpeechSynthesizer>>) -> Self {
        Self { tiers }
    }
}

#[async_trait]
impl SpeechSynthesizer for TieredSynthesizer {
    fn label(&self) -> &str {
        "tiered"
    }

    async fn synthesize(&self, text: &str) -> Result<SynthAudio, SynthError> {
        let mut last_error = String::from("no synthesis tiers configured");
        for tier in &self.tiers {
            match tier.synthesize(text).await {
                Ok(audio) => return Ok(audio),
                Err(err) => {
                    warn!(tier = tier.label(), "synthesis tier failed: {err}");
                    last_error = err.to_string();
                }
            }
        }
        Err(SynthError::AllTiersFailed(last_error))
    }
}

/// Sample rate, channel count and estimated playback duration for an opaque
/// artifact. WAV is read from its header; MP3 is estimated from byte length
/// at the nominal bitrate.
pub fn probe_audio(bytes: &[u8], content_type: &str) -> (Option<u32>, Option<u16>, u64) {
    if content_type.eq_ignore_ascii_case("audio/wav")
        || content_type.eq_ignore_ascii_case("audio/x-wav")
    {
        if let Ok(reader) = hound::WavReader::new(Cursor::new(bytes)) {
            let spec = reader.spec();
            let frames = reader.duration() as u64;
            let duration_ms = frames * 1_000 / spec.sample_rate.max(1) as u64;
            return (Some(spec.sample_rate), Some(spec.channels), duration_ms);
        }
    }
    let duration_ms = bytes.len() as u64 * 8 * 1_000 / MP3_NOMINAL_BITRATE;
    (None, None, duration_ms)
}
