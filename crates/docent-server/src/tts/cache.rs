//! Content-addressed audio cache with per-key single-flight.
//!
//! Identical text must produce identical audio at near-zero cost the second
//! time: the greeting and the persona's stock phrases are synthesised many
//! times per hour and the upstream voice is rate-limited and expensive.
//! Storage is a flat directory keyed by the lowercase SHA-256 of the text;
//! writes go through a temp file and rename, so partial writes are never
//! observable. Concurrency control is strictly per key.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::synth::{probe_audio, SpeechSynthesizer, SynthError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioMeta {
    pub content_type: String,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub duration_ms: u64,
    pub tier: String,
}

#[derive(Debug, Clone)]
pub struct TtsArtifact {
    pub bytes: Arc<Vec<u8>>,
    pub meta: AudioMeta,
}

type Flight = Arc<OnceCell<Arc<TtsArtifact>>>;

pub struct TtsCache {
    dir: PathBuf,
    enabled: bool,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    synth_timeout: Duration,
    inflight: Mutex<HashMap<String, Flight>>,
}

impl TtsCache {
    pub fn new(
        dir: PathBuf,
        enabled: bool,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        synth_timeout: Duration,
    ) -> Self {
        Self {
            dir,
            enabled,
            synthesizer,
            synth_timeout,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache_key(text: &str) -> String {
        let digest = Sha256::digest(text.as_bytes());
        format!("{digest:x}")
    }

    /// Return cached audio, join an in-flight synthesis, or start one.
    /// The underlying synthesiser runs at most once per key at a time, and
    /// every waiter receives the same artifact.
    pub async fn get_or_synth(&self, text: &str) -> Result<Arc<TtsArtifact>, SynthError> {
        let key = Self::cache_key(text);

        if self.enabled {
            if let Some(artifact) = self.load(&key) {
                debug!(%key, "tts cache hit");
                return Ok(Arc::new(artifact));
            }
        }

        let cell = {
            let mut inflight = self.inflight.lock().unwrap();
            inflight
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = cell
            .get_or_try_init(|| self.synthesize_and_store(text, &key))
            .await
            .map(Arc::clone);

        let mut inflight = self.inflight.lock().unwrap();
        if let Some(existing) = inflight.get(&key) {
            if Arc::ptr_eq(existing, &cell) {
                inflight.remove(&key);
            }
        }

        result
    }

    /// Number of audio entries on disk.
    pub fn entry_count(&self) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return 0;
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                !name.ends_with(".json") && !name.ends_with(".tmp")
            })
            .count()
    }

    async fn synthesize_and_store(&self, text: &str, key: &str) -> Result<Arc<TtsArtifact>, SynthError> {
        let audio = tokio::time::timeout(self.synth_timeout, self.synthesizer.synthesize(text))
            .await
            .map_err(|_| SynthError::Timeout)??;

        let (sample_rate, channels, duration_ms) = probe_audio(&audio.bytes, &audio.content_type);
        let meta = AudioMeta {
            content_type: audio.content_type,
            sample_rate,
            channels,
            duration_ms,
            tier: audio.tier,
        };
        let artifact = Arc::new(TtsArtifact {
            bytes: Arc::new(audio.bytes),
            meta,
        });

        if self.enabled {
            let dir = self.dir.clone();
            let key = key.to_string();
            let to_store = artifact.clone();
            let stored = tokio::task::spawn_blocking(move || persist_atomic(&dir, &key, &to_store))
                .await
                .map_err(|err| SynthError::Storage(err.to_string()))?;
            if let Err(err) = stored {
                // Storage trouble must not cost the caller its audio.
                warn!("failed to persist tts artifact: {err:#}");
            }
        }

        Ok(artifact)
    }

    fn load(&self, key: &str) -> Option<TtsArtifact> {
        let meta_raw = std::fs::read(self.meta_path(key)).ok()?;
        let meta: AudioMeta = serde_json::from_slice(&meta_raw).ok()?;
        let bytes = std::fs::read(self.audio_path(key)).ok()?;
        Some(TtsArtifact {
            bytes: Arc::new(bytes),
            meta,
        })
    }

    fn audio_path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

fn persist_atomic(dir: &Path, key: &str, artifact: &TtsArtifact) -> anyhow::Result<()> {
    use anyhow::Context;

    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create tts cache directory: {}", dir.display()))?;

    let audio_path = dir.join(key);
    write_then_rename(dir, &audio_path, &artifact.bytes)?;

    let meta_path = dir.join(format!("{key}.json"));
    let meta_json = serde_json::to_vec(&artifact.meta).context("Failed to encode audio metadata")?;
    write_then_rename(dir, &meta_path, &meta_json)?;

    Ok(())
}

fn write_then_rename(dir: &Path, target: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    use anyhow::Context;

    let temp_path = dir.join(format!(
        "{}.{}.tmp",
        target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default(),
        uuid::Uuid::new_v4().simple()
    ));
    std::fs::write(&temp_path, bytes).with_context(|| {
        format!(
            "Failed writing cache file to temporary path: {}",
            temp_path.display()
        )
    })?;
    std::fs::rename(&temp_path, target).with_context(|| {
        format!(
            "Failed moving cache file from '{}' to '{}'",
            temp_path.display(),
            target.display()
        )
    })?;
    Ok(())
}
