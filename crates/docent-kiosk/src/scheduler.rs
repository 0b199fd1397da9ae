//! Playout scheduling against the learned clock offset.
//!
//! Receives control messages from the room datachannel, preloads images
//! ahead of their show instant, and fires the crossfade at the converted
//! local time. Shows may run up to the configured tolerance late; anything
//! later is dropped rather than displayed stale.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use docent_core::ControlMessage;

use crate::clock::ClockSync;
use crate::crossfade::{CrossfadeSurface, ImageHandle};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("image fetch failed: {0}")]
    Http(String),
    #[error("image fetch timed out")]
    Timeout,
}

/// Collaborator that turns a CDN url into image bytes. Injected so tests
/// and alternative hosts never touch the network.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, id: &str, cdn_url: &str) -> Result<ImageHandle, FetchError>;
}

pub struct HttpImageFetcher {
    client: reqwest::Client,
}

impl HttpImageFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpImageFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, id: &str, cdn_url: &str) -> Result<ImageHandle, FetchError> {
        let response = self
            .client
            .get(cdn_url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|err| FetchError::Http(err.to_string()))?
            .error_for_status()
            .map_err(|err| FetchError::Http(err.to_string()))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|err| FetchError::Http(err.to_string()))?;
        Ok(ImageHandle::new(id, bytes.to_vec()))
    }
}

#[derive(Debug, Clone)]
pub struct PlayoutConfig {
    /// How late a show may fire and still render, in milliseconds.
    pub late_tolerance_ms: i64,
    /// Crossfade duration used when a show message carries none.
    pub default_crossfade_ms: u64,
    /// Frame cadence for opacity interpolation.
    pub frame_interval: Duration,
    /// Rendered when a show arrives for an image that never preloaded or
    /// whose TTL expired.
    pub fallback_image: ImageHandle,
}

impl Default for PlayoutConfig {
    fn default() -> Self {
        Self {
            late_tolerance_ms: 100,
            default_crossfade_ms: 400,
            frame_interval: Duration::from_millis(16),
            fallback_image: ImageHandle::new("fallback", Vec::new()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlayoutStats {
    pub preloads_stored: u64,
    pub preload_failures: u64,
    pub shows_rendered: u64,
    pub shows_late: u64,
    pub shows_dropped: u64,
}

struct PreloadedImage {
    handle: ImageHandle,
    expires_at_ms: i64,
}

struct PlayoutState {
    sync: ClockSync,
    preloads: HashMap<String, PreloadedImage>,
    pending: HashMap<String, JoinHandle<()>>,
    surface: CrossfadeSurface,
    stats: PlayoutStats,
    fade_driver_running: bool,
}

impl PlayoutState {
    fn new() -> Self {
        Self {
            sync: ClockSync::new(),
            preloads: HashMap::new(),
            pending: HashMap::new(),
            surface: CrossfadeSurface::new(),
            stats: PlayoutStats::default(),
            fade_driver_running: false,
        }
    }
}

/// The client-side scheduler. Owns the clock sync, the preload store and
/// every armed timer; the session's client analogue owns the scheduler and
/// resets it on session end, which releases everything.
#[derive(Clone)]
pub struct PlayoutScheduler {
    state: Arc<Mutex<PlayoutState>>,
    fetcher: Arc<dyn ImageFetcher>,
    config: Arc<PlayoutConfig>,
}

impl PlayoutScheduler {
    pub fn new(fetcher: Arc<dyn ImageFetcher>, config: PlayoutConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(PlayoutState::new())),
            fetcher,
            config: Arc::new(config),
        }
    }

    /// Entry point for messages arriving off the room datachannel.
    pub async fn handle_message(&self, message: ControlMessage) {
        match message {
            ControlMessage::ImgPreload {
                id,
                cdn_url,
                playout_ts,
                ttl_ms,
            } => self.preload(&id, &cdn_url, playout_ts, ttl_ms).await,
            ControlMessage::ImgShow {
                id,
                playout_ts,
                duration_ms,
                ..
            } => self.schedule_show(&id, playout_ts, duration_ms),
            ControlMessage::EndOfStream { session_id } => {
                debug!(%session_id, "end of stream, resetting playout");
                self.reset();
            }
            ControlMessage::EndChat | ControlMessage::TimeTick { .. } => {}
        }
    }

    /// Fetch and store an image ahead of its show instant. Idempotent per
    /// id within one session.
    pub async fn preload(&self, id: &str, cdn_url: &str, playout_ts: i64, ttl_ms: u64) {
        {
            let mut state = self.state.lock().unwrap();
            state.sync.initialise(playout_ts);
            if state.preloads.contains_key(id) {
                debug!(%id, "image already preloaded, skipping");
                return;
            }
        }

        match self.fetcher.fetch(id, cdn_url).await {
            Ok(handle) => {
                let mut state = self.state.lock().unwrap();
                let expires_at_ms = state.sync.local_now_ms() + ttl_ms as i64;
                state.preloads.insert(
                    id.to_string(),
                    PreloadedImage {
                        handle,
                        expires_at_ms,
                    },
                );
                state.stats.preloads_stored += 1;
            }
            Err(err) => {
                let mut state = self.state.lock().unwrap();
                state.stats.preload_failures += 1;
                error!(%id, %cdn_url, "image preload failed: {err}");
            }
        }
    }

    /// Arm (or immediately fire) the show for a converted local instant.
    pub fn schedule_show(&self, id: &str, playout_ts: i64, duration_ms: u64) {
        let mut state = self.state.lock().unwrap();
        state.sync.initialise(playout_ts);

        let local_ts = match state.sync.convert(playout_ts) {
            Some(ts) => ts,
            None => return,
        };
        let delay = local_ts - state.sync.local_now_ms();

        if delay < -self.config.late_tolerance_ms {
            state.stats.shows_dropped += 1;
            warn!(%id, delay_ms = delay, "show arrived too late, skipping");
            return;
        }

        if delay <= 0 {
            state.stats.shows_late += 1;
            warn!(%id, delay_ms = delay, "show is late but within tolerance, rendering now");
            self.render_locked(&mut state, id, duration_ms);
            return;
        }

        if let Some(previous) = state.pending.remove(id) {
            previous.abort();
        }

        let scheduler = self.clone();
        let id_owned = id.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
            let mut state = scheduler.state.lock().unwrap();
            state.pending.remove(&id_owned);
            scheduler.render_locked(&mut state, &id_owned, duration_ms);
        });
        state.pending.insert(id.to_string(), task);
    }

    /// Swap in the preloaded image (or the fallback) on the idle buffer and
    /// run the timed crossfade.
    fn render_locked(&self, state: &mut PlayoutState, id: &str, duration_ms: u64) {
        let now = state.sync.local_now_ms();
        let handle = match state.preloads.get(id) {
            Some(preloaded) if preloaded.expires_at_ms > now => preloaded.handle.clone(),
            Some(_) => {
                warn!(%id, "preloaded image expired, rendering fallback");
                self.config.fallback_image.clone()
            }
            None => {
                warn!(%id, "no preloaded image, rendering fallback");
                self.config.fallback_image.clone()
            }
        };

        let duration = if duration_ms == 0 {
            self.config.default_crossfade_ms
        } else {
            duration_ms
        };
        state.surface.begin(handle, duration, now);
        state.stats.shows_rendered += 1;
        self.ensure_fade_driver(state);
    }

    fn ensure_fade_driver(&self, state: &mut PlayoutState) {
        if state.fade_driver_running {
            return;
        }
        state.fade_driver_running = true;

        let scheduler = self.clone();
        let frame = self.config.frame_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(frame).await;
                let mut state = scheduler.state.lock().unwrap();
                let now = state.sync.local_now_ms();
                if !state.surface.tick(now) {
                    state.fade_driver_running = false;
                    break;
                }
            }
        });
    }

    /// Clear the offset, cancel every pending timer and empty both stores.
    /// Invoked on session end or explicit restart.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        for (_, task) in state.pending.drain() {
            task.abort();
        }
        state.preloads.clear();
        state.sync = ClockSync::new();
        state.surface = CrossfadeSurface::new();
        state.fade_driver_running = false;
    }

    pub fn stats(&self) -> PlayoutStats {
        self.state.lock().unwrap().stats
    }

    pub fn is_synced(&self) -> bool {
        self.state.lock().unwrap().sync.is_initialised()
    }

    pub fn visible_image(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .surface
            .visible_id()
            .map(str::to_string)
    }

    pub fn pending_shows(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    pub fn preloaded_ids(&self) -> Vec<String> {
        self.state.lock().unwrap().preloads.keys().cloned().collect()
    }
}
