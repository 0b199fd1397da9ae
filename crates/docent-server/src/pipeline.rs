//! The per-turn conversation pipeline.
//!
//! One user message fans out into the LLM call, a cache-backed TTS
//! synthesis, and a set of time-offset control messages armed against the
//! shared timeline anchor. Audio returns in the HTTP response; visuals
//! travel the datachannel on their own schedule. A single transient failure
//! never ends the session: LLM trouble drops the turn, TTS trouble drops
//! the audio, an unresolvable image downgrades to a fallback descriptor.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{debug, warn};

use docent_core::{parse_llm_reply, ChatTurn, ControlMessage, TimelineAction, Transition};

use crate::llm::LlmError;
use crate::state::AppState;
use crate::tts::TtsArtifact;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("session not found")]
    SessionNotFound,
    #[error(transparent)]
    Llm(#[from] LlmError),
}

#[derive(Debug)]
pub struct TurnOutcome {
    pub assistant_text: String,
    pub audio: Option<Arc<TtsArtifact>>,
    pub images_scheduled: usize,
    pub end_chat: bool,
    pub tts_error: bool,
}

/// Run one conversation turn. Turns on the same session are serialised on
/// the session's turn gate; turns on distinct sessions are independent.
pub async fn converse(
    state: &AppState,
    session_id: &str,
    message: &str,
) -> Result<TurnOutcome, PipelineError> {
    let slot = state
        .registry
        .slot(session_id)
        .ok_or(PipelineError::SessionNotFound)?;
    if !slot.is_active() {
        return Err(PipelineError::SessionNotFound);
    }

    let _turn = slot.turn_gate.lock().await;
    // The session may have ended while this turn queued behind another.
    if !slot.is_active() {
        return Err(PipelineError::SessionNotFound);
    }

    state.registry.refresh(session_id);
    let room_name = slot.room_name();

    slot.append_history(ChatTurn::user(message));
    let history = slot.history_snapshot();

    let raw_reply = tokio::time::timeout(
        state.config.llm_timeout,
        state.llm.respond(session_id, &history, message),
    )
    .await
    .map_err(|_| PipelineError::Llm(LlmError::Timeout))??;

    let reply = parse_llm_reply(&raw_reply);
    let assistant_text = reply.speech().to_string();
    slot.append_history(ChatTurn::assistant(assistant_text.clone()));

    let (audio, tts_error) = match tokio::time::timeout(
        state.config.tts_timeout,
        state.tts.get_or_synth(&assistant_text),
    )
    .await
    {
        Ok(Ok(artifact)) => (Some(artifact), false),
        Ok(Err(err)) => {
            warn!(%session_id, "tts failed, returning silent turn: {err}");
            (None, true)
        }
        Err(_) => {
            warn!(%session_id, "tts timed out, returning silent turn");
            (None, true)
        }
    };

    // Anchor the timeline: a small pre-roll absorbs the HTTP round-trip,
    // audio decode and client scheduling cost.
    let now = now_ms();
    let speech_start_ts = now + state.config.anchor_lead_ms as i64;

    let mut images_scheduled = 0;
    for event in reply.timeline() {
        let TimelineAction::PreloadImage(image) = &event.action;
        let resolution = state.catalog.resolve(image);
        if !resolution.matched {
            warn!(%session_id, requested = %image.id, "image unresolved, dispatching fallback descriptor");
        }
        let descriptor = resolution.descriptor;

        let show_at = speech_start_ts + event.time_offset_ms as i64;
        let preload_at = (show_at - state.config.preload_lead_ms as i64).max(now);

        state.router.schedule(
            &room_name,
            ControlMessage::ImgPreload {
                id: descriptor.id.clone(),
                cdn_url: descriptor.cdn_url.clone(),
                playout_ts: preload_at,
                ttl_ms: state.config.preload_ttl_ms,
            },
            preload_at,
        );
        state.router.schedule(
            &room_name,
            ControlMessage::ImgShow {
                id: descriptor.id,
                playout_ts: show_at,
                transition: Transition::Crossfade,
                duration_ms: state.config.show_crossfade_ms,
                caption: Some(descriptor.title),
            },
            show_at,
        );
        images_scheduled += 1;
    }

    if reply.end_chat() {
        let speech_ms = audio
            .as_ref()
            .map(|artifact| artifact.meta.duration_ms)
            .unwrap_or_else(|| estimate_speech_ms(&assistant_text));
        let end_at = speech_start_ts + speech_ms as i64;
        debug!(%session_id, end_at, "scheduling end_chat at speech end");
        state
            .router
            .schedule(&room_name, ControlMessage::EndChat, end_at);
    }

    Ok(TurnOutcome {
        assistant_text,
        audio,
        images_scheduled,
        end_chat: reply.end_chat(),
        tts_error,
    })
}

/// Rough speaking-time estimate used when no audio artifact exists.
fn estimate_speech_ms(text: &str) -> u64 {
    (text.chars().count() as u64 * 55).clamp(400, 8_000)
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogHandle;
    use crate::config::ServerConfig;
    use crate::datachannel::DatachannelRouter;
    use crate::llm::LlmBackend;
    use crate::sessions::{EndReason, SessionRegistry};
    use crate::transport::LocalRoomHub;
    use crate::tts::{SpeechSynthesizer, SynthAudio, SynthError, TtsCache};
    use async_trait::async_trait;
    use docent_core::ChatRole;
    use std::io::Write;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const CATALOG_DOC: &str = r#"{
        "collections": {
            "architecture": [
                {"id": "parthenon", "title": "The Parthenon", "cdn_url": "https://cdn.example/parthenon.jpg", "keywords": ["temple", "athens"]},
                {"id": "colosseum", "title": "The Colosseum", "cdn_url": "https://cdn.example/colosseum.jpg", "keywords": ["rome", "arena"]}
            ]
        }
    }"#;

    struct StubLlm {
        reply: Mutex<Result<String, ()>>,
        delay: Duration,
    }

    impl StubLlm {
        fn returning(reply: &str) -> Self {
            Self {
                reply: Mutex::new(Ok(reply.to_string())),
                delay: Duration::ZERO,
            }
        }

        fn failing() -> Self {
            Self {
                reply: Mutex::new(Err(())),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl LlmBackend for StubLlm {
        async fn respond(
            &self,
            _session_id: &str,
            _history: &[ChatTurn],
            _message: &str,
        ) -> Result<String, LlmError> {
            tokio::time::sleep(self.delay).await;
            self.reply
                .lock()
                .unwrap()
                .clone()
                .map_err(|_| LlmError::Unreachable("stub upstream down".into()))
        }
    }

    struct CountingSynth {
        calls: Arc<AtomicU64>,
        fail: bool,
    }

    #[async_trait]
    impl SpeechSynthesizer for CountingSynth {
        fn label(&self) -> &str {
            "counting"
        }

        async fn synthesize(&self, text: &str) -> Result<SynthAudio, SynthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SynthError::Tier("stub voice down".into()));
            }
            Ok(SynthAudio {
                bytes: format!("audio:{text}").into_bytes(),
                content_type: "audio/mpeg".into(),
                tier: "counting".into(),
            })
        }
    }

    struct Harness {
        state: AppState,
        hub: Arc<LocalRoomHub>,
        synth_calls: Arc<AtomicU64>,
        _cache_dir: tempfile::TempDir,
        _catalog_file: tempfile::NamedTempFile,
    }

    fn harness(llm: Arc<dyn LlmBackend>, synth_fails: bool) -> Harness {
        let config = Arc::new(ServerConfig {
            session_idle_timeout: Duration::from_secs(600),
            session_duration_s: 300,
            anchor_lead_ms: 50,
            preload_lead_ms: 80,
            llm_timeout: Duration::from_secs(2),
            tts_timeout: Duration::from_secs(2),
            ..ServerConfig::default()
        });

        let hub = Arc::new(LocalRoomHub::new("ws://local"));
        let router = Arc::new(DatachannelRouter::new(hub.clone()));
        let registry = Arc::new(SessionRegistry::new(
            config.clone(),
            hub.clone(),
            router.clone(),
        ));

        let synth_calls = Arc::new(AtomicU64::new(0));
        let cache_dir = tempfile::tempdir().unwrap();
        let tts = Arc::new(TtsCache::new(
            cache_dir.path().to_path_buf(),
            true,
            Arc::new(CountingSynth {
                calls: synth_calls.clone(),
                fail: synth_fails,
            }),
            Duration::from_secs(2),
        ));

        let mut catalog_file = tempfile::NamedTempFile::new().unwrap();
        catalog_file.write_all(CATALOG_DOC.as_bytes()).unwrap();
        catalog_file.flush().unwrap();
        let catalog = Arc::new(CatalogHandle::load(catalog_file.path().to_path_buf()).unwrap());

        let state = AppState::new(config, registry, router, llm, tts, catalog);
        Harness {
            state,
            hub,
            synth_calls,
            _cache_dir: cache_dir,
            _catalog_file: catalog_file,
        }
    }

    async fn start_session(harness: &Harness) -> (String, mpsc::UnboundedReceiver<Vec<u8>>) {
        let created = harness.state.registry.create("kiosk-1").await.unwrap();
        let rx = harness.hub.subscribe(&created.grant.room_name).unwrap();
        (created.session_id, rx)
    }

    async fn recv_message(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> ControlMessage {
        let payload = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for control message")
            .expect("room channel closed");
        ControlMessage::from_json_bytes(&payload).unwrap()
    }

    const PARTHENON_REPLY: &str = r#"{"speech_response":"The Parthenon crowns the Acropolis of Athens.","timeline_events":[{"time_offset_ms":100,"action":{"type":"PRELOAD_IMAGE","payload":{"id":"parthenon"}}}],"end_chat":false}"#;

    #[tokio::test]
    async fn cold_turn_returns_audio_and_schedules_one_preload_and_one_show() {
        let h = harness(Arc::new(StubLlm::returning(PARTHENON_REPLY)), false);
        let (session_id, mut rx) = start_session(&h).await;

        let before = now_ms();
        let outcome = converse(&h.state, &session_id, "Tell me about the Parthenon")
            .await
            .unwrap();

        assert_eq!(
            outcome.assistant_text,
            "The Parthenon crowns the Acropolis of Athens."
        );
        assert!(outcome.audio.is_some());
        assert!(!outcome.audio.as_ref().unwrap().bytes.is_empty());
        assert_eq!(outcome.images_scheduled, 1);
        assert!(!outcome.end_chat);
        assert!(!outcome.tts_error);
        assert_eq!(h.state.tts.entry_count(), 1);

        let preload = recv_message(&mut rx).await;
        let show = recv_message(&mut rx).await;
        match preload {
            ControlMessage::ImgPreload { ref id, .. } => assert_eq!(id, "parthenon"),
            other => panic!("expected img_preload first, got {other:?}"),
        }
        match show {
            ControlMessage::ImgShow { ref id, playout_ts, .. } => {
                assert_eq!(id, "parthenon");
                // show_at = anchor (now + 50) + offset (100)
                let expected = before + 50 + 100;
                assert!((playout_ts - expected).abs() < 500, "playout_ts drifted: {playout_ts} vs {expected}");
            }
            other => panic!("expected img_show second, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn warm_turn_skips_synthesis_and_returns_identical_audio() {
        let h = harness(Arc::new(StubLlm::returning(PARTHENON_REPLY)), false);
        let (session_id, _rx) = start_session(&h).await;

        let cold = converse(&h.state, &session_id, "Tell me about the Parthenon")
            .await
            .unwrap();
        let warm = converse(&h.state, &session_id, "Tell me again")
            .await
            .unwrap();

        assert_eq!(h.synth_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            cold.audio.unwrap().bytes,
            warm.audio.unwrap().bytes
        );
        assert_eq!(h.state.tts.entry_count(), 1);
    }

    #[tokio::test]
    async fn fenced_end_chat_reply_schedules_the_end_chat_message() {
        let raw = "```json\n{\"speech_response\":\"Hi\",\"timeline_events\":[],\"end_chat\":true}\n```";
        let h = harness(Arc::new(StubLlm::returning(raw)), false);
        let (session_id, mut rx) = start_session(&h).await;

        let outcome = converse(&h.state, &session_id, "bye").await.unwrap();
        assert!(outcome.end_chat);
        assert_eq!(outcome.assistant_text, "Hi");

        let message = recv_message(&mut rx).await;
        assert_eq!(message, ControlMessage::EndChat);
    }

    #[tokio::test]
    async fn tts_failure_returns_silent_turn_with_visuals_still_scheduled() {
        let h = harness(Arc::new(StubLlm::returning(PARTHENON_REPLY)), true);
        let (session_id, mut rx) = start_session(&h).await;

        let outcome = converse(&h.state, &session_id, "Tell me about the Parthenon")
            .await
            .unwrap();
        assert!(outcome.tts_error);
        assert!(outcome.audio.is_none());
        assert_eq!(outcome.images_scheduled, 1);

        assert!(matches!(
            recv_message(&mut rx).await,
            ControlMessage::ImgPreload { .. }
        ));
        assert!(matches!(
            recv_message(&mut rx).await,
            ControlMessage::ImgShow { .. }
        ));

        let session = h.state.registry.lookup(&session_id).unwrap();
        assert_eq!(session.state, crate::sessions::SessionState::Active);
    }

    #[tokio::test]
    async fn unresolved_image_dispatches_a_fallback_descriptor() {
        let raw = r#"{"speech_response":"Look at this.","timeline_events":[{"time_offset_ms":100,"action":{"type":"PRELOAD_IMAGE","payload":{"id":"zzzz-unknown-zzzz"}}}],"end_chat":false}"#;
        let h = harness(Arc::new(StubLlm::returning(raw)), false);
        let (session_id, mut rx) = start_session(&h).await;

        let outcome = converse(&h.state, &session_id, "show me").await.unwrap();
        assert_eq!(outcome.images_scheduled, 1);

        match recv_message(&mut rx).await {
            ControlMessage::ImgPreload { id, .. } => {
                assert!(["parthenon", "colosseum"].contains(&id.as_str()));
            }
            other => panic!("expected img_preload, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn llm_failure_drops_the_turn_but_keeps_the_session() {
        let h = harness(Arc::new(StubLlm::failing()), false);
        let (session_id, _rx) = start_session(&h).await;

        let err = converse(&h.state, &session_id, "hello").await.unwrap_err();
        assert!(matches!(err, PipelineError::Llm(_)));

        let session = h.state.registry.lookup(&session_id).unwrap();
        assert_eq!(session.state, crate::sessions::SessionState::Active);
    }

    #[tokio::test]
    async fn unknown_session_fails_before_touching_the_model() {
        let h = harness(Arc::new(StubLlm::returning(PARTHENON_REPLY)), false);
        let err = converse(&h.state, "sess_missing", "hello").await.unwrap_err();
        assert!(matches!(err, PipelineError::SessionNotFound));
    }

    #[tokio::test]
    async fn ended_session_rejects_further_turns() {
        let h = harness(Arc::new(StubLlm::returning(PARTHENON_REPLY)), false);
        let (session_id, _rx) = start_session(&h).await;
        h.state.registry.end(&session_id, EndReason::Manual).await;

        let err = converse(&h.state, &session_id, "hello").await.unwrap_err();
        assert!(matches!(err, PipelineError::SessionNotFound));
    }

    #[tokio::test]
    async fn history_grows_by_exactly_user_and_assistant_per_turn() {
        let h = harness(Arc::new(StubLlm::returning(PARTHENON_REPLY)), false);
        let (session_id, _rx) = start_session(&h).await;
        let slot = h.state.registry.slot(&session_id).unwrap();
        assert_eq!(slot.history_snapshot().len(), 1);

        converse(&h.state, &session_id, "first question").await.unwrap();

        let history = slot.history_snapshot();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].role, ChatRole::System);
        assert_eq!(history[1].role, ChatRole::User);
        assert_eq!(history[1].content, "first question");
        assert_eq!(history[2].role, ChatRole::Assistant);
        assert_eq!(
            history[2].content,
            "The Parthenon crowns the Acropolis of Athens."
        );
    }

    #[tokio::test]
    async fn scheduled_visuals_drive_the_kiosk_playout_end_to_end() {
        use docent_kiosk::{
            FetchError, ImageFetcher, ImageHandle, PlayoutConfig, PlayoutScheduler,
        };

        struct StubFetcher;

        #[async_trait]
        impl ImageFetcher for StubFetcher {
            async fn fetch(&self, id: &str, _cdn_url: &str) -> Result<ImageHandle, FetchError> {
                Ok(ImageHandle::new(id, vec![0xFF]))
            }
        }

        let h = harness(Arc::new(StubLlm::returning(PARTHENON_REPLY)), false);
        let (session_id, mut rx) = start_session(&h).await;

        let playout = PlayoutScheduler::new(Arc::new(StubFetcher), PlayoutConfig::default());
        let pump = {
            let playout = playout.clone();
            tokio::spawn(async move {
                while let Some(payload) = rx.recv().await {
                    if let Ok(message) = ControlMessage::from_json_bytes(&payload) {
                        playout.handle_message(message).await;
                    }
                }
            })
        };

        converse(&h.state, &session_id, "Tell me about the Parthenon")
            .await
            .unwrap();

        // anchor (50ms) + offset (100ms) + fade, with margin.
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(playout.visible_image(), Some("parthenon".to_string()));
        assert_eq!(playout.stats().shows_dropped, 0);
        pump.abort();
    }

    #[tokio::test]
    async fn concurrent_turns_on_one_session_never_interleave_history() {
        let llm = Arc::new(StubLlm {
            reply: Mutex::new(Ok(PARTHENON_REPLY.to_string())),
            delay: Duration::from_millis(50),
        });
        let h = harness(llm, false);
        let (session_id, _rx) = start_session(&h).await;

        let first = {
            let state = h.state.clone();
            let id = session_id.clone();
            tokio::spawn(async move { converse(&state, &id, "one").await })
        };
        let second = {
            let state = h.state.clone();
            let id = session_id.clone();
            tokio::spawn(async move { converse(&state, &id, "two").await })
        };
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        let history = h.state.registry.slot(&session_id).unwrap().history_snapshot();
        assert_eq!(history.len(), 5);
        let roles: Vec<ChatRole> = history.iter().map(|turn| turn.role).collect();
        assert_eq!(
            roles,
            vec![
                ChatRole::System,
                ChatRole::User,
                ChatRole::Assistant,
                ChatRole::User,
                ChatRole::Assistant,
            ]
        );
    }
}
