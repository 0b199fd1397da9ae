//! Text-to-speech: tiered synthesis behind a content-addressed cache.

pub mod cache;
pub mod synth;

pub use cache::{TtsArtifact, TtsCache};
pub use synth::{
    probe_audio, HttpVoiceTier, SineTier, SpeechSynthesizer, SynthAudio, SynthError,
    TieredSynthesizer,
};
