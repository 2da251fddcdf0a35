//! # Ringline Voice — per-call media relay and conversation engine
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                        Media Relay                             │
//! │  telephony leg ──frames──▶ recognizer ──transcripts──▶ engine  │
//! │  telephony leg ◀─frames── synthesizer ◀───reply text── engine  │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The relay buffers a bounded number of frames per direction and drops the
//! oldest under backpressure. The engine runs the turn loop with a per-turn
//! latency budget and transfer-trigger detection.

pub mod engine;
pub mod language;
pub mod recognize;
pub mod relay;
pub mod synthesize;
pub mod triggers;

pub use engine::{ConversationEngine, EngineConfig, EngineOutcome};
pub use language::{
    extract_intents, HttpLanguage, LanguageBackend, LmRequest, LmResponse, PlaceholderLanguage,
};
pub use recognize::{HttpRecognizer, RecognizerBackend, ScriptedRecognizer, TranscriptEvent};
pub use relay::{spawn_relay, AudioFrame, FrameBuffer, MediaRelayHandle, FRAME_SAMPLES};
pub use synthesize::{pcm16_to_frames, HttpSynthesis, PlaceholderSynthesis, SynthesisBackend};
pub use triggers::TransferTriggers;
