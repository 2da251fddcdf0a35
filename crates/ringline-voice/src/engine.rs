//! **Conversation Engine** — the recognize → decide → speak turn loop.
//!
//! Accumulates recognized speech until an end-of-utterance signal (explicit
//! marker, barge-in, or a silence gap), asks the language model for a reply
//! built from the utterance plus a bounded recent-turns window and the
//! campaign script, scans both sides against the transfer triggers, and
//! synthesizes the reply. A per-turn latency budget applies: a slow
//! language-model or synthesis call falls back to a precomputed filler
//! utterance rather than leaving dead air.
//!
//! Turn sequence numbers are monotonic with no gaps and every turn is
//! persisted append-only before the reply is spoken, so replay reconstructs
//! exactly what the caller heard.

use crate::language::{LanguageBackend, LmRequest, LmResponse};
use crate::recognize::TranscriptEvent;
use crate::relay::AudioFrame;
use crate::synthesize::SynthesisBackend;
use crate::triggers::TransferTriggers;
use chrono::Utc;
use ringline_core::{CallStore, ConversationTurn, RinglineConfig, RinglineResult, Speaker};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, OnceCell};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Why the turn loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineOutcome {
    /// A transfer trigger fired; the state machine should begin transferring.
    Transfer,
    /// Conversation ended normally (caller gone, stream closed, or campaign
    /// stop observed at a turn boundary).
    Completed,
    /// The language service failed repeatedly; the call should fail.
    ServiceFailure,
}

/// Turn-loop policy, lifted from the core config.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Silence gap that commits an utterance when no explicit marker arrives.
    pub utterance_gap: Duration,
    /// Total caller silence that ends the conversation. Keeps an abandoned
    /// handset from holding the call open until the overall deadline.
    pub silence_timeout: Duration,
    /// Budget for language-model plus synthesis work per turn.
    pub turn_budget: Duration,
    /// Prior turns kept in memory for prompt construction.
    pub recent_turns_window: usize,
    /// Fallback utterances, rotated on each latency breach.
    pub fillers: Vec<String>,
    /// Consecutive language failures tolerated before giving up on the call.
    pub max_service_retries: u32,
}

impl EngineConfig {
    pub fn from_core(cfg: &RinglineConfig) -> Self {
        Self {
            utterance_gap: cfg.utterance_gap(),
            silence_timeout: cfg.silence_timeout(),
            turn_budget: cfg.turn_budget(),
            recent_turns_window: cfg.recent_turns_window,
            fillers: cfg.filler_utterances.clone(),
            max_service_retries: cfg.max_service_retries,
        }
    }
}

/// Per-call conversation driver. One instance is shared across calls; all
/// per-call state lives in `run`'s locals.
pub struct ConversationEngine {
    language: Arc<dyn LanguageBackend>,
    synthesis: Arc<dyn SynthesisBackend>,
    triggers: TransferTriggers,
    store: Arc<dyn CallStore>,
    config: EngineConfig,
    /// Filler utterances synthesized once, outside any per-turn budget, so a
    /// slow or failing synthesis call can still be answered from cache.
    filler_audio: OnceCell<Vec<(String, Vec<AudioFrame>)>>,
}

impl ConversationEngine {
    pub fn new(
        language: Arc<dyn LanguageBackend>,
        synthesis: Arc<dyn SynthesisBackend>,
        triggers: TransferTriggers,
        store: Arc<dyn CallStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            language,
            synthesis,
            triggers,
            store,
            config,
            filler_audio: OnceCell::new(),
        }
    }

    /// Runs the turn loop for one call until a terminal trigger.
    ///
    /// `cancel` is observed at turn boundaries only, so an operator stop never
    /// cuts audio mid-sentence.
    pub async fn run(
        &self,
        call: Uuid,
        script_context: &str,
        mut transcripts: mpsc::Receiver<TranscriptEvent>,
        synth_out: mpsc::Sender<AudioFrame>,
        cancel: watch::Receiver<bool>,
    ) -> RinglineResult<EngineOutcome> {
        let mut seq: u64 = 0;
        let mut history: VecDeque<ConversationTurn> = VecDeque::new();
        let mut filler_idx = 0usize;
        let mut language_failures = 0u32;

        // Warm the filler cache before the first turn can need it.
        self.warm_filler_audio().await;

        loop {
            if *cancel.borrow() {
                info!(%call, "campaign stop observed at turn boundary");
                return Ok(EngineOutcome::Completed);
            }

            let utterance = match self
                .collect_utterance(call, &mut transcripts, cancel.clone())
                .await
            {
                Some(text) => text,
                None => {
                    info!(%call, "caller input ended, conversation complete");
                    return Ok(EngineOutcome::Completed);
                }
            };
            if utterance.trim().is_empty() {
                continue;
            }

            self.persist_turn(call, &mut seq, &mut history, Speaker::Caller, &utterance)
                .await?;

            if self.triggers.match_text(&utterance).is_some() {
                info!(%call, "caller requested transfer");
                return Ok(EngineOutcome::Transfer);
            }

            let request = LmRequest {
                utterance: utterance.clone(),
                history: history.iter().cloned().collect(),
                script_context: script_context.to_string(),
            };

            let response = match timeout(self.config.turn_budget, self.language.complete(&request))
                .await
            {
                Ok(Ok(response)) => {
                    language_failures = 0;
                    response
                }
                Ok(Err(e)) => {
                    language_failures += 1;
                    warn!(%call, attempts = language_failures, "language model failed: {e}");
                    if language_failures >= self.config.max_service_retries {
                        return Ok(EngineOutcome::ServiceFailure);
                    }
                    self.filler(&mut filler_idx)
                }
                Err(_) => {
                    warn!(%call, budget_ms = self.config.turn_budget.as_millis() as u64,
                        "latency_breach: language model over per-turn budget, using filler");
                    self.filler(&mut filler_idx)
                }
            };

            let transfer = self.triggers.match_text(&response.text).is_some()
                || self.triggers.match_intents(&response.intents).is_some();

            // What actually gets spoken; swapped for a filler on a synthesis
            // breach so the persisted turn matches the audio.
            let mut spoken = response.text.clone();
            let frames = match timeout(
                self.config.turn_budget,
                self.synthesis.synthesize(&response.text),
            )
            .await
            {
                Ok(Ok(frames)) => frames,
                Ok(Err(e)) => {
                    warn!(%call, "synthesis failed, speaking filler: {e}");
                    self.cached_filler(&mut filler_idx, &mut spoken)
                }
                Err(_) => {
                    warn!(%call, "latency_breach: synthesis over per-turn budget, speaking filler");
                    self.cached_filler(&mut filler_idx, &mut spoken)
                }
            };

            self.persist_turn(call, &mut seq, &mut history, Speaker::Assistant, &spoken)
                .await?;
            for frame in frames {
                if synth_out.send(frame).await.is_err() {
                    info!(%call, "outbound audio closed, ending conversation");
                    return Ok(EngineOutcome::Completed);
                }
            }

            if transfer {
                return Ok(EngineOutcome::Transfer);
            }
        }
    }

    /// Accumulates transcript events into one utterance. Commits on an
    /// explicit end-of-utterance marker, a barge-in, or the configured silence
    /// gap once some text has arrived. Returns `None` when the stream closes
    /// with nothing pending, or when the caller stays silent past the silence
    /// timeout.
    async fn collect_utterance(
        &self,
        call: Uuid,
        transcripts: &mut mpsc::Receiver<TranscriptEvent>,
        mut cancel: watch::Receiver<bool>,
    ) -> Option<String> {
        let mut pending = String::new();
        let mut cancel_open = true;

        loop {
            let event = if pending.trim().is_empty() {
                tokio::select! {
                    changed = cancel.changed(), if cancel_open => {
                        match changed {
                            Ok(()) if *cancel.borrow() => return None,
                            Ok(()) => {}
                            // Operator side gone; only transcripts matter now.
                            Err(_) => cancel_open = false,
                        }
                        continue;
                    }
                    recv = timeout(self.config.silence_timeout, transcripts.recv()) => {
                        match recv {
                            Err(_) => {
                                warn!(%call,
                                    silence_s = self.config.silence_timeout.as_secs(),
                                    "caller silent past the silence timeout");
                                return None;
                            }
                            Ok(event) => event?,
                        }
                    }
                }
            } else {
                match timeout(self.config.utterance_gap, transcripts.recv()).await {
                    // Gap elapsed with text pending: that is the utterance.
                    Err(_) => return Some(pending),
                    Ok(Some(event)) => event,
                    Ok(None) => return Some(pending),
                }
            };

            match event {
                TranscriptEvent::Interim(text) => {
                    debug!(interim = %text, "interim transcript");
                }
                TranscriptEvent::Final(text) => {
                    if !pending.is_empty() {
                        pending.push(' ');
                    }
                    pending.push_str(text.trim());
                }
                TranscriptEvent::EndOfUtterance | TranscriptEvent::BargeIn => {
                    if !pending.trim().is_empty() {
                        return Some(pending);
                    }
                }
            }
        }
    }

    /// Appends a turn durably and to the in-memory prompt window. `seq` is
    /// the authoritative counter; it only ever moves forward by one.
    async fn persist_turn(
        &self,
        call: Uuid,
        seq: &mut u64,
        history: &mut VecDeque<ConversationTurn>,
        speaker: Speaker,
        text: &str,
    ) -> RinglineResult<()> {
        let turn = ConversationTurn {
            call,
            seq: *seq,
            speaker,
            text: text.to_string(),
            timestamp: Utc::now(),
        };
        self.store.append_turn(&turn).await?;
        *seq += 1;

        history.push_back(turn);
        while history.len() > self.config.recent_turns_window {
            history.pop_front();
        }
        Ok(())
    }

    /// Synthesizes the configured fillers once per process. Failures are
    /// logged and skipped; the cache keeps whatever succeeded.
    async fn warm_filler_audio(&self) {
        self.filler_audio
            .get_or_init(|| async {
                let mut cache = Vec::new();
                for text in &self.config.fillers {
                    match self.synthesis.synthesize(text).await {
                        Ok(frames) => cache.push((text.clone(), frames)),
                        Err(e) => warn!(filler = %text, "filler pre-synthesis failed: {e}"),
                    }
                }
                cache
            })
            .await;
    }

    /// Pulls the next precomputed filler, rewriting `spoken` to its text.
    /// Empty when no filler could be pre-synthesized.
    fn cached_filler(&self, idx: &mut usize, spoken: &mut String) -> Vec<AudioFrame> {
        match self.filler_audio.get().filter(|cache| !cache.is_empty()) {
            Some(cache) => {
                let (text, frames) = &cache[*idx % cache.len()];
                *idx += 1;
                spoken.clone_from(text);
                frames.clone()
            }
            None => Vec::new(),
        }
    }

    fn filler(&self, idx: &mut usize) -> LmResponse {
        let text = if self.config.fillers.is_empty() {
            "One moment please.".to_string()
        } else {
            let text = self.config.fillers[*idx % self.config.fillers.len()].clone();
            *idx += 1;
            text
        };
        LmResponse {
            text,
            intents: Vec::new(),
        }
    }
}
