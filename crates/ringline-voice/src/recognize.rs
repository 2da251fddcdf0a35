//! **Speech recognition** — streaming audio in, transcript events out.
//!
//! Implement `RecognizerBackend` for the recognition service in use. The
//! engine only depends on the event stream: interim/final text plus an
//! end-of-utterance marker. `HttpRecognizer` batches one utterance at a time
//! (energy-gap endpointing, WAV upload to an OpenAI-compatible transcription
//! API); `ScriptedRecognizer` drives tests.

use crate::relay::AudioFrame;
use async_trait::async_trait;
use ringline_core::{RinglineError, RinglineResult};
use std::io::Write;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Events emitted by a recognition stream.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptEvent {
    /// Partial hypothesis; may be revised.
    Interim(String),
    /// Finalized text for the current utterance segment.
    Final(String),
    /// The caller stopped talking; the utterance is complete.
    EndOfUtterance,
    /// The caller started talking over assistant audio.
    BargeIn,
}

/// Streaming recognition backend for one call leg.
#[async_trait]
pub trait RecognizerBackend: Send + Sync {
    /// Consume `audio` until it closes, emitting transcript events on `events`.
    /// Returning closes the recognition stream for the call.
    async fn run_stream(
        &self,
        audio: mpsc::Receiver<AudioFrame>,
        events: mpsc::Sender<TranscriptEvent>,
    ) -> RinglineResult<()>;
}

/// Encode f32 PCM (mono) to 16-bit WAV bytes for API upload.
fn pcm_f32_to_wav(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    let num_samples = samples.len();
    let data_len = num_samples * 2; // 16-bit = 2 bytes per sample
    let header_len = 44u32;
    let file_len = header_len + data_len as u32;

    let mut buf = Vec::with_capacity(44 + data_len);
    // RIFF header
    buf.write_all(b"RIFF").unwrap();
    buf.write_all(&(file_len - 8).to_le_bytes()).unwrap();
    buf.write_all(b"WAVE").unwrap();
    // fmt subchunk
    buf.write_all(b"fmt ").unwrap();
    buf.write_all(&16u32.to_le_bytes()).unwrap();
    buf.write_all(&1u16.to_le_bytes()).unwrap(); // PCM
    buf.write_all(&1u16.to_le_bytes()).unwrap(); // mono
    buf.write_all(&sample_rate.to_le_bytes()).unwrap();
    buf.write_all(&(sample_rate * 2).to_le_bytes()).unwrap(); // byte rate
    buf.write_all(&2u16.to_le_bytes()).unwrap(); // block align
    buf.write_all(&16u16.to_le_bytes()).unwrap(); // bits per sample
    // data subchunk
    buf.write_all(b"data").unwrap();
    buf.write_all(&(data_len as u32).to_le_bytes()).unwrap();
    for &s in samples {
        let clamped = s.clamp(-1.0, 1.0);
        let i = (clamped * 32767.0).round() as i16;
        buf.write_all(&i.to_le_bytes()).unwrap();
    }
    buf
}

fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// Production recognizer: energy-gap endpointing over the frame stream, then
/// one WAV upload per utterance to an OpenAI-compatible transcription API.
/// Env: `RINGLINE_STT_URL` (base, default https://api.openai.com/v1),
/// `RINGLINE_STT_KEY`, `RINGLINE_STT_MODEL` (default whisper-1).
pub struct HttpRecognizer {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    /// Frames of trailing silence that close an utterance (default 40 = 800ms).
    pub gap_frames: usize,
    /// RMS above this counts as speech.
    pub energy_threshold: f32,
    pub sample_rate: u32,
    client: reqwest::Client,
}

impl HttpRecognizer {
    pub fn from_env() -> RinglineResult<Self> {
        let base_url = std::env::var("RINGLINE_STT_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let api_key = std::env::var("RINGLINE_STT_KEY")
            .map_err(|_| RinglineError::Config("RINGLINE_STT_KEY not set".to_string()))?;
        let model = std::env::var("RINGLINE_STT_MODEL").unwrap_or_else(|_| "whisper-1".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RinglineError::Recognition(e.to_string()))?;
        Ok(Self {
            base_url,
            api_key,
            model,
            gap_frames: 40,
            energy_threshold: 0.015,
            sample_rate: 16_000,
            client,
        })
    }

    async fn transcribe(&self, samples: &[f32]) -> RinglineResult<String> {
        let wav = pcm_f32_to_wav(samples, self.sample_rate);
        let url = format!(
            "{}/audio/transcriptions",
            self.base_url.trim_end_matches('/')
        );
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| RinglineError::Recognition(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone());
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| RinglineError::Recognition(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(RinglineError::Recognition(format!(
                "STT API error {status}: {body}"
            )));
        }
        let json: serde_json::Value = res
            .json()
            .await
            .map_err(|e| RinglineError::Recognition(e.to_string()))?;
        Ok(json
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim()
            .to_string())
    }
}

#[async_trait]
impl RecognizerBackend for HttpRecognizer {
    async fn run_stream(
        &self,
        mut audio: mpsc::Receiver<AudioFrame>,
        events: mpsc::Sender<TranscriptEvent>,
    ) -> RinglineResult<()> {
        let mut utterance: Vec<f32> = Vec::new();
        let mut in_speech = false;
        let mut silent_frames = 0usize;

        while let Some(frame) = audio.recv().await {
            let speech = rms(&frame.samples) > self.energy_threshold;
            if speech {
                in_speech = true;
                silent_frames = 0;
                utterance.extend_from_slice(&frame.samples);
            } else if in_speech {
                silent_frames += 1;
                utterance.extend_from_slice(&frame.samples);
                if silent_frames >= self.gap_frames {
                    match self.transcribe(&utterance).await {
                        Ok(text) if !text.is_empty() => {
                            let _ = events.send(TranscriptEvent::Final(text)).await;
                            let _ = events.send(TranscriptEvent::EndOfUtterance).await;
                        }
                        Ok(_) => debug!("utterance transcribed empty, skipping"),
                        Err(e) => warn!("transcription failed: {e}"),
                    }
                    utterance.clear();
                    in_speech = false;
                    silent_frames = 0;
                }
            }
        }

        // Flush whatever was buffered when the leg closed.
        if in_speech && !utterance.is_empty() {
            if let Ok(text) = self.transcribe(&utterance).await {
                if !text.is_empty() {
                    let _ = events.send(TranscriptEvent::Final(text)).await;
                    let _ = events.send(TranscriptEvent::EndOfUtterance).await;
                }
            }
        }
        Ok(())
    }
}

/// Scripted recognizer for tests: drains audio, emits a fixed event sequence
/// with a configurable inter-event delay.
pub struct ScriptedRecognizer {
    pub script: Vec<TranscriptEvent>,
    pub delay: Duration,
}

impl ScriptedRecognizer {
    pub fn new(script: Vec<TranscriptEvent>) -> Self {
        Self {
            script,
            delay: Duration::from_millis(10),
        }
    }
}

#[async_trait]
impl RecognizerBackend for ScriptedRecognizer {
    async fn run_stream(
        &self,
        mut audio: mpsc::Receiver<AudioFrame>,
        events: mpsc::Sender<TranscriptEvent>,
    ) -> RinglineResult<()> {
        // Keep the audio side drained so the relay never backs up.
        let drain = tokio::spawn(async move { while audio.recv().await.is_some() {} });

        for event in self.script.clone() {
            tokio::time::sleep(self.delay).await;
            if events.send(event).await.is_err() {
                break;
            }
        }
        // Leave the channel open until the engine hangs up; the engine decides
        // when the conversation is over.
        drain.await.ok();
        Ok(())
    }
}
