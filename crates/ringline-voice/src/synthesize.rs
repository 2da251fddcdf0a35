//! **Speech synthesis** — text in, audio frames out, streamed to the relay.

use crate::relay::{AudioFrame, FRAME_SAMPLES};
use async_trait::async_trait;
use ringline_core::{RinglineError, RinglineResult};
use std::time::Duration;

#[async_trait]
pub trait SynthesisBackend: Send + Sync {
    /// Synthesize `text` into fixed-size PCM frames ready for the outbound leg.
    async fn synthesize(&self, text: &str) -> RinglineResult<Vec<AudioFrame>>;
}

/// Production backend: OpenAI-compatible speech API, response decoded from
/// 16-bit PCM into relay frames.
/// Env: `RINGLINE_TTS_URL` (default https://api.openai.com/v1),
/// `RINGLINE_TTS_KEY`, `RINGLINE_TTS_MODEL` (default tts-1),
/// `RINGLINE_TTS_VOICE` (default alloy).
pub struct HttpSynthesis {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub voice: String,
    client: reqwest::Client,
}

impl HttpSynthesis {
    pub fn from_env() -> RinglineResult<Self> {
        let base_url = std::env::var("RINGLINE_TTS_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let api_key = std::env::var("RINGLINE_TTS_KEY")
            .map_err(|_| RinglineError::Config("RINGLINE_TTS_KEY not set".to_string()))?;
        let model = std::env::var("RINGLINE_TTS_MODEL").unwrap_or_else(|_| "tts-1".to_string());
        let voice = std::env::var("RINGLINE_TTS_VOICE").unwrap_or_else(|_| "alloy".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RinglineError::Synthesis(e.to_string()))?;
        Ok(Self {
            base_url,
            api_key,
            model,
            voice,
            client,
        })
    }
}

/// Splits raw 16-bit little-endian PCM into relay-sized f32 frames, padding
/// the tail frame with silence.
pub fn pcm16_to_frames(raw: &[u8]) -> Vec<AudioFrame> {
    let mut samples = Vec::with_capacity(raw.len() / 2);
    for pair in raw.chunks_exact(2) {
        let v = i16::from_le_bytes([pair[0], pair[1]]);
        samples.push(v as f32 / 32768.0);
    }
    let mut frames = Vec::with_capacity(samples.len() / FRAME_SAMPLES + 1);
    for chunk in samples.chunks(FRAME_SAMPLES) {
        let mut frame = chunk.to_vec();
        frame.resize(FRAME_SAMPLES, 0.0);
        frames.push(AudioFrame::new(frame));
    }
    frames
}

#[async_trait]
impl SynthesisBackend for HttpSynthesis {
    async fn synthesize(&self, text: &str) -> RinglineResult<Vec<AudioFrame>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/audio/speech", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "voice": self.voice,
            "input": text,
            "response_format": "pcm",
        });
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| RinglineError::Synthesis(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(RinglineError::Synthesis(format!(
                "TTS API error {status}: {body}"
            )));
        }
        let raw = res
            .bytes()
            .await
            .map_err(|e| RinglineError::Synthesis(e.to_string()))?;
        Ok(pcm16_to_frames(&raw))
    }
}

/// Placeholder synthesis: one silent frame per word, so tests can count audio
/// without any API. Optional delay for latency-budget tests.
#[derive(Debug, Clone, Default)]
pub struct PlaceholderSynthesis {
    pub delay: Option<Duration>,
}

#[async_trait]
impl SynthesisBackend for PlaceholderSynthesis {
    async fn synthesize(&self, text: &str) -> RinglineResult<Vec<AudioFrame>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let words = text.split_whitespace().count().max(1);
        Ok((0..words).map(|_| AudioFrame::silence()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm16_chunks_into_padded_frames() {
        // 1.5 frames of PCM
        let raw = vec![0u8; FRAME_SAMPLES * 3];
        let frames = pcm16_to_frames(&raw);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.samples.len() == FRAME_SAMPLES));
    }

    #[tokio::test]
    async fn placeholder_emits_one_frame_per_word() {
        let synth = PlaceholderSynthesis::default();
        let frames = synth.synthesize("three word reply").await.unwrap();
        assert_eq!(frames.len(), 3);
    }
}
