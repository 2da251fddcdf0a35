//! **Telephony client** — outbound placement, hangup, and transfer against the
//! provider, plus the per-call media channel handles.
//!
//! Status callbacks flow back through the provider's webhook into the
//! `CallDispatcher`; this module only covers the request side.

use async_trait::async_trait;
use dashmap::DashMap;
use ringline_core::{RinglineError, RinglineResult};
use ringline_voice::AudioFrame;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// The audio endpoints for one connected call, as seen by the orchestrator:
/// frames arriving from the callee and frames to play to the callee.
pub struct MediaChannels {
    pub from_leg: mpsc::Receiver<AudioFrame>,
    pub to_leg: mpsc::Sender<AudioFrame>,
}

/// The provider-facing ends of the same channels, fed by whatever bridges the
/// provider's audio stream (websocket handler, test driver).
pub struct MediaLeg {
    pub into_call: mpsc::Sender<AudioFrame>,
    pub from_call: mpsc::Receiver<AudioFrame>,
}

fn media_pair(capacity: usize) -> (MediaChannels, MediaLeg) {
    let (in_tx, in_rx) = mpsc::channel(capacity);
    let (out_tx, out_rx) = mpsc::channel(capacity);
    (
        MediaChannels {
            from_leg: in_rx,
            to_leg: out_tx,
        },
        MediaLeg {
            into_call: in_tx,
            from_call: out_rx,
        },
    )
}

#[async_trait]
pub trait TelephonyClient: Send + Sync {
    /// Places an outbound call presenting `from` to `to`. Returns the
    /// provider's call identifier; status callbacks arrive keyed by our id.
    async fn place_call(&self, call: Uuid, from: &str, to: &str) -> RinglineResult<String>;

    /// Opens the bidirectional audio channel for an answered call.
    async fn open_media(&self, call: Uuid) -> RinglineResult<MediaChannels>;

    async fn hangup(&self, provider_id: &str) -> RinglineResult<()>;

    /// Bridges the call to a human agent at `target`.
    async fn transfer(&self, provider_id: &str, target: &str) -> RinglineResult<()>;
}

// -----------------------------------------------------------------------------
// HTTP provider client
// -----------------------------------------------------------------------------

/// REST telephony provider client.
/// Env: `RINGLINE_TELEPHONY_URL`, `RINGLINE_TELEPHONY_KEY`.
///
/// The provider streams call audio to this process keyed by call id; the
/// stream handler looks up `leg_for` to feed the in-call channels.
pub struct HttpTelephony {
    pub base_url: String,
    pub api_key: String,
    client: reqwest::Client,
    /// Provider-side media ends awaiting pickup by the audio stream handler.
    legs: DashMap<Uuid, MediaLeg>,
    media_capacity: usize,
}

impl HttpTelephony {
    pub fn from_env() -> RinglineResult<Self> {
        let base_url = std::env::var("RINGLINE_TELEPHONY_URL")
            .map_err(|_| RinglineError::Config("RINGLINE_TELEPHONY_URL not set".to_string()))?;
        let api_key = std::env::var("RINGLINE_TELEPHONY_KEY")
            .map_err(|_| RinglineError::Config("RINGLINE_TELEPHONY_KEY not set".to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| RinglineError::Telephony(e.to_string()))?;
        Ok(Self {
            base_url,
            api_key,
            client,
            legs: DashMap::new(),
            media_capacity: 64,
        })
    }

    /// Claims the provider-side media ends for a call. The audio stream
    /// handler (gateway websocket) calls this once per connected call.
    pub fn leg_for(&self, call: Uuid) -> Option<MediaLeg> {
        self.legs.remove(&call).map(|(_, leg)| leg)
    }
}

#[async_trait]
impl TelephonyClient for HttpTelephony {
    async fn place_call(&self, call: Uuid, from: &str, to: &str) -> RinglineResult<String> {
        let url = format!("{}/calls", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "reference": call,
            "from": from,
            "to": to,
        });
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| RinglineError::Telephony(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(RinglineError::Telephony(format!(
                "placement failed {status}: {body}"
            )));
        }
        let json: serde_json::Value = res
            .json()
            .await
            .map_err(|e| RinglineError::Telephony(e.to_string()))?;
        json.get("call_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| RinglineError::Telephony("placement response missing call_id".into()))
    }

    async fn open_media(&self, call: Uuid) -> RinglineResult<MediaChannels> {
        let (channels, leg) = media_pair(self.media_capacity);
        self.legs.insert(call, leg);
        Ok(channels)
    }

    async fn hangup(&self, provider_id: &str) -> RinglineResult<()> {
        let url = format!(
            "{}/calls/{}/hangup",
            self.base_url.trim_end_matches('/'),
            provider_id
        );
        self.client
            .post(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| RinglineError::Telephony(e.to_string()))?
            .error_for_status()
            .map_err(|e| RinglineError::Telephony(e.to_string()))?;
        Ok(())
    }

    async fn transfer(&self, provider_id: &str, target: &str) -> RinglineResult<()> {
        let url = format!(
            "{}/calls/{}/transfer",
            self.base_url.trim_end_matches('/'),
            provider_id
        );
        self.client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "target": target }))
            .send()
            .await
            .map_err(|e| RinglineError::Telephony(e.to_string()))?
            .error_for_status()
            .map_err(|e| RinglineError::Telephony(e.to_string()))?;
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Scripted test double
// -----------------------------------------------------------------------------

/// Records placements and hands out media channels; tests drive callbacks
/// through the dispatcher and audio through the returned legs.
#[derive(Default)]
pub struct ScriptedTelephony {
    pub placed: Mutex<Vec<(Uuid, String, String)>>,
    pub transfers: Mutex<Vec<String>>,
    pub hangups: Mutex<Vec<String>>,
    /// When set, `place_call` fails with this message.
    pub fail_placement: Option<String>,
    legs: DashMap<Uuid, MediaLeg>,
}

impl ScriptedTelephony {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            fail_placement: Some(message.into()),
            ..Self::default()
        }
    }

    /// Test-side media ends for a call (available after `open_media`).
    pub fn leg_for(&self, call: Uuid) -> Option<MediaLeg> {
        self.legs.remove(&call).map(|(_, leg)| leg)
    }
}

#[async_trait]
impl TelephonyClient for ScriptedTelephony {
    async fn place_call(&self, call: Uuid, from: &str, to: &str) -> RinglineResult<String> {
        if let Some(ref message) = self.fail_placement {
            return Err(RinglineError::Telephony(message.clone()));
        }
        self.placed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((call, from.to_string(), to.to_string()));
        Ok(format!("prov-{call}"))
    }

    async fn open_media(&self, call: Uuid) -> RinglineResult<MediaChannels> {
        let (channels, leg) = media_pair(64);
        self.legs.insert(call, leg);
        Ok(channels)
    }

    async fn hangup(&self, provider_id: &str) -> RinglineResult<()> {
        self.hangups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(provider_id.to_string());
        Ok(())
    }

    async fn transfer(&self, provider_id: &str, _target: &str) -> RinglineResult<()> {
        self.transfers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(provider_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_telephony_records_placements() {
        let telephony = ScriptedTelephony::new();
        let call = Uuid::new_v4();
        let provider_id = telephony
            .place_call(call, "+15550001111", "+15557772222")
            .await
            .unwrap();
        assert!(provider_id.starts_with("prov-"));
        assert_eq!(telephony.placed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn media_pair_round_trips_frames() {
        let telephony = ScriptedTelephony::new();
        let call = Uuid::new_v4();
        let mut channels = telephony.open_media(call).await.unwrap();
        let mut leg = telephony.leg_for(call).unwrap();

        leg.into_call.send(AudioFrame::silence()).await.unwrap();
        assert!(channels.from_leg.recv().await.is_some());

        channels.to_leg.send(AudioFrame::silence()).await.unwrap();
        assert!(leg.from_call.recv().await.is_some());
    }

    #[tokio::test]
    async fn failing_placement_reports_telephony_error() {
        let telephony = ScriptedTelephony::failing("carrier 503");
        let err = telephony
            .place_call(Uuid::new_v4(), "+1", "+2")
            .await
            .unwrap_err();
        assert!(matches!(err, RinglineError::Telephony(_)));
    }
}
