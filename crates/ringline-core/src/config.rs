//! Runtime configuration for the dialer core.
//!
//! Every policy parameter the orchestrator consults (timeouts, latency
//! budgets, DID reputation policy, cost rates) is configuration, loaded from
//! an optional TOML file with `RINGLINE`-prefixed environment overrides.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Reputation and rotation policy for the DID pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DidPolicy {
    /// Max calls per DID per day before it is excluded until reset.
    #[serde(default = "default_daily_call_cap")]
    pub daily_call_cap: u32,
    /// Max connected talk seconds per DID per day.
    #[serde(default = "default_daily_talk_cap")]
    pub daily_talk_cap_seconds: u64,
    /// Multiplicative decay applied to reputation on every health signal.
    #[serde(default = "default_decay_factor")]
    pub decay_factor: f32,
    /// Additive penalty for a carrier-filtering signal.
    #[serde(default = "default_filter_penalty")]
    pub filter_penalty: f32,
    /// Additive penalty for a spam complaint signal.
    #[serde(default = "default_complaint_penalty")]
    pub complaint_penalty: f32,
    /// Reputation below this floor puts the DID into cooldown.
    #[serde(default = "default_reputation_floor")]
    pub reputation_floor: f32,
    /// Consecutive no-answers that trigger a cooldown.
    #[serde(default = "default_no_answer_streak")]
    pub no_answer_streak: u32,
    /// Cooldown duration in seconds.
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
}

fn default_daily_call_cap() -> u32 {
    100
}
fn default_daily_talk_cap() -> u64 {
    4 * 3600
}
fn default_decay_factor() -> f32 {
    0.98
}
fn default_filter_penalty() -> f32 {
    0.25
}
fn default_complaint_penalty() -> f32 {
    0.40
}
fn default_reputation_floor() -> f32 {
    0.30
}
fn default_no_answer_streak() -> u32 {
    3
}
fn default_cooldown_seconds() -> u64 {
    6 * 3600
}

impl Default for DidPolicy {
    fn default() -> Self {
        Self {
            daily_call_cap: default_daily_call_cap(),
            daily_talk_cap_seconds: default_daily_talk_cap(),
            decay_factor: default_decay_factor(),
            filter_penalty: default_filter_penalty(),
            complaint_penalty: default_complaint_penalty(),
            reputation_floor: default_reputation_floor(),
            no_answer_streak: default_no_answer_streak(),
            cooldown_seconds: default_cooldown_seconds(),
        }
    }
}

impl DidPolicy {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds)
    }
}

/// Top-level dialer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RinglineConfig {
    /// Gateway listen port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Sled database path for the durable call store.
    #[serde(default = "default_storage_path")]
    pub storage_path: String,

    /// Seconds a call may ring before it is abandoned.
    #[serde(default = "default_ring_timeout")]
    pub ring_timeout_seconds: u64,
    /// Grace period (ms) for the media channel to attach after answer.
    #[serde(default = "default_attach_grace")]
    pub attach_grace_ms: u64,
    /// Overall per-call deadline; the leak guard forces the call terminal past it.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_seconds: u64,

    /// Silence gap (ms) that ends a caller utterance.
    #[serde(default = "default_utterance_gap")]
    pub utterance_gap_ms: u64,
    /// Seconds of total caller silence before the conversation ends.
    #[serde(default = "default_silence_timeout")]
    pub silence_timeout_seconds: u64,
    /// Per-turn budget (ms) for the language-model and synthesis calls.
    #[serde(default = "default_turn_budget")]
    pub turn_latency_budget_ms: u64,
    /// Recent turns kept in memory for prompt construction.
    #[serde(default = "default_recent_window")]
    pub recent_turns_window: usize,
    /// Spoken when a turn blows its latency budget, instead of dead air.
    #[serde(default = "default_fillers")]
    pub filler_utterances: Vec<String>,
    /// Caller/assistant phrases that hand the call to a human.
    #[serde(default = "default_transfer_phrases")]
    pub transfer_phrases: Vec<String>,
    /// Language-model intent tags that hand the call to a human.
    #[serde(default = "default_transfer_intents")]
    pub transfer_intents: Vec<String>,
    /// Where transferred calls are bridged (agent queue or E.164 number).
    #[serde(default = "default_transfer_target")]
    pub transfer_target: String,

    /// Bounded retry count for external-service calls.
    #[serde(default = "default_service_retries")]
    pub max_service_retries: u32,
    /// Base backoff (ms) between external-service retries, doubled per attempt.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    /// Default concurrent-call ceiling for campaigns without an explicit one.
    #[serde(default = "default_ceiling")]
    pub default_campaign_ceiling: usize,
    /// Projected cost of one call, used for the admission budget check.
    #[serde(default = "default_expected_cost")]
    pub expected_call_cost: f64,
    /// Billed rate per connected minute, used for final cost reconciliation.
    #[serde(default = "default_cost_per_minute")]
    pub cost_per_minute: f64,
    /// Max frames buffered per direction in the media relay before drop-oldest.
    #[serde(default = "default_relay_buffer")]
    pub relay_buffer_frames: usize,

    #[serde(default)]
    pub did: DidPolicy,
}

fn default_port() -> u16 {
    8010
}
fn default_storage_path() -> String {
    "./data/ringline".to_string()
}
fn default_ring_timeout() -> u64 {
    25
}
fn default_attach_grace() -> u64 {
    2_000
}
fn default_call_timeout() -> u64 {
    600
}
fn default_silence_timeout() -> u64 {
    30
}
fn default_utterance_gap() -> u64 {
    800
}
fn default_turn_budget() -> u64 {
    1_500
}
fn default_recent_window() -> usize {
    12
}
fn default_fillers() -> Vec<String> {
    vec![
        "One moment please.".to_string(),
        "Let me just check that for you.".to_string(),
        "Bear with me a second.".to_string(),
    ]
}
fn default_transfer_phrases() -> Vec<String> {
    vec![
        "speak to a person".to_string(),
        "talk to a human".to_string(),
        "transfer me".to_string(),
        "real person".to_string(),
    ]
}
fn default_transfer_intents() -> Vec<String> {
    vec!["transfer".to_string(), "handoff".to_string()]
}
fn default_transfer_target() -> String {
    "agents".to_string()
}
fn default_service_retries() -> u32 {
    3
}
fn default_retry_backoff() -> u64 {
    250
}
fn default_ceiling() -> usize {
    10
}
fn default_expected_cost() -> f64 {
    0.12
}
fn default_cost_per_minute() -> f64 {
    0.045
}
fn default_relay_buffer() -> usize {
    16
}

impl Default for RinglineConfig {
    fn default() -> Self {
        // serde defaults double as the programmatic defaults
        serde_json::from_str("{}").expect("defaults deserialize")
    }
}

impl RinglineConfig {
    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_seconds)
    }
    pub fn attach_grace(&self) -> Duration {
        Duration::from_millis(self.attach_grace_ms)
    }
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_seconds)
    }
    pub fn utterance_gap(&self) -> Duration {
        Duration::from_millis(self.utterance_gap_ms)
    }
    pub fn silence_timeout(&self) -> Duration {
        Duration::from_secs(self.silence_timeout_seconds)
    }
    pub fn turn_budget(&self) -> Duration {
        Duration::from_millis(self.turn_latency_budget_ms)
    }
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Load config from file and environment.
    /// Precedence: env `RINGLINE_CONFIG` path > `config/ringline.toml` > defaults;
    /// `RINGLINE__`-prefixed environment variables override either.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("RINGLINE_CONFIG").unwrap_or_else(|_| "config/ringline".to_string());
        let builder = config::Config::builder();

        let path = Path::new(&config_path);
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("RINGLINE").separator("__"))
            .build()?;

        built.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = RinglineConfig::default();
        assert_eq!(cfg.ring_timeout(), Duration::from_secs(25));
        assert_eq!(cfg.did.no_answer_streak, 3);
        assert!(!cfg.filler_utterances.is_empty());
        assert!(cfg.expected_call_cost > 0.0);
    }

    #[test]
    fn toml_overrides_defaults() {
        let cfg: RinglineConfig = toml::from_str(
            r#"
            ring_timeout_seconds = 10
            [did]
            daily_call_cap = 5
            "#,
        )
        .unwrap();
        assert_eq!(cfg.ring_timeout_seconds, 10);
        assert_eq!(cfg.did.daily_call_cap, 5);
        // untouched fields keep defaults
        assert_eq!(cfg.turn_latency_budget_ms, 1_500);
    }
}
