//! Shared data model for the Ringline dialer: leads, DIDs, calls, turns, budgets.
//!
//! Ownership rules (who mutates what):
//! - `Lead` is mutated by the completion handler after each attempt.
//! - `DidRecord` is mutated only by the DID pool.
//! - `CallRecord` is owned by its call task and frozen once terminal.
//! - `ConversationTurn` is append-only, written by the conversation engine.
//! - `BudgetLedger` is mutated by the admission controller and the completion
//!   handler's final spend reconciliation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Campaigns and DIDs are keyed by operator-assigned string ids.
pub type CampaignId = String;
pub type DidId = String;

// -----------------------------------------------------------------------------
// Leads
// -----------------------------------------------------------------------------

/// One phone number attached to a lead, with per-number attempt bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhoneCandidate {
    /// E.164 destination number.
    pub number: String,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_attempted: Option<DateTime<Utc>>,
    /// Inactive candidates are skipped (bad number, opt-out).
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

impl PhoneCandidate {
    pub fn new(number: impl Into<String>) -> Self {
        Self {
            number: number.into(),
            attempts: 0,
            last_attempted: None,
            active: true,
        }
    }
}

/// Identity-free contact record. Phone candidates are ordered by preference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    pub campaign: CampaignId,
    pub phones: Vec<PhoneCandidate>,
}

impl Lead {
    pub fn new(campaign: impl Into<CampaignId>, number: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            campaign: campaign.into(),
            phones: vec![PhoneCandidate::new(number)],
        }
    }

    /// First active candidate in preference order, if any.
    pub fn next_candidate(&self) -> Option<&PhoneCandidate> {
        self.phones.iter().find(|p| p.active)
    }

    /// Records an attempt against the first active candidate.
    pub fn mark_attempted(&mut self, at: DateTime<Utc>) {
        if let Some(p) = self.phones.iter_mut().find(|p| p.active) {
            p.attempts += 1;
            p.last_attempted = Some(at);
        }
    }
}

// -----------------------------------------------------------------------------
// DIDs (outbound sender identities)
// -----------------------------------------------------------------------------

/// One outbound sender identity and its health/usage counters.
///
/// A DID over either daily cap is excluded from selection until the daily
/// reset; a DID under the reputation floor sits in cooldown until the cooldown
/// expires or an operator re-activates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DidRecord {
    pub id: DidId,
    /// E.164 caller-id number presented to the callee.
    pub number: String,
    /// Reputation score in [0.0, 1.0]; decayed and penalized by health signals.
    pub reputation: f32,
    #[serde(default)]
    pub calls_today: u32,
    #[serde(default)]
    pub talk_seconds_today: u64,
    #[serde(default)]
    pub cooldown_until: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Leased to a live call right now; excluded from selection until release.
    #[serde(default)]
    pub in_use: bool,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
    /// Consecutive no-answer outcomes; a configured streak triggers cooldown.
    #[serde(default)]
    pub consecutive_no_answer: u32,
}

impl DidRecord {
    pub fn new(id: impl Into<DidId>, number: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            number: number.into(),
            reputation: 1.0,
            calls_today: 0,
            talk_seconds_today: 0,
            cooldown_until: None,
            active: true,
            in_use: false,
            last_used: None,
            consecutive_no_answer: 0,
        }
    }

    /// Clamps reputation to [0.0, 1.0].
    pub fn clamp(&mut self) {
        self.reputation = self.reputation.clamp(0.0, 1.0);
    }

    /// True when the DID is in an active cooldown window at `now`.
    pub fn cooling_down(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.map(|until| now < until).unwrap_or(false)
    }
}

// -----------------------------------------------------------------------------
// Calls
// -----------------------------------------------------------------------------

/// Lifecycle states of one outbound call.
///
/// `Failed` and `Abandoned` are reachable from every non-terminal state; the
/// transition table lives in the dialer crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Queued,
    Dialing,
    Ringing,
    Connected,
    Conversing,
    Transferring,
    Completed,
    Failed,
    Abandoned,
}

impl CallState {
    /// Terminal states admit no further transitions; duplicate callbacks for a
    /// terminal call are no-ops.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Abandoned)
    }
}

/// Reason code recorded with every terminal call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    /// Handed to a human agent.
    Transferred,
    /// Conversation ran to a natural end (script done or caller hung up).
    Completed,
    Voicemail,
    NoAnswer,
    Busy,
    CarrierError,
    /// External recognition/language/synthesis/telephony failure after retries.
    ServiceFailure,
    /// Ring timeout elapsed before answer.
    RingTimeout,
    /// Media channel never attached within the grace period.
    MediaTimeout,
    /// Operator stop/cancel.
    Canceled,
    /// Leak guard: overall call timeout forced the call terminal.
    ForcedTimeout,
}

/// One outbound call. Created at admission, owned by its call task, immutable
/// once `state` is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: Uuid,
    pub lead: Uuid,
    pub campaign: CampaignId,
    pub did: DidId,
    pub state: CallState,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub outcome: Option<CallOutcome>,
    #[serde(default)]
    pub cost_accrued: f64,
}

impl CallRecord {
    pub fn new(lead: &Lead, did: &DidId) -> Self {
        Self {
            id: Uuid::new_v4(),
            lead: lead.id,
            campaign: lead.campaign.clone(),
            did: did.clone(),
            state: CallState::Queued,
            started_at: Utc::now(),
            connected_at: None,
            ended_at: None,
            outcome: None,
            cost_accrued: 0.0,
        }
    }

    /// Seconds of connected talk time, zero if the call never connected.
    pub fn talk_seconds(&self) -> u64 {
        match (self.connected_at, self.ended_at) {
            (Some(start), Some(end)) => (end - start).num_seconds().max(0) as u64,
            _ => 0,
        }
    }
}

// -----------------------------------------------------------------------------
// Conversation turns
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Caller,
    Assistant,
}

/// One utterance in a call's conversation. Sequence numbers are strictly
/// increasing with no gaps; the persisted sequence is the authoritative record
/// of what the caller heard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub call: Uuid,
    pub seq: u64,
    pub speaker: Speaker,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

// -----------------------------------------------------------------------------
// Budget
// -----------------------------------------------------------------------------

/// Per-campaign spend ledger for one billing period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetLedger {
    pub campaign: CampaignId,
    /// Billing period label, e.g. "2026-08".
    pub period: String,
    pub spent: f64,
    pub limit: f64,
    pub alert_threshold: f64,
}

impl BudgetLedger {
    pub fn new(campaign: impl Into<CampaignId>, limit: f64, alert_threshold: f64) -> Self {
        Self {
            campaign: campaign.into(),
            period: Utc::now().format("%Y-%m").to_string(),
            spent: 0.0,
            limit,
            alert_threshold,
        }
    }

    /// True if spending `extra` on top of current spend would cross the limit.
    pub fn would_exceed(&self, extra: f64) -> bool {
        self.spent + extra > self.limit
    }

    /// True once spend has crossed the alert threshold.
    pub fn past_alert(&self) -> bool {
        self.spent >= self.alert_threshold
    }
}

// -----------------------------------------------------------------------------
// Operator alerts
// -----------------------------------------------------------------------------

/// Operator-visible alerts emitted by the orchestration core.
///
/// Only budget thresholds, leak-guard trips, and repeated external-service
/// failures surface here; everything else stays in the logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Alert {
    BudgetThreshold {
        campaign: CampaignId,
        spent: f64,
        threshold: f64,
    },
    CampaignPaused {
        campaign: CampaignId,
        spent: f64,
        limit: f64,
    },
    LeakGuard {
        call: Uuid,
        campaign: CampaignId,
    },
    ServiceFailures {
        call: Uuid,
        service: String,
        attempts: u32,
    },
}
