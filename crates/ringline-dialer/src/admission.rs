//! **Admission Controller** — gates call starts against concurrency, budget,
//! and DID availability.
//!
//! The three checks run under one per-campaign async mutex so two admission
//! decisions for the same campaign can never both observe the last free slot.
//! Different campaigns never contend. The `AdmitToken` is released exactly
//! once, enforced by moving it into `release`.

use crate::did_pool::{DidLease, DidPool};
use ringline_core::{
    Alert, CallOutcome, CallRecord, CallStore, CampaignId, Lead, RinglineResult,
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

/// Why an admission was refused. Exhaustion is recoverable: the caller should
/// requeue the lead and retry later rather than drop it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    ConcurrencyLimit,
    BudgetExceeded,
    DidExhausted,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConcurrencyLimit => write!(f, "concurrency_limit"),
            Self::BudgetExceeded => write!(f, "budget_exceeded"),
            Self::DidExhausted => write!(f, "did_exhausted"),
        }
    }
}

/// Capability permitting one call to run. Holds the DID lease; consumed by
/// `AdmissionController::release`.
#[derive(Debug)]
pub struct AdmitToken {
    pub call_id: Uuid,
    pub campaign: CampaignId,
    pub(crate) lease: DidLease,
}

#[derive(Debug)]
struct CampaignGate {
    active_calls: usize,
    ceiling: usize,
    /// Set when spend reaches the limit; cleared by `resume`.
    paused_over_budget: bool,
    /// One threshold alert per crossing.
    alerted: bool,
}

/// Shared admission state. One per process.
pub struct AdmissionController {
    gates: DashMap<CampaignId, Arc<Mutex<CampaignGate>>>,
    pool: Arc<DidPool>,
    store: Arc<dyn CallStore>,
    alerts: broadcast::Sender<Alert>,
    expected_call_cost: f64,
    default_ceiling: usize,
}

impl AdmissionController {
    pub fn new(
        pool: Arc<DidPool>,
        store: Arc<dyn CallStore>,
        expected_call_cost: f64,
        default_ceiling: usize,
    ) -> Self {
        let (alerts, _) = broadcast::channel(64);
        Self {
            gates: DashMap::new(),
            pool,
            store,
            alerts,
            expected_call_cost,
            default_ceiling,
        }
    }

    /// Subscribe to operator alerts (budget threshold, auto-pause).
    pub fn alerts(&self) -> broadcast::Receiver<Alert> {
        self.alerts.subscribe()
    }

    /// Sender side of the alert stream, so call tasks emit onto the same
    /// channel operators subscribe to.
    pub fn alert_sender(&self) -> broadcast::Sender<Alert> {
        self.alerts.clone()
    }

    fn gate(&self, campaign: &str) -> Arc<Mutex<CampaignGate>> {
        self.gates
            .entry(campaign.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(CampaignGate {
                    active_calls: 0,
                    ceiling: self.default_ceiling,
                    paused_over_budget: false,
                    alerted: false,
                }))
            })
            .clone()
    }

    /// Sets the concurrent-call ceiling for a campaign.
    pub async fn set_ceiling(&self, campaign: &str, ceiling: usize) {
        let gate = self.gate(campaign);
        gate.lock().await.ceiling = ceiling;
    }

    /// Live call count for a campaign.
    pub async fn active_calls(&self, campaign: &str) -> usize {
        let gate = self.gate(campaign);
        let gate = gate.lock().await;
        gate.active_calls
    }

    /// Admits one call for `lead`'s campaign, or explains the refusal.
    ///
    /// Checks, in order and atomically per campaign: concurrency ceiling,
    /// projected budget (spent + expected cost of one call), DID availability.
    /// On success the returned `CallRecord` is in `Queued` with its DID
    /// assigned.
    pub async fn try_admit(&self, lead: &Lead) -> RinglineResult<Result<(AdmitToken, CallRecord), RejectReason>> {
        let campaign = lead.campaign.as_str();
        let gate = self.gate(campaign);
        let mut gate = gate.lock().await;

        if gate.paused_over_budget {
            return Ok(Err(RejectReason::BudgetExceeded));
        }
        if gate.active_calls >= gate.ceiling {
            return Ok(Err(RejectReason::ConcurrencyLimit));
        }

        // Budget projection. The gate stays locked across this read so the
        // decision is atomic per campaign; the store is local, not a network
        // service.
        if let Some(ledger) = self.store.read_budget(campaign).await? {
            if ledger.would_exceed(self.expected_call_cost) {
                gate.paused_over_budget = true;
                warn!(
                    campaign,
                    spent = ledger.spent,
                    limit = ledger.limit,
                    "budget limit reached, campaign auto-paused"
                );
                let _ = self.alerts.send(Alert::CampaignPaused {
                    campaign: campaign.to_string(),
                    spent: ledger.spent,
                    limit: ledger.limit,
                });
                return Ok(Err(RejectReason::BudgetExceeded));
            }
            if ledger.past_alert() && !gate.alerted {
                gate.alerted = true;
                warn!(
                    campaign,
                    spent = ledger.spent,
                    threshold = ledger.alert_threshold,
                    "budget alert threshold crossed"
                );
                let _ = self.alerts.send(Alert::BudgetThreshold {
                    campaign: campaign.to_string(),
                    spent: ledger.spent,
                    threshold: ledger.alert_threshold,
                });
            }
        }

        let Some(lease) = self.pool.acquire(campaign) else {
            return Ok(Err(RejectReason::DidExhausted));
        };

        gate.active_calls += 1;
        let call = CallRecord::new(lead, &lease.did);
        info!(
            campaign,
            call = %call.id,
            did = %lease.did,
            active = gate.active_calls,
            ceiling = gate.ceiling,
            "call admitted"
        );

        Ok(Ok((
            AdmitToken {
                call_id: call.id,
                campaign: campaign.to_string(),
                lease,
            },
            call,
        )))
    }

    /// Releases a finished call: frees the campaign slot, returns the DID to
    /// the pool with the call's outcome, and commits the final cost.
    pub async fn release(
        &self,
        token: AdmitToken,
        cost: f64,
        outcome: &CallOutcome,
        talk_seconds: u64,
    ) -> RinglineResult<()> {
        {
            let gate = self.gate(&token.campaign);
            let mut gate = gate.lock().await;
            gate.active_calls = gate.active_calls.saturating_sub(1);
            info!(
                campaign = %token.campaign,
                call = %token.call_id,
                active = gate.active_calls,
                cost,
                "admission token released"
            );
        }
        self.pool.release(token.lease, outcome, talk_seconds);
        self.store.commit_spend(&token.campaign, cost).await?;
        Ok(())
    }

    /// Clears the over-budget pause after an operator raises the limit.
    pub async fn resume(&self, campaign: &str) {
        let gate = self.gate(campaign);
        let mut gate = gate.lock().await;
        gate.paused_over_budget = false;
        gate.alerted = false;
        info!(campaign, "campaign admission resumed");
    }

    /// True while the campaign is auto-paused over budget.
    pub async fn paused_over_budget(&self, campaign: &str) -> bool {
        let gate = self.gate(campaign);
        let gate = gate.lock().await;
        gate.paused_over_budget
    }
}
