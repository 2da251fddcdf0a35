//! **Completion handler** — terminal bookkeeping once a call reaches a
//! terminal state.
//!
//! Persists the final call record, reconciles the actual cost against the
//! budget ledger, releases the admission token (which frees the campaign slot
//! and returns the DID with the outcome as a health signal), and bumps the
//! lead's attempt counters. Runs exactly once per call: the token moves in.

use crate::admission::{AdmissionController, AdmitToken};
use chrono::Utc;
use ringline_core::{CallOutcome, CallRecord, CallStore, Lead, RinglineResult};
use std::sync::Arc;
use tracing::{info, warn};

pub struct CompletionHandler {
    admission: Arc<AdmissionController>,
    store: Arc<dyn CallStore>,
    /// Billed rate per connected minute.
    cost_per_minute: f64,
}

impl CompletionHandler {
    pub fn new(
        admission: Arc<AdmissionController>,
        store: Arc<dyn CallStore>,
        cost_per_minute: f64,
    ) -> Self {
        Self {
            admission,
            store,
            cost_per_minute,
        }
    }

    /// Actual cost of a call: billed per connected minute, pro-rated by the
    /// second. Never-connected calls cost nothing.
    pub fn cost_of(&self, talk_seconds: u64) -> f64 {
        self.cost_per_minute * talk_seconds as f64 / 60.0
    }

    /// Finalizes one call. Stamps the outcome and end time, persists the
    /// record, reconciles spend, and releases the slot and DID.
    pub async fn finalize(
        &self,
        token: AdmitToken,
        mut call: CallRecord,
        outcome: CallOutcome,
        lead: &mut Lead,
    ) -> RinglineResult<CallRecord> {
        let now = Utc::now();
        if call.ended_at.is_none() {
            call.ended_at = Some(now);
        }
        call.outcome = Some(outcome);

        let talk_seconds = call.talk_seconds();
        call.cost_accrued = self.cost_of(talk_seconds);

        // The slot and DID come back even when persistence fails; the token
        // must not die unreleased.
        let persisted = self.store.record_call_outcome(&call).await;
        if let Err(e) = &persisted {
            warn!(call = %call.id, "call record persistence failed: {e}");
        }
        self.admission
            .release(token, call.cost_accrued, &outcome, talk_seconds)
            .await?;
        lead.mark_attempted(now);
        persisted?;

        info!(
            call = %call.id,
            campaign = %call.campaign,
            ?outcome,
            talk_seconds,
            cost = call.cost_accrued,
            "call finalized"
        );
        Ok(call)
    }
}
