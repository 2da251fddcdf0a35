//! **DID Pool Manager** — inventory of outbound sender identities with
//! reputation-based rotation.
//!
//! Selection picks the highest-reputation DID that is active, off cooldown,
//! and under both daily caps, breaking ties by least-recently-used to spread
//! load. Exhaustion is a value, not an error: the caller queues the lead for
//! retry. All mutation happens inside one short mutex; no lock is ever held
//! across an external-service call.

use chrono::{Duration as ChronoDuration, Utc};
use ringline_core::{CallOutcome, DidId, DidPolicy, DidRecord};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{info, warn};

/// Health signals fed back into a DID's reputation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthSignal {
    Answered,
    NoAnswer,
    Busy,
    /// Carrier spam-filtering detected on this caller id.
    CarrierFiltered,
    /// Recipient complaint attributed to this caller id.
    Complaint,
}

impl HealthSignal {
    /// Maps a terminal call outcome to the pool's health signal.
    pub fn from_outcome(outcome: &CallOutcome) -> Self {
        match outcome {
            CallOutcome::Transferred | CallOutcome::Completed | CallOutcome::Voicemail => {
                Self::Answered
            }
            CallOutcome::NoAnswer | CallOutcome::RingTimeout => Self::NoAnswer,
            CallOutcome::Busy => Self::Busy,
            CallOutcome::CarrierError => Self::CarrierFiltered,
            _ => Self::Answered,
        }
    }
}

/// Capability to use one DID for one call. Must be released exactly once;
/// release happens by value through `DidPool::release`.
#[derive(Debug)]
pub struct DidLease {
    pub did: DidId,
    /// Caller-id number to present on the outbound leg.
    pub number: String,
}

/// The shared DID inventory. One per process.
pub struct DidPool {
    inner: Mutex<HashMap<DidId, DidRecord>>,
    policy: DidPolicy,
}

impl DidPool {
    pub fn new(policy: DidPolicy) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            policy,
        }
    }

    /// Poisoning only matters if a panic happened inside the critical section;
    /// the counters are still usable, so recover the guard.
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<DidId, DidRecord>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, record: DidRecord) {
        self.lock().insert(record.id.clone(), record);
    }

    /// Picks the best eligible DID, or `None` when the pool is exhausted.
    ///
    /// Eligible: active, not leased to another live call, off cooldown, under
    /// daily-call and daily-talk caps. Best: highest reputation,
    /// least-recently-used tie-break.
    pub fn acquire(&self, campaign: &str) -> Option<DidLease> {
        let now = Utc::now();
        let mut pool = self.lock();

        let pick = pool
            .values()
            .filter(|d| {
                d.active
                    && !d.in_use
                    && !d.cooling_down(now)
                    && d.calls_today < self.policy.daily_call_cap
                    && d.talk_seconds_today < self.policy.daily_talk_cap_seconds
            })
            .max_by(|a, b| {
                a.reputation
                    .partial_cmp(&b.reputation)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    // older last_used wins the tie, so invert the time ordering
                    .then_with(|| b.last_used.cmp(&a.last_used))
            })
            .map(|d| d.id.clone())?;

        let record = pool.get_mut(&pick).expect("picked id exists");
        let calls_before = record.calls_today;
        record.calls_today += 1;
        record.in_use = true;
        record.last_used = Some(now);

        info!(
            did = %record.id,
            campaign,
            calls_before,
            calls_after = record.calls_today,
            reputation = record.reputation,
            "DID acquired"
        );

        Some(DidLease {
            did: record.id.clone(),
            number: record.number.clone(),
        })
    }

    /// Returns a lease after the call ends, charging talk time and feeding the
    /// outcome into the DID's health.
    pub fn release(&self, lease: DidLease, outcome: &CallOutcome, talk_seconds: u64) {
        {
            let mut pool = self.lock();
            if let Some(record) = pool.get_mut(&lease.did) {
                let talk_before = record.talk_seconds_today;
                record.in_use = false;
                record.talk_seconds_today += talk_seconds;
                info!(
                    did = %lease.did,
                    ?outcome,
                    talk_before,
                    talk_after = record.talk_seconds_today,
                    "DID released"
                );
            } else {
                warn!(did = %lease.did, "release for unknown DID ignored");
                return;
            }
        }
        self.record_health(&lease.did, HealthSignal::from_outcome(outcome));
    }

    /// Applies exponential decay plus per-signal penalties. A reputation below
    /// the floor, or a configured streak of consecutive no-answers, puts the
    /// DID into cooldown.
    pub fn record_health(&self, did: &str, signal: HealthSignal) {
        let mut pool = self.lock();
        let Some(record) = pool.get_mut(did) else {
            warn!(did, "health signal for unknown DID ignored");
            return;
        };

        record.reputation *= self.policy.decay_factor;
        match signal {
            HealthSignal::Answered => {
                record.consecutive_no_answer = 0;
                // successful contact recovers some reputation
                record.reputation += (1.0 - record.reputation) * 0.05;
            }
            HealthSignal::NoAnswer => {
                record.consecutive_no_answer += 1;
            }
            HealthSignal::Busy => {}
            HealthSignal::CarrierFiltered => {
                record.consecutive_no_answer = 0;
                record.reputation -= self.policy.filter_penalty;
            }
            HealthSignal::Complaint => {
                record.consecutive_no_answer = 0;
                record.reputation -= self.policy.complaint_penalty;
            }
        }
        record.clamp();

        let streak_tripped = record.consecutive_no_answer >= self.policy.no_answer_streak;
        let floor_tripped = record.reputation < self.policy.reputation_floor;
        if (streak_tripped || floor_tripped) && !record.cooling_down(Utc::now()) {
            let until = Utc::now()
                + ChronoDuration::from_std(self.policy.cooldown()).unwrap_or_default();
            record.cooldown_until = Some(until);
            record.consecutive_no_answer = 0;
            warn!(
                did,
                reputation = record.reputation,
                streak_tripped,
                floor_tripped,
                cooldown_until = %until,
                "DID entering cooldown"
            );
        }
    }

    /// Clears daily counters (scheduled reset).
    pub fn reset_daily_counters(&self) {
        let mut pool = self.lock();
        for record in pool.values_mut() {
            record.calls_today = 0;
            record.talk_seconds_today = 0;
        }
        info!(dids = pool.len(), "daily DID counters reset");
    }

    /// Operator override: end a cooldown early and restore the DID.
    pub fn reactivate(&self, did: &str) {
        let mut pool = self.lock();
        if let Some(record) = pool.get_mut(did) {
            record.cooldown_until = None;
            record.active = true;
            record.reputation = record.reputation.max(self.policy.reputation_floor);
            info!(did, "DID manually re-activated");
        }
    }

    /// Point-in-time copy of the inventory for dashboards.
    pub fn snapshot(&self) -> Vec<DidRecord> {
        let pool = self.lock();
        let mut out: Vec<DidRecord> = pool.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(policy: DidPolicy, dids: &[(&str, f32)]) -> DidPool {
        let pool = DidPool::new(policy);
        for (id, rep) in dids {
            let mut record = DidRecord::new(*id, format!("+1555000{id}"));
            record.reputation = *rep;
            pool.insert(record);
        }
        pool
    }

    #[test]
    fn acquire_prefers_highest_reputation() {
        let pool = pool_with(
            DidPolicy::default(),
            &[("did-a", 0.5), ("did-b", 0.9), ("did-c", 0.7)],
        );
        let lease = pool.acquire("camp-1").unwrap();
        assert_eq!(lease.did, "did-b");
    }

    #[test]
    fn acquire_breaks_ties_least_recently_used() {
        let pool = pool_with(DidPolicy::default(), &[("did-a", 0.8), ("did-b", 0.8)]);
        let first = pool.acquire("camp-1").unwrap();
        // Same reputation: the unused DID must come next.
        let second = pool.acquire("camp-1").unwrap();
        assert_ne!(first.did, second.did);
    }

    #[test]
    fn leased_did_is_excluded_until_released() {
        let pool = pool_with(DidPolicy::default(), &[("did-a", 0.9)]);

        let lease = pool.acquire("camp-1").unwrap();
        // The sole DID is on a live call: no second lease.
        assert!(pool.acquire("camp-2").is_none());

        pool.release(lease, &CallOutcome::Completed, 5);
        assert!(pool.acquire("camp-2").is_some());
    }

    #[test]
    fn daily_call_cap_excludes_did_until_reset() {
        let policy = DidPolicy {
            daily_call_cap: 1,
            ..DidPolicy::default()
        };
        let pool = pool_with(policy, &[("did-a", 0.9)]);

        let lease = pool.acquire("camp-1").unwrap();
        assert_eq!(lease.did, "did-a");
        // Cap reached: pool is exhausted.
        assert!(pool.acquire("camp-1").is_none());

        pool.release(lease, &CallOutcome::Completed, 10);
        assert!(pool.acquire("camp-1").is_none());

        pool.reset_daily_counters();
        assert!(pool.acquire("camp-1").is_some());
    }

    #[test]
    fn talk_time_cap_excludes_did() {
        let policy = DidPolicy {
            daily_talk_cap_seconds: 60,
            ..DidPolicy::default()
        };
        let pool = pool_with(policy, &[("did-a", 0.9)]);

        let lease = pool.acquire("camp-1").unwrap();
        pool.release(lease, &CallOutcome::Completed, 120);
        assert!(pool.acquire("camp-1").is_none());
    }

    #[test]
    fn three_no_answers_trigger_cooldown() {
        let pool = pool_with(DidPolicy::default(), &[("did-a", 0.9)]);
        for _ in 0..3 {
            pool.record_health("did-a", HealthSignal::NoAnswer);
        }
        assert!(pool.acquire("camp-1").is_none());

        pool.reactivate("did-a");
        assert!(pool.acquire("camp-1").is_some());
    }

    #[test]
    fn complaint_below_floor_triggers_cooldown() {
        let policy = DidPolicy {
            complaint_penalty: 0.5,
            reputation_floor: 0.5,
            ..DidPolicy::default()
        };
        let pool = pool_with(policy, &[("did-a", 0.6)]);
        pool.record_health("did-a", HealthSignal::Complaint);
        assert!(pool.acquire("camp-1").is_none());
    }

    #[test]
    fn answered_resets_no_answer_streak() {
        let pool = pool_with(DidPolicy::default(), &[("did-a", 0.9)]);
        pool.record_health("did-a", HealthSignal::NoAnswer);
        pool.record_health("did-a", HealthSignal::NoAnswer);
        pool.record_health("did-a", HealthSignal::Answered);
        pool.record_health("did-a", HealthSignal::NoAnswer);
        // streak broken, no cooldown yet
        assert!(pool.acquire("camp-1").is_some());
    }

    #[test]
    fn inactive_did_is_never_selected() {
        let pool = pool_with(DidPolicy::default(), &[("did-a", 0.9)]);
        {
            let mut inner = pool.inner.lock().unwrap();
            inner.get_mut("did-a").unwrap().active = false;
        }
        assert!(pool.acquire("camp-1").is_none());
    }
}
