//! **Campaign runner** — dequeues leads and feeds them through admission into
//! per-call tasks.
//!
//! One pump task per running campaign. Refused admissions requeue the lead at
//! the head and back off; the pump never drops a lead on exhaustion. Stop
//! semantics: queued leads are discarded immediately (they never dialed),
//! pre-connect calls are canceled, and conversing calls wind down at their
//! next turn boundary via the shared cancel signal.

use crate::admission::AdmissionController;
use crate::runner::{run_call, CallDeps};
use crate::state::CallEvent;
use dashmap::DashMap;
use ringline_core::{CampaignId, Lead};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

/// Point-in-time view of one campaign's queue, for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub campaign: CampaignId,
    pub queued: usize,
    pub active: usize,
    pub finished: u64,
    pub paused: bool,
    pub stopped: bool,
}

struct CampaignState {
    script: String,
    queue: Mutex<VecDeque<Lead>>,
    cancel: watch::Sender<bool>,
    paused: AtomicBool,
    stopped: AtomicBool,
    in_flight: AtomicUsize,
    finished: AtomicU64,
}

impl CampaignState {
    fn queue(&self) -> MutexGuard<'_, VecDeque<Lead>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Owns the running campaigns. One per process, shared with the gateway.
pub struct CampaignRunner {
    deps: CallDeps,
    admission: Arc<AdmissionController>,
    campaigns: DashMap<CampaignId, Arc<CampaignState>>,
}

impl CampaignRunner {
    pub fn new(deps: CallDeps, admission: Arc<AdmissionController>) -> Self {
        Self {
            deps,
            admission,
            campaigns: DashMap::new(),
        }
    }

    /// Starts (or restarts a stopped) campaign with its lead queue. Returns
    /// false if the campaign is already running.
    pub async fn start(
        &self,
        campaign: impl Into<CampaignId>,
        script: impl Into<String>,
        leads: Vec<Lead>,
        ceiling: Option<usize>,
    ) -> bool {
        let campaign: CampaignId = campaign.into();
        if let Some(existing) = self.campaigns.get(&campaign) {
            if !existing.stopped.load(Ordering::Relaxed) {
                warn!(%campaign, "campaign already running");
                return false;
            }
        }

        if let Some(ceiling) = ceiling {
            self.admission.set_ceiling(&campaign, ceiling).await;
        }

        let (cancel, _) = watch::channel(false);
        let state = Arc::new(CampaignState {
            script: script.into(),
            queue: Mutex::new(leads.into()),
            cancel,
            paused: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            finished: AtomicU64::new(0),
        });
        self.campaigns.insert(campaign.clone(), state.clone());

        info!(%campaign, queued = state.queue().len(), "campaign started");
        tokio::spawn(pump(
            self.deps.clone(),
            self.admission.clone(),
            campaign,
            state,
        ));
        true
    }

    /// Pauses dialing; in-flight calls run to completion.
    pub fn pause(&self, campaign: &str) -> bool {
        match self.campaigns.get(campaign) {
            Some(state) => {
                state.paused.store(true, Ordering::Relaxed);
                info!(campaign, "campaign paused");
                true
            }
            None => false,
        }
    }

    /// Resumes dialing, clearing any over-budget auto-pause as well.
    pub async fn resume(&self, campaign: &str) -> bool {
        match self.campaigns.get(campaign) {
            Some(state) => {
                state.paused.store(false, Ordering::Relaxed);
                self.admission.resume(campaign).await;
                info!(campaign, "campaign resumed");
                true
            }
            None => false,
        }
    }

    /// Stops a campaign: discards queued leads, cancels pre-connect calls,
    /// winds down conversing calls at their next turn boundary.
    pub fn stop(&self, campaign: &str) -> bool {
        match self.campaigns.get(campaign) {
            Some(state) => {
                state.stopped.store(true, Ordering::Relaxed);
                let discarded = {
                    let mut queue = state.queue();
                    let n = queue.len();
                    queue.clear();
                    n
                };
                let _ = state.cancel.send(true);
                info!(campaign, discarded, "campaign stopped");
                true
            }
            None => false,
        }
    }

    /// Cancels one in-flight call.
    pub fn cancel_call(&self, call: Uuid) -> bool {
        self.deps.dispatcher.deliver(call, CallEvent::Canceled)
    }

    pub fn status(&self, campaign: &str) -> Option<QueueStatus> {
        self.campaigns.get(campaign).map(|state| QueueStatus {
            campaign: campaign.to_string(),
            queued: state.queue().len(),
            active: state.in_flight.load(Ordering::Relaxed),
            finished: state.finished.load(Ordering::Relaxed),
            paused: state.paused.load(Ordering::Relaxed),
            stopped: state.stopped.load(Ordering::Relaxed),
        })
    }

    pub fn statuses(&self) -> Vec<QueueStatus> {
        self.campaigns
            .iter()
            .map(|entry| {
                let state = entry.value();
                QueueStatus {
                    campaign: entry.key().clone(),
                    queued: state.queue().len(),
                    active: state.in_flight.load(Ordering::Relaxed),
                    finished: state.finished.load(Ordering::Relaxed),
                    paused: state.paused.load(Ordering::Relaxed),
                    stopped: state.stopped.load(Ordering::Relaxed),
                }
            })
            .collect()
    }
}

/// The dial pump: dequeue → admit → spawn one call task. Runs until the queue
/// and in-flight count drain, or the campaign is stopped.
async fn pump(
    deps: CallDeps,
    admission: Arc<AdmissionController>,
    campaign: CampaignId,
    state: Arc<CampaignState>,
) {
    let idle = deps.config.retry_backoff();

    loop {
        if state.stopped.load(Ordering::Relaxed) {
            break;
        }
        if state.paused.load(Ordering::Relaxed) {
            tokio::time::sleep(idle).await;
            continue;
        }

        let lead = state.queue().pop_front();
        let Some(lead) = lead else {
            if state.in_flight.load(Ordering::Relaxed) == 0 {
                break;
            }
            tokio::time::sleep(idle).await;
            continue;
        };

        match admission.try_admit(&lead).await {
            Ok(Ok((token, call))) => {
                state.in_flight.fetch_add(1, Ordering::Relaxed);
                let deps = deps.clone();
                let script = state.script.clone();
                let cancel_rx = state.cancel.subscribe();
                let state = state.clone();
                tokio::spawn(async move {
                    run_call(deps, token, call, lead, script, cancel_rx).await;
                    state.in_flight.fetch_sub(1, Ordering::Relaxed);
                    state.finished.fetch_add(1, Ordering::Relaxed);
                });
            }
            Ok(Err(reason)) => {
                // Recoverable refusal: the lead goes back to the head and the
                // pump waits for a slot, budget, or DID to free up.
                info!(%campaign, %reason, "admission refused, lead requeued");
                state.queue().push_front(lead);
                tokio::time::sleep(idle).await;
            }
            Err(e) => {
                warn!(%campaign, "admission error, lead requeued: {e}");
                state.queue().push_front(lead);
                tokio::time::sleep(idle).await;
            }
        }
    }

    info!(
        %campaign,
        finished = state.finished.load(Ordering::Relaxed),
        "campaign pump exited"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::CompletionHandler;
    use crate::did_pool::DidPool;
    use crate::dispatch::CallDispatcher;
    use crate::telephony::ScriptedTelephony;
    use ringline_core::{CallOutcome, DidPolicy, DidRecord, MemoryStore, RinglineConfig};
    use ringline_voice::{
        ConversationEngine, EngineConfig, PlaceholderLanguage, PlaceholderSynthesis,
        ScriptedRecognizer, TransferTriggers,
    };
    use std::time::Duration;

    struct World {
        runner: CampaignRunner,
        admission: Arc<AdmissionController>,
        telephony: Arc<ScriptedTelephony>,
        store: Arc<MemoryStore>,
    }

    fn world(dids: usize) -> World {
        let mut config = RinglineConfig::default();
        config.ring_timeout_seconds = 1;
        config.retry_backoff_ms = 20;
        let config = Arc::new(config);

        let pool = Arc::new(DidPool::new(DidPolicy::default()));
        for i in 0..dids {
            pool.insert(DidRecord::new(format!("did-{i}"), format!("+1555000{i:04}")));
        }
        let store = Arc::new(MemoryStore::new());
        let admission = Arc::new(AdmissionController::new(
            pool,
            store.clone(),
            config.expected_call_cost,
            config.default_campaign_ceiling,
        ));
        let completion = Arc::new(CompletionHandler::new(
            admission.clone(),
            store.clone(),
            config.cost_per_minute,
        ));
        let engine = Arc::new(ConversationEngine::new(
            Arc::new(PlaceholderLanguage::with_reply("ok")),
            Arc::new(PlaceholderSynthesis::default()),
            TransferTriggers::default(),
            store.clone(),
            EngineConfig::from_core(&config),
        ));
        let telephony = Arc::new(ScriptedTelephony::new());

        let deps = CallDeps {
            config,
            dispatcher: Arc::new(CallDispatcher::new()),
            telephony: telephony.clone(),
            recognizer: Arc::new(ScriptedRecognizer::new(Vec::new())),
            engine,
            completion,
            alerts: admission.alert_sender(),
        };
        World {
            runner: CampaignRunner::new(deps, admission.clone()),
            admission,
            telephony,
            store,
        }
    }

    #[tokio::test]
    async fn ceiling_limits_concurrent_dials_until_slots_free() {
        let w = world(8);
        let leads: Vec<Lead> = (0..3)
            .map(|i| Lead::new("camp-1", format!("+1555777000{i}")))
            .collect();

        assert!(
            w.runner
                .start("camp-1", "script", leads, Some(2))
                .await
        );

        // While the first two ring (1s ring timeout), the third must wait.
        let mut max_active = 0;
        for _ in 0..400 {
            max_active = max_active.max(w.admission.active_calls("camp-1").await);
            let finished = w
                .runner
                .status("camp-1")
                .map(|s| s.finished)
                .unwrap_or(0);
            if finished == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(max_active, 2, "ceiling of 2 was not saturated or was exceeded");
        assert_eq!(w.telephony.placed.lock().unwrap().len(), 3);
        let recorded = w.store.recorded_calls();
        assert_eq!(recorded.len(), 3);
        assert!(recorded
            .iter()
            .all(|c| c.outcome == Some(CallOutcome::RingTimeout)));
    }

    #[tokio::test]
    async fn stop_discards_queued_and_cancels_ringing() {
        let w = world(4);
        let leads: Vec<Lead> = (0..5)
            .map(|i| Lead::new("camp-1", format!("+1555777000{i}")))
            .collect();
        w.runner.start("camp-1", "script", leads, Some(1)).await;

        // Wait for the first call to be in flight, then stop everything.
        for _ in 0..200 {
            if !w.telephony.placed.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(w.runner.stop("camp-1"));

        for _ in 0..200 {
            let status = w.runner.status("camp-1").unwrap();
            if status.active == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let status = w.runner.status("camp-1").unwrap();
        assert!(status.stopped);
        assert_eq!(status.queued, 0);
        assert_eq!(status.active, 0);
        // Only the in-flight call produced a record, and it was canceled.
        let recorded = w.store.recorded_calls();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].outcome, Some(CallOutcome::Canceled));
    }

    #[tokio::test]
    async fn pause_holds_the_queue_and_resume_releases_it() {
        let w = world(4);
        let leads = vec![Lead::new("camp-1", "+15557770000")];
        w.runner.start("camp-1", "script", leads, Some(1)).await;
        assert!(w.runner.pause("camp-1"));

        // Paused before the pump dequeued: nothing places.
        tokio::time::sleep(Duration::from_millis(100)).await;
        // The pump may have dequeued the lead before the pause landed; accept
        // either zero or one placement, but after resume the campaign drains.
        w.runner.resume("camp-1").await;

        for _ in 0..400 {
            if w.runner.status("camp-1").map(|s| s.finished) == Some(1) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(w.runner.status("camp-1").unwrap().finished, 1);
    }

    #[tokio::test]
    async fn cancel_call_reaches_the_owning_task() {
        let w = world(4);
        let leads = vec![Lead::new("camp-1", "+15557770000")];
        w.runner.start("camp-1", "script", leads, Some(1)).await;

        // Find the live call via the dispatcher and cancel it.
        let mut canceled = false;
        for _ in 0..200 {
            let placed = w.telephony.placed.lock().unwrap().clone();
            if let Some((call, _, _)) = placed.first() {
                canceled = w.runner.cancel_call(*call);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(canceled);

        for _ in 0..200 {
            if w.runner.status("camp-1").map(|s| s.finished) == Some(1) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let recorded = w.store.recorded_calls();
        assert_eq!(recorded[0].outcome, Some(CallOutcome::Canceled));
    }
}
