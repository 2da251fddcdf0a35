//! End-to-end orchestration tests: campaign runner → admission → call tasks,
//! with scripted telephony and voice backends standing in for the providers.

use ringline_core::{
    Alert, BudgetLedger, CallOutcome, CallStore, DidPolicy, DidRecord, Lead, MemoryStore,
    RinglineConfig,
};
use ringline_dialer::{
    AdmissionController, CallDeps, CallDispatcher, CallEvent, CampaignRunner, CompletionHandler,
    DidPool, ScriptedTelephony,
};
use ringline_voice::{
    AudioFrame, ConversationEngine, EngineConfig, PlaceholderLanguage, PlaceholderSynthesis,
    ScriptedRecognizer, TranscriptEvent, TransferTriggers,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

struct World {
    runner: CampaignRunner,
    admission: Arc<AdmissionController>,
    pool: Arc<DidPool>,
    telephony: Arc<ScriptedTelephony>,
    store: Arc<MemoryStore>,
    deps: CallDeps,
}

fn world(policy: DidPolicy, dids: usize, recognizer: Vec<TranscriptEvent>) -> World {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut config = RinglineConfig::default();
    config.ring_timeout_seconds = 1;
    config.retry_backoff_ms = 20;
    config.utterance_gap_ms = 50;
    let config = Arc::new(config);

    let pool = Arc::new(DidPool::new(policy));
    for i in 0..dids {
        pool.insert(DidRecord::new(format!("did-{i}"), format!("+1555000{i:04}")));
    }
    let store = Arc::new(MemoryStore::new());
    let admission = Arc::new(AdmissionController::new(
        pool.clone(),
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
        Arc::new(PlaceholderLanguage::with_reply("Understood, thank you.")),
        Arc::new(PlaceholderSynthesis::default()),
        TransferTriggers::new(
            config.transfer_phrases.clone(),
            config.transfer_intents.clone(),
        ),
        store.clone(),
        EngineConfig::from_core(&config),
    ));
    let telephony = Arc::new(ScriptedTelephony::new());

    let deps = CallDeps {
        config,
        dispatcher: Arc::new(CallDispatcher::new()),
        telephony: telephony.clone(),
        recognizer: Arc::new(ScriptedRecognizer::new(recognizer)),
        engine,
        completion,
        alerts: admission.alert_sender(),
    };
    World {
        runner: CampaignRunner::new(deps.clone(), admission.clone()),
        admission,
        pool,
        telephony,
        store,
        deps,
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn answered_call_runs_the_full_pipeline() {
    let w = world(
        DidPolicy::default(),
        2,
        vec![
            TranscriptEvent::Final("hi there".into()),
            TranscriptEvent::EndOfUtterance,
        ],
    );
    let lead = Lead::new("camp-1", "+15557770000");
    w.runner
        .start("camp-1", "Appointment reminder script.", vec![lead], Some(1))
        .await;

    let telephony = w.telephony.clone();
    wait_until("placement", || !telephony.placed.lock().unwrap().is_empty()).await;
    let (call_id, _, _) = w.telephony.placed.lock().unwrap()[0].clone();

    w.deps.dispatcher.deliver(call_id, CallEvent::ProviderRinging);
    w.deps.dispatcher.deliver(call_id, CallEvent::Answered);

    // The first inbound audio frame confirms media attachment.
    let mut leg = None;
    for _ in 0..200 {
        leg = w.telephony.leg_for(call_id);
        if leg.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    leg.expect("media leg")
        .into_call
        .send(AudioFrame::silence())
        .await
        .unwrap();

    let runner = &w.runner;
    wait_until("campaign drained", || {
        runner.status("camp-1").map(|s| s.finished) == Some(1)
    })
    .await;

    let recorded = w.store.recorded_calls();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].outcome, Some(CallOutcome::Completed));
    let turns = w.store.turns(call_id).await.unwrap();
    assert_eq!(turns.len(), 2, "caller turn and assistant reply persisted");
    assert_eq!(w.admission.active_calls("camp-1").await, 0);
}

#[tokio::test]
async fn budget_limit_pauses_campaign_until_raised() {
    let w = world(DidPolicy::default(), 2, Vec::new());
    let mut ledger = BudgetLedger::new("camp-1", 1.0, 0.8);
    ledger.spent = 0.95;
    w.store.set_budget(&ledger).await.unwrap();

    let mut alerts = w.admission.alerts();
    let lead = Lead::new("camp-1", "+15557770000");
    w.runner.start("camp-1", "script", vec![lead], Some(2)).await;

    // The lead is refused and requeued; no call is placed.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(w.telephony.placed.lock().unwrap().is_empty());
    let status = w.runner.status("camp-1").unwrap();
    assert_eq!(status.queued, 1);
    assert_eq!(status.finished, 0);
    assert!(w.admission.paused_over_budget("camp-1").await);
    assert!(matches!(
        alerts.try_recv(),
        Ok(Alert::CampaignPaused { .. })
    ));

    // Operator raises the limit and resumes; the campaign drains.
    let mut raised = ledger.clone();
    raised.limit = 10.0;
    w.store.set_budget(&raised).await.unwrap();
    w.runner.resume("camp-1").await;

    let runner = &w.runner;
    wait_until("campaign drained after resume", || {
        runner.status("camp-1").map(|s| s.finished) == Some(1)
    })
    .await;
}

#[tokio::test]
async fn capped_did_is_withheld_until_daily_reset() {
    let policy = DidPolicy {
        daily_call_cap: 1,
        ..DidPolicy::default()
    };
    let w = world(policy, 1, Vec::new());
    let leads = vec![
        Lead::new("camp-1", "+15557770000"),
        Lead::new("camp-1", "+15557770001"),
    ];
    w.runner.start("camp-1", "script", leads, Some(5)).await;

    // First lead burns the single DID's daily cap (ring timeout, 1s).
    let runner = &w.runner;
    wait_until("first call finished", || {
        runner.status("camp-1").map(|s| s.finished) == Some(1)
    })
    .await;

    // Second lead cannot be admitted: the only DID is at its cap.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let status = w.runner.status("camp-1").unwrap();
    assert_eq!(status.queued, 1);
    assert!(w.pool.acquire("camp-1").is_none());

    // Daily reset frees the DID and the campaign drains.
    w.pool.reset_daily_counters();
    wait_until("campaign drained after reset", || {
        runner.status("camp-1").map(|s| s.finished) == Some(2)
    })
    .await;
}

#[tokio::test]
async fn leak_guard_forces_stuck_call_terminal() {
    let w = world(DidPolicy::default(), 1, Vec::new());
    // Ring window longer than the overall deadline: the call gets stuck.
    let mut config = (*w.deps.config).clone();
    config.ring_timeout_seconds = 30;
    config.call_timeout_seconds = 1;
    let mut deps = w.deps.clone();
    deps.config = Arc::new(config);

    let mut alerts = w.admission.alerts();
    let lead = Lead::new("camp-1", "+15557770000");
    let (token, call) = w.admission.try_admit(&lead).await.unwrap().unwrap();
    let call_id = call.id;

    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let outcome =
        ringline_dialer::run_call(deps, token, call, lead, String::new(), cancel_rx).await;

    assert_eq!(outcome, CallOutcome::ForcedTimeout);
    assert_eq!(w.admission.active_calls("camp-1").await, 0);
    match alerts.try_recv() {
        Ok(Alert::LeakGuard { call, .. }) => assert_eq!(call, call_id),
        other => panic!("expected leak guard alert, got {other:?}"),
    }
}
