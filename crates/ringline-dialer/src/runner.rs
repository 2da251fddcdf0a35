//! **Call runner** — one tokio task per admitted call.
//!
//! The task owns the call record end to end: places the outbound leg, consumes
//! the call's sequential event queue, enforces the ring and media-attach
//! timeouts, wires up the relay/recognizer/engine once the call connects, and
//! hands the finished call to the completion handler. An overall per-call
//! deadline acts as a leak guard: no call task outlives it, whatever the
//! provider does.

use crate::admission::AdmitToken;
use crate::completion::CompletionHandler;
use crate::dispatch::CallDispatcher;
use crate::state::{self, CallEvent};
use crate::telephony::TelephonyClient;
use ringline_core::{
    Alert, CallOutcome, CallRecord, CallState, Lead, RinglineConfig, RinglineResult,
};
use ringline_voice::{
    spawn_relay, AudioFrame, ConversationEngine, EngineOutcome, MediaRelayHandle,
    RecognizerBackend, TranscriptEvent,
};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Everything a call task needs. Cloned once per spawned call.
#[derive(Clone)]
pub struct CallDeps {
    pub config: Arc<RinglineConfig>,
    pub dispatcher: Arc<CallDispatcher>,
    pub telephony: Arc<dyn TelephonyClient>,
    pub recognizer: Arc<dyn RecognizerBackend>,
    pub engine: Arc<ConversationEngine>,
    pub completion: Arc<CompletionHandler>,
    pub alerts: broadcast::Sender<Alert>,
}

/// Per-call wiring that exists only while the task runs.
#[derive(Default)]
struct Session {
    provider_id: Option<String>,
    ring_deadline: Option<Instant>,
    attach_deadline: Option<Instant>,
    relay: Option<MediaRelayHandle>,
    recognizer_task: Option<JoinHandle<()>>,
    attach_task: Option<JoinHandle<()>>,
    engine_task: Option<JoinHandle<RinglineResult<EngineOutcome>>>,
    /// Engine-side channel ends, parked between media-open and attach.
    pending_io: Option<(mpsc::Receiver<TranscriptEvent>, mpsc::Sender<AudioFrame>)>,
}

/// Drives one call from placement to completion. Returns the outcome after
/// the completion handler has released the slot, DID, and spend.
pub async fn run_call(
    deps: CallDeps,
    token: AdmitToken,
    mut call: CallRecord,
    mut lead: Lead,
    script: String,
    cancel: watch::Receiver<bool>,
) -> CallOutcome {
    let caller_id = token.lease.number.clone();
    let mut events = deps.dispatcher.register(call.id);
    let mut session = Session::default();

    let outcome = drive(
        &deps,
        &mut call,
        &lead,
        &caller_id,
        &script,
        &mut events,
        cancel,
        &mut session,
    )
    .await;

    deps.dispatcher.unregister(call.id);
    teardown(&deps, &call, outcome, &mut session).await;

    if outcome == CallOutcome::ForcedTimeout {
        warn!(call = %call.id, "leak guard tripped, call forced terminal");
        let _ = deps.alerts.send(Alert::LeakGuard {
            call: call.id,
            campaign: call.campaign.clone(),
        });
    }

    if let Err(e) = deps.completion.finalize(token, call, outcome, &mut lead).await {
        error!("finalize failed: {e}");
    }
    outcome
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    deps: &CallDeps,
    call: &mut CallRecord,
    lead: &Lead,
    caller_id: &str,
    script: &str,
    events: &mut mpsc::UnboundedReceiver<CallEvent>,
    mut cancel: watch::Receiver<bool>,
    session: &mut Session,
) -> CallOutcome {
    let Some(candidate) = lead.next_candidate() else {
        state::apply(call, CallEvent::Canceled);
        return CallOutcome::Canceled;
    };
    if *cancel.borrow() {
        state::apply(call, CallEvent::Canceled);
        return CallOutcome::Canceled;
    }

    let overall = Instant::now() + deps.config.call_timeout();

    state::apply(call, CallEvent::DialStarted);
    match place_with_retry(deps, call.id, caller_id, &candidate.number).await {
        Ok(provider_id) => {
            info!(call = %call.id, provider = %provider_id, to = %candidate.number, "call placed");
            session.provider_id = Some(provider_id);
            session.ring_deadline = Some(Instant::now() + deps.config.ring_timeout());
        }
        Err(e) => {
            warn!(call = %call.id, "placement failed after retries: {e}");
            state::apply(call, CallEvent::CarrierError);
            return CallOutcome::ServiceFailure;
        }
    }

    let (engine_cancel_tx, engine_cancel_rx) = watch::channel(false);
    let mut cancel_open = true;

    loop {
        // The nearest applicable deadline for the current state, capped by
        // the overall leak guard.
        let (mut deadline, mut deadline_event) = match call.state {
            CallState::Dialing | CallState::Ringing => (
                session.ring_deadline.unwrap_or(overall),
                CallEvent::RingTimeout,
            ),
            CallState::Connected => (
                session.attach_deadline.unwrap_or(overall),
                CallEvent::AttachTimeout,
            ),
            _ => (overall, CallEvent::ForcedTimeout),
        };
        if overall < deadline {
            deadline = overall;
            deadline_event = CallEvent::ForcedTimeout;
        }

        tokio::select! {
            changed = cancel.changed(), if cancel_open => {
                match changed {
                    Ok(()) if *cancel.borrow() => match call.state {
                        // Mid-conversation stops wind down at the next turn
                        // boundary; the engine returns Completed.
                        CallState::Conversing | CallState::Transferring => {
                            info!(call = %call.id, "stop requested, winding down at turn boundary");
                            let _ = engine_cancel_tx.send(true);
                        }
                        _ => {
                            state::apply(call, CallEvent::Canceled);
                            return CallOutcome::Canceled;
                        }
                    },
                    Ok(()) => {}
                    // Operator side gone; no further stop signals will come.
                    Err(_) => cancel_open = false,
                }
            }

            joined = engine_wait(&mut session.engine_task) => {
                session.engine_task = None;
                if let Some(outcome) = handle_engine_exit(deps, call, session, joined).await {
                    return outcome;
                }
            }

            maybe = events.recv() => {
                let Some(event) = maybe else {
                    // Dispatcher route dropped out from under the task.
                    state::apply(call, CallEvent::Canceled);
                    return CallOutcome::Canceled;
                };
                if let Some(outcome) =
                    handle_event(deps, call, script, session, event, &engine_cancel_rx).await
                {
                    return outcome;
                }
            }

            _ = sleep_until(deadline) => {
                if let Some(outcome) =
                    handle_event(deps, call, script, session, deadline_event, &engine_cancel_rx).await
                {
                    return outcome;
                }
            }
        }
    }
}

/// Resolves when the engine task finishes; pends forever while there is none.
async fn engine_wait(
    task: &mut Option<JoinHandle<RinglineResult<EngineOutcome>>>,
) -> Result<RinglineResult<EngineOutcome>, tokio::task::JoinError> {
    match task.as_mut() {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn handle_engine_exit(
    deps: &CallDeps,
    call: &mut CallRecord,
    session: &mut Session,
    joined: Result<RinglineResult<EngineOutcome>, tokio::task::JoinError>,
) -> Option<CallOutcome> {
    match joined {
        Ok(Ok(EngineOutcome::Transfer)) => {
            state::apply(call, CallEvent::TransferTriggered);
            let provider = session.provider_id.clone().unwrap_or_default();
            match deps
                .telephony
                .transfer(&provider, &deps.config.transfer_target)
                .await
            {
                Ok(()) => {
                    state::apply(call, CallEvent::TransferComplete);
                    Some(CallOutcome::Transferred)
                }
                Err(e) => {
                    warn!(call = %call.id, "transfer failed: {e}");
                    state::apply(call, CallEvent::CarrierError);
                    Some(CallOutcome::ServiceFailure)
                }
            }
        }
        Ok(Ok(EngineOutcome::Completed)) => {
            state::apply(call, CallEvent::ConversationDone);
            Some(CallOutcome::Completed)
        }
        Ok(Ok(EngineOutcome::ServiceFailure)) => {
            let _ = deps.alerts.send(Alert::ServiceFailures {
                call: call.id,
                service: "language".to_string(),
                attempts: deps.config.max_service_retries,
            });
            state::apply(call, CallEvent::CarrierError);
            Some(CallOutcome::ServiceFailure)
        }
        Ok(Err(e)) => {
            warn!(call = %call.id, "conversation engine error: {e}");
            state::apply(call, CallEvent::CarrierError);
            Some(CallOutcome::ServiceFailure)
        }
        Err(e) => {
            error!(call = %call.id, "conversation engine task panicked: {e}");
            state::apply(call, CallEvent::CarrierError);
            Some(CallOutcome::ServiceFailure)
        }
    }
}

/// Applies one event; sets up per-state wiring on entry to Connected and
/// Conversing. Returns the outcome once the call goes terminal.
async fn handle_event(
    deps: &CallDeps,
    call: &mut CallRecord,
    script: &str,
    session: &mut Session,
    event: CallEvent,
    engine_cancel: &watch::Receiver<bool>,
) -> Option<CallOutcome> {
    if !state::apply(call, event) {
        return None;
    }

    match call.state {
        CallState::Connected => {
            session.ring_deadline = None;
            session.attach_deadline = Some(Instant::now() + deps.config.attach_grace());
            if let Err(e) = open_media(deps, call.id, session).await {
                warn!(call = %call.id, "media open failed: {e}");
                state::apply(call, CallEvent::CarrierError);
                return Some(CallOutcome::ServiceFailure);
            }
        }
        CallState::Conversing => {
            session.attach_deadline = None;
            start_engine(deps, call.id, script, session, engine_cancel.clone());
        }
        _ => {}
    }

    call.state.is_terminal().then(|| outcome_for(event))
}

async fn place_with_retry(
    deps: &CallDeps,
    call: Uuid,
    from: &str,
    to: &str,
) -> RinglineResult<String> {
    let mut backoff = deps.config.retry_backoff();
    let mut attempt = 0u32;
    loop {
        match deps.telephony.place_call(call, from, to).await {
            Ok(provider_id) => return Ok(provider_id),
            Err(e) => {
                attempt += 1;
                if attempt >= deps.config.max_service_retries {
                    return Err(e);
                }
                warn!(%call, attempt, "placement failed, retrying: {e}");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
    }
}

/// Opens the provider media channel and wires relay + recognizer. The engine
/// is not started yet: it waits for the attach confirmation, which arrives as
/// a `MediaAttached` event once the first inbound frame flows.
async fn open_media(deps: &CallDeps, call: Uuid, session: &mut Session) -> RinglineResult<()> {
    let channels = deps.telephony.open_media(call).await?;

    let (rec_audio_tx, rec_audio_rx) = mpsc::channel(64);
    let (transcript_tx, transcript_rx) = mpsc::channel(64);
    let (synth_tx, synth_rx) = mpsc::channel(256);

    let mut relay = spawn_relay(
        call,
        deps.config.relay_buffer_frames,
        channels.from_leg,
        rec_audio_tx,
        synth_rx,
        channels.to_leg,
    );

    if let Some(attached) = relay.take_attached() {
        let dispatcher = deps.dispatcher.clone();
        session.attach_task = Some(tokio::spawn(async move {
            if attached.await.is_ok() {
                dispatcher.deliver(call, CallEvent::MediaAttached);
            }
        }));
    }

    let recognizer = deps.recognizer.clone();
    session.recognizer_task = Some(tokio::spawn(async move {
        if let Err(e) = recognizer.run_stream(rec_audio_rx, transcript_tx).await {
            warn!(%call, "recognition stream ended with error: {e}");
        }
    }));

    session.relay = Some(relay);
    session.pending_io = Some((transcript_rx, synth_tx));
    Ok(())
}

fn start_engine(
    deps: &CallDeps,
    call: Uuid,
    script: &str,
    session: &mut Session,
    cancel: watch::Receiver<bool>,
) {
    let Some((transcripts, synth_out)) = session.pending_io.take() else {
        return;
    };
    let engine = deps.engine.clone();
    let script = script.to_string();
    session.engine_task = Some(tokio::spawn(async move {
        engine.run(call, &script, transcripts, synth_out, cancel).await
    }));
}

/// Maps the terminal-causing event to the recorded outcome.
fn outcome_for(event: CallEvent) -> CallOutcome {
    match event {
        CallEvent::NoAnswer => CallOutcome::NoAnswer,
        CallEvent::Busy => CallOutcome::Busy,
        CallEvent::CarrierError => CallOutcome::CarrierError,
        CallEvent::RingTimeout => CallOutcome::RingTimeout,
        CallEvent::AttachTimeout => CallOutcome::MediaTimeout,
        CallEvent::Canceled => CallOutcome::Canceled,
        CallEvent::ForcedTimeout => CallOutcome::ForcedTimeout,
        CallEvent::TransferComplete => CallOutcome::Transferred,
        CallEvent::VoicemailDetected => CallOutcome::Voicemail,
        _ => CallOutcome::Completed,
    }
}

/// Stops whatever is still running and hangs up any live leg.
async fn teardown(deps: &CallDeps, call: &CallRecord, outcome: CallOutcome, session: &mut Session) {
    if let Some(task) = session.engine_task.take() {
        task.abort();
    }
    if let Some(task) = session.attach_task.take() {
        task.abort();
    }
    if let Some(task) = session.recognizer_task.take() {
        task.abort();
    }
    if let Some(relay) = session.relay.take() {
        let (inbound, outbound) = relay.shutdown().await;
        if inbound + outbound > 0 {
            info!(call = %call.id, inbound, outbound, "relay dropped frames under backpressure");
        }
    }

    // Transferred calls belong to the agent now; provider-terminated calls
    // have no leg left to hang up.
    let leg_may_be_live = !matches!(
        outcome,
        CallOutcome::Transferred
            | CallOutcome::NoAnswer
            | CallOutcome::Busy
            | CallOutcome::CarrierError
    );
    if leg_may_be_live {
        if let Some(provider) = session.provider_id.take() {
            if let Err(e) = deps.telephony.hangup(&provider).await {
                warn!(call = %call.id, "hangup failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionController;
    use crate::did_pool::DidPool;
    use crate::telephony::ScriptedTelephony;
    use ringline_core::{CallStore, DidPolicy, DidRecord, MemoryStore};
    use ringline_voice::{
        EngineConfig, PlaceholderLanguage, PlaceholderSynthesis, ScriptedRecognizer,
        TransferTriggers,
    };
    use std::time::Duration;

    struct Harness {
        deps: CallDeps,
        admission: Arc<AdmissionController>,
        telephony: Arc<ScriptedTelephony>,
        store: Arc<MemoryStore>,
        pool: Arc<DidPool>,
    }

    fn harness(recognizer_script: Vec<TranscriptEvent>) -> Harness {
        let mut config = ringline_core::RinglineConfig::default();
        config.ring_timeout_seconds = 1;
        config.attach_grace_ms = 500;
        config.utterance_gap_ms = 50;
        config.silence_timeout_seconds = 1;
        config.turn_latency_budget_ms = 200;
        let config = Arc::new(config);

        let pool = Arc::new(DidPool::new(DidPolicy::default()));
        pool.insert(DidRecord::new("did-1", "+15550009999"));
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
            Arc::new(PlaceholderLanguage::with_reply("Understood.")),
            Arc::new(PlaceholderSynthesis::default()),
            TransferTriggers::new(config.transfer_phrases.clone(), config.transfer_intents.clone()),
            store.clone(),
            EngineConfig::from_core(&config),
        ));
        let telephony = Arc::new(ScriptedTelephony::new());

        let deps = CallDeps {
            config,
            dispatcher: Arc::new(CallDispatcher::new()),
            telephony: telephony.clone(),
            recognizer: Arc::new(ScriptedRecognizer::new(recognizer_script)),
            engine,
            completion,
            alerts: admission.alert_sender(),
        };
        Harness {
            deps,
            admission,
            telephony,
            store,
            pool,
        }
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn happy_path_runs_conversation_to_completion() {
        let h = harness(vec![
            TranscriptEvent::Final("hello".into()),
            TranscriptEvent::EndOfUtterance,
        ]);
        let lead = Lead::new("camp-1", "+15557770000");
        let (token, call) = h.admission.try_admit(&lead).await.unwrap().unwrap();
        let call_id = call.id;

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(run_call(
            h.deps.clone(),
            token,
            call,
            lead,
            "Survey script.".to_string(),
            cancel_rx,
        ));

        let telephony = h.telephony.clone();
        wait_for("placement", || {
            !telephony.placed.lock().unwrap().is_empty()
        })
        .await;

        let dispatcher = h.deps.dispatcher.clone();
        dispatcher.deliver(call_id, CallEvent::ProviderRinging);
        dispatcher.deliver(call_id, CallEvent::Answered);

        // The media channel opens on answer; feed one frame to confirm attach.
        let mut leg = None;
        for _ in 0..200 {
            leg = h.telephony.leg_for(call_id);
            if leg.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let leg = leg.expect("media leg");
        leg.into_call.send(AudioFrame::silence()).await.unwrap();

        // The caller-side leg stays open; after the scripted exchange the
        // caller goes quiet, and the silence timeout ends the conversation.
        let outcome = task.await.unwrap();
        assert_eq!(outcome, CallOutcome::Completed);

        // Slot and DID are back, and the call was recorded with its outcome.
        assert_eq!(h.admission.active_calls("camp-1").await, 0);
        assert!(h.pool.acquire("camp-1").is_some());
        let recorded = h.store.recorded_calls();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].outcome, Some(CallOutcome::Completed));
        // The conversation itself was persisted.
        assert!(!h.store.turns(call_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ring_timeout_abandons_and_releases_resources() {
        let h = harness(Vec::new());
        let lead = Lead::new("camp-1", "+15557770000");
        let (token, call) = h.admission.try_admit(&lead).await.unwrap().unwrap();

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let outcome = run_call(
            h.deps.clone(),
            token,
            call,
            lead,
            String::new(),
            cancel_rx,
        )
        .await;

        // Nobody delivered an answer: the 1s ring window elapses.
        assert_eq!(outcome, CallOutcome::RingTimeout);
        assert_eq!(h.admission.active_calls("camp-1").await, 0);
        assert!(h.pool.acquire("camp-1").is_some());
        // The ringing leg was hung up.
        assert_eq!(h.telephony.hangups.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancel_while_ringing_abandons_immediately() {
        let h = harness(Vec::new());
        let lead = Lead::new("camp-1", "+15557770000");
        let (token, call) = h.admission.try_admit(&lead).await.unwrap().unwrap();
        let call_id = call.id;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(run_call(
            h.deps.clone(),
            token,
            call,
            lead,
            String::new(),
            cancel_rx,
        ));

        let telephony = h.telephony.clone();
        wait_for("placement", || {
            !telephony.placed.lock().unwrap().is_empty()
        })
        .await;
        h.deps.dispatcher.deliver(call_id, CallEvent::ProviderRinging);
        cancel_tx.send(true).unwrap();

        let outcome = task.await.unwrap();
        assert_eq!(outcome, CallOutcome::Canceled);
        let recorded = h.store.recorded_calls();
        assert_eq!(recorded[0].outcome, Some(CallOutcome::Canceled));
    }

    #[tokio::test]
    async fn no_answer_callback_fails_the_call() {
        let h = harness(Vec::new());
        let lead = Lead::new("camp-1", "+15557770000");
        let (token, call) = h.admission.try_admit(&lead).await.unwrap().unwrap();
        let call_id = call.id;

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(run_call(
            h.deps.clone(),
            token,
            call,
            lead,
            String::new(),
            cancel_rx,
        ));

        let telephony = h.telephony.clone();
        wait_for("placement", || {
            !telephony.placed.lock().unwrap().is_empty()
        })
        .await;
        h.deps.dispatcher.deliver(call_id, CallEvent::NoAnswer);

        let outcome = task.await.unwrap();
        assert_eq!(outcome, CallOutcome::NoAnswer);
        // Provider ended the call; we do not hang up a dead leg.
        assert!(h.telephony.hangups.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn transfer_phrase_bridges_to_agent() {
        let h = harness(vec![
            TranscriptEvent::Final("I want to speak to a person".into()),
            TranscriptEvent::EndOfUtterance,
        ]);
        let lead = Lead::new("camp-1", "+15557770000");
        let (token, call) = h.admission.try_admit(&lead).await.unwrap().unwrap();
        let call_id = call.id;

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(run_call(
            h.deps.clone(),
            token,
            call,
            lead,
            String::new(),
            cancel_rx,
        ));

        let telephony = h.telephony.clone();
        wait_for("placement", || {
            !telephony.placed.lock().unwrap().is_empty()
        })
        .await;
        h.deps.dispatcher.deliver(call_id, CallEvent::Answered);

        let mut leg = None;
        for _ in 0..200 {
            leg = h.telephony.leg_for(call_id);
            if leg.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let leg = leg.expect("media leg");
        leg.into_call.send(AudioFrame::silence()).await.unwrap();

        let outcome = task.await.unwrap();
        assert_eq!(outcome, CallOutcome::Transferred);
        assert_eq!(h.telephony.transfers.lock().unwrap().len(), 1);
        // Transferred calls are not hung up by us.
        assert!(h.telephony.hangups.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn placement_failure_after_retries_is_service_failure() {
        let mut h = harness(Vec::new());
        let telephony = Arc::new(ScriptedTelephony::failing("carrier 503"));
        h.deps.telephony = telephony;

        let lead = Lead::new("camp-1", "+15557770000");
        let (token, call) = h.admission.try_admit(&lead).await.unwrap().unwrap();

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let outcome = run_call(h.deps.clone(), token, call, lead, String::new(), cancel_rx).await;
        assert_eq!(outcome, CallOutcome::ServiceFailure);
        assert_eq!(h.admission.active_calls("camp-1").await, 0);
    }
}
