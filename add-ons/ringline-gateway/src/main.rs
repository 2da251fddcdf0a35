//! Axum-based gateway for the Ringline dialer. Config-driven via
//! `RinglineConfig`; the API keys for telephony and the voice services stay in
//! the backend environment, the dashboard never sees them.
//!
//! Surfaces:
//! - campaign control (`start`/`pause`/`resume`/`stop`/`status`)
//! - per-call cancel
//! - the telephony status-callback webhook
//! - the provider audio websocket (16-bit PCM frames, keyed by call id)
//! - DID inventory management
//! - an SSE stream of operator alerts

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{Method, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use ringline_core::{
    BudgetLedger, CallStore, DidRecord, Lead, MemoryStore, PhoneCandidate, RinglineConfig,
    SledStore,
};
use ringline_dialer::{
    AdmissionController, CallDeps, CallDispatcher, CallEvent, CampaignRunner, CompletionHandler,
    DidPool, HttpTelephony, MediaLeg, ScriptedTelephony, TelephonyClient,
};
use ringline_voice::{
    pcm16_to_frames, ConversationEngine, EngineConfig, HttpLanguage, HttpRecognizer,
    HttpSynthesis, LanguageBackend, PlaceholderLanguage, PlaceholderSynthesis, RecognizerBackend,
    ScriptedRecognizer, SynthesisBackend, TransferTriggers,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Clone)]
struct AppState {
    config: Arc<RinglineConfig>,
    runner: Arc<CampaignRunner>,
    admission: Arc<AdmissionController>,
    pool: Arc<DidPool>,
    dispatcher: Arc<CallDispatcher>,
    store: Arc<dyn CallStore>,
    /// Present only when the HTTP telephony provider is configured; the media
    /// websocket claims its per-call legs from here.
    http_telephony: Option<Arc<HttpTelephony>>,
}

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[ringline-gateway] .env not loaded: {e} (using system environment)");
    }
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(RinglineConfig::load().unwrap_or_else(|e| {
        warn!("config load failed ({e}), using defaults");
        RinglineConfig::default()
    }));

    let store: Arc<dyn CallStore> = match SledStore::open(&config.storage_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            warn!("sled open failed ({e}), falling back to in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let pool = Arc::new(DidPool::new(config.did.clone()));
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

    let language: Arc<dyn LanguageBackend> = match HttpLanguage::from_env() {
        Ok(backend) => Arc::new(backend),
        Err(e) => {
            warn!("language backend unavailable ({e}), using placeholder");
            Arc::new(PlaceholderLanguage::with_reply(
                "Thanks, let me note that down.",
            ))
        }
    };
    let synthesis: Arc<dyn SynthesisBackend> = match HttpSynthesis::from_env() {
        Ok(backend) => Arc::new(backend),
        Err(e) => {
            warn!("synthesis backend unavailable ({e}), using placeholder");
            Arc::new(PlaceholderSynthesis::default())
        }
    };
    let recognizer: Arc<dyn RecognizerBackend> = match HttpRecognizer::from_env() {
        Ok(backend) => Arc::new(backend),
        Err(e) => {
            warn!("recognition backend unavailable ({e}), using silent stub");
            Arc::new(ScriptedRecognizer::new(Vec::new()))
        }
    };
    let engine = Arc::new(ConversationEngine::new(
        language,
        synthesis,
        TransferTriggers::new(
            config.transfer_phrases.clone(),
            config.transfer_intents.clone(),
        ),
        store.clone(),
        EngineConfig::from_core(&config),
    ));

    let (telephony, http_telephony): (Arc<dyn TelephonyClient>, Option<Arc<HttpTelephony>>) =
        match HttpTelephony::from_env() {
            Ok(client) => {
                let client = Arc::new(client);
                (client.clone(), Some(client))
            }
            Err(e) => {
                warn!("telephony provider unavailable ({e}), using scripted stub");
                (Arc::new(ScriptedTelephony::new()), None)
            }
        };

    let dispatcher = Arc::new(CallDispatcher::new());
    let deps = CallDeps {
        config: config.clone(),
        dispatcher: dispatcher.clone(),
        telephony,
        recognizer,
        engine,
        completion,
        alerts: admission.alert_sender(),
    };
    let runner = Arc::new(CampaignRunner::new(deps, admission.clone()));

    let state = AppState {
        config: config.clone(),
        runner,
        admission,
        pool,
        dispatcher,
        store,
        http_telephony,
    };

    let addr = format!("0.0.0.0:{}", config.port);
    info!(%addr, "ringline gateway listening");
    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    axum::serve(listener, router(state)).await.unwrap();
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/campaigns", get(list_campaigns))
        .route("/api/v1/campaigns/:id/start", post(start_campaign))
        .route("/api/v1/campaigns/:id/pause", post(pause_campaign))
        .route("/api/v1/campaigns/:id/resume", post(resume_campaign))
        .route("/api/v1/campaigns/:id/stop", post(stop_campaign))
        .route("/api/v1/campaigns/:id/status", get(campaign_status))
        .route("/api/v1/calls/:id/cancel", post(cancel_call))
        .route("/api/v1/callbacks/telephony", post(telephony_callback))
        .route("/api/v1/media/:call", get(media_stream))
        .route("/api/v1/dids", get(list_dids).post(add_did))
        .route("/api/v1/dids/reset", post(reset_dids))
        .route("/api/v1/dids/:id/reactivate", post(reactivate_did))
        .route("/api/v1/alerts", get(alerts_stream))
        .layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::any())
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(Any),
        )
        .with_state(state)
}

// -----------------------------------------------------------------------------
// Campaign control
// -----------------------------------------------------------------------------

#[derive(Deserialize)]
struct StartCampaignRequest {
    script: String,
    leads: Vec<LeadSpec>,
    #[serde(default)]
    ceiling: Option<usize>,
    #[serde(default)]
    budget: Option<BudgetSpec>,
}

#[derive(Deserialize)]
struct LeadSpec {
    /// Phone candidates in preference order (E.164).
    phones: Vec<String>,
}

#[derive(Deserialize)]
struct BudgetSpec {
    limit: f64,
    alert_threshold: f64,
}

async fn start_campaign(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<StartCampaignRequest>,
) -> impl IntoResponse {
    if let Some(budget) = &req.budget {
        let ledger = BudgetLedger::new(id.clone(), budget.limit, budget.alert_threshold);
        if let Err(e) = state.store.set_budget(&ledger).await {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    }

    let leads: Vec<Lead> = req
        .leads
        .iter()
        .filter_map(|spec| {
            let mut phones = spec.phones.iter();
            let mut lead = Lead::new(id.clone(), phones.next()?.clone());
            for phone in phones {
                lead.phones.push(PhoneCandidate::new(phone.clone()));
            }
            Some(lead)
        })
        .collect();
    let queued = leads.len();

    if state.runner.start(id.clone(), req.script, leads, req.ceiling).await {
        Json(json!({ "campaign": id, "started": true, "queued": queued })).into_response()
    } else {
        (
            StatusCode::CONFLICT,
            Json(json!({ "campaign": id, "started": false, "error": "already running" })),
        )
            .into_response()
    }
}

async fn pause_campaign(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    if state.runner.pause(&id) {
        Json(json!({ "campaign": id, "paused": true })).into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

async fn resume_campaign(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if state.runner.resume(&id).await {
        Json(json!({ "campaign": id, "resumed": true })).into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

async fn stop_campaign(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    if state.runner.stop(&id) {
        Json(json!({ "campaign": id, "stopped": true })).into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

async fn campaign_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.runner.status(&id) {
        Some(status) => Json(status).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn list_campaigns(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.runner.statuses())
}

// -----------------------------------------------------------------------------
// Calls: cancel, status webhook, media bridge
// -----------------------------------------------------------------------------

async fn cancel_call(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    if state.runner.cancel_call(id) {
        Json(json!({ "call": id, "canceled": true })).into_response()
    } else {
        (
            StatusCode::GONE,
            Json(json!({ "call": id, "canceled": false, "error": "call not live" })),
        )
            .into_response()
    }
}

#[derive(Deserialize)]
struct TelephonyCallback {
    call: Uuid,
    event: CallEvent,
}

/// Provider status webhook. Duplicate or late callbacks are dropped by the
/// dispatcher and answered 410; the provider should not retry those.
async fn telephony_callback(
    State(state): State<AppState>,
    Json(cb): Json<TelephonyCallback>,
) -> impl IntoResponse {
    if state.dispatcher.deliver(cb.call, cb.event) {
        StatusCode::ACCEPTED
    } else {
        StatusCode::GONE
    }
}

async fn media_stream(
    ws: WebSocketUpgrade,
    Path(call): Path<Uuid>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let Some(telephony) = state.http_telephony.clone() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(leg) = telephony.leg_for(call) else {
        // Not answered yet, already claimed, or already finished.
        return StatusCode::GONE.into_response();
    };
    ws.on_upgrade(move |socket| pump_media(socket, call, leg))
}

/// Bridges the provider websocket to the call's media channels. Inbound
/// binary messages are 16-bit little-endian PCM; outbound frames are encoded
/// the same way.
async fn pump_media(mut socket: WebSocket, call: Uuid, leg: MediaLeg) {
    let MediaLeg {
        into_call,
        mut from_call,
    } = leg;
    info!(%call, "provider media socket connected");

    loop {
        tokio::select! {
            msg = socket.recv() => match msg {
                Some(Ok(Message::Binary(bytes))) => {
                    for frame in pcm16_to_frames(&bytes) {
                        if into_call.send(frame).await.is_err() {
                            return;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!(%call, "provider media socket closed");
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(%call, "media socket error: {e}");
                    return;
                }
            },
            frame = from_call.recv() => match frame {
                Some(frame) => {
                    let mut bytes = Vec::with_capacity(frame.samples.len() * 2);
                    for sample in &frame.samples {
                        let v = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                        bytes.extend_from_slice(&v.to_le_bytes());
                    }
                    if socket.send(Message::Binary(bytes)).await.is_err() {
                        return;
                    }
                }
                None => {
                    let _ = socket.send(Message::Close(None)).await;
                    return;
                }
            },
        }
    }
}

// -----------------------------------------------------------------------------
// DID inventory
// -----------------------------------------------------------------------------

#[derive(Deserialize)]
struct AddDidRequest {
    id: String,
    number: String,
}

async fn add_did(State(state): State<AppState>, Json(req): Json<AddDidRequest>) -> impl IntoResponse {
    state.pool.insert(DidRecord::new(req.id.clone(), req.number));
    Json(json!({ "did": req.id, "added": true }))
}

async fn list_dids(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.pool.snapshot())
}

async fn reset_dids(State(state): State<AppState>) -> impl IntoResponse {
    state.pool.reset_daily_counters();
    Json(json!({ "reset": true }))
}

async fn reactivate_did(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    state.pool.reactivate(&id);
    Json(json!({ "did": id, "reactivated": true }))
}

// -----------------------------------------------------------------------------
// Observability
// -----------------------------------------------------------------------------

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "live_calls": state.dispatcher.live_calls(),
        "dropped_events": state.dispatcher.dropped_events(),
        "port": state.config.port,
    }))
}

/// Operator alert stream: budget thresholds, auto-pauses, leak-guard trips,
/// repeated service failures.
async fn alerts_stream(
    State(state): State<AppState>,
) -> Sse<impl futures_util::Stream<Item = Result<Event, axum::Error>>> {
    let rx = state.admission.alerts();
    let stream = BroadcastStream::new(rx).filter_map(|item| async move {
        match item {
            Ok(alert) => Some(Event::default().event("alert").json_data(&alert)),
            // Lagged subscriber: skip what was missed, keep streaming.
            Err(_) => None,
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
