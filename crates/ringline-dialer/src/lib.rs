//! # Ringline Dialer — outbound call orchestration core
//!
//! ```text
//! leads ─▶ CampaignRunner ─▶ AdmissionController ─▶ run_call (one task/call)
//!                                   │                    │
//!                               DidPool            CallDispatcher ◀─ webhooks
//!                                                        │
//!                                             relay / recognizer / engine
//!                                                        │
//!                                               CompletionHandler
//! ```
//!
//! Each admitted call runs in its own tokio task, which owns the call's state
//! machine and media wiring end to end. Cross-call state is limited to the DID
//! pool, the per-campaign admission gates, and the budget ledger, each behind
//! its own short critical section.

pub mod admission;
pub mod campaign;
pub mod completion;
pub mod did_pool;
pub mod dispatch;
pub mod runner;
pub mod state;
pub mod telephony;

pub use admission::{AdmissionController, AdmitToken, RejectReason};
pub use campaign::{CampaignRunner, QueueStatus};
pub use completion::CompletionHandler;
pub use did_pool::{DidLease, DidPool, HealthSignal};
pub use dispatch::CallDispatcher;
pub use runner::{run_call, CallDeps};
pub use state::{apply, transition, CallEvent};
pub use telephony::{
    HttpTelephony, MediaChannels, MediaLeg, ScriptedTelephony, TelephonyClient,
};
