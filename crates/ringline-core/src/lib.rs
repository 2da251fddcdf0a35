//! # Ringline Core — shared contracts for the outbound dialer
//!
//! Data model (leads, DIDs, calls, turns, budgets), error taxonomy,
//! configuration, and the durable call store used by the orchestration core.

pub mod config;
pub mod error;
pub mod store;
pub mod types;

pub use config::{DidPolicy, RinglineConfig};
pub use error::{RinglineError, RinglineResult};
pub use store::{CallStore, MemoryStore, SledStore};
pub use types::{
    Alert, BudgetLedger, CallOutcome, CallRecord, CallState, CampaignId, ConversationTurn,
    DidId, DidRecord, Lead, PhoneCandidate, Speaker,
};
