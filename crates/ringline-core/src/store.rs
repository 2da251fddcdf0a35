//! Durable call store: the persistence collaborator behind the orchestration core.
//!
//! The core never assumes in-process durability of call or turn data; every
//! turn and terminal outcome goes through this trait. `SledStore` is the
//! production implementation (one sled tree per record family, JSON values);
//! `MemoryStore` backs tests.

use crate::error::{RinglineError, RinglineResult};
use crate::types::{BudgetLedger, CallRecord, CampaignId, ConversationTurn};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

/// Persistence contract required by the orchestration core. All operations are
/// independently retryable.
#[async_trait]
pub trait CallStore: Send + Sync {
    /// Appends one conversation turn. Turns for a call arrive in strictly
    /// increasing `seq` order and are never rewritten.
    async fn append_turn(&self, turn: &ConversationTurn) -> RinglineResult<()>;

    /// Records a call's terminal state. Called exactly once per call.
    async fn record_call_outcome(&self, call: &CallRecord) -> RinglineResult<()>;

    /// Reads the campaign's budget ledger; `None` means no budget configured.
    async fn read_budget(&self, campaign: &str) -> RinglineResult<Option<BudgetLedger>>;

    /// Adds `amount` to the campaign's spent total.
    async fn commit_spend(&self, campaign: &str, amount: f64) -> RinglineResult<()>;

    /// Creates or replaces a campaign's budget ledger.
    async fn set_budget(&self, ledger: &BudgetLedger) -> RinglineResult<()>;

    /// All persisted turns for a call in sequence order (replay/audit).
    async fn turns(&self, call: Uuid) -> RinglineResult<Vec<ConversationTurn>>;
}

// -----------------------------------------------------------------------------
// Sled implementation
// -----------------------------------------------------------------------------

/// Sled-backed store: trees `turns`, `calls`, `budgets`.
/// Turn keys are `{call}:{seq:012}` so a prefix scan yields sequence order.
pub struct SledStore {
    turns: sled::Tree,
    calls: sled::Tree,
    budgets: sled::Tree,
    /// Serializes read-modify-write of budget values.
    budget_lock: Mutex<()>,
}

impl SledStore {
    pub fn open<P: AsRef<Path>>(path: P) -> RinglineResult<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            turns: db.open_tree("turns")?,
            calls: db.open_tree("calls")?,
            budgets: db.open_tree("budgets")?,
            budget_lock: Mutex::new(()),
        })
    }

    fn turn_key(call: Uuid, seq: u64) -> String {
        format!("{}:{:012}", call, seq)
    }
}

#[async_trait]
impl CallStore for SledStore {
    async fn append_turn(&self, turn: &ConversationTurn) -> RinglineResult<()> {
        let key = Self::turn_key(turn.call, turn.seq);
        let value = serde_json::to_vec(turn)?;
        self.turns.insert(key.as_bytes(), value)?;
        Ok(())
    }

    async fn record_call_outcome(&self, call: &CallRecord) -> RinglineResult<()> {
        let value = serde_json::to_vec(call)?;
        self.calls.insert(call.id.as_bytes(), value)?;
        Ok(())
    }

    async fn read_budget(&self, campaign: &str) -> RinglineResult<Option<BudgetLedger>> {
        match self.budgets.get(campaign.as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    async fn commit_spend(&self, campaign: &str, amount: f64) -> RinglineResult<()> {
        let _guard = self
            .budget_lock
            .lock()
            .map_err(|e| RinglineError::Storage(format!("budget lock poisoned: {e}")))?;
        let mut ledger = match self.budgets.get(campaign.as_bytes())? {
            Some(raw) => serde_json::from_slice::<BudgetLedger>(&raw)?,
            None => return Ok(()), // no ledger, nothing to bill against
        };
        ledger.spent += amount;
        self.budgets
            .insert(campaign.as_bytes(), serde_json::to_vec(&ledger)?)?;
        Ok(())
    }

    async fn set_budget(&self, ledger: &BudgetLedger) -> RinglineResult<()> {
        self.budgets
            .insert(ledger.campaign.as_bytes(), serde_json::to_vec(ledger)?)?;
        Ok(())
    }

    async fn turns(&self, call: Uuid) -> RinglineResult<Vec<ConversationTurn>> {
        let prefix = format!("{}:", call);
        let mut out = Vec::new();
        for item in self.turns.scan_prefix(prefix.as_bytes()) {
            let (_, raw) = item?;
            out.push(serde_json::from_slice(&raw)?);
        }
        Ok(out)
    }
}

// -----------------------------------------------------------------------------
// In-memory implementation (tests, demos)
// -----------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    turns: Vec<ConversationTurn>,
    calls: HashMap<Uuid, CallRecord>,
    budgets: HashMap<CampaignId, BudgetLedger>,
}

/// In-memory store with the same contract as `SledStore`.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> RinglineResult<std::sync::MutexGuard<'_, MemoryInner>> {
        self.inner
            .lock()
            .map_err(|e| RinglineError::Storage(format!("store lock poisoned: {e}")))
    }

    /// Terminal call records seen so far (test inspection).
    pub fn recorded_calls(&self) -> Vec<CallRecord> {
        self.inner
            .lock()
            .map(|g| g.calls.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CallStore for MemoryStore {
    async fn append_turn(&self, turn: &ConversationTurn) -> RinglineResult<()> {
        self.lock()?.turns.push(turn.clone());
        Ok(())
    }

    async fn record_call_outcome(&self, call: &CallRecord) -> RinglineResult<()> {
        self.lock()?.calls.insert(call.id, call.clone());
        Ok(())
    }

    async fn read_budget(&self, campaign: &str) -> RinglineResult<Option<BudgetLedger>> {
        Ok(self.lock()?.budgets.get(campaign).cloned())
    }

    async fn commit_spend(&self, campaign: &str, amount: f64) -> RinglineResult<()> {
        if let Some(ledger) = self.lock()?.budgets.get_mut(campaign) {
            ledger.spent += amount;
        }
        Ok(())
    }

    async fn set_budget(&self, ledger: &BudgetLedger) -> RinglineResult<()> {
        self.lock()?
            .budgets
            .insert(ledger.campaign.clone(), ledger.clone());
        Ok(())
    }

    async fn turns(&self, call: Uuid) -> RinglineResult<Vec<ConversationTurn>> {
        let mut out: Vec<ConversationTurn> = self
            .lock()?
            .turns
            .iter()
            .filter(|t| t.call == call)
            .cloned()
            .collect();
        out.sort_by_key(|t| t.seq);
        Ok(out)
    }
}
