//! **Callback dispatcher** — routes asynchronous events to the owning call.
//!
//! Telephony webhooks, media notifications, and conversation events all arrive
//! keyed by call id; each live call consumes its own sequential queue, which
//! preserves ordering within a call without any cross-call coordination.
//! Events for unknown or finished calls are protocol violations: logged,
//! counted, dropped.

use crate::state::CallEvent;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

pub struct CallDispatcher {
    routes: DashMap<Uuid, mpsc::UnboundedSender<CallEvent>>,
    dropped: AtomicU64,
}

impl Default for CallDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl CallDispatcher {
    pub fn new() -> Self {
        Self {
            routes: DashMap::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Registers a call and returns its sequential event queue.
    pub fn register(&self, call: Uuid) -> mpsc::UnboundedReceiver<CallEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.insert(call, tx);
        rx
    }

    /// Removes a finished call's route. Idempotent.
    pub fn unregister(&self, call: Uuid) {
        self.routes.remove(&call);
    }

    /// Delivers an event to a call's queue. Returns false when the call is
    /// unknown or already gone; the event is dropped, never an error.
    pub fn deliver(&self, call: Uuid, event: CallEvent) -> bool {
        match self.routes.get(&call) {
            Some(tx) if tx.send(event).is_ok() => true,
            _ => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(%call, ?event, "event for unknown or finished call dropped");
                false
            }
        }
    }

    /// How many live routes exist (dashboard metric).
    pub fn live_calls(&self) -> usize {
        self.routes.len()
    }

    /// Protocol violations seen so far.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
