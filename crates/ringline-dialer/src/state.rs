//! **Call State Machine** — explicit transition table keyed by (state, event).
//!
//! Undefined (state, event) pairs are no-ops, not errors: telephony providers
//! redeliver callbacks, and a callback for an already-terminal call must not
//! produce a transition. The table is pure; `apply` layers timestamping and
//! logging on top.

use chrono::Utc;
use ringline_core::{CallRecord, CallState};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Everything that can drive a call's state, from either event source:
/// telephony status callbacks or internal conversation events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallEvent {
    // telephony callbacks
    DialStarted,
    ProviderRinging,
    Answered,
    NoAnswer,
    Busy,
    CarrierError,
    HangupDetected,
    /// Provider machine detection: an answering machine picked up.
    VoicemailDetected,
    // internal events
    MediaAttached,
    AttachTimeout,
    TransferTriggered,
    TransferComplete,
    ConversationDone,
    RingTimeout,
    Canceled,
    /// Leak guard: the overall call timeout forces the call terminal.
    ForcedTimeout,
}

/// The transition table. Returns the next state, or `None` for undefined
/// pairs (including anything after a terminal state).
pub fn transition(state: CallState, event: CallEvent) -> Option<CallState> {
    use CallEvent as E;
    use CallState as S;

    if state.is_terminal() {
        return None;
    }

    match (state, event) {
        (S::Queued, E::DialStarted) => Some(S::Dialing),
        (S::Dialing, E::ProviderRinging) => Some(S::Ringing),
        // Some providers report answer without a ringing callback first.
        (S::Dialing | S::Ringing, E::Answered) => Some(S::Connected),
        (S::Connected, E::MediaAttached) => Some(S::Conversing),
        (S::Connected, E::AttachTimeout) => Some(S::Failed),
        (S::Conversing, E::TransferTriggered) => Some(S::Transferring),
        (S::Transferring, E::TransferComplete) => Some(S::Completed),
        (S::Conversing, E::ConversationDone | E::HangupDetected) => Some(S::Completed),
        // Machine detection can arrive any time between answer and the first
        // turns; the script is not worth playing to a mailbox.
        (S::Connected | S::Conversing, E::VoicemailDetected) => Some(S::Completed),

        (S::Dialing | S::Ringing, E::NoAnswer | E::Busy | E::CarrierError) => Some(S::Failed),
        // Dialing counts against the ring window too; some providers never
        // report a distinct ringing status.
        (S::Dialing | S::Ringing, E::RingTimeout) => Some(S::Abandoned),

        // Failed/Abandoned are reachable from every non-terminal state.
        (_, E::Canceled) => Some(S::Abandoned),
        (_, E::CarrierError) => Some(S::Failed),
        // The leak guard forces Completed regardless of state.
        (_, E::ForcedTimeout) => Some(S::Completed),

        _ => None,
    }
}

/// Applies `event` to `call`, stamping `connected_at`/`ended_at` as states are
/// entered. Returns false (and logs) when the event is a no-op.
pub fn apply(call: &mut CallRecord, event: CallEvent) -> bool {
    match transition(call.state, event) {
        Some(next) => {
            info!(call = %call.id, from = ?call.state, to = ?next, ?event, "call transition");
            if next == CallState::Connected {
                call.connected_at = Some(Utc::now());
            }
            if next.is_terminal() {
                call.ended_at = Some(Utc::now());
            }
            call.state = next;
            true
        }
        None => {
            debug!(call = %call.id, state = ?call.state, ?event, "ignoring event (no-op)");
            false
        }
    }
}
