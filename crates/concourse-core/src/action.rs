//! Action types for the deterministic state machine.

use crate::{message::OutboundMessage, Event, TimerId};
use concourse_types::{
    ExecutedVertex, LedgerProof, NodeId, SafetyState, VertexId, VertexStoreSnapshot, View,
};
use std::time::Duration;

/// Actions the state machine wants to perform.
///
/// Actions are **commands** - they describe something to do. The runner
/// executes actions in the order returned and may convert results back into
/// events.
#[derive(Debug, Clone)]
pub enum Action {
    // ═══════════════════════════════════════════════════════════════════════
    // Network
    // ═══════════════════════════════════════════════════════════════════════
    /// Send a message to a single validator.
    Send { to: NodeId, message: OutboundMessage },

    /// Broadcast a message to every validator, including ourselves.
    Broadcast { message: OutboundMessage },

    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════
    /// Set a timer to fire after a duration. Re-setting an armed id
    /// replaces the pending expiry.
    SetTimer { id: TimerId, duration: Duration },

    /// Cancel a previously set timer.
    CancelTimer { id: TimerId },

    // ═══════════════════════════════════════════════════════════════════════
    // Internal (fed back as events with Internal priority)
    // ═══════════════════════════════════════════════════════════════════════
    /// Enqueue an internal event for immediate processing.
    EnqueueInternal { event: Event },

    // ═══════════════════════════════════════════════════════════════════════
    // Storage
    // ═══════════════════════════════════════════════════════════════════════
    /// Persist the safety state.
    ///
    /// Always emitted before the send action carrying the vote derived from
    /// this state. A runner that cannot persist must halt the node instead
    /// of sending: releasing an unpersisted vote risks equivocation after
    /// restart.
    PersistSafetyState { state: SafetyState },

    /// Persist the vertex store. Emitted whenever the root, certificates or
    /// vertex set change.
    PersistVertexStore { snapshot: VertexStoreSnapshot },

    // ═══════════════════════════════════════════════════════════════════════
    // Ledger
    // ═══════════════════════════════════════════════════════════════════════
    /// Apply a committed batch to the ledger, oldest first, with the proof
    /// that commits it. The runner answers with
    /// [`Event::LedgerStateUpdated`] once applied.
    CommitVertices {
        vertices: Vec<ExecutedVertex>,
        proof: LedgerProof,
    },

    /// Ask the runner to bring the ledger up to `proof` by state transfer
    /// from `peers`; the vertex-by-vertex path is too far behind to help.
    /// Completion arrives as [`Event::LedgerStateUpdated`].
    RequestLedgerSync {
        proof: LedgerProof,
        peers: Vec<NodeId>,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // External Notifications
    // ═══════════════════════════════════════════════════════════════════════
    /// Safety rules refused to vote in this view. Surfaced for observers;
    /// the protocol itself simply abstains.
    EmitNoVote { view: View, vertex_id: VertexId },
}

impl Action {
    /// Check if this action performs network or storage I/O.
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            Action::Send { .. }
                | Action::Broadcast { .. }
                | Action::PersistSafetyState { .. }
                | Action::PersistVertexStore { .. }
                | Action::CommitVertices { .. }
                | Action::RequestLedgerSync { .. }
        )
    }

    /// Check if this is a storage write action.
    pub fn is_storage_write(&self) -> bool {
        matches!(
            self,
            Action::PersistSafetyState { .. } | Action::PersistVertexStore { .. }
        )
    }

    /// Get the action type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::Send { .. } => "Send",
            Action::Broadcast { .. } => "Broadcast",
            Action::SetTimer { .. } => "SetTimer",
            Action::CancelTimer { .. } => "CancelTimer",
            Action::EnqueueInternal { .. } => "EnqueueInternal",
            Action::PersistSafetyState { .. } => "PersistSafetyState",
            Action::PersistVertexStore { .. } => "PersistVertexStore",
            Action::CommitVertices { .. } => "CommitVertices",
            Action::RequestLedgerSync { .. } => "RequestLedgerSync",
            Action::EmitNoVote { .. } => "EmitNoVote",
        }
    }
}
