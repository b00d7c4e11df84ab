//! Event types for the deterministic state machine.

use crate::message::{GetVerticesErrorResponse, GetVerticesRequest, GetVerticesResponse, Proposal};
use concourse_types::{ExecutedVertex, LedgerProof, NodeId, ViewCertificate, View, Vote};

/// Priority levels for event ordering within the same timestamp.
///
/// Events at the same simulation time are processed in priority order.
/// Lower values = higher priority (processed first).
///
/// This ensures causality is preserved: internal events (consequences of
/// processing an event) are handled before new external inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventPriority {
    /// Internal events: consequences of prior event processing.
    /// Processed first to maintain causality.
    Internal = 0,

    /// Timer events: scheduled by the node itself.
    Timer = 1,

    /// Network events: external inputs from other nodes.
    Network = 2,
}

/// All possible events a node can receive.
///
/// Events are **passive data** - they describe something that happened.
/// The state machine processes events and returns actions.
#[derive(Debug, Clone)]
pub enum Event {
    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle (priority: Internal)
    // ═══════════════════════════════════════════════════════════════════════
    /// Begin consensus from the recovered (or genesis) state. Delivered once
    /// by the runner before any other event.
    Start,

    // ═══════════════════════════════════════════════════════════════════════
    // Timers (priority: Timer)
    // ═══════════════════════════════════════════════════════════════════════
    /// The local timeout for a view fired without the view completing.
    LocalTimeout { view: View },

    /// An outstanding vertex fetch went unanswered.
    SyncRequestTimeout { vertex_id: concourse_types::VertexId },

    // ═══════════════════════════════════════════════════════════════════════
    // Network Messages (priority: Network)
    // ═══════════════════════════════════════════════════════════════════════
    /// Received a proposal. Author and signature are checked by the event
    /// verifier before any state is touched.
    ProposalReceived { proposal: Box<Proposal> },

    /// Received a vote. Sender identity is the vote's author field, verified
    /// against its signatures.
    VoteReceived { vote: Box<Vote> },

    /// A peer asked us for vertices.
    VertexRequestReceived {
        from: NodeId,
        request: GetVerticesRequest,
    },

    /// A peer answered one of our vertex requests.
    VertexResponseReceived {
        from: NodeId,
        response: GetVerticesResponse,
    },

    /// A peer could not answer one of our vertex requests.
    VertexErrorResponseReceived {
        from: NodeId,
        response: Box<GetVerticesErrorResponse>,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Internal Events (priority: Internal)
    // ═══════════════════════════════════════════════════════════════════════
    /// A vertex was executed and inserted into the vertex store.
    VertexInserted { vertex: Box<ExecutedVertex> },

    /// The current view's votes formed a certificate.
    ///
    /// `author` is the validator whose vote completed the quorum, kept as a
    /// sync hint: it provably holds every vertex the certificate refers to.
    ViewQuorumReached {
        certificate: ViewCertificate,
        author: NodeId,
    },

    /// The ledger advanced, either by our own commit or by ledger sync.
    /// Delivered by the runner after executing the corresponding action.
    LedgerStateUpdated { proof: LedgerProof },
}

impl Event {
    /// Get the priority for this event type.
    ///
    /// Events at the same timestamp are processed in priority order,
    /// ensuring causality is preserved.
    pub fn priority(&self) -> EventPriority {
        match self {
            Event::Start
            | Event::VertexInserted { .. }
            | Event::ViewQuorumReached { .. }
            | Event::LedgerStateUpdated { .. } => EventPriority::Internal,

            Event::LocalTimeout { .. } | Event::SyncRequestTimeout { .. } => EventPriority::Timer,

            Event::ProposalReceived { .. }
            | Event::VoteReceived { .. }
            | Event::VertexRequestReceived { .. }
            | Event::VertexResponseReceived { .. }
            | Event::VertexErrorResponseReceived { .. } => EventPriority::Network,
        }
    }

    /// Check if this is an internal event (consequence of prior processing).
    pub fn is_internal(&self) -> bool {
        self.priority() == EventPriority::Internal
    }

    /// Check if this is a network event (from another node).
    pub fn is_network(&self) -> bool {
        self.priority() == EventPriority::Network
    }

    /// Get the event type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::Start => "Start",
            Event::LocalTimeout { .. } => "LocalTimeout",
            Event::SyncRequestTimeout { .. } => "SyncRequestTimeout",
            Event::ProposalReceived { .. } => "ProposalReceived",
            Event::VoteReceived { .. } => "VoteReceived",
            Event::VertexRequestReceived { .. } => "VertexRequestReceived",
            Event::VertexResponseReceived { .. } => "VertexResponseReceived",
            Event::VertexErrorResponseReceived { .. } => "VertexErrorResponseReceived",
            Event::VertexInserted { .. } => "VertexInserted",
            Event::ViewQuorumReached { .. } => "ViewQuorumReached",
            Event::LedgerStateUpdated { .. } => "LedgerStateUpdated",
        }
    }
}
