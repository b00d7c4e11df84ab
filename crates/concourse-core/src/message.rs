//! Outbound message types for network communication.

use concourse_types::{
    HighQC, NodeId, QuorumCertificate, Signature, TimeoutCertificate, Vertex, VertexId, Vote,
};

/// A signed proposal for the current view.
///
/// Carries the proposer's committed-QC and TC knowledge so receivers that
/// fell behind can catch up from the proposal alone. The vertex's own parent
/// QC is the proposer's highest QC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub vertex: Vertex,
    pub author: NodeId,
    /// Signature over the vertex hash.
    pub signature: Signature,
    pub highest_committed_qc: QuorumCertificate,
    pub highest_tc: Option<TimeoutCertificate>,
}

impl Proposal {
    /// The sync position implied by this proposal.
    pub fn high_qc(&self) -> HighQC {
        HighQC::new(
            self.vertex.parent_qc.clone(),
            self.highest_committed_qc.clone(),
            self.highest_tc.clone(),
        )
    }
}

/// Request for `count` vertices walking parent links from `vertex_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetVerticesRequest {
    pub vertex_id: VertexId,
    pub count: usize,
}

/// All-or-nothing answer to a [`GetVerticesRequest`], newest first.
/// Echoes the request for correlation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetVerticesResponse {
    pub request: GetVerticesRequest,
    pub vertices: Vec<Vertex>,
}

/// Sent when the responder cannot serve a request, carrying its own sync
/// position so the requester can tell whether it is the one behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetVerticesErrorResponse {
    pub request: GetVerticesRequest,
    pub high_qc: HighQC,
}

/// Outbound network messages.
///
/// These are the messages a node can send to other nodes. The runner handles
/// the actual network I/O.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// Proposal for the current view, broadcast by its leader.
    Proposal(Box<Proposal>),

    /// Vote on a proposal, sent to the next leader (or broadcast when it
    /// carries a timeout signature).
    Vote(Box<Vote>),

    /// Vertex fetch request.
    GetVerticesRequest(GetVerticesRequest),

    /// Vertex fetch response.
    GetVerticesResponse(GetVerticesResponse),

    /// Vertex fetch failure.
    GetVerticesErrorResponse(Box<GetVerticesErrorResponse>),
}

impl OutboundMessage {
    /// Get a human-readable name for this message type.
    pub fn type_name(&self) -> &'static str {
        match self {
            OutboundMessage::Proposal(_) => "Proposal",
            OutboundMessage::Vote(_) => "Vote",
            OutboundMessage::GetVerticesRequest(_) => "GetVerticesRequest",
            OutboundMessage::GetVerticesResponse(_) => "GetVerticesResponse",
            OutboundMessage::GetVerticesErrorResponse(_) => "GetVerticesErrorResponse",
        }
    }

    /// Check if this is a sync protocol message.
    pub fn is_sync(&self) -> bool {
        matches!(
            self,
            OutboundMessage::GetVerticesRequest(_)
                | OutboundMessage::GetVerticesResponse(_)
                | OutboundMessage::GetVerticesErrorResponse(_)
        )
    }
}
