//! Vertices: the units of the consensus DAG.

use crate::{Epoch, Hash, NodeId, QuorumCertificate, VertexId, View};
use serde::{Deserialize, Serialize};

/// Summary of the ledger state reached by speculatively executing a vertex.
///
/// Produced by the injected `Ledger` collaborator; consensus never inspects
/// the executed state itself, only this summary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedgerHeader {
    pub epoch: Epoch,
    pub view: View,
    /// Monotone counter over all ledger writes. Drives ledger-sync
    /// escalation when a peer is too far ahead to catch up vertex by vertex.
    pub state_version: u64,
    /// Consensus timestamp in milliseconds.
    pub timestamp: u64,
}

impl LedgerHeader {
    pub fn genesis(epoch: Epoch) -> Self {
        LedgerHeader {
            epoch,
            view: View::genesis(),
            state_version: 0,
            timestamp: 0,
        }
    }
}

/// Header identifying a vertex and the ledger state it produces.
///
/// Three of these form the [`crate::VoteData`] that the 3-chain commit rule
/// is evaluated over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VertexHeader {
    pub view: View,
    pub vertex_id: VertexId,
    pub ledger_header: LedgerHeader,
}

impl VertexHeader {
    pub fn new(view: View, vertex_id: VertexId, ledger_header: LedgerHeader) -> Self {
        VertexHeader {
            view,
            vertex_id,
            ledger_header,
        }
    }

    pub fn genesis(ledger_header: LedgerHeader) -> Self {
        VertexHeader {
            view: View::genesis(),
            vertex_id: Hash::ZERO,
            ledger_header,
        }
    }
}

/// A proposed extension of the chain.
///
/// The vertex's identity is the hash of its contents, computed by the
/// injected hasher at verification time and carried separately (see
/// [`ExecutedVertex`]).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Vertex {
    /// Certificate for the parent this vertex extends.
    pub parent_qc: QuorumCertificate,
    pub view: View,
    /// Opaque command payload. Empty for timeout vertices.
    pub payload: Vec<u8>,
    /// None for the genesis vertex and locally constructed timeout vertices.
    pub proposer: Option<NodeId>,
}

impl Vertex {
    pub fn new(
        parent_qc: QuorumCertificate,
        view: View,
        payload: Vec<u8>,
        proposer: NodeId,
    ) -> Self {
        Vertex {
            parent_qc,
            view,
            payload,
            proposer: Some(proposer),
        }
    }

    /// An empty vertex used to keep the 3-chain moving through a timed-out
    /// view when this node never voted in it.
    pub fn timeout(parent_qc: QuorumCertificate, view: View) -> Self {
        Vertex {
            parent_qc,
            view,
            payload: Vec::new(),
            proposer: None,
        }
    }

    pub fn genesis(ledger_header: LedgerHeader) -> Self {
        let header = VertexHeader::genesis(ledger_header);
        Vertex {
            parent_qc: QuorumCertificate::genesis(header),
            view: View::genesis(),
            payload: Vec::new(),
            proposer: None,
        }
    }

    pub fn parent_header(&self) -> &VertexHeader {
        &self.parent_qc.vote_data.proposed
    }

    pub fn grandparent_header(&self) -> &VertexHeader {
        &self.parent_qc.vote_data.parent
    }

    pub fn parent_id(&self) -> VertexId {
        self.parent_header().vertex_id
    }

    pub fn epoch(&self) -> Epoch {
        self.parent_header().ledger_header.epoch
    }

    /// True when this vertex directly extends the previous view.
    pub fn has_direct_parent(&self) -> bool {
        self.view == self.parent_header().view.next()
    }

    pub fn parent_has_direct_parent(&self) -> bool {
        self.parent_header().view == self.grandparent_header().view.next()
    }

    /// The commit rule never fires across the genesis boundary.
    pub fn touches_genesis(&self) -> bool {
        self.view.is_genesis()
            || self.parent_header().view.is_genesis()
            || self.grandparent_header().view.is_genesis()
    }
}

/// A vertex paired with its identity and the ledger header obtained from
/// speculative execution. Everything stored in the vertex store is executed.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutedVertex {
    pub vertex: Vertex,
    pub id: VertexId,
    pub ledger_header: LedgerHeader,
}

impl ExecutedVertex {
    pub fn new(vertex: Vertex, id: VertexId, ledger_header: LedgerHeader) -> Self {
        ExecutedVertex {
            vertex,
            id,
            ledger_header,
        }
    }

    pub fn genesis(ledger_header: LedgerHeader) -> Self {
        ExecutedVertex {
            vertex: Vertex::genesis(ledger_header),
            id: Hash::ZERO,
            ledger_header,
        }
    }

    pub fn header(&self) -> VertexHeader {
        VertexHeader::new(self.vertex.view, self.id, self.ledger_header)
    }

    pub fn view(&self) -> View {
        self.vertex.view
    }

    pub fn parent_id(&self) -> VertexId {
        self.vertex.parent_id()
    }
}
