//! Collaborator traits injected into the consensus core.

use crate::{Action, Event};
use concourse_types::{Hash, LedgerHeader, NodeId, Signature, Vertex, VertexId, View, VoteData, VoteTimeout};
use std::time::Duration;

/// The node-level state machine contract.
///
/// Implementations must be deterministic: the same state, event and clock
/// always produce the same actions.
pub trait StateMachine {
    fn handle(&mut self, event: Event, now: Duration) -> Vec<Action>;
}

/// Speculative execution of proposed vertices.
///
/// Consensus orders vertices; what a vertex *does* is the ledger's business.
/// `prepare` executes a vertex against the state reached by its parent and
/// summarizes the result; actual commitment happens later through
/// [`Action::CommitVertices`].
pub trait Ledger {
    /// Returns the ledger header the vertex produces, or `None` when the
    /// ledger cannot extend the parent state with this vertex.
    fn prepare(
        &self,
        parent: &LedgerHeader,
        vertex: &Vertex,
        vertex_id: VertexId,
    ) -> Option<LedgerHeader>;
}

/// Content hashing for the protocol's signable values.
///
/// All validators must agree on these hashes, so the implementation is part
/// of the protocol configuration, not of this crate.
pub trait Hasher {
    fn hash_vertex(&self, vertex: &Vertex) -> Hash;
    fn hash_vote_data(&self, vote_data: &VoteData, timestamp: u64) -> Hash;
    fn hash_timeout(&self, timeout: &VoteTimeout) -> Hash;
}

/// Signs hashes with this node's key.
pub trait HashSigner {
    fn sign(&self, hash: Hash) -> Signature;
}

/// Verifies a signature over a hash against a validator's key.
pub trait HashVerifier {
    fn verify(&self, node: &NodeId, hash: Hash, signature: &Signature) -> bool;
}

/// Supplies the command payload when this node proposes.
pub trait PayloadSource {
    fn next_payload(&mut self, view: View) -> Vec<u8>;
}

/// A payload source that proposes empty vertices. Useful in tests and for
/// validators running without a command queue.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyPayloadSource;

impl PayloadSource for EmptyPayloadSource {
    fn next_payload(&mut self, _view: View) -> Vec<u8> {
        Vec::new()
    }
}
