//! Deterministic stand-ins for the injected collaborators.
//!
//! Not cryptography. Hashes come from the standard library's SipHash and
//! "signatures" are recomputable digests, which is exactly what unit tests
//! and the simulation need: stable ids, forgeable-on-purpose signatures,
//! zero dependencies.

use crate::{HashSigner, HashVerifier, Hasher, Ledger};
use concourse_types::{
    Hash, LedgerHeader, NodeId, Signature, Vertex, VertexId, VoteData, VoteTimeout,
};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash as StdHash, Hasher as StdHasher};

fn digest<T: StdHash>(domain: u8, value: &T) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (chunk, slot) in out.chunks_exact_mut(8).enumerate() {
        let mut hasher = DefaultHasher::new();
        hasher.write_u8(domain);
        hasher.write_u8(chunk as u8);
        value.hash(&mut hasher);
        slot.copy_from_slice(&hasher.finish().to_le_bytes());
    }
    out
}

/// Structural hashing over the types' `Hash` derives, with per-kind domain
/// separation.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeterministicHasher;

impl Hasher for DeterministicHasher {
    fn hash_vertex(&self, vertex: &Vertex) -> Hash {
        Hash(digest(1, vertex))
    }

    fn hash_vote_data(&self, vote_data: &VoteData, timestamp: u64) -> Hash {
        Hash(digest(2, &(vote_data, timestamp)))
    }

    fn hash_timeout(&self, timeout: &VoteTimeout) -> Hash {
        Hash(digest(3, timeout))
    }
}

fn fake_signature(node: &NodeId, hash: &Hash) -> Signature {
    Signature(digest(4, &(node, hash)))
}

/// Signs by mixing the node id into the hash. Verifiable by anyone who can
/// recompute the mix, i.e. everyone.
#[derive(Debug, Clone, Copy)]
pub struct DeterministicSigner {
    pub node: NodeId,
}

impl DeterministicSigner {
    pub fn new(node: NodeId) -> Self {
        DeterministicSigner { node }
    }
}

impl HashSigner for DeterministicSigner {
    fn sign(&self, hash: Hash) -> Signature {
        fake_signature(&self.node, &hash)
    }
}

/// Accepts exactly the signatures [`DeterministicSigner`] produces.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeterministicVerifier;

impl HashVerifier for DeterministicVerifier {
    fn verify(&self, node: &NodeId, hash: Hash, signature: &Signature) -> bool {
        fake_signature(node, &hash) == *signature
    }
}

/// A verifier that rejects everything. For exercising the drop paths.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectingVerifier;

impl HashVerifier for RejectingVerifier {
    fn verify(&self, _node: &NodeId, _hash: Hash, _signature: &Signature) -> bool {
        false
    }
}

/// A ledger whose state version counts executed vertices. Every vertex
/// prepares successfully.
#[derive(Debug, Default, Clone, Copy)]
pub struct CountingLedger;

impl Ledger for CountingLedger {
    fn prepare(
        &self,
        parent: &LedgerHeader,
        vertex: &Vertex,
        _vertex_id: VertexId,
    ) -> Option<LedgerHeader> {
        Some(LedgerHeader {
            epoch: parent.epoch,
            view: vertex.view,
            state_version: parent.state_version + 1,
            timestamp: parent.timestamp,
        })
    }
}
