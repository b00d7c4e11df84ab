//! Foundational types for Concourse consensus.
//!
//! Everything here is passive data: identifiers, certificates, vertices and
//! the durable state snapshots the protocol persists. Protocol logic lives
//! in the `concourse-bft` and `concourse-sync` crates.

mod certificates;
mod crypto;
mod hash;
mod safety;
mod snapshot;
mod validators;
mod vertex;
mod view;
mod vote;

pub use certificates::{
    HighQC, LedgerProof, QuorumCertificate, TimeoutCertificate, TimestampedSignature,
    TimestampedSignatures, ViewCertificate, VoteData,
};
pub use crypto::{NodeId, Signature};
pub use hash::{Hash, VertexId};
pub use safety::SafetyState;
pub use snapshot::VertexStoreSnapshot;
pub use validators::{ValidationState, Validator, ValidatorSet};
pub use vertex::{ExecutedVertex, LedgerHeader, Vertex, VertexHeader};
pub use view::{Epoch, View};
pub use vote::{Vote, VoteTimeout};

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
