//! Quorum and timeout certificates.

use crate::{Epoch, LedgerHeader, NodeId, Signature, VertexHeader, View};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A signature together with the wall-clock timestamp it covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimestampedSignature {
    pub timestamp: u64,
    pub signature: Signature,
}

/// Signatures keyed by signer, in deterministic order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimestampedSignatures {
    signatures: BTreeMap<NodeId, TimestampedSignature>,
}

impl TimestampedSignatures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(signatures: BTreeMap<NodeId, TimestampedSignature>) -> Self {
        TimestampedSignatures { signatures }
    }

    pub fn insert(&mut self, signer: NodeId, signature: TimestampedSignature) {
        self.signatures.insert(signer, signature);
    }

    pub fn count(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    pub fn signers(&self) -> impl Iterator<Item = &NodeId> {
        self.signatures.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &TimestampedSignature)> {
        self.signatures.iter()
    }
}

/// The three headers a vote covers: the proposed vertex, its parent, and the
/// vertex that commits if this vote's quorum completes a 3-chain.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VoteData {
    pub proposed: VertexHeader,
    pub parent: VertexHeader,
    pub committed: Option<VertexHeader>,
}

impl VoteData {
    pub fn new(
        proposed: VertexHeader,
        parent: VertexHeader,
        committed: Option<VertexHeader>,
    ) -> Self {
        VoteData {
            proposed,
            parent,
            committed,
        }
    }
}

/// Proof that a quorum of validator weight voted for identical [`VoteData`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuorumCertificate {
    pub vote_data: VoteData,
    pub signatures: TimestampedSignatures,
}

impl QuorumCertificate {
    pub fn new(vote_data: VoteData, signatures: TimestampedSignatures) -> Self {
        QuorumCertificate {
            vote_data,
            signatures,
        }
    }

    /// The self-referential certificate that roots an epoch. Carries no
    /// signatures; it is part of the trusted initial configuration.
    pub fn genesis(header: VertexHeader) -> Self {
        QuorumCertificate {
            vote_data: VoteData::new(header, header, None),
            signatures: TimestampedSignatures::new(),
        }
    }

    pub fn view(&self) -> View {
        self.vote_data.proposed.view
    }

    pub fn proposed(&self) -> &VertexHeader {
        &self.vote_data.proposed
    }

    pub fn parent(&self) -> &VertexHeader {
        &self.vote_data.parent
    }

    pub fn committed(&self) -> Option<&VertexHeader> {
        self.vote_data.committed.as_ref()
    }
}

/// Proof that a quorum of validator weight timed out of a view. Advances the
/// view without certifying any vertex.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeoutCertificate {
    pub view: View,
    pub epoch: Epoch,
    pub signatures: TimestampedSignatures,
}

impl TimeoutCertificate {
    pub fn new(view: View, epoch: Epoch, signatures: TimestampedSignatures) -> Self {
        TimeoutCertificate {
            view,
            epoch,
            signatures,
        }
    }
}

/// A node's current sync position: the highest QC it has seen, the highest
/// QC known to commit a vertex, and the highest TC if any.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HighQC {
    pub highest_qc: QuorumCertificate,
    pub highest_committed_qc: QuorumCertificate,
    pub highest_tc: Option<TimeoutCertificate>,
}

impl HighQC {
    pub fn new(
        highest_qc: QuorumCertificate,
        highest_committed_qc: QuorumCertificate,
        highest_tc: Option<TimeoutCertificate>,
    ) -> Self {
        debug_assert!(highest_committed_qc.view() <= highest_qc.view());
        HighQC {
            highest_qc,
            highest_committed_qc,
            highest_tc,
        }
    }

    /// Highest view certified by either certificate. The next view to run
    /// is one past this.
    pub fn highest_view(&self) -> View {
        match &self.highest_tc {
            Some(tc) if tc.view > self.highest_qc.view() => tc.view,
            _ => self.highest_qc.view(),
        }
    }
}

/// Either certificate a view's votes can form.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViewCertificate {
    Qc(QuorumCertificate),
    Tc(TimeoutCertificate),
}

/// Proof of a committed ledger state, handed to the ledger-sync path so the
/// runner knows which peers can serve the missing state.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedgerProof {
    pub header: LedgerHeader,
    pub signers: Vec<NodeId>,
}

impl LedgerProof {
    pub fn genesis(header: LedgerHeader) -> Self {
        LedgerProof {
            header,
            signers: Vec::new(),
        }
    }

    pub fn from_qc(qc: &QuorumCertificate) -> Option<Self> {
        qc.committed().map(|committed| LedgerProof {
            header: committed.ledger_header,
            signers: qc.signatures.signers().copied().collect(),
        })
    }

    pub fn state_version(&self) -> u64 {
        self.header.state_version
    }
}
