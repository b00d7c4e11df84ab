//! Shared fixtures for tests across the workspace.

use crate::{
    Epoch, ExecutedVertex, HighQC, LedgerHeader, NodeId, QuorumCertificate, Validator,
    ValidatorSet,
};

pub fn node(byte: u8) -> NodeId {
    NodeId([byte; 32])
}

/// Equal-weight validator set over nodes `1..=count`.
pub fn validator_set(count: u8) -> ValidatorSet {
    ValidatorSet::from_validators((1..=count).map(|i| Validator::new(node(i), 1)))
}

pub fn genesis_ledger_header() -> LedgerHeader {
    LedgerHeader::genesis(Epoch::of(1))
}

pub fn genesis_vertex() -> ExecutedVertex {
    ExecutedVertex::genesis(genesis_ledger_header())
}

pub fn genesis_qc() -> QuorumCertificate {
    QuorumCertificate::genesis(genesis_vertex().header())
}

pub fn genesis_high_qc() -> HighQC {
    let qc = genesis_qc();
    HighQC::new(qc.clone(), qc, None)
}
