//! Voting safety: no equivocation, no breaking the lock.

use concourse_core::{HashSigner, Hasher, Proposal};
use concourse_types::{
    ExecutedVertex, HighQC, NodeId, QuorumCertificate, SafetyState, TimeoutCertificate, Vertex,
    VertexId, View, Vote, VoteData, VoteTimeout,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// A proposal the safety rules refuse to endorse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SafetyViolation {
    #[error("vertex at view {proposed} violates earlier vote at view {last_voted}")]
    ViolatesEarlierVote { proposed: View, last_voted: View },

    #[error("parent at view {parent} does not respect locked view {locked}")]
    ViolatesLockedView { parent: View, locked: View },
}

/// Owns the durable [`SafetyState`] and gates every signature this node
/// produces over consensus data.
///
/// State changes here must reach disk before the resulting vote reaches the
/// network; callers emit `Action::PersistSafetyState` with [`Self::state`]
/// ahead of the send action.
pub struct SafetyRules {
    node: NodeId,
    hasher: Arc<dyn Hasher>,
    signer: Arc<dyn HashSigner>,
    state: SafetyState,
}

impl SafetyRules {
    pub fn new(
        node: NodeId,
        hasher: Arc<dyn Hasher>,
        signer: Arc<dyn HashSigner>,
        initial_state: SafetyState,
    ) -> Self {
        SafetyRules {
            node,
            hasher,
            signer,
            state: initial_state,
        }
    }

    pub fn state(&self) -> &SafetyState {
        &self.state
    }

    /// The vote we last released, if it was for this view.
    pub fn last_vote(&self, view: View) -> Option<&Vote> {
        self.state
            .last_vote
            .as_ref()
            .filter(|vote| vote.view() == view)
    }

    fn check_last_voted(&self, vertex: &Vertex) -> Result<(), SafetyViolation> {
        let last_voted = self.state.last_voted_view();
        if vertex.view <= last_voted {
            return Err(SafetyViolation::ViolatesEarlierVote {
                proposed: vertex.view,
                last_voted,
            });
        }
        Ok(())
    }

    /// Checks the lock and returns the (possibly advanced) locked view to
    /// apply on success. The lock ratchets to the grandparent's view: a
    /// quorum on this vertex would give its grandparent two consecutive
    /// certificates.
    fn check_locked(&self, vertex: &Vertex) -> Result<View, SafetyViolation> {
        let locked = self.state.locked_view;
        let parent = vertex.parent_header().view;
        if parent < locked {
            return Err(SafetyViolation::ViolatesLockedView { parent, locked });
        }
        let grandparent = vertex.grandparent_header().view;
        Ok(if grandparent > locked { grandparent } else { locked })
    }

    /// Sign a proposal built from our own vertex. Only the lock is checked;
    /// proposing is not voting.
    pub fn sign_proposal(
        &self,
        vertex: &Vertex,
        vertex_id: VertexId,
        highest_committed_qc: QuorumCertificate,
        highest_tc: Option<TimeoutCertificate>,
    ) -> Option<Proposal> {
        if let Err(violation) = self.check_locked(vertex) {
            warn!(%violation, "refusing to sign proposal");
            return None;
        }

        let signature = self.signer.sign(vertex_id);
        Some(Proposal {
            vertex: vertex.clone(),
            author: self.node,
            signature,
            highest_committed_qc,
            highest_tc,
        })
    }

    fn construct_vote_data(executed: &ExecutedVertex) -> VoteData {
        let vertex = &executed.vertex;
        // A quorum on this vertex commits the grandparent exactly when it
        // would complete three consecutive certified views.
        let committed = if vertex.touches_genesis()
            || !vertex.has_direct_parent()
            || !vertex.parent_has_direct_parent()
        {
            None
        } else {
            Some(*vertex.grandparent_header())
        };
        VoteData::new(executed.header(), *vertex.parent_header(), committed)
    }

    /// Builds an unchecked vote. Does not touch the safety state; use
    /// [`Self::vote_for`] unless the caller enforces safety itself (the
    /// timeout path, which votes on a vertex it just constructed).
    pub fn create_vote(&self, executed: &ExecutedVertex, timestamp: u64, high_qc: HighQC) -> Vote {
        let vote_data = Self::construct_vote_data(executed);
        let hash = self.hasher.hash_vote_data(&vote_data, timestamp);
        let signature = self.signer.sign(hash);
        Vote {
            author: self.node,
            epoch: executed.ledger_header.epoch,
            vote_data,
            timestamp,
            signature,
            high_qc,
            timeout_signature: None,
        }
    }

    /// Vote for a proposed vertex if doing so cannot conflict with any vote
    /// we already released.
    pub fn vote_for(
        &mut self,
        executed: &ExecutedVertex,
        timestamp: u64,
        high_qc: HighQC,
    ) -> Result<Vote, SafetyViolation> {
        self.check_last_voted(&executed.vertex)?;
        let locked_view = self.check_locked(&executed.vertex)?;

        let vote = self.create_vote(executed, timestamp, high_qc);
        self.state.locked_view = locked_view;
        self.state.last_vote = Some(vote.clone());
        debug!(view = %vote.view(), vertex = %executed.id, "voting");
        Ok(vote)
    }

    /// Adds a timeout signature to a vote we already released, making it
    /// count toward a timeout certificate as well. Idempotent.
    pub fn timeout_vote(&mut self, vote: Vote) -> Vote {
        if vote.is_timeout() {
            return vote;
        }
        let timeout = VoteTimeout::of(&vote);
        let signature = self.signer.sign(self.hasher.hash_timeout(&timeout));
        let vote = vote.with_timeout_signature(signature);
        self.state.last_vote = Some(vote.clone());
        vote
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concourse_core::test_support::{DeterministicHasher, DeterministicSigner};
    use concourse_types::test_utils::{genesis_high_qc, genesis_vertex, node};
    use concourse_types::{
        Epoch, Hash, LedgerHeader, QuorumCertificate, TimestampedSignatures, VertexHeader,
    };

    fn rules() -> SafetyRules {
        SafetyRules::new(
            node(1),
            Arc::new(DeterministicHasher),
            Arc::new(DeterministicSigner::new(node(1))),
            SafetyState::default(),
        )
    }

    fn ledger_header(view: u64) -> LedgerHeader {
        LedgerHeader {
            epoch: Epoch::of(1),
            view: View::of(view),
            state_version: view,
            timestamp: 0,
        }
    }

    fn header(view: u64, id_byte: u8) -> VertexHeader {
        VertexHeader::new(View::of(view), Hash([id_byte; 32]), ledger_header(view))
    }

    /// A vertex at `view` whose parent QC certifies `parent` over `grandparent`.
    fn executed(view: u64, id_byte: u8, parent: VertexHeader, grandparent: VertexHeader) -> ExecutedVertex {
        let qc = QuorumCertificate::new(
            VoteData::new(parent, grandparent, None),
            TimestampedSignatures::new(),
        );
        let vertex = Vertex::new(qc, View::of(view), Vec::new(), node(9));
        ExecutedVertex::new(vertex, Hash([id_byte; 32]), ledger_header(view))
    }

    fn genesis_header() -> VertexHeader {
        genesis_vertex().header()
    }

    #[test]
    fn votes_once_per_view() {
        let mut rules = rules();
        let vertex = executed(1, 10, genesis_header(), genesis_header());
        assert!(rules.vote_for(&vertex, 0, genesis_high_qc()).is_ok());

        // Same view, different vertex: refused.
        let conflicting = executed(1, 11, genesis_header(), genesis_header());
        assert_eq!(
            rules.vote_for(&conflicting, 0, genesis_high_qc()),
            Err(SafetyViolation::ViolatesEarlierVote {
                proposed: View::of(1),
                last_voted: View::of(1),
            })
        );
        // And so is the identical vertex: the vote is not re-released.
        assert!(rules.vote_for(&vertex, 0, genesis_high_qc()).is_err());
    }

    #[test]
    fn refuses_views_at_or_below_last_voted() {
        let mut rules = rules();
        let v5 = executed(5, 10, genesis_header(), genesis_header());
        rules.vote_for(&v5, 0, genesis_high_qc()).unwrap();
        let v3 = executed(3, 11, genesis_header(), genesis_header());
        assert!(rules.vote_for(&v3, 0, genesis_high_qc()).is_err());
    }

    #[test]
    fn lock_ratchets_to_grandparent_and_rejects_older_parents() {
        let mut rules = rules();
        // Vertex at view 7, parent at 6, grandparent at 5: lock moves to 5.
        let vertex = executed(7, 10, header(6, 6), header(5, 5));
        rules.vote_for(&vertex, 0, genesis_high_qc()).unwrap();
        assert_eq!(rules.state().locked_view, View::of(5));

        // A later proposal extending a pre-lock parent is refused.
        let stale_parent = executed(8, 11, header(4, 4), header(3, 3));
        assert_eq!(
            rules.vote_for(&stale_parent, 0, genesis_high_qc()),
            Err(SafetyViolation::ViolatesLockedView {
                parent: View::of(4),
                locked: View::of(5),
            })
        );
    }

    #[test]
    fn commit_header_requires_three_consecutive_views() {
        let rules = rules();
        // 5 → 6 → 7 consecutive: voting on 7 nominates 5 for commit.
        let chained = executed(7, 10, header(6, 6), header(5, 5));
        let vote = rules.create_vote(&chained, 0, genesis_high_qc());
        assert_eq!(vote.vote_data.committed, Some(header(5, 5)));

        // 5 → 6 → 8 has a gap: nothing commits.
        let gapped = executed(8, 11, header(6, 6), header(5, 5));
        let vote = rules.create_vote(&gapped, 0, genesis_high_qc());
        assert_eq!(vote.vote_data.committed, None);

        // Chains touching genesis never nominate a commit.
        let near_genesis = executed(2, 12, header(1, 1), genesis_header());
        let vote = rules.create_vote(&near_genesis, 0, genesis_high_qc());
        assert_eq!(vote.vote_data.committed, None);
    }

    #[test]
    fn timeout_vote_keeps_vote_data_and_adds_signature() {
        let mut rules = rules();
        let vertex = executed(1, 10, genesis_header(), genesis_header());
        let vote = rules.vote_for(&vertex, 0, genesis_high_qc()).unwrap();
        let timed_out = rules.timeout_vote(vote.clone());
        assert!(timed_out.is_timeout());
        assert_eq!(timed_out.vote_data, vote.vote_data);
        assert_eq!(timed_out.signature, vote.signature);
        // The augmented vote becomes the durable last vote.
        assert_eq!(rules.state().last_vote.as_ref(), Some(&timed_out));
        // Idempotent.
        assert_eq!(rules.timeout_vote(timed_out.clone()), timed_out);
    }

    #[test]
    fn last_vote_is_view_scoped() {
        let mut rules = rules();
        let vertex = executed(2, 10, header(1, 1), genesis_header());
        let vote = rules.vote_for(&vertex, 0, genesis_high_qc()).unwrap();
        assert_eq!(rules.last_vote(View::of(2)), Some(&vote));
        assert_eq!(rules.last_vote(View::of(3)), None);
    }
}
