//! The per-view event state machine.

use crate::{
    Pacemaker, PendingVotes, SafetyRules, VertexStore, ViewUpdate, VoteProcessingResult,
};
use concourse_core::{Action, Event, Hasher, OutboundMessage, Proposal};
use concourse_types::{Epoch, ExecutedVertex, NodeId, ValidatorSet, View, Vote};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Reduces verified events into state transitions over the pacemaker,
/// safety rules, pending votes and vertex store.
///
/// Owns all per-view bookkeeping: whether we voted, whether the view timed
/// out, and whether a quorum was already reached. All three reset on every
/// view transition.
pub struct EventReducer {
    node: NodeId,
    epoch: Epoch,
    validator_set: ValidatorSet,
    hasher: Arc<dyn Hasher>,
    pacemaker: Pacemaker,
    safety: SafetyRules,
    pending_votes: PendingVotes,
    latest_view_update: Option<ViewUpdate>,
    latest_inserted: Option<ExecutedVertex>,
    has_voted: bool,
    has_reached_quorum: bool,
    is_view_timed_out: bool,
}

impl EventReducer {
    pub fn new(
        node: NodeId,
        epoch: Epoch,
        validator_set: ValidatorSet,
        hasher: Arc<dyn Hasher>,
        pacemaker: Pacemaker,
        safety: SafetyRules,
    ) -> Self {
        EventReducer {
            node,
            epoch,
            validator_set,
            hasher,
            pacemaker,
            safety,
            pending_votes: PendingVotes::new(),
            latest_view_update: None,
            latest_inserted: None,
            has_voted: false,
            has_reached_quorum: false,
            is_view_timed_out: false,
        }
    }

    pub fn current_view(&self) -> View {
        self.latest_view_update
            .as_ref()
            .map(|update| update.current_view)
            .unwrap_or_else(View::genesis)
    }

    pub fn safety_state(&self) -> &concourse_types::SafetyState {
        self.safety.state()
    }

    /// Re-evaluates the view implied by the store's sync position and
    /// enters it if it advances us. Called at start, after quorums, and
    /// after every successful sync.
    pub fn process_high_qc(
        &mut self,
        vertex_store: &mut VertexStore,
        now_ms: u64,
        actions: &mut Vec<Action>,
    ) {
        if let Some(update) = self.pacemaker.process_qc(vertex_store.high_qc()) {
            self.process_view_update(update, vertex_store, now_ms, actions);
        }
    }

    fn process_view_update(
        &mut self,
        update: ViewUpdate,
        vertex_store: &mut VertexStore,
        now_ms: u64,
        actions: &mut Vec<Action>,
    ) {
        self.has_voted = false;
        self.has_reached_quorum = false;
        self.is_view_timed_out = false;
        self.latest_view_update = Some(update.clone());
        self.pacemaker
            .process_view_update(&update, &mut self.safety, actions);
        // A vertex for the new view may already have been inserted (we can
        // receive the proposal before the certificates that advance us).
        self.try_vote(vertex_store, now_ms, actions);
    }

    /// A vertex was executed into the store; vote if it belongs to the
    /// current view and safety allows.
    pub fn process_vertex_inserted(
        &mut self,
        executed: ExecutedVertex,
        vertex_store: &mut VertexStore,
        now_ms: u64,
        actions: &mut Vec<Action>,
    ) {
        if executed.view() != self.current_view() {
            trace!(view = %executed.view(), current = %self.current_view(), "stale insert");
            return;
        }
        self.latest_inserted = Some(executed);
        self.try_vote(vertex_store, now_ms, actions);
    }

    fn try_vote(&mut self, vertex_store: &VertexStore, now_ms: u64, actions: &mut Vec<Action>) {
        let Some(update) = &self.latest_view_update else {
            return;
        };
        let Some(executed) = &self.latest_inserted else {
            return;
        };
        if executed.view() != update.current_view {
            return;
        }
        // A timed-out view gets a timeout vote from the pacemaker instead.
        if self.has_voted || self.is_view_timed_out {
            return;
        }
        match self
            .safety
            .vote_for(executed, now_ms, vertex_store.high_qc())
        {
            Ok(vote) => {
                self.has_voted = true;
                actions.push(Action::PersistSafetyState {
                    state: self.safety.state().clone(),
                });
                actions.push(Action::Send {
                    to: update.next_leader,
                    message: OutboundMessage::Vote(Box::new(vote)),
                });
            }
            Err(violation) => {
                debug!(%violation, vertex = %executed.id, "abstaining");
                actions.push(Action::EmitNoVote {
                    view: executed.view(),
                    vertex_id: executed.id,
                });
            }
        }
    }

    /// Counts a verified vote. Only the next leader accumulates regular
    /// votes; timeout votes concern everyone.
    pub fn process_vote(&mut self, vote: &Vote, actions: &mut Vec<Action>) {
        if vote.epoch != self.epoch {
            trace!(epoch = ?vote.epoch, "vote from another epoch ignored");
            return;
        }
        let Some(update) = &self.latest_view_update else {
            return;
        };
        if vote.view() != update.current_view {
            trace!(view = %vote.view(), current = %update.current_view, "stale vote ignored");
            return;
        }
        if self.has_reached_quorum {
            trace!(view = %vote.view(), "vote after quorum ignored");
            return;
        }
        if !vote.is_timeout() && update.next_leader != self.node {
            warn!(author = %vote.author, "regular vote sent to non-leader");
            return;
        }
        match self.pending_votes.insert_vote(vote, &self.validator_set) {
            VoteProcessingResult::QuorumReached(certificate) => {
                self.has_reached_quorum = true;
                actions.push(Action::EnqueueInternal {
                    event: Event::ViewQuorumReached {
                        certificate,
                        author: vote.author,
                    },
                });
            }
            VoteProcessingResult::Accepted => {
                trace!(author = %vote.author, view = %vote.view(), "vote accepted");
            }
            VoteProcessingResult::Rejected(reason) => {
                debug!(author = %vote.author, ?reason, "vote rejected");
            }
        }
    }

    /// Inserts a verified, synced proposal's vertex for the current view.
    pub fn process_proposal(
        &mut self,
        proposal: &Proposal,
        vertex_store: &mut VertexStore,
        actions: &mut Vec<Action>,
    ) {
        let view = proposal.vertex.view;
        if view != self.current_view() {
            trace!(%view, current = %self.current_view(), "stale proposal ignored");
            return;
        }
        if let Some(tc) = &proposal.highest_tc {
            vertex_store.insert_timeout_certificate(tc, actions);
        }
        let vertex_id = self.hasher.hash_vertex(&proposal.vertex);
        if let Err(error) = vertex_store.insert_vertex(proposal.vertex.clone(), vertex_id, actions)
        {
            warn!(%error, vertex = %vertex_id, "proposal vertex not inserted");
        }
    }

    /// The local timeout for `view` fired.
    pub fn process_local_timeout(
        &mut self,
        view: View,
        vertex_store: &mut VertexStore,
        now_ms: u64,
        actions: &mut Vec<Action>,
    ) {
        if view == self.current_view() {
            self.is_view_timed_out = true;
        }
        self.pacemaker
            .process_local_timeout(view, vertex_store, &mut self.safety, now_ms, actions);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProposerElection;
    use concourse_core::test_support::{
        CountingLedger, DeterministicHasher, DeterministicSigner,
    };
    use concourse_core::{EmptyPayloadSource, HashSigner};
    use concourse_types::test_utils::{genesis_qc, genesis_vertex, node, validator_set};
    use concourse_types::{SafetyState, Vertex, ViewCertificate};
    use std::time::Duration;

    fn reducer(self_node: u8) -> EventReducer {
        let hasher: Arc<dyn Hasher> = Arc::new(DeterministicHasher);
        let pacemaker = Pacemaker::new(
            node(self_node),
            crate::PacemakerConfig {
                base_timeout: Duration::from_millis(100),
                backoff_exponent_cap: 3,
            },
            ProposerElection::new(validator_set(4)),
            Arc::clone(&hasher),
            Box::new(EmptyPayloadSource),
        );
        let safety = SafetyRules::new(
            node(self_node),
            Arc::clone(&hasher),
            Arc::new(DeterministicSigner::new(node(self_node))),
            SafetyState::default(),
        );
        EventReducer::new(
            node(self_node),
            concourse_types::Epoch::of(1),
            validator_set(4),
            hasher,
            pacemaker,
            safety,
        )
    }

    fn store() -> VertexStore {
        VertexStore::rooted_at(Arc::new(CountingLedger), genesis_vertex(), genesis_qc())
    }

    fn signed_vote_for(author_byte: u8, executed: &ExecutedVertex, timeout: bool) -> Vote {
        let author = node(author_byte);
        let hasher = DeterministicHasher;
        let signer = DeterministicSigner::new(author);
        let rules = SafetyRules::new(
            author,
            Arc::new(hasher),
            Arc::new(signer),
            SafetyState::default(),
        );
        let vote = rules.create_vote(executed, 3 + author_byte as u64, {
            let qc = genesis_qc();
            concourse_types::HighQC::new(qc.clone(), qc, None)
        });
        if timeout {
            let hash = hasher.hash_timeout(&concourse_types::VoteTimeout::of(&vote));
            vote.with_timeout_signature(signer.sign(hash))
        } else {
            vote
        }
    }

    /// Brings a reducer into view 1 and inserts a view-1 vertex.
    fn enter_view_one(reducer: &mut EventReducer, store: &mut VertexStore) -> (ExecutedVertex, Vec<Action>) {
        let mut actions = Vec::new();
        reducer.process_high_qc(store, 0, &mut actions);
        assert_eq!(reducer.current_view(), View::of(1));

        let vertex = Vertex::new(genesis_qc(), View::of(1), Vec::new(), node(2));
        let vertex_id = DeterministicHasher.hash_vertex(&vertex);
        let executed = store
            .insert_vertex(vertex, vertex_id, &mut Vec::new())
            .unwrap();
        (executed, actions)
    }

    #[test]
    fn votes_exactly_once_per_inserted_vertex() {
        let mut reducer = reducer(1);
        let mut store = store();
        let (executed, _) = enter_view_one(&mut reducer, &mut store);

        let mut actions = Vec::new();
        reducer.process_vertex_inserted(executed.clone(), &mut store, 0, &mut actions);
        let persist = actions
            .iter()
            .position(|a| matches!(a, Action::PersistSafetyState { .. }))
            .expect("safety persisted");
        let send = actions
            .iter()
            .position(|a| matches!(
                a,
                Action::Send { to, message: OutboundMessage::Vote(_) } if *to == node(3)
            ))
            .expect("vote sent to next leader");
        assert!(persist < send);

        // Replaying the insert does not release a second vote.
        let mut again = Vec::new();
        reducer.process_vertex_inserted(executed, &mut store, 0, &mut again);
        assert!(!again.iter().any(|a| matches!(a, Action::Send { .. })));
    }

    #[test]
    fn stale_view_insert_is_ignored() {
        let mut reducer = reducer(1);
        let mut store = store();
        enter_view_one(&mut reducer, &mut store);

        let stale = Vertex::new(genesis_qc(), View::of(9), Vec::new(), node(2));
        let id = DeterministicHasher.hash_vertex(&stale);
        let executed = store.insert_vertex(stale, id, &mut Vec::new()).unwrap();
        let mut actions = Vec::new();
        reducer.process_vertex_inserted(executed, &mut store, 0, &mut actions);
        assert!(actions.is_empty());
    }

    #[test]
    fn does_not_vote_after_view_timed_out() {
        let mut reducer = reducer(1);
        let mut store = store();
        let (executed, _) = enter_view_one(&mut reducer, &mut store);

        let mut actions = Vec::new();
        reducer.process_local_timeout(View::of(1), &mut store, 0, &mut actions);

        let mut vote_actions = Vec::new();
        reducer.process_vertex_inserted(executed, &mut store, 0, &mut vote_actions);
        assert!(!vote_actions
            .iter()
            .any(|a| matches!(a, Action::Send { .. })));
    }

    #[test]
    fn quorum_dispatched_exactly_once() {
        // Node 3 is the next leader for view 1 (leader of view 2).
        let mut reducer = reducer(3);
        let mut store = store();
        let (executed, _) = enter_view_one(&mut reducer, &mut store);

        let mut actions = Vec::new();
        for author in [1u8, 2, 4] {
            reducer.process_vote(&signed_vote_for(author, &executed, false), &mut actions);
        }
        let quorums = actions
            .iter()
            .filter(|a| matches!(
                a,
                Action::EnqueueInternal { event: Event::ViewQuorumReached { .. } }
            ))
            .count();
        assert_eq!(quorums, 1);

        // A late vote after the quorum changes nothing.
        let mut late = Vec::new();
        reducer.process_vote(&signed_vote_for(3, &executed, false), &mut late);
        assert!(late.is_empty());
    }

    #[test]
    fn stale_votes_never_reach_the_accumulator() {
        // Node 3 is the next leader for view 1.
        let mut reducer = reducer(3);
        let mut store = store();
        let (executed, _) = enter_view_one(&mut reducer, &mut store);

        // A quorum's worth of genesis-view votes arrives late. Were they
        // counted, they would form a certificate and dispatch a quorum.
        let genesis = store.root().clone();
        let mut actions = Vec::new();
        for author in [1u8, 2, 4] {
            reducer.process_vote(&signed_vote_for(author, &genesis, false), &mut actions);
        }
        assert!(actions.is_empty());

        // Current-view votes from the same authors still quorum: the stale
        // ones left no trace behind.
        for author in [1u8, 2, 4] {
            reducer.process_vote(&signed_vote_for(author, &executed, false), &mut actions);
        }
        let quorums = actions
            .iter()
            .filter(|a| matches!(
                a,
                Action::EnqueueInternal { event: Event::ViewQuorumReached { .. } }
            ))
            .count();
        assert_eq!(quorums, 1);
    }

    #[test]
    fn regular_votes_ignored_by_non_leader() {
        let mut reducer = reducer(1); // next leader for view 1 is node 3
        let mut store = store();
        let (executed, _) = enter_view_one(&mut reducer, &mut store);

        let mut actions = Vec::new();
        for author in [1u8, 2, 4] {
            reducer.process_vote(&signed_vote_for(author, &executed, false), &mut actions);
        }
        assert!(actions.is_empty());
    }

    #[test]
    fn timeout_votes_accepted_by_everyone() {
        let mut reducer = reducer(1);
        let mut store = store();
        let (executed, _) = enter_view_one(&mut reducer, &mut store);

        let mut actions = Vec::new();
        for author in [2u8, 3, 4] {
            reducer.process_vote(&signed_vote_for(author, &executed, true), &mut actions);
        }
        // Identical vote data from all three: the QC quorum also completes,
        // whichever certificate formed, exactly one dispatch happened.
        let quorums = actions
            .iter()
            .filter(|a| matches!(
                a,
                Action::EnqueueInternal { event: Event::ViewQuorumReached { .. } }
            ))
            .count();
        assert_eq!(quorums, 1);
    }

    #[test]
    fn stale_proposal_ignored() {
        let mut reducer = reducer(1);
        let mut store = store();
        enter_view_one(&mut reducer, &mut store);

        let vertex = Vertex::new(genesis_qc(), View::of(7), Vec::new(), node(4));
        let proposal = Proposal {
            vertex,
            author: node(4),
            signature: concourse_types::Signature([0; 32]),
            highest_committed_qc: genesis_qc(),
            highest_tc: None,
        };
        let before = store.len();
        let mut actions = Vec::new();
        reducer.process_proposal(&proposal, &mut store, &mut actions);
        assert_eq!(store.len(), before);
        assert!(actions.is_empty());
    }

    #[test]
    fn current_proposal_inserted() {
        let mut reducer = reducer(1);
        let mut store = store();
        enter_view_one(&mut reducer, &mut store);

        let vertex = Vertex::new(genesis_qc(), View::of(1), vec![1], node(2));
        let proposal = Proposal {
            vertex,
            author: node(2),
            signature: concourse_types::Signature([0; 32]),
            highest_committed_qc: genesis_qc(),
            highest_tc: None,
        };
        let mut actions = Vec::new();
        reducer.process_proposal(&proposal, &mut store, &mut actions);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::EnqueueInternal { event: Event::VertexInserted { .. } })));
    }

    #[test]
    fn quorum_certificate_carries_the_vote_data() {
        let mut reducer = reducer(3);
        let mut store = store();
        let (executed, _) = enter_view_one(&mut reducer, &mut store);

        let mut actions = Vec::new();
        for author in [1u8, 2, 4] {
            reducer.process_vote(&signed_vote_for(author, &executed, false), &mut actions);
        }
        let certificate = actions
            .iter()
            .find_map(|a| match a {
                Action::EnqueueInternal {
                    event: Event::ViewQuorumReached { certificate, .. },
                } => Some(certificate.clone()),
                _ => None,
            })
            .expect("quorum");
        match certificate {
            ViewCertificate::Qc(qc) => {
                assert_eq!(qc.proposed().vertex_id, executed.id);
                assert_eq!(qc.signatures.count(), 3);
            }
            ViewCertificate::Tc(_) => panic!("expected QC"),
        }
    }
}
