//! Event routing across verifier, sync and reducer.

use concourse_bft::{
    EventReducer, EventVerifier, Pacemaker, PacemakerConfig, ProposerElection, SafetyRules,
    VertexStore,
};
use concourse_core::{
    Action, Event, HashSigner, HashVerifier, Hasher, Ledger, PayloadSource, Proposal,
    StateMachine,
};
use concourse_sync::{SyncConfig, SyncCoordinator, SyncResult};
use concourse_types::{
    Epoch, ExecutedVertex, HighQC, LedgerHeader, NodeId, QuorumCertificate, SafetyState,
    ValidatorSet, VertexStoreSnapshot, ViewCertificate, Vote,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Tunables for one node.
#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    pub pacemaker: PacemakerConfig,
    pub sync: SyncConfig,
    /// Seed for the sync coordinator's peer rotation.
    pub sync_seed: u64,
}

/// The injected collaborators a node needs.
pub struct Collaborators {
    pub hasher: Arc<dyn Hasher>,
    pub signer: Arc<dyn HashSigner>,
    pub verifier: Arc<dyn HashVerifier>,
    pub ledger: Arc<dyn Ledger>,
    pub payload_source: Box<dyn PayloadSource>,
}

/// Durable state read back at startup.
pub struct RecoveredState {
    pub safety: SafetyState,
    pub vertex_store: VertexStoreSnapshot,
    pub ledger_header: LedgerHeader,
}

impl RecoveredState {
    /// The state of a node that has never run: genesis root, empty safety
    /// state.
    pub fn genesis(ledger_header: LedgerHeader) -> Self {
        let root = ExecutedVertex::genesis(ledger_header);
        let qc = QuorumCertificate::genesis(root.header());
        RecoveredState {
            safety: SafetyState::default(),
            vertex_store: VertexStoreSnapshot::new(
                root,
                Vec::new(),
                HighQC::new(qc.clone(), qc, None),
            ),
            ledger_header,
        }
    }
}

/// One validator's complete consensus state machine.
pub struct NodeStateMachine {
    node: NodeId,
    vertex_store: VertexStore,
    verifier: EventVerifier,
    reducer: EventReducer,
    sync: SyncCoordinator,
}

impl NodeStateMachine {
    pub fn new(
        node: NodeId,
        epoch: Epoch,
        validator_set: ValidatorSet,
        config: NodeConfig,
        collaborators: Collaborators,
        recovered: RecoveredState,
    ) -> Self {
        let vertex_store = VertexStore::new(
            Arc::clone(&collaborators.ledger),
            recovered.vertex_store,
        );
        let pacemaker = Pacemaker::new(
            node,
            config.pacemaker,
            ProposerElection::new(validator_set.clone()),
            Arc::clone(&collaborators.hasher),
            collaborators.payload_source,
        );
        let safety = SafetyRules::new(
            node,
            Arc::clone(&collaborators.hasher),
            collaborators.signer,
            recovered.safety,
        );
        let reducer = EventReducer::new(
            node,
            epoch,
            validator_set.clone(),
            Arc::clone(&collaborators.hasher),
            pacemaker,
            safety,
        );
        let verifier = EventVerifier::new(
            validator_set,
            Arc::clone(&collaborators.hasher),
            collaborators.verifier,
        );
        let sync = SyncCoordinator::new(
            node,
            config.sync,
            collaborators.hasher,
            recovered.ledger_header,
            config.sync_seed,
        );
        NodeStateMachine {
            node,
            vertex_store,
            verifier,
            reducer,
            sync,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    pub fn current_view(&self) -> concourse_types::View {
        self.reducer.current_view()
    }

    pub fn vertex_store(&self) -> &VertexStore {
        &self.vertex_store
    }

    pub fn safety_state(&self) -> &SafetyState {
        self.reducer.safety_state()
    }

    /// A proposal (or vote) may carry certificates we have not caught up to.
    /// Sync first; when the position applies cleanly, let it advance the view
    /// before the message itself is processed, so a proposal for the view its
    /// own QC opens is not mistaken for a stale one.
    fn process_proposal(&mut self, proposal: Box<Proposal>, now_ms: u64, actions: &mut Vec<Action>) {
        let high_qc = proposal.high_qc();
        let author = proposal.author;
        match self
            .sync
            .sync_to_qc(high_qc.clone(), author, &mut self.vertex_store, actions)
        {
            SyncResult::Synced => {
                self.reducer
                    .process_high_qc(&mut self.vertex_store, now_ms, actions);
                self.reducer
                    .process_proposal(&proposal, &mut self.vertex_store, actions);
            }
            SyncResult::InProgress => {
                self.sync
                    .defer(&high_qc, Event::ProposalReceived { proposal });
            }
            SyncResult::Invalid => {}
        }
    }

    fn process_vote(&mut self, vote: Box<Vote>, now_ms: u64, actions: &mut Vec<Action>) {
        let high_qc = vote.high_qc.clone();
        let author = vote.author;
        match self
            .sync
            .sync_to_qc(high_qc.clone(), author, &mut self.vertex_store, actions)
        {
            SyncResult::Synced => {
                self.reducer
                    .process_high_qc(&mut self.vertex_store, now_ms, actions);
                self.reducer.process_vote(&vote, actions);
            }
            SyncResult::InProgress => {
                self.sync.defer(&high_qc, Event::VoteReceived { vote });
            }
            SyncResult::Invalid => {}
        }
    }

    fn process_quorum(
        &mut self,
        certificate: ViewCertificate,
        author: NodeId,
        now_ms: u64,
        actions: &mut Vec<Action>,
    ) {
        match certificate {
            ViewCertificate::Tc(tc) => {
                self.vertex_store.insert_timeout_certificate(&tc, actions);
                self.reducer
                    .process_high_qc(&mut self.vertex_store, now_ms, actions);
            }
            ViewCertificate::Qc(qc) => {
                // Formed from votes we counted; the certified vertex is
                // normally already local, but the completing vote may have
                // certified a vertex we only know by hash.
                let high_qc = HighQC::new(
                    qc.clone(),
                    self.vertex_store.high_qc().highest_committed_qc,
                    self.vertex_store.highest_tc().cloned(),
                );
                match self.sync.sync_to_qc(
                    high_qc.clone(),
                    author,
                    &mut self.vertex_store,
                    actions,
                ) {
                    SyncResult::Synced => {
                        self.reducer
                            .process_high_qc(&mut self.vertex_store, now_ms, actions);
                    }
                    SyncResult::InProgress => {
                        self.sync.defer(
                            &high_qc,
                            Event::ViewQuorumReached {
                                certificate: ViewCertificate::Qc(qc),
                                author,
                            },
                        );
                    }
                    SyncResult::Invalid => {}
                }
            }
        }
    }
}

impl StateMachine for NodeStateMachine {
    fn handle(&mut self, event: Event, now: Duration) -> Vec<Action> {
        let Some(event) = self.verifier.verify(event) else {
            return Vec::new();
        };
        trace!(node = %self.node, event = event.type_name(), "handling");
        let now_ms = now.as_millis() as u64;
        let mut actions = Vec::new();
        match event {
            Event::Start => {
                self.reducer
                    .process_high_qc(&mut self.vertex_store, now_ms, &mut actions);
            }
            Event::LocalTimeout { view } => {
                self.reducer
                    .process_local_timeout(view, &mut self.vertex_store, now_ms, &mut actions);
            }
            Event::SyncRequestTimeout { vertex_id } => {
                self.sync.process_request_timeout(vertex_id, &mut actions);
            }
            Event::ProposalReceived { proposal } => {
                self.process_proposal(proposal, now_ms, &mut actions);
            }
            Event::VoteReceived { vote } => {
                self.process_vote(vote, now_ms, &mut actions);
            }
            Event::VertexRequestReceived { from, request } => {
                self.sync
                    .process_request(from, request, &self.vertex_store, &mut actions);
            }
            Event::VertexResponseReceived { from, response } => {
                self.sync
                    .process_response(from, response, &mut self.vertex_store, &mut actions);
            }
            Event::VertexErrorResponseReceived { from, response } => {
                self.sync.process_error_response(
                    from,
                    *response,
                    &mut self.vertex_store,
                    &mut actions,
                );
            }
            Event::VertexInserted { vertex } => {
                self.reducer.process_vertex_inserted(
                    *vertex,
                    &mut self.vertex_store,
                    now_ms,
                    &mut actions,
                );
            }
            Event::ViewQuorumReached {
                certificate,
                author,
            } => {
                self.process_quorum(certificate, author, now_ms, &mut actions);
            }
            Event::LedgerStateUpdated { proof } => {
                self.sync
                    .process_ledger_update(&proof, &mut self.vertex_store, &mut actions);
            }
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concourse_core::test_support::{
        CountingLedger, DeterministicHasher, DeterministicSigner, DeterministicVerifier,
    };
    use concourse_core::{EmptyPayloadSource, OutboundMessage, TimerId};
    use concourse_types::test_utils::{
        genesis_high_qc, genesis_ledger_header, genesis_qc, node, validator_set,
    };
    use concourse_types::{Signature, Vertex, View};
    use std::collections::VecDeque;

    fn machine(self_node: u8) -> NodeStateMachine {
        NodeStateMachine::new(
            node(self_node),
            Epoch::of(1),
            validator_set(4),
            NodeConfig::default(),
            Collaborators {
                hasher: Arc::new(DeterministicHasher),
                signer: Arc::new(DeterministicSigner::new(node(self_node))),
                verifier: Arc::new(DeterministicVerifier),
                ledger: Arc::new(CountingLedger),
                payload_source: Box::new(EmptyPayloadSource),
            },
            RecoveredState::genesis(genesis_ledger_header()),
        )
    }

    /// Feeds an event through, draining internal events in place, and
    /// returns the externally visible actions.
    fn handle_all(machine: &mut NodeStateMachine, event: Event) -> Vec<Action> {
        let mut queue = VecDeque::from([event]);
        let mut out = Vec::new();
        while let Some(event) = queue.pop_front() {
            for action in machine.handle(event, Duration::from_millis(5)) {
                match action {
                    Action::EnqueueInternal { event } => queue.push_back(event),
                    other => out.push(other),
                }
            }
        }
        out
    }

    fn proposal_for_view_one() -> Proposal {
        let author = node(2); // leader of view 1 with 4 validators
        let vertex = Vertex::new(genesis_qc(), View::of(1), Vec::new(), author);
        let vertex_id = DeterministicHasher.hash_vertex(&vertex);
        Proposal {
            vertex,
            author,
            signature: DeterministicSigner::new(author).sign(vertex_id),
            highest_committed_qc: genesis_qc(),
            highest_tc: None,
        }
    }

    #[test]
    fn start_arms_the_view_timer() {
        let mut machine = machine(1);
        let actions = handle_all(&mut machine, Event::Start);
        assert_eq!(machine.current_view(), View::of(1));
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::SetTimer { id: TimerId::LocalTimeout(v), .. } if *v == View::of(1)
        )));
        // Node 1 does not lead view 1.
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::Broadcast { .. })));
    }

    #[test]
    fn start_as_leader_broadcasts_a_proposal() {
        let mut machine = machine(2);
        let actions = handle_all(&mut machine, Event::Start);
        let proposal = actions
            .iter()
            .find_map(|a| match a {
                Action::Broadcast {
                    message: OutboundMessage::Proposal(p),
                } => Some(p.clone()),
                _ => None,
            })
            .expect("proposal broadcast");
        assert_eq!(proposal.vertex.view, View::of(1));
        assert_eq!(proposal.author, node(2));
    }

    #[test]
    fn verified_proposal_produces_a_vote_for_the_next_leader() {
        let mut machine = machine(1);
        handle_all(&mut machine, Event::Start);
        let actions = handle_all(
            &mut machine,
            Event::ProposalReceived {
                proposal: Box::new(proposal_for_view_one()),
            },
        );
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
            .expect("vote sent to the next leader");
        assert!(persist < send);
    }

    #[test]
    fn tampered_proposal_is_dropped() {
        let mut machine = machine(1);
        handle_all(&mut machine, Event::Start);
        let mut proposal = proposal_for_view_one();
        proposal.signature = Signature([0xAB; 32]);
        let actions = handle_all(
            &mut machine,
            Event::ProposalReceived {
                proposal: Box::new(proposal),
            },
        );
        assert!(actions.is_empty());
        assert_eq!(machine.vertex_store().len(), 1);
    }

    #[test]
    fn local_timeout_broadcasts_a_timeout_vote() {
        let mut machine = machine(1);
        handle_all(&mut machine, Event::Start);
        let actions = handle_all(&mut machine, Event::LocalTimeout { view: View::of(1) });
        let vote = actions
            .iter()
            .find_map(|a| match a {
                Action::Broadcast {
                    message: OutboundMessage::Vote(v),
                } => Some(v.clone()),
                _ => None,
            })
            .expect("timeout vote broadcast");
        assert!(vote.is_timeout());
        assert_eq!(vote.view(), View::of(1));
    }

    #[test]
    fn vertex_requests_are_served_from_the_store() {
        let mut machine = machine(1);
        handle_all(&mut machine, Event::Start);
        let request = concourse_core::GetVerticesRequest {
            vertex_id: concourse_types::Hash::ZERO,
            count: 1,
        };
        let actions = handle_all(
            &mut machine,
            Event::VertexRequestReceived {
                from: node(4),
                request,
            },
        );
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Send { to, message: OutboundMessage::GetVerticesResponse(_) } if *to == node(4)
        )));
    }

    #[test]
    fn vote_quorum_advances_the_view_and_the_new_leader_proposes() {
        // Node 3 is the next leader of view 1, hence leader of view 2.
        let mut machine = machine(3);
        handle_all(&mut machine, Event::Start);
        let proposal = proposal_for_view_one();
        handle_all(
            &mut machine,
            Event::ProposalReceived {
                proposal: Box::new(proposal.clone()),
            },
        );

        // Reconstruct the executed vertex exactly as the store holds it.
        let vertex_id = DeterministicHasher.hash_vertex(&proposal.vertex);
        let ledger_header = CountingLedger
            .prepare(&genesis_ledger_header(), &proposal.vertex, vertex_id)
            .unwrap();
        let executed = ExecutedVertex::new(proposal.vertex.clone(), vertex_id, ledger_header);

        let mut all_actions = Vec::new();
        for author_byte in [1u8, 2, 4] {
            let author = node(author_byte);
            let rules = SafetyRules::new(
                author,
                Arc::new(DeterministicHasher),
                Arc::new(DeterministicSigner::new(author)),
                SafetyState::default(),
            );
            let vote = rules.create_vote(&executed, 5, genesis_high_qc());
            all_actions.extend(handle_all(
                &mut machine,
                Event::VoteReceived {
                    vote: Box::new(vote),
                },
            ));
        }

        // The quorum advanced us into view 2, which we lead.
        assert_eq!(machine.current_view(), View::of(2));
        let next_proposal = all_actions
            .iter()
            .find_map(|a| match a {
                Action::Broadcast {
                    message: OutboundMessage::Proposal(p),
                } => Some(p.clone()),
                _ => None,
            })
            .expect("view 2 proposal broadcast");
        assert_eq!(next_proposal.vertex.view, View::of(2));
        assert_eq!(next_proposal.vertex.parent_id(), vertex_id);
    }
}
