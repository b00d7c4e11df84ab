//! View progression and liveness.

use crate::{ProposerElection, SafetyRules, VertexStore};
use concourse_core::{
    Action, Hasher, OutboundMessage, PayloadSource, TimerId,
};
use concourse_types::{HighQC, NodeId, Vertex, View};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Timeout policy for views.
///
/// The local timeout doubles for every uncommitted view between the current
/// view and the highest committed one, capped; a healthy chain keeps the
/// exponent at zero while a struggling one backs off until quorum reforms.
#[derive(Debug, Clone, Copy)]
pub struct PacemakerConfig {
    pub base_timeout: Duration,
    pub backoff_exponent_cap: u32,
}

impl Default for PacemakerConfig {
    fn default() -> Self {
        PacemakerConfig {
            base_timeout: Duration::from_secs(1),
            backoff_exponent_cap: 6,
        }
    }
}

/// A view transition: the new view, the sync position that justified it,
/// and its leadership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewUpdate {
    pub current_view: View,
    pub high_qc: HighQC,
    pub leader: NodeId,
    pub next_leader: NodeId,
}

/// Drives views forward: arms the local timeout, proposes when this node
/// leads, and produces timeout votes when a view stalls.
pub struct Pacemaker {
    node: NodeId,
    config: PacemakerConfig,
    election: ProposerElection,
    hasher: Arc<dyn Hasher>,
    payload_source: Box<dyn PayloadSource>,
    current_view: View,
    high_qc: Option<HighQC>,
    /// Highest view we have emitted a [`ViewUpdate`] for; guards against
    /// re-dispatching on replayed certificates.
    last_dispatched_view: View,
}

impl Pacemaker {
    pub fn new(
        node: NodeId,
        config: PacemakerConfig,
        election: ProposerElection,
        hasher: Arc<dyn Hasher>,
        payload_source: Box<dyn PayloadSource>,
    ) -> Self {
        Pacemaker {
            node,
            config,
            election,
            hasher,
            payload_source,
            current_view: View::genesis(),
            high_qc: None,
            last_dispatched_view: View::genesis(),
        }
    }

    pub fn current_view(&self) -> View {
        self.current_view
    }

    /// Computes the view implied by a sync position. Returns the transition
    /// to apply, or None when it would not advance us.
    pub fn process_qc(&mut self, high_qc: HighQC) -> Option<ViewUpdate> {
        let next_view = high_qc.highest_view().next();
        if next_view <= self.last_dispatched_view {
            return None;
        }
        self.last_dispatched_view = next_view;
        Some(ViewUpdate {
            current_view: next_view,
            leader: self.election.leader(next_view),
            next_leader: self.election.leader(next_view.next()),
            high_qc,
        })
    }

    /// Enters the view carried by `update`: re-arms the timeout and, when
    /// we lead it, broadcasts a proposal extending the highest QC.
    pub fn process_view_update(
        &mut self,
        update: &ViewUpdate,
        safety: &mut SafetyRules,
        actions: &mut Vec<Action>,
    ) {
        if update.current_view <= self.current_view {
            trace!(view = %update.current_view, "non-advancing view update ignored");
            return;
        }
        let previous_view = self.current_view;
        self.current_view = update.current_view;
        self.high_qc = Some(update.high_qc.clone());

        actions.push(Action::CancelTimer {
            id: TimerId::LocalTimeout(previous_view),
        });
        actions.push(Action::SetTimer {
            id: TimerId::LocalTimeout(self.current_view),
            duration: self.timeout_duration(&update.high_qc),
        });
        info!(view = %self.current_view, leader = %update.leader, "view update");

        if update.leader == self.node {
            self.propose(update, safety, actions);
        }
    }

    fn propose(&mut self, update: &ViewUpdate, safety: &mut SafetyRules, actions: &mut Vec<Action>) {
        let view = update.current_view;
        let payload = self.payload_source.next_payload(view);
        let vertex = Vertex::new(
            update.high_qc.highest_qc.clone(),
            view,
            payload,
            self.node,
        );
        let vertex_id = self.hasher.hash_vertex(&vertex);
        let Some(proposal) = safety.sign_proposal(
            &vertex,
            vertex_id,
            update.high_qc.highest_committed_qc.clone(),
            update.high_qc.highest_tc.clone(),
        ) else {
            return;
        };
        debug!(view = %view, vertex = %vertex_id, "proposing");
        actions.push(Action::Broadcast {
            message: OutboundMessage::Proposal(Box::new(proposal)),
        });
    }

    /// Handles the local timeout for `view` firing. Broadcasts a timeout
    /// vote - the vote we already released for this view, timeout-signed,
    /// or a vote on a freshly inserted empty vertex - and re-arms the timer
    /// so a lost broadcast is re-sent.
    pub fn process_local_timeout(
        &mut self,
        view: View,
        vertex_store: &mut VertexStore,
        safety: &mut SafetyRules,
        now_ms: u64,
        actions: &mut Vec<Action>,
    ) {
        if view != self.current_view {
            trace!(%view, current = %self.current_view, "stale local timeout");
            return;
        }
        let high_qc = self
            .high_qc
            .clone()
            .unwrap_or_else(|| vertex_store.high_qc());
        warn!(%view, "local timeout");

        actions.push(Action::SetTimer {
            id: TimerId::LocalTimeout(view),
            duration: self.timeout_duration(&high_qc),
        });

        let vote = match safety.last_vote(view).cloned() {
            Some(vote) => safety.timeout_vote(vote),
            None => {
                // Never voted in this view: vote on an empty vertex so the
                // timeout still carries usable vote data.
                let vertex = Vertex::timeout(high_qc.highest_qc.clone(), view);
                let vertex_id = self.hasher.hash_vertex(&vertex);
                match vertex_store.insert_vertex(vertex, vertex_id, actions) {
                    Ok(executed) => {
                        let vote = safety.create_vote(&executed, now_ms, vertex_store.high_qc());
                        safety.timeout_vote(vote)
                    }
                    Err(error) => {
                        warn!(%error, %view, "could not insert timeout vertex");
                        return;
                    }
                }
            }
        };

        actions.push(Action::PersistSafetyState {
            state: safety.state().clone(),
        });
        actions.push(Action::Broadcast {
            message: OutboundMessage::Vote(Box::new(vote)),
        });
    }

    fn timeout_duration(&self, high_qc: &HighQC) -> Duration {
        let committed_view = high_qc.highest_committed_qc.view();
        let uncommitted = self
            .current_view
            .number()
            .saturating_sub(committed_view.number())
            .saturating_sub(1);
        let exponent = (uncommitted as u32).min(self.backoff_cap());
        self.config.base_timeout * 2u32.saturating_pow(exponent)
    }

    fn backoff_cap(&self) -> u32 {
        self.config.backoff_exponent_cap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concourse_core::test_support::{CountingLedger, DeterministicHasher, DeterministicSigner};
    use concourse_core::EmptyPayloadSource;
    use concourse_types::test_utils::{genesis_high_qc, genesis_qc, genesis_vertex, node, validator_set};
    use concourse_types::SafetyState;

    fn pacemaker(self_node: u8) -> Pacemaker {
        Pacemaker::new(
            node(self_node),
            PacemakerConfig {
                base_timeout: Duration::from_millis(100),
                backoff_exponent_cap: 3,
            },
            ProposerElection::new(validator_set(4)),
            Arc::new(DeterministicHasher),
            Box::new(EmptyPayloadSource),
        )
    }

    fn safety(self_node: u8) -> SafetyRules {
        SafetyRules::new(
            node(self_node),
            Arc::new(DeterministicHasher),
            Arc::new(DeterministicSigner::new(node(self_node))),
            SafetyState::default(),
        )
    }

    fn store() -> VertexStore {
        VertexStore::rooted_at(Arc::new(CountingLedger), genesis_vertex(), genesis_qc())
    }

    #[test]
    fn process_qc_advances_once_per_position() {
        let mut pacemaker = pacemaker(1);
        let update = pacemaker.process_qc(genesis_high_qc()).expect("first");
        assert_eq!(update.current_view, View::of(1));
        // Replaying the same position dispatches nothing.
        assert!(pacemaker.process_qc(genesis_high_qc()).is_none());
    }

    #[test]
    fn view_update_arms_timer_and_cancels_previous() {
        let mut pacemaker = pacemaker(1);
        let mut safety = safety(1);
        let update = pacemaker.process_qc(genesis_high_qc()).unwrap();
        let mut actions = Vec::new();
        pacemaker.process_view_update(&update, &mut safety, &mut actions);
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::CancelTimer { id: TimerId::LocalTimeout(v) } if v.is_genesis()
        )));
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::SetTimer { id: TimerId::LocalTimeout(v), .. } if *v == View::of(1)
        )));

        // Stale re-entry does nothing.
        let mut again = Vec::new();
        pacemaker.process_view_update(&update, &mut safety, &mut again);
        assert!(again.is_empty());
    }

    #[test]
    fn leader_broadcasts_a_proposal() {
        // View 1's leader with 4 validators is node(2).
        let mut pacemaker = pacemaker(2);
        let mut safety = safety(2);
        let update = pacemaker.process_qc(genesis_high_qc()).unwrap();
        let mut actions = Vec::new();
        pacemaker.process_view_update(&update, &mut safety, &mut actions);
        let proposal = actions
            .iter()
            .find_map(|a| match a {
                Action::Broadcast {
                    message: OutboundMessage::Proposal(p),
                } => Some(p.clone()),
                _ => None,
            })
            .expect("proposal broadcast");
        assert_eq!(proposal.author, node(2));
        assert_eq!(proposal.vertex.view, View::of(1));
        assert_eq!(proposal.vertex.parent_qc, genesis_qc());
    }

    #[test]
    fn non_leader_does_not_propose() {
        let mut pacemaker = pacemaker(1);
        let mut safety = safety(1);
        let update = pacemaker.process_qc(genesis_high_qc()).unwrap();
        let mut actions = Vec::new();
        pacemaker.process_view_update(&update, &mut safety, &mut actions);
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::Broadcast { .. })));
    }

    #[test]
    fn timeout_without_prior_vote_inserts_empty_vertex_and_broadcasts() {
        let mut pacemaker = pacemaker(1);
        let mut safety = safety(1);
        let mut store = store();
        let update = pacemaker.process_qc(genesis_high_qc()).unwrap();
        let mut actions = Vec::new();
        pacemaker.process_view_update(&update, &mut safety, &mut actions);

        let mut actions = Vec::new();
        pacemaker.process_local_timeout(View::of(1), &mut store, &mut safety, 0, &mut actions);

        // Timer re-armed.
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::SetTimer { id: TimerId::LocalTimeout(v), .. } if *v == View::of(1)
        )));
        // The empty vertex landed in the store.
        assert_eq!(store.len(), 2);
        // Safety state persisted before the broadcast.
        let persist_index = actions
            .iter()
            .position(|a| matches!(a, Action::PersistSafetyState { .. }))
            .expect("persist");
        let broadcast_index = actions
            .iter()
            .position(|a| matches!(
                a,
                Action::Broadcast { message: OutboundMessage::Vote(v) } if v.is_timeout()
            ))
            .expect("timeout vote broadcast");
        assert!(persist_index < broadcast_index);
    }

    #[test]
    fn timeout_with_prior_vote_resends_it_timeout_signed() {
        let mut pacemaker = pacemaker(1);
        let mut safety = safety(1);
        let mut store = store();
        let update = pacemaker.process_qc(genesis_high_qc()).unwrap();
        let mut actions = Vec::new();
        pacemaker.process_view_update(&update, &mut safety, &mut actions);

        // Vote normally in view 1 first.
        let vertex = Vertex::new(genesis_qc(), View::of(1), Vec::new(), node(2));
        let vertex_id = DeterministicHasher.hash_vertex(&vertex);
        let executed = store
            .insert_vertex(vertex, vertex_id, &mut Vec::new())
            .unwrap();
        let vote = safety.vote_for(&executed, 0, genesis_high_qc()).unwrap();

        let mut actions = Vec::new();
        pacemaker.process_local_timeout(View::of(1), &mut store, &mut safety, 0, &mut actions);
        let sent = actions
            .iter()
            .find_map(|a| match a {
                Action::Broadcast {
                    message: OutboundMessage::Vote(v),
                } => Some(v.clone()),
                _ => None,
            })
            .expect("vote broadcast");
        assert!(sent.is_timeout());
        assert_eq!(sent.vote_data, vote.vote_data);
        // No extra vertex was created.
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn stale_timeout_is_ignored() {
        let mut pacemaker = pacemaker(1);
        let mut safety = safety(1);
        let mut store = store();
        let update = pacemaker.process_qc(genesis_high_qc()).unwrap();
        pacemaker.process_view_update(&update, &mut safety, &mut Vec::new());

        let mut actions = Vec::new();
        pacemaker.process_local_timeout(View::of(7), &mut store, &mut safety, 0, &mut actions);
        assert!(actions.is_empty());
    }

    #[test]
    fn timeout_backs_off_with_uncommitted_views() {
        let config = PacemakerConfig {
            base_timeout: Duration::from_millis(100),
            backoff_exponent_cap: 3,
        };
        let mut pacemaker = Pacemaker::new(
            node(1),
            config,
            ProposerElection::new(validator_set(4)),
            Arc::new(DeterministicHasher),
            Box::new(EmptyPayloadSource),
        );
        let mut safety = safety(1);

        // View 1 over genesis: no uncommitted backlog, base timeout.
        let update = pacemaker.process_qc(genesis_high_qc()).unwrap();
        let mut actions = Vec::new();
        pacemaker.process_view_update(&update, &mut safety, &mut actions);
        let first = timer_duration(&actions);
        assert_eq!(first, Duration::from_millis(100));

        // Jump far ahead without commits: capped exponent.
        pacemaker.current_view = View::of(40);
        let capped = pacemaker.timeout_duration(&genesis_high_qc());
        assert_eq!(capped, Duration::from_millis(800));
    }

    fn timer_duration(actions: &[Action]) -> Duration {
        actions
            .iter()
            .find_map(|a| match a {
                Action::SetTimer { duration, .. } => Some(*duration),
                _ => None,
            })
            .expect("timer set")
    }
}
