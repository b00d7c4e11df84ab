//! Authenticity gate in front of the reducer.

use concourse_core::{Event, HashVerifier, Hasher, Proposal};
use concourse_types::{ValidatorSet, Vote, VoteTimeout};
use std::sync::Arc;
use tracing::warn;

/// Checks that network events were authored by a current validator and are
/// correctly signed. Anything that fails is dropped silently (logged, never
/// propagated); local and internal events pass through untouched.
pub struct EventVerifier {
    validator_set: ValidatorSet,
    hasher: Arc<dyn Hasher>,
    verifier: Arc<dyn HashVerifier>,
}

impl EventVerifier {
    pub fn new(
        validator_set: ValidatorSet,
        hasher: Arc<dyn Hasher>,
        verifier: Arc<dyn HashVerifier>,
    ) -> Self {
        EventVerifier {
            validator_set,
            hasher,
            verifier,
        }
    }

    /// Returns the event when it may be processed, None when it must be
    /// dropped.
    pub fn verify(&self, event: Event) -> Option<Event> {
        let valid = match &event {
            Event::ProposalReceived { proposal } => self.valid_proposal(proposal),
            Event::VoteReceived { vote } => self.valid_vote(vote),
            _ => true,
        };
        if valid {
            Some(event)
        } else {
            warn!(event = event.type_name(), "unverified event dropped");
            None
        }
    }

    fn valid_proposal(&self, proposal: &Proposal) -> bool {
        if !self.validator_set.contains(&proposal.author) {
            return false;
        }
        let vertex_id = self.hasher.hash_vertex(&proposal.vertex);
        self.verifier
            .verify(&proposal.author, vertex_id, &proposal.signature)
    }

    fn valid_vote(&self, vote: &Vote) -> bool {
        if !self.validator_set.contains(&vote.author) {
            return false;
        }
        let vote_hash = self.hasher.hash_vote_data(&vote.vote_data, vote.timestamp);
        if !self.verifier.verify(&vote.author, vote_hash, &vote.signature) {
            return false;
        }
        match vote.timeout_signature {
            Some(timeout_signature) => {
                let timeout_hash = self.hasher.hash_timeout(&VoteTimeout::of(vote));
                self.verifier
                    .verify(&vote.author, timeout_hash, &timeout_signature)
            }
            None => true,
        }
    }
}
