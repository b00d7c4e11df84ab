//! Vote aggregation.

use concourse_types::{
    NodeId, QuorumCertificate, TimeoutCertificate, ValidationState, ValidatorSet,
    ViewCertificate, View, Vote, VoteData,
};
use std::collections::HashMap;
use tracing::trace;

/// Why a vote was not counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteRejectedReason {
    InvalidAuthor,
    DuplicateVote,
}

/// Outcome of feeding one vote into the aggregator.
#[derive(Debug, Clone)]
pub enum VoteProcessingResult {
    /// Counted, no quorum yet.
    Accepted,
    /// Not counted.
    Rejected(VoteRejectedReason),
    /// This vote completed a certificate. One-shot: the accumulator that
    /// formed it is retired.
    QuorumReached(ViewCertificate),
}

#[derive(Debug, Clone)]
struct PreviousVote {
    view: View,
    vote_data: VoteData,
    is_timeout: bool,
}

/// Aggregates votes for the current view into quorum certificates, and
/// timeout signatures into timeout certificates.
///
/// Each validator contributes to at most one vote accumulator at a time:
/// voting again retires the earlier contribution. Timeout signatures
/// accumulate per view regardless of which vertex each vote endorses, since
/// a timeout certificate certifies the view, not a vertex.
pub struct PendingVotes {
    vote_state: HashMap<VoteData, ValidationState>,
    timeout_state: HashMap<View, ValidationState>,
    previous_votes: HashMap<NodeId, PreviousVote>,
}

impl PendingVotes {
    pub fn new() -> Self {
        PendingVotes {
            vote_state: HashMap::new(),
            timeout_state: HashMap::new(),
            previous_votes: HashMap::new(),
        }
    }

    /// Feeds one verified vote in.
    pub fn insert_vote(
        &mut self,
        vote: &Vote,
        validator_set: &ValidatorSet,
    ) -> VoteProcessingResult {
        let author = vote.author;
        if !validator_set.contains(&author) {
            return VoteProcessingResult::Rejected(VoteRejectedReason::InvalidAuthor);
        }

        // A re-sent identical vote is a duplicate, unless it newly carries a
        // timeout signature: then only the timeout accumulator advances.
        let mut count_primary = true;
        if let Some(previous) = self.previous_votes.get(&author) {
            if previous.view == vote.view() && previous.vote_data == vote.vote_data {
                if vote.is_timeout() && !previous.is_timeout {
                    count_primary = false;
                } else {
                    return VoteProcessingResult::Rejected(VoteRejectedReason::DuplicateVote);
                }
            } else {
                let previous = previous.clone();
                self.retire_previous_vote(&author, &previous);
            }
        }
        self.previous_votes.insert(
            author,
            PreviousVote {
                view: vote.view(),
                vote_data: vote.vote_data.clone(),
                is_timeout: vote.is_timeout(),
            },
        );

        if count_primary {
            let state = self
                .vote_state
                .entry(vote.vote_data.clone())
                .or_insert_with(|| validator_set.new_validation_state());
            state.add_signature(author, vote.timestamp, vote.signature);
            if state.complete() {
                let signatures = state.signatures();
                self.vote_state.remove(&vote.vote_data);
                trace!(view = %vote.view(), "quorum certificate formed");
                return VoteProcessingResult::QuorumReached(ViewCertificate::Qc(
                    QuorumCertificate::new(vote.vote_data.clone(), signatures),
                ));
            }
        }

        if let Some(timeout_signature) = vote.timeout_signature {
            let state = self
                .timeout_state
                .entry(vote.view())
                .or_insert_with(|| validator_set.new_validation_state());
            state.add_signature(author, vote.timestamp, timeout_signature);
            if state.complete() {
                let signatures = state.signatures();
                self.timeout_state.remove(&vote.view());
                trace!(view = %vote.view(), "timeout certificate formed");
                return VoteProcessingResult::QuorumReached(ViewCertificate::Tc(
                    TimeoutCertificate::new(vote.view(), vote.epoch, signatures),
                ));
            }
        }

        VoteProcessingResult::Accepted
    }

    fn retire_previous_vote(&mut self, author: &NodeId, previous: &PreviousVote) {
        if let Some(state) = self.vote_state.get_mut(&previous.vote_data) {
            state.remove_signature(author);
            if state.is_empty() {
                self.vote_state.remove(&previous.vote_data);
            }
        }
        if previous.is_timeout {
            if let Some(state) = self.timeout_state.get_mut(&previous.view) {
                state.remove_signature(author);
                if state.is_empty() {
                    self.timeout_state.remove(&previous.view);
                }
            }
        }
    }

    pub fn vote_state_size(&self) -> usize {
        self.vote_state.len()
    }

    pub fn timeout_vote_state_size(&self) -> usize {
        self.timeout_state.len()
    }

    pub fn previous_votes_size(&self) -> usize {
        self.previous_votes.len()
    }
}

impl Default for PendingVotes {
    fn default() -> Self {
        Self::new()
    }
}
