//! Leader assignment.

use concourse_types::{NodeId, ValidatorSet, View};

/// Rotates leadership through the validator set in its canonical order,
/// one leader per view. Every honest node derives the same schedule.
#[derive(Clone, Debug)]
pub struct ProposerElection {
    validator_set: ValidatorSet,
}

impl ProposerElection {
    pub fn new(validator_set: ValidatorSet) -> Self {
        debug_assert!(!validator_set.is_empty());
        ProposerElection { validator_set }
    }

    pub fn leader(&self, view: View) -> NodeId {
        let validators = self.validator_set.validators();
        let index = (view.number() % validators.len() as u64) as usize;
        validators[index].node
    }

    pub fn is_leader(&self, node: &NodeId, view: View) -> bool {
        self.leader(view) == *node
    }
}
