//! Weighted validator sets and quorum accounting.

use crate::{NodeId, TimestampedSignature, TimestampedSignatures};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// One weighted member of the consensus committee.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Validator {
    pub node: NodeId,
    pub weight: u64,
}

impl Validator {
    pub fn new(node: NodeId, weight: u64) -> Self {
        Validator { node, weight }
    }
}

/// An immutable, insertion-ordered set of weighted validators.
///
/// Order is observable: the proposer rotation walks validators in the order
/// they were supplied, so every node must construct the set identically.
/// Cheap to clone.
#[derive(Clone, Debug)]
pub struct ValidatorSet {
    validators: Arc<Vec<Validator>>,
    weights: Arc<HashMap<NodeId, u64>>,
    total_weight: u128,
}

impl ValidatorSet {
    /// Builds a set, preserving iteration order. A node supplied twice keeps
    /// its first weight.
    pub fn from_validators(validators: impl IntoIterator<Item = Validator>) -> Self {
        let mut ordered = Vec::new();
        let mut weights = HashMap::new();
        for validator in validators {
            if weights.contains_key(&validator.node) {
                continue;
            }
            weights.insert(validator.node, validator.weight);
            ordered.push(validator);
        }
        let total_weight = ordered.iter().map(|v| v.weight as u128).sum();
        ValidatorSet {
            validators: Arc::new(ordered),
            weights: Arc::new(weights),
            total_weight,
        }
    }

    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.weights.contains_key(node)
    }

    pub fn weight_of(&self, node: &NodeId) -> Option<u64> {
        self.weights.get(node).copied()
    }

    pub fn total_weight(&self) -> u128 {
        self.total_weight
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.validators.iter().map(|v| v.node)
    }

    /// Fresh accumulator for one round of signature collection.
    pub fn new_validation_state(&self) -> ValidationState {
        ValidationState {
            validator_set: self.clone(),
            signatures: BTreeMap::new(),
            signed_weight: 0,
        }
    }
}

/// Accumulates signatures toward a Byzantine quorum: strictly more than 2/3
/// of the set's total weight.
#[derive(Clone, Debug)]
pub struct ValidationState {
    validator_set: ValidatorSet,
    signatures: BTreeMap<NodeId, TimestampedSignature>,
    signed_weight: u128,
}

impl ValidationState {
    /// Records a signature. Returns false and leaves the state untouched
    /// when the signer is not a member; re-adding a signer is a no-op that
    /// still returns true.
    pub fn add_signature(
        &mut self,
        signer: NodeId,
        timestamp: u64,
        signature: crate::Signature,
    ) -> bool {
        let Some(weight) = self.validator_set.weight_of(&signer) else {
            return false;
        };
        if self.signatures.contains_key(&signer) {
            return true;
        }
        self.signatures
            .insert(signer, TimestampedSignature { timestamp, signature });
        self.signed_weight += weight as u128;
        true
    }

    /// Removes a signer's contribution, if present.
    pub fn remove_signature(&mut self, signer: &NodeId) {
        if self.signatures.remove(signer).is_some() {
            if let Some(weight) = self.validator_set.weight_of(signer) {
                self.signed_weight -= weight as u128;
            }
        }
    }

    /// True once accumulated weight strictly exceeds 2/3 of the total.
    pub fn complete(&self) -> bool {
        self.signed_weight * 3 > self.validator_set.total_weight() * 2
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    pub fn count(&self) -> usize {
        self.signatures.len()
    }

    pub fn signatures(&self) -> TimestampedSignatures {
        TimestampedSignatures::from_map(self.signatures.clone())
    }
}
