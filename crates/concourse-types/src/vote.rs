//! Votes and the timeout payload.

use crate::{Epoch, HighQC, NodeId, Signature, View, VoteData};
use serde::{Deserialize, Serialize};

/// A validator's vote on a proposed vertex.
///
/// The primary signature covers `(vote_data, timestamp)`. A vote may
/// additionally carry a timeout signature over [`VoteTimeout`], turning the
/// same vote into a contribution toward a timeout certificate.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Vote {
    pub author: NodeId,
    pub epoch: Epoch,
    pub vote_data: VoteData,
    pub timestamp: u64,
    pub signature: Signature,
    /// The author's sync position, piggybacked so receivers can catch up.
    pub high_qc: HighQC,
    pub timeout_signature: Option<Signature>,
}

impl Vote {
    pub fn view(&self) -> View {
        self.vote_data.proposed.view
    }

    pub fn is_timeout(&self) -> bool {
        self.timeout_signature.is_some()
    }

    pub fn with_timeout_signature(mut self, signature: Signature) -> Vote {
        self.timeout_signature = Some(signature);
        self
    }
}

/// Canonical payload of a timeout signature: the view being abandoned.
/// Deliberately independent of any vertex so that timeout votes for
/// different proposals still aggregate into one certificate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VoteTimeout {
    pub view: View,
    pub epoch: Epoch,
}

impl VoteTimeout {
    pub fn of(vote: &Vote) -> Self {
        VoteTimeout {
            view: vote.view(),
            epoch: vote.epoch,
        }
    }
}
