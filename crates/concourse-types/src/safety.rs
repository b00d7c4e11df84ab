//! Durable safety state.

use crate::{View, Vote};
use serde::{Deserialize, Serialize};

/// The state a validator must never lose: its lock and its last vote.
///
/// Persisted before any vote derived from it leaves the node, so a restart
/// can never lead to equivocation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyState {
    /// View of the highest 2-chain head observed; proposals extending a
    /// parent older than this are refused.
    pub locked_view: View,
    pub last_vote: Option<Vote>,
}

impl SafetyState {
    pub fn new(locked_view: View, last_vote: Option<Vote>) -> Self {
        SafetyState {
            locked_view,
            last_vote,
        }
    }

    pub fn last_voted_view(&self) -> View {
        self.last_vote
            .as_ref()
            .map(|vote| vote.view())
            .unwrap_or_else(View::genesis)
    }
}
