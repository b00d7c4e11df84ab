//! View and epoch counters.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A consensus round. Views increase monotonically within an epoch and one
/// leader is assigned per view.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct View(u64);

impl View {
    pub const fn genesis() -> Self {
        View(0)
    }

    pub const fn of(number: u64) -> Self {
        View(number)
    }

    pub fn number(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> View {
        View(self.0.checked_add(1).unwrap_or(u64::MAX))
    }

    pub fn previous(&self) -> View {
        View(self.0.saturating_sub(1))
    }

    pub fn is_genesis(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "view({})", self.0)
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Epoch counter. The validator set is fixed for the duration of an epoch;
/// events from other epochs are stale.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Epoch(u64);

impl Epoch {
    pub const fn of(number: u64) -> Self {
        Epoch(number)
    }

    pub fn number(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "epoch({})", self.0)
    }
}
