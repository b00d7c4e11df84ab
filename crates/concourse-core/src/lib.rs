//! Core vocabulary of the Concourse consensus state machine.
//!
//! - [`Event`]: all possible inputs to a node
//! - [`Action`]: all possible outputs from a node
//! - [`EventPriority`]: ordering of events at the same timestamp
//! - [`StateMachine`]: the trait every node-level machine implements
//! - collaborator traits ([`Ledger`], [`Hasher`], [`HashSigner`],
//!   [`HashVerifier`], [`PayloadSource`]) injected at construction
//!
//! # Architecture
//!
//! ```text
//! Events → StateMachine::handle() → Actions
//! ```
//!
//! The state machine is synchronous and deterministic: it mutates itself but
//! performs no I/O. A runner (simulation or production) delivers events,
//! executes the returned actions in order, and converts results back into
//! events. Persistence actions always precede the send actions derived from
//! the same state; a runner must halt rather than send if a persist fails.

mod action;
mod event;
mod message;
mod traits;

pub use action::Action;
pub use event::{Event, EventPriority};
pub use message::{
    GetVerticesErrorResponse, GetVerticesRequest, GetVerticesResponse, OutboundMessage, Proposal,
};
pub use traits::{
    EmptyPayloadSource, HashSigner, HashVerifier, Hasher, Ledger, PayloadSource, StateMachine,
};

use concourse_types::{VertexId, View};

/// Identifies a cancellable timer.
///
/// Setting a timer with an id that is already armed replaces it; cancelling
/// an unarmed id is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Local timeout for a view. One per view; superseded on view advance.
    LocalTimeout(View),
    /// Timeout for an outstanding vertex fetch, keyed by the requested id.
    SyncRequest(VertexId),
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
