//! The BFT consensus components.
//!
//! Each component is an owned piece of state driven synchronously by the
//! [`EventReducer`], which is itself driven by the node-level state machine
//! in `concourse-node`:
//!
//! - [`PendingVotes`]: aggregates votes into quorum/timeout certificates
//! - [`SafetyRules`]: decides whether voting is safe, owns the durable
//!   safety state
//! - [`VertexStore`]: the uncommitted vertex DAG and the 3-chain commit rule
//! - [`Pacemaker`]: view progression, local timeouts, proposal generation
//! - [`EventVerifier`]: authenticity gate in front of everything else

mod pacemaker;
mod pending_votes;
mod proposer;
mod reducer;
mod safety_rules;
mod verifier;
mod vertex_store;

pub use pacemaker::{Pacemaker, PacemakerConfig, ViewUpdate};
pub use pending_votes::{PendingVotes, VoteProcessingResult, VoteRejectedReason};
pub use proposer::ProposerElection;
pub use reducer::EventReducer;
pub use safety_rules::{SafetyRules, SafetyViolation};
pub use verifier::EventVerifier;
pub use vertex_store::{VertexStore, VertexStoreError};
