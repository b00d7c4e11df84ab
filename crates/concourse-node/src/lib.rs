//! The node-level state machine.
//!
//! [`NodeStateMachine`] composes the consensus components into one
//! [`StateMachine`](concourse_core::StateMachine): every event passes the
//! verifier first, network events that reveal missing ancestry detour
//! through the sync coordinator, and everything that survives reaches the
//! reducer. The machine performs no I/O; runners execute the returned
//! actions in order.

mod node;

pub use node::{Collaborators, NodeConfig, NodeStateMachine, RecoveredState};
