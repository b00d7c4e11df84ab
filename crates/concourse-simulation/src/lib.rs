//! Deterministic multi-node simulation.
//!
//! Runs a set of [`concourse_node::NodeStateMachine`]s against a simulated
//! network: a single priority event queue ordered by (time, priority,
//! sequence), seeded jittered latency, cancellable timers, and optional
//! partitions. Everything is driven from one seed, so a failing run replays
//! exactly.

mod network;
mod runner;

pub use network::LatencyModel;
pub use runner::{Simulation, SimulationConfig};

/// Installs a permissive env-filter subscriber for manual debugging runs.
/// No-op when a subscriber is already set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
