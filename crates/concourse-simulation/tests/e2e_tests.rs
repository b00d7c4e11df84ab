//! Whole-network runs: liveness and agreement under happy path, a silent
//! leader, and a healed partition.

use concourse_simulation::{Simulation, SimulationConfig};
use concourse_types::{VertexId, View};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing_test::traced_test;

/// No two nodes may commit different vertices at the same state version.
fn assert_committed_agree(sim: &Simulation) {
    let mut seen: BTreeMap<u64, VertexId> = BTreeMap::new();
    for index in 0..sim.node_count() {
        for executed in sim.committed(index) {
            let version = executed.ledger_header.state_version;
            match seen.get(&version) {
                Some(id) => assert_eq!(
                    *id, executed.id,
                    "node {index} disagrees at state version {version}"
                ),
                None => {
                    seen.insert(version, executed.id);
                }
            }
        }
    }
}

#[test]
#[traced_test]
fn four_nodes_commit_and_agree() {
    let mut sim = Simulation::new(SimulationConfig::default());
    sim.start();
    sim.run_until(Duration::from_secs(10));

    for index in 0..sim.node_count() {
        let committed = sim.committed(index).len();
        assert!(committed >= 5, "node {index} committed only {committed}");
    }
    assert_committed_agree(&sim);
}

#[test]
#[traced_test]
fn progress_survives_a_silent_leader() {
    let mut sim = Simulation::new(SimulationConfig::default());
    // Index 1 (the leader of view 1, and of every fourth view after) never
    // sends or receives anything.
    sim.set_partitioned(1, true);
    sim.start();
    sim.run_until(Duration::from_secs(20));

    for index in [0, 2, 3] {
        assert!(
            sim.node(index).current_view() > View::of(1),
            "node {index} stuck at view {:?}",
            sim.node(index).current_view()
        );
        assert!(
            !sim.committed(index).is_empty(),
            "node {index} committed nothing"
        );
    }
    assert_committed_agree(&sim);
}

#[test]
#[traced_test]
fn lagging_node_catches_up_after_partition_heals() {
    let mut sim = Simulation::new(SimulationConfig::default());
    sim.start();
    sim.run_for(Duration::from_secs(1));

    sim.set_partitioned(3, true);
    sim.run_for(Duration::from_secs(5));
    sim.set_partitioned(3, false);
    sim.run_for(Duration::from_secs(10));

    let laggard = sim.node(3);
    assert!(
        laggard.current_view() > View::of(5),
        "laggard never caught up: view {:?}",
        laggard.current_view()
    );
    assert!(
        laggard.vertex_store().root().view() > View::genesis(),
        "laggard's root never moved"
    );
    assert!(
        !sim.committed(3).is_empty(),
        "laggard committed nothing after the heal"
    );
    assert_committed_agree(&sim);
}
