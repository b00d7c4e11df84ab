//! The deterministic event loop.

use crate::network::{message_to_event, LatencyModel};
use concourse_core::test_support::{
    CountingLedger, DeterministicHasher, DeterministicSigner, DeterministicVerifier,
};
use concourse_core::{
    Action, EmptyPayloadSource, Event, EventPriority, OutboundMessage, StateMachine, TimerId,
};
use concourse_node::{Collaborators, NodeConfig, NodeStateMachine, RecoveredState};
use concourse_types::test_utils::{genesis_ledger_header, node, validator_set};
use concourse_types::{Epoch, ExecutedVertex, NodeId, SafetyState, VertexStoreSnapshot};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub validators: u8,
    pub seed: u64,
    pub latency: LatencyModel,
    pub node: NodeConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            validators: 4,
            seed: 42,
            latency: LatencyModel::default(),
            node: NodeConfig::default(),
        }
    }
}

enum ItemKind {
    Deliver(Event),
    TimerFired { id: TimerId, generation: u64 },
}

struct ScheduledItem {
    at: Duration,
    priority: EventPriority,
    seq: u64,
    node: usize,
    kind: ItemKind,
}

impl ScheduledItem {
    fn key(&self) -> (Duration, EventPriority, u64) {
        (self.at, self.priority, self.seq)
    }
}

impl PartialEq for ScheduledItem {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for ScheduledItem {}

impl PartialOrd for ScheduledItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledItem {
    // Reversed so the BinaryHeap pops the earliest item first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

/// A network of validators under one seeded clock.
///
/// Events at the same instant are processed Internal before Timer before
/// Network, so consequences of an event always land before new inputs.
/// Persistence actions are recorded (not written anywhere), and the
/// ledger-facing actions are answered the way a production runner would:
/// commits and state transfers come back as [`Event::LedgerStateUpdated`].
pub struct Simulation {
    config: SimulationConfig,
    ids: Vec<NodeId>,
    nodes: Vec<NodeStateMachine>,
    queue: BinaryHeap<ScheduledItem>,
    timers: HashMap<(usize, TimerId), u64>,
    partitioned: Vec<bool>,
    committed: Vec<Vec<ExecutedVertex>>,
    persisted_safety: Vec<SafetyState>,
    persisted_store: Vec<Option<VertexStoreSnapshot>>,
    rng: ChaCha8Rng,
    now: Duration,
    seq: u64,
}

impl Simulation {
    pub fn new(config: SimulationConfig) -> Self {
        let ids: Vec<NodeId> = (1..=config.validators).map(node).collect();
        let set = validator_set(config.validators);
        let nodes = ids
            .iter()
            .enumerate()
            .map(|(index, id)| {
                let mut node_config = config.node.clone();
                node_config.sync_seed = config.seed.wrapping_add(index as u64);
                NodeStateMachine::new(
                    *id,
                    Epoch::of(1),
                    set.clone(),
                    node_config,
                    Collaborators {
                        hasher: Arc::new(DeterministicHasher),
                        signer: Arc::new(DeterministicSigner::new(*id)),
                        verifier: Arc::new(DeterministicVerifier),
                        ledger: Arc::new(CountingLedger),
                        payload_source: Box::new(EmptyPayloadSource),
                    },
                    RecoveredState::genesis(genesis_ledger_header()),
                )
            })
            .collect();
        let count = ids.len();
        Simulation {
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            config,
            ids,
            nodes,
            queue: BinaryHeap::new(),
            timers: HashMap::new(),
            partitioned: vec![false; count],
            committed: vec![Vec::new(); count],
            persisted_safety: vec![SafetyState::default(); count],
            persisted_store: vec![None; count],
            now: Duration::ZERO,
            seq: 0,
        }
    }

    /// Delivers [`Event::Start`] to every node.
    pub fn start(&mut self) {
        for index in 0..self.nodes.len() {
            self.schedule(
                index,
                self.now,
                EventPriority::Internal,
                ItemKind::Deliver(Event::Start),
            );
        }
    }

    /// Processes events until the queue is drained past `deadline`.
    pub fn run_until(&mut self, deadline: Duration) {
        while let Some(next) = self.queue.peek() {
            if next.at > deadline {
                break;
            }
            let item = match self.queue.pop() {
                Some(item) => item,
                None => break,
            };
            self.now = item.at;
            let event = match item.kind {
                ItemKind::TimerFired { id, generation } => {
                    if self.timers.get(&(item.node, id)) != Some(&generation) {
                        continue; // superseded or cancelled
                    }
                    match id {
                        TimerId::LocalTimeout(view) => Event::LocalTimeout { view },
                        TimerId::SyncRequest(vertex_id) => Event::SyncRequestTimeout { vertex_id },
                    }
                }
                ItemKind::Deliver(event) => {
                    if self.partitioned[item.node] && event.is_network() {
                        continue;
                    }
                    event
                }
            };
            let actions = self.nodes[item.node].handle(event, self.now);
            self.execute(item.node, actions);
        }
        self.now = deadline;
    }

    pub fn run_for(&mut self, duration: Duration) {
        let deadline = self.now + duration;
        self.run_until(deadline);
    }

    /// Cuts a node off from the network (both directions). Timers and
    /// internal events keep running.
    pub fn set_partitioned(&mut self, index: usize, partitioned: bool) {
        debug!(node = %self.ids[index], partitioned, "partition changed");
        self.partitioned[index] = partitioned;
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, index: usize) -> &NodeStateMachine {
        &self.nodes[index]
    }

    /// Everything node `index` has committed, oldest first.
    pub fn committed(&self, index: usize) -> &[ExecutedVertex] {
        &self.committed[index]
    }

    pub fn persisted_safety(&self, index: usize) -> &SafetyState {
        &self.persisted_safety[index]
    }

    pub fn persisted_store(&self, index: usize) -> Option<&VertexStoreSnapshot> {
        self.persisted_store[index].as_ref()
    }

    fn execute(&mut self, index: usize, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send { to, message } => self.deliver(index, to, message),
                Action::Broadcast { message } => {
                    for to in self.ids.clone() {
                        self.deliver(index, to, message.clone());
                    }
                }
                Action::SetTimer { id, duration } => {
                    let generation = self.bump_timer(index, id);
                    let at = self.now + duration;
                    self.schedule(
                        index,
                        at,
                        EventPriority::Timer,
                        ItemKind::TimerFired { id, generation },
                    );
                }
                Action::CancelTimer { id } => {
                    self.bump_timer(index, id);
                }
                Action::EnqueueInternal { event } => {
                    let priority = event.priority();
                    self.schedule(index, self.now, priority, ItemKind::Deliver(event));
                }
                Action::PersistSafetyState { state } => {
                    self.persisted_safety[index] = state;
                }
                Action::PersistVertexStore { snapshot } => {
                    self.persisted_store[index] = Some(snapshot);
                }
                Action::CommitVertices { vertices, proof } => {
                    self.committed[index].extend(vertices);
                    self.schedule(
                        index,
                        self.now,
                        EventPriority::Internal,
                        ItemKind::Deliver(Event::LedgerStateUpdated { proof }),
                    );
                }
                Action::RequestLedgerSync { proof, peers: _ } => {
                    // State transfer: a couple of network round trips.
                    let delay = self.latency() + self.latency();
                    let at = self.now + delay;
                    self.schedule(
                        index,
                        at,
                        EventPriority::Internal,
                        ItemKind::Deliver(Event::LedgerStateUpdated { proof }),
                    );
                }
                Action::EmitNoVote { .. } => {}
            }
        }
    }

    fn deliver(&mut self, from: usize, to: NodeId, message: OutboundMessage) {
        if self.partitioned[from] {
            return;
        }
        let Some(to_index) = self.ids.iter().position(|id| *id == to) else {
            return;
        };
        let at = self.now + self.latency();
        let event = message_to_event(self.ids[from], message);
        let priority = event.priority();
        self.schedule(to_index, at, priority, ItemKind::Deliver(event));
    }

    fn latency(&mut self) -> Duration {
        self.config.latency.sample(&mut self.rng)
    }

    fn bump_timer(&mut self, node: usize, id: TimerId) -> u64 {
        let generation = self.timers.entry((node, id)).or_insert(0);
        *generation += 1;
        *generation
    }

    fn schedule(&mut self, node: usize, at: Duration, priority: EventPriority, kind: ItemKind) {
        self.seq += 1;
        self.queue.push(ScheduledItem {
            at,
            priority,
            seq: self.seq,
            node,
            kind,
        });
    }
}
