//! The uncommitted vertex DAG and the 3-chain commit rule.

use concourse_core::{Action, Event, Ledger};
use concourse_types::{
    ExecutedVertex, HighQC, LedgerProof, QuorumCertificate, TimeoutCertificate, Vertex,
    VertexHeader, VertexId, VertexStoreSnapshot,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VertexStoreError {
    /// The vertex's parent is not in the store. Not a protocol fault: the
    /// sync coordinator fetches the missing ancestry.
    #[error("parent {0} not in store")]
    MissingParent(VertexId),

    /// The ledger could not extend the parent state with this vertex.
    #[error("ledger rejected vertex {0}")]
    PreparationFailed(VertexId),
}

/// Holds every certified-but-uncommitted vertex, rooted at the latest
/// committed vertex.
///
/// The root advances monotonically. Commits happen only through
/// [`Self::add_qc`] observing a QC whose vote data names a committed header;
/// the whole root-to-target path commits as one batch and everything not
/// descending from the new root is pruned. All walks are iterative.
pub struct VertexStore {
    ledger: Arc<dyn Ledger>,
    root_id: VertexId,
    vertices: HashMap<VertexId, ExecutedVertex>,
    children: HashMap<VertexId, Vec<VertexId>>,
    highest_qc: QuorumCertificate,
    highest_committed_qc: QuorumCertificate,
    highest_tc: Option<TimeoutCertificate>,
}

impl VertexStore {
    /// Builds a store from a snapshot previously produced by
    /// [`Self::snapshot`]. Snapshot vertices are parent-before-child, so a
    /// single pass reconstructs the DAG.
    pub fn new(ledger: Arc<dyn Ledger>, snapshot: VertexStoreSnapshot) -> Self {
        let mut store = VertexStore {
            ledger,
            root_id: snapshot.root.id,
            vertices: HashMap::new(),
            children: HashMap::new(),
            highest_qc: snapshot.high_qc.highest_qc,
            highest_committed_qc: snapshot.high_qc.highest_committed_qc,
            highest_tc: snapshot.high_qc.highest_tc,
        };
        store.vertices.insert(snapshot.root.id, snapshot.root);
        for vertex in snapshot.vertices {
            debug_assert!(store.vertices.contains_key(&vertex.parent_id()));
            store
                .children
                .entry(vertex.parent_id())
                .or_default()
                .push(vertex.id);
            store.vertices.insert(vertex.id, vertex);
        }
        store
    }

    /// A store containing only the genesis (or recovery) root.
    pub fn rooted_at(ledger: Arc<dyn Ledger>, root: ExecutedVertex, root_qc: QuorumCertificate) -> Self {
        Self::new(
            ledger,
            VertexStoreSnapshot::new(root, Vec::new(), HighQC::new(root_qc.clone(), root_qc, None)),
        )
    }

    pub fn root(&self) -> &ExecutedVertex {
        // Invariant: the root is always present.
        &self.vertices[&self.root_id]
    }

    pub fn contains(&self, vertex_id: &VertexId) -> bool {
        self.vertices.contains_key(vertex_id)
    }

    pub fn get(&self, vertex_id: &VertexId) -> Option<&ExecutedVertex> {
        self.vertices.get(vertex_id)
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn high_qc(&self) -> HighQC {
        HighQC::new(
            self.highest_qc.clone(),
            self.highest_committed_qc.clone(),
            self.highest_tc.clone(),
        )
    }

    pub fn highest_tc(&self) -> Option<&TimeoutCertificate> {
        self.highest_tc.as_ref()
    }

    /// Executes and inserts a vertex whose parent is present. Re-inserting
    /// a known vertex is a no-op. Emits [`Event::VertexInserted`] and a
    /// store persist on success.
    pub fn insert_vertex(
        &mut self,
        vertex: Vertex,
        vertex_id: VertexId,
        actions: &mut Vec<Action>,
    ) -> Result<ExecutedVertex, VertexStoreError> {
        if let Some(existing) = self.vertices.get(&vertex_id) {
            return Ok(existing.clone());
        }
        let parent_id = vertex.parent_id();
        let parent_header = self
            .vertices
            .get(&parent_id)
            .map(|parent| parent.ledger_header)
            .ok_or(VertexStoreError::MissingParent(parent_id))?;
        let ledger_header = self
            .ledger
            .prepare(&parent_header, &vertex, vertex_id)
            .ok_or(VertexStoreError::PreparationFailed(vertex_id))?;

        let executed = ExecutedVertex::new(vertex, vertex_id, ledger_header);
        self.vertices.insert(vertex_id, executed.clone());
        self.children.entry(parent_id).or_default().push(vertex_id);
        debug!(vertex = %vertex_id, view = %executed.view(), "vertex inserted");

        actions.push(Action::PersistVertexStore {
            snapshot: self.snapshot(),
        });
        actions.push(Action::EnqueueInternal {
            event: Event::VertexInserted {
                vertex: Box::new(executed.clone()),
            },
        });
        Ok(executed)
    }

    /// Observes a certificate. Returns false when the certified vertex is
    /// unknown, leaving the store untouched; the caller is behind and must
    /// sync. Otherwise updates the high QC, commits if the certificate's
    /// vote data resolves a committed header past the root, and returns
    /// true.
    pub fn add_qc(&mut self, qc: &QuorumCertificate, actions: &mut Vec<Action>) -> bool {
        if !self.vertices.contains_key(&qc.proposed().vertex_id) {
            return false;
        }

        let mut dirty = false;
        let mut commit_batch = None;
        if let Some(committed) = qc.committed().copied() {
            if committed.view > self.root().view() {
                commit_batch = self.commit(&committed, qc);
                dirty |= commit_batch.is_some();
            }
        }
        if qc.view() > self.highest_qc.view() {
            self.highest_qc = qc.clone();
            dirty = true;
        }

        if dirty {
            // Persist ahead of the ledger commit so a restart replays the
            // commit rather than losing it.
            actions.push(Action::PersistVertexStore {
                snapshot: self.snapshot(),
            });
        }
        if let Some((vertices, proof)) = commit_batch {
            actions.push(Action::CommitVertices { vertices, proof });
        }
        true
    }

    /// Commits the root-to-target path. Returns the batch (oldest first)
    /// with its proof, or None when the target is not reachable.
    fn commit(
        &mut self,
        committed: &VertexHeader,
        qc: &QuorumCertificate,
    ) -> Option<(Vec<ExecutedVertex>, LedgerProof)> {
        let path = self.path_from_root(committed.vertex_id)?;
        let proof = LedgerProof::from_qc(qc)?;

        info!(
            vertex = %committed.vertex_id,
            view = %committed.view,
            count = path.len(),
            "committing"
        );
        self.highest_committed_qc = qc.clone();
        self.root_id = committed.vertex_id;
        self.prune();
        Some((path, proof))
    }

    /// Drops every vertex that does not descend from the current root.
    fn prune(&mut self) {
        let mut reachable = HashSet::new();
        let mut stack = vec![self.root_id];
        while let Some(id) = stack.pop() {
            if reachable.insert(id) {
                if let Some(children) = self.children.get(&id) {
                    stack.extend(children.iter().copied());
                }
            }
        }
        self.vertices.retain(|id, _| reachable.contains(id));
        self.children.retain(|id, _| reachable.contains(id));
        for children in self.children.values_mut() {
            children.retain(|id| reachable.contains(id));
        }
    }

    /// The path from (excluding) the root to `vertex_id`, oldest first.
    fn path_from_root(&self, vertex_id: VertexId) -> Option<Vec<ExecutedVertex>> {
        let mut path = Vec::new();
        let mut current = vertex_id;
        while current != self.root_id {
            let vertex = self.vertices.get(&current)?;
            path.push(vertex.clone());
            current = vertex.parent_id();
        }
        path.reverse();
        Some(path)
    }

    /// Records a timeout certificate if it is newer than the one we hold.
    pub fn insert_timeout_certificate(
        &mut self,
        tc: &TimeoutCertificate,
        actions: &mut Vec<Action>,
    ) {
        let newer = self
            .highest_tc
            .as_ref()
            .map(|current| tc.view > current.view)
            .unwrap_or(true);
        if newer {
            self.highest_tc = Some(tc.clone());
            actions.push(Action::PersistVertexStore {
                snapshot: self.snapshot(),
            });
        }
    }

    /// `count` vertices walking parent links from `vertex_id`, newest
    /// first. All or nothing: None when any hop is missing or the chain
    /// runs out at the self-parented genesis vertex.
    pub fn get_vertices(&self, vertex_id: VertexId, count: usize) -> Option<Vec<ExecutedVertex>> {
        let mut vertices = Vec::with_capacity(count);
        let mut current = vertex_id;
        for _ in 0..count {
            let vertex = self.vertices.get(&current)?;
            let parent = vertex.parent_id();
            vertices.push(vertex.clone());
            if parent == current {
                break;
            }
            current = parent;
        }
        (vertices.len() == count).then_some(vertices)
    }

    /// Atomically replaces the store's contents from a snapshot assembled
    /// by sync. Refused (false, store untouched) when the snapshot is
    /// stale or internally inconsistent.
    pub fn try_rebuild(&mut self, snapshot: VertexStoreSnapshot, actions: &mut Vec<Action>) -> bool {
        if snapshot.root.view() < self.root().view() {
            debug!(root = %snapshot.root.id, "stale rebuild snapshot ignored");
            return false;
        }
        let mut seen = HashSet::new();
        seen.insert(snapshot.root.id);
        for vertex in &snapshot.vertices {
            if !seen.contains(&vertex.parent_id()) {
                warn!(vertex = %vertex.id, "rebuild snapshot has a broken parent link");
                return false;
            }
            seen.insert(vertex.id);
        }

        // Timeout certificates stay monotonic across rebuilds.
        let highest_tc = match (&self.highest_tc, &snapshot.high_qc.highest_tc) {
            (Some(ours), Some(theirs)) if ours.view >= theirs.view => Some(ours.clone()),
            (ours, None) => ours.clone(),
            (_, theirs) => theirs.clone(),
        };

        let rebuilt = VertexStore::new(Arc::clone(&self.ledger), snapshot);
        self.root_id = rebuilt.root_id;
        self.vertices = rebuilt.vertices;
        self.children = rebuilt.children;
        self.highest_qc = rebuilt.highest_qc;
        self.highest_committed_qc = rebuilt.highest_committed_qc;
        self.highest_tc = highest_tc;

        info!(root = %self.root_id, vertices = self.vertices.len(), "vertex store rebuilt");
        actions.push(Action::PersistVertexStore {
            snapshot: self.snapshot(),
        });
        true
    }

    /// Durable image of the store: root, uncommitted vertices in
    /// parent-before-child order, and the sync position.
    pub fn snapshot(&self) -> VertexStoreSnapshot {
        let mut vertices = Vec::with_capacity(self.vertices.len().saturating_sub(1));
        let mut stack: Vec<VertexId> = self
            .children
            .get(&self.root_id)
            .map(|c| c.clone())
            .unwrap_or_default();
        while let Some(id) = stack.pop() {
            if let Some(vertex) = self.vertices.get(&id) {
                vertices.push(vertex.clone());
            }
            if let Some(children) = self.children.get(&id) {
                stack.extend(children.iter().copied());
            }
        }
        VertexStoreSnapshot::new(self.root().clone(), vertices, self.high_qc())
    }
}
