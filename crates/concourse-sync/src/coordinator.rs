//! The sync coordinator state machine.

use concourse_bft::VertexStore;
use concourse_core::{
    Action, Event, GetVerticesErrorResponse, GetVerticesRequest, GetVerticesResponse, Hasher,
    OutboundMessage, TimerId,
};
use concourse_types::{
    ExecutedVertex, HighQC, LedgerHeader, LedgerProof, NodeId, QuorumCertificate, VertexId,
    VertexStoreSnapshot,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Retry policy for vertex fetches.
#[derive(Debug, Clone, Copy)]
pub struct SyncConfig {
    /// How long to wait for a vertex response before retrying elsewhere.
    pub request_timeout: Duration,
    /// Retries per request after the initial send, before the sync is
    /// abandoned.
    pub max_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            request_timeout: Duration::from_millis(200),
            max_retries: 3,
        }
    }
}

/// Outcome of [`SyncCoordinator::sync_to_qc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncResult {
    /// The certificates applied cleanly; the caller may proceed.
    Synced,
    /// Missing ancestry is being fetched. Defer the triggering event; it is
    /// re-enqueued when the sync lands.
    InProgress,
    /// The target is behind our own committed state. Nothing to do.
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncStage {
    /// Walking parent links back from the target QC's proposed vertex, one
    /// vertex per request, until we reach one we already hold.
    QcVertices,
    /// Fetching the three vertices pinned by the committed QC to rebuild
    /// the store around a newer root.
    CommittedVertices,
    /// Waiting for the runner to bring the ledger up to the committed
    /// proof before the rebuild can proceed.
    LedgerSync,
}

struct SyncState {
    high_qc: HighQC,
    authors: Vec<NodeId>,
    stage: SyncStage,
    /// Vertices collected so far, newest first.
    fetched: Vec<concourse_types::Vertex>,
    /// Events to re-enqueue once the sync lands.
    deferred: Vec<Event>,
}

impl SyncState {
    fn committed_version(&self) -> Option<u64> {
        self.high_qc
            .highest_committed_qc
            .committed()
            .map(|header| header.ledger_header.state_version)
    }
}

struct RequestState {
    /// Syncs waiting on this vertex, keyed by their target's proposed id.
    sync_ids: Vec<VertexId>,
    count: usize,
    /// Sends so far, including the first.
    attempts: u32,
}

/// Fills vertex gaps the certificates reveal.
///
/// Syncs are keyed by the target QC's proposed vertex id, so concurrent
/// triggers toward the same position share one sync. Each outstanding fetch
/// carries a [`TimerId::SyncRequest`] timeout; on expiry the fetch rotates to
/// a random remaining peer, bounded by [`SyncConfig::max_retries`].
pub struct SyncCoordinator {
    node: NodeId,
    config: SyncConfig,
    hasher: Arc<dyn Hasher>,
    rng: ChaCha8Rng,
    /// Highest ledger header known to be durable locally.
    current_ledger: LedgerHeader,
    syncs: HashMap<VertexId, SyncState>,
    requests: HashMap<VertexId, RequestState>,
}

impl SyncCoordinator {
    pub fn new(
        node: NodeId,
        config: SyncConfig,
        hasher: Arc<dyn Hasher>,
        current_ledger: LedgerHeader,
        seed: u64,
    ) -> Self {
        SyncCoordinator {
            node,
            config,
            hasher,
            rng: ChaCha8Rng::seed_from_u64(seed),
            current_ledger,
            syncs: HashMap::new(),
            requests: HashMap::new(),
        }
    }

    pub fn syncs_in_flight(&self) -> usize {
        self.syncs.len()
    }

    pub fn current_ledger(&self) -> &LedgerHeader {
        &self.current_ledger
    }

    /// Brings the store up to a sync position, fetching missing ancestry
    /// from `author` (and the position's signers) if needed.
    pub fn sync_to_qc(
        &mut self,
        high_qc: HighQC,
        author: NodeId,
        store: &mut VertexStore,
        actions: &mut Vec<Action>,
    ) -> SyncResult {
        if let Some(tc) = &high_qc.highest_tc {
            store.insert_timeout_certificate(tc, actions);
        }
        let proposed_view = high_qc.highest_qc.proposed().view;
        if proposed_view < store.root().view() || proposed_view < self.current_ledger.view {
            trace!(view = %proposed_view, "sync target behind committed state");
            return SyncResult::Invalid;
        }

        store.add_qc(&high_qc.highest_committed_qc, actions);
        if store.add_qc(&high_qc.highest_qc, actions) {
            return SyncResult::Synced;
        }

        let sync_id = high_qc.highest_qc.proposed().vertex_id;
        if self.syncs.contains_key(&sync_id) {
            return SyncResult::InProgress;
        }

        let authors = self.authors_for(author, &high_qc.highest_qc);
        let Some(first) = authors.first().copied() else {
            warn!(target = %sync_id, "no peers can serve this sync");
            return SyncResult::Invalid;
        };

        let behind_committed = high_qc
            .highest_committed_qc
            .committed()
            .map(|header| header.ledger_header.state_version > self.current_ledger.state_version)
            .unwrap_or(false);
        let committed_proposed = high_qc.highest_committed_qc.proposed().vertex_id;

        debug!(target = %sync_id, committed_gap = behind_committed, "sync started");
        self.syncs.insert(
            sync_id,
            SyncState {
                high_qc,
                authors,
                stage: if behind_committed {
                    SyncStage::CommittedVertices
                } else {
                    SyncStage::QcVertices
                },
                fetched: Vec::new(),
                deferred: Vec::new(),
            },
        );
        if behind_committed {
            self.send_request(sync_id, committed_proposed, 3, first, actions);
        } else {
            self.send_request(sync_id, sync_id, 1, first, actions);
        }
        SyncResult::InProgress
    }

    /// Parks an event on the in-progress sync toward `high_qc`; it is
    /// re-enqueued when the sync lands. No-op if no such sync exists.
    pub fn defer(&mut self, high_qc: &HighQC, event: Event) {
        let sync_id = high_qc.highest_qc.proposed().vertex_id;
        if let Some(sync) = self.syncs.get_mut(&sync_id) {
            trace!(target = %sync_id, event = event.type_name(), "event deferred behind sync");
            sync.deferred.push(event);
        }
    }

    /// Serves a peer's vertex fetch from the local store, or reports our own
    /// sync position when we cannot.
    pub fn process_request(
        &mut self,
        from: NodeId,
        request: GetVerticesRequest,
        store: &VertexStore,
        actions: &mut Vec<Action>,
    ) {
        match store.get_vertices(request.vertex_id, request.count) {
            Some(executed) => {
                actions.push(Action::Send {
                    to: from,
                    message: OutboundMessage::GetVerticesResponse(GetVerticesResponse {
                        request,
                        vertices: executed.into_iter().map(|e| e.vertex).collect(),
                    }),
                });
            }
            None => {
                actions.push(Action::Send {
                    to: from,
                    message: OutboundMessage::GetVerticesErrorResponse(Box::new(
                        GetVerticesErrorResponse {
                            request,
                            high_qc: store.high_qc(),
                        },
                    )),
                });
            }
        }
    }

    /// Handles a peer's answer to one of our fetches.
    pub fn process_response(
        &mut self,
        from: NodeId,
        response: GetVerticesResponse,
        store: &mut VertexStore,
        actions: &mut Vec<Action>,
    ) {
        let requested = response.request.vertex_id;
        let Some(request) = self.requests.remove(&requested) else {
            trace!(peer = %from, "unsolicited vertex response ignored");
            return;
        };
        actions.push(Action::CancelTimer {
            id: TimerId::SyncRequest(requested),
        });
        for sync_id in request.sync_ids {
            let Some(stage) = self.syncs.get(&sync_id).map(|sync| sync.stage) else {
                continue;
            };
            match stage {
                SyncStage::QcVertices => {
                    self.process_qc_vertices_response(sync_id, &response, store, actions)
                }
                SyncStage::CommittedVertices => {
                    self.process_committed_vertices_response(sync_id, &response, store, actions)
                }
                SyncStage::LedgerSync => {}
            }
        }
    }

    fn process_qc_vertices_response(
        &mut self,
        sync_id: VertexId,
        response: &GetVerticesResponse,
        store: &mut VertexStore,
        actions: &mut Vec<Action>,
    ) {
        let Some(vertex) = response.vertices.first().cloned() else {
            warn!(target = %sync_id, "empty vertex response");
            self.abandon(sync_id, actions);
            return;
        };
        if self.hasher.hash_vertex(&vertex) != response.request.vertex_id {
            warn!(target = %sync_id, "vertex response does not hash to the requested id");
            self.abandon(sync_id, actions);
            return;
        }
        let parent_id = vertex.parent_id();
        let (authors, high_qc) = {
            let Some(sync) = self.syncs.get_mut(&sync_id) else {
                return;
            };
            sync.fetched.push(vertex);
            (sync.authors.clone(), sync.high_qc.clone())
        };

        if !store.contains(&parent_id) {
            match self.pick_author(&authors) {
                Some(to) => self.send_request(sync_id, parent_id, 1, to, actions),
                None => self.abandon(sync_id, actions),
            }
            return;
        }

        // The whole missing chain is in hand; land it oldest first.
        let fetched = match self.syncs.get_mut(&sync_id) {
            Some(sync) => std::mem::take(&mut sync.fetched),
            None => return,
        };
        for vertex in fetched.into_iter().rev() {
            let vertex_id = self.hasher.hash_vertex(&vertex);
            if let Err(error) = store.insert_vertex(vertex, vertex_id, actions) {
                warn!(%error, target = %sync_id, "fetched vertex rejected");
                self.abandon(sync_id, actions);
                return;
            }
        }
        store.add_qc(&high_qc.highest_committed_qc, actions);
        if store.add_qc(&high_qc.highest_qc, actions) {
            self.complete(sync_id, actions);
        } else {
            warn!(target = %sync_id, "target certificate still not appliable after fetch");
            self.abandon(sync_id, actions);
        }
    }

    fn process_committed_vertices_response(
        &mut self,
        sync_id: VertexId,
        response: &GetVerticesResponse,
        store: &mut VertexStore,
        actions: &mut Vec<Action>,
    ) {
        let committed_qc = {
            let Some(sync) = self.syncs.get(&sync_id) else {
                return;
            };
            sync.high_qc.highest_committed_qc.clone()
        };
        let data = &committed_qc.vote_data;
        let Some(committed_header) = data.committed else {
            self.abandon(sync_id, actions);
            return;
        };
        // The committed QC pins exactly three vertices by hash.
        let expected = [
            data.proposed.vertex_id,
            data.parent.vertex_id,
            committed_header.vertex_id,
        ];
        if response.vertices.len() != expected.len() {
            warn!(target = %sync_id, got = response.vertices.len(), "short committed-vertices response");
            self.abandon(sync_id, actions);
            return;
        }
        for (vertex, expected_id) in response.vertices.iter().zip(expected) {
            if self.hasher.hash_vertex(vertex) != expected_id {
                warn!(target = %sync_id, "committed vertex does not hash to its header");
                self.abandon(sync_id, actions);
                return;
            }
        }

        let Some(proof) = LedgerProof::from_qc(&committed_qc) else {
            self.abandon(sync_id, actions);
            return;
        };
        let needs_ledger = proof.state_version() > self.current_ledger.state_version;
        let peers = {
            let Some(sync) = self.syncs.get_mut(&sync_id) else {
                return;
            };
            sync.fetched = response.vertices.clone();
            sync.authors.clone()
        };
        if needs_ledger {
            // The committed state itself is ahead of our ledger; hand over
            // to state transfer and resume once it completes.
            info!(target = %sync_id, version = proof.state_version(), "escalating to ledger sync");
            if let Some(sync) = self.syncs.get_mut(&sync_id) {
                sync.stage = SyncStage::LedgerSync;
            }
            actions.push(Action::RequestLedgerSync { proof, peers });
        } else {
            self.rebuild_and_continue(sync_id, store, actions);
        }
    }

    /// Rebuilds the store around the fetched committed root and resumes the
    /// walk toward the original target.
    fn rebuild_and_continue(
        &mut self,
        sync_id: VertexId,
        store: &mut VertexStore,
        actions: &mut Vec<Action>,
    ) {
        let (high_qc, fetched) = match self.syncs.get(&sync_id) {
            Some(sync) => (sync.high_qc.clone(), sync.fetched.clone()),
            None => return,
        };
        let committed_qc = high_qc.highest_committed_qc.clone();
        let data = committed_qc.vote_data.clone();
        let Some(committed_header) = data.committed else {
            self.abandon(sync_id, actions);
            return;
        };
        if fetched.len() != 3 {
            self.abandon(sync_id, actions);
            return;
        }
        // fetched is newest first: [proposed, parent, committed]. The QC's
        // vote data supplies their executed ledger headers, so no
        // re-preparation is needed.
        let root = ExecutedVertex::new(
            fetched[2].clone(),
            committed_header.vertex_id,
            committed_header.ledger_header,
        );
        let parent = ExecutedVertex::new(
            fetched[1].clone(),
            data.parent.vertex_id,
            data.parent.ledger_header,
        );
        let proposed = ExecutedVertex::new(
            fetched[0].clone(),
            data.proposed.vertex_id,
            data.proposed.ledger_header,
        );
        let snapshot = VertexStoreSnapshot::new(
            root,
            vec![parent, proposed],
            HighQC::new(
                committed_qc.clone(),
                committed_qc,
                high_qc.highest_tc.clone(),
            ),
        );
        if !store.try_rebuild(snapshot, actions) {
            self.abandon(sync_id, actions);
            return;
        }

        if store.add_qc(&high_qc.highest_qc, actions) {
            self.complete(sync_id, actions);
            return;
        }
        let authors = match self.syncs.get_mut(&sync_id) {
            Some(sync) => {
                sync.stage = SyncStage::QcVertices;
                sync.fetched.clear();
                sync.authors.clone()
            }
            None => return,
        };
        match self.pick_author(&authors) {
            Some(to) => self.send_request(sync_id, sync_id, 1, to, actions),
            None => self.abandon(sync_id, actions),
        }
    }

    /// A peer could not serve one of our fetches. If its position dominates
    /// ours, chase that instead; otherwise the sync is dropped.
    pub fn process_error_response(
        &mut self,
        from: NodeId,
        response: GetVerticesErrorResponse,
        store: &mut VertexStore,
        actions: &mut Vec<Action>,
    ) {
        let requested = response.request.vertex_id;
        let Some(request) = self.requests.remove(&requested) else {
            trace!(peer = %from, "unsolicited error response ignored");
            return;
        };
        actions.push(Action::CancelTimer {
            id: TimerId::SyncRequest(requested),
        });
        for sync_id in request.sync_ids {
            let Some(sync) = self.syncs.remove(&sync_id) else {
                continue;
            };
            if response.high_qc.highest_view() > sync.high_qc.highest_view() {
                info!(peer = %from, "peer is ahead, re-syncing toward its position");
                match self.sync_to_qc(response.high_qc.clone(), from, store, actions) {
                    SyncResult::Synced => {
                        for event in sync.deferred {
                            actions.push(Action::EnqueueInternal { event });
                        }
                    }
                    SyncResult::InProgress => {
                        let new_id = response.high_qc.highest_qc.proposed().vertex_id;
                        if let Some(new_sync) = self.syncs.get_mut(&new_id) {
                            new_sync.deferred.extend(sync.deferred);
                        }
                    }
                    SyncResult::Invalid => {}
                }
            } else {
                warn!(peer = %from, target = %sync_id, "peer could not serve sync request");
            }
        }
        self.prune_requests(actions);
    }

    /// An outstanding fetch went unanswered; rotate to another peer or give
    /// up.
    pub fn process_request_timeout(&mut self, vertex_id: VertexId, actions: &mut Vec<Action>) {
        let Some(mut request) = self.requests.remove(&vertex_id) else {
            trace!(vertex = %vertex_id, "timeout for a settled request");
            return;
        };
        request.sync_ids.retain(|id| self.syncs.contains_key(id));
        if request.sync_ids.is_empty() {
            return;
        }
        if request.attempts > self.config.max_retries {
            warn!(vertex = %vertex_id, attempts = request.attempts, "sync request exhausted its retries");
            for sync_id in request.sync_ids {
                self.abandon(sync_id, actions);
            }
            return;
        }
        let authors = self
            .syncs
            .get(&request.sync_ids[0])
            .map(|sync| sync.authors.clone())
            .unwrap_or_default();
        let Some(to) = self.pick_author(&authors) else {
            for sync_id in request.sync_ids {
                self.abandon(sync_id, actions);
            }
            return;
        };
        debug!(vertex = %vertex_id, peer = %to, attempt = request.attempts + 1, "retrying sync request");
        request.attempts += 1;
        actions.push(Action::Send {
            to,
            message: OutboundMessage::GetVerticesRequest(GetVerticesRequest {
                vertex_id,
                count: request.count,
            }),
        });
        actions.push(Action::SetTimer {
            id: TimerId::SyncRequest(vertex_id),
            duration: self.config.request_timeout,
        });
        self.requests.insert(vertex_id, request);
    }

    /// The ledger advanced (own commit or completed state transfer).
    /// Resolves ledger-sync stages that are now satisfied and drops syncs
    /// the ledger has overtaken.
    pub fn process_ledger_update(
        &mut self,
        proof: &LedgerProof,
        store: &mut VertexStore,
        actions: &mut Vec<Action>,
    ) {
        if proof.header.state_version > self.current_ledger.state_version {
            self.current_ledger = proof.header;
        }

        let stale: Vec<VertexId> = self
            .syncs
            .iter()
            .filter(|(_, sync)| {
                sync.high_qc.highest_qc.proposed().view <= self.current_ledger.view
            })
            .map(|(id, _)| *id)
            .collect();
        for sync_id in stale {
            debug!(target = %sync_id, "sync overtaken by the ledger");
            self.syncs.remove(&sync_id);
        }

        let ready: Vec<VertexId> = self
            .syncs
            .iter()
            .filter(|(_, sync)| {
                sync.stage == SyncStage::LedgerSync
                    && sync
                        .committed_version()
                        .map(|version| version <= self.current_ledger.state_version)
                        .unwrap_or(false)
            })
            .map(|(id, _)| *id)
            .collect();
        for sync_id in ready {
            self.rebuild_and_continue(sync_id, store, actions);
        }
        self.prune_requests(actions);
    }

    fn send_request(
        &mut self,
        sync_id: VertexId,
        requested: VertexId,
        count: usize,
        to: NodeId,
        actions: &mut Vec<Action>,
    ) {
        let entry = self.requests.entry(requested).or_insert(RequestState {
            sync_ids: Vec::new(),
            count,
            attempts: 0,
        });
        if !entry.sync_ids.contains(&sync_id) {
            entry.sync_ids.push(sync_id);
        }
        if entry.attempts > 0 {
            // Already in flight; this sync just waits on the same answer.
            return;
        }
        entry.attempts = 1;
        trace!(vertex = %requested, count, peer = %to, "requesting vertices");
        actions.push(Action::Send {
            to,
            message: OutboundMessage::GetVerticesRequest(GetVerticesRequest {
                vertex_id: requested,
                count,
            }),
        });
        actions.push(Action::SetTimer {
            id: TimerId::SyncRequest(requested),
            duration: self.config.request_timeout,
        });
    }

    fn complete(&mut self, sync_id: VertexId, actions: &mut Vec<Action>) {
        if let Some(sync) = self.syncs.remove(&sync_id) {
            debug!(target = %sync_id, resumed = sync.deferred.len(), "sync complete");
            for event in sync.deferred {
                actions.push(Action::EnqueueInternal { event });
            }
        }
        self.prune_requests(actions);
    }

    fn abandon(&mut self, sync_id: VertexId, actions: &mut Vec<Action>) {
        if let Some(sync) = self.syncs.remove(&sync_id) {
            warn!(target = %sync_id, dropped = sync.deferred.len(), "sync abandoned");
        }
        self.prune_requests(actions);
    }

    /// Drops request entries no live sync is waiting on.
    fn prune_requests(&mut self, actions: &mut Vec<Action>) {
        let dead: Vec<VertexId> = self
            .requests
            .iter()
            .filter(|(_, request)| {
                !request
                    .sync_ids
                    .iter()
                    .any(|id| self.syncs.contains_key(id))
            })
            .map(|(id, _)| *id)
            .collect();
        for id in dead {
            self.requests.remove(&id);
            actions.push(Action::CancelTimer {
                id: TimerId::SyncRequest(id),
            });
        }
    }

    /// Peers that can serve a sync toward `qc`: its author first, then its
    /// signers, never ourselves.
    fn authors_for(&self, author: NodeId, qc: &QuorumCertificate) -> Vec<NodeId> {
        let mut authors = Vec::new();
        if author != self.node {
            authors.push(author);
        }
        for signer in qc.signatures.signers() {
            if *signer != self.node && !authors.contains(signer) {
                authors.push(*signer);
            }
        }
        authors
    }

    fn pick_author(&mut self, authors: &[NodeId]) -> Option<NodeId> {
        if authors.is_empty() {
            None
        } else {
            Some(authors[self.rng.gen_range(0..authors.len())])
        }
    }
}
