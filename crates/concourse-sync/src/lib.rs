//! Vertex synchronization.
//!
//! A node falls behind whenever a certificate refers to a vertex it never
//! received. The [`SyncCoordinator`] closes that gap: it fetches missing
//! ancestry one vertex at a time, rebuilds the vertex store around a newer
//! committed root when the gap spans a commit, and escalates to ledger state
//! transfer when even the committed state is ahead of the local ledger.
//! Events that triggered a sync are deferred and re-enqueued once the sync
//! lands, so the caller simply processes them again.

mod coordinator;

pub use coordinator::{SyncConfig, SyncCoordinator, SyncResult};
