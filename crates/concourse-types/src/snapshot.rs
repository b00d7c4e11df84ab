//! Durable vertex store state.

use crate::{ExecutedVertex, HighQC};
use serde::{Deserialize, Serialize};

/// Everything needed to rebuild a vertex store: the committed root, the
/// uncommitted vertices in parent-before-child order, and the sync position.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VertexStoreSnapshot {
    pub root: ExecutedVertex,
    pub vertices: Vec<ExecutedVertex>,
    pub high_qc: HighQC,
}

impl VertexStoreSnapshot {
    pub fn new(root: ExecutedVertex, vertices: Vec<ExecutedVertex>, high_qc: HighQC) -> Self {
        VertexStoreSnapshot {
            root,
            vertices,
            high_qc,
        }
    }
}
