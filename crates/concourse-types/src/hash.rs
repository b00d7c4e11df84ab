//! Content hash newtype.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A 32-byte content hash.
///
/// The hashing algorithm itself is injected (see the `Hasher` trait in
/// `concourse-core`); this type only carries the digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

/// Identifies a vertex by the hash of its contents.
pub type VertexId = Hash;

impl Hash {
    pub const ZERO: Hash = Hash([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Hash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Abbreviated hex, enough to disambiguate in logs.
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}..{:02x}{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[30], self.0[31]
        )
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
