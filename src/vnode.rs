//! Vnode service integration traits.
//!
//! Defines the interface the host storage layer provides: per-partition
//! key folds, divergent-object fetches, vector clock lookups, and
//! preflist ownership queries. The exchange engine and the Merkle
//! helper consume this trait; tests implement it with in-memory mocks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

/// A bucket/key pair identifying a replicated object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BKey {
    pub bucket: Vec<u8>,
    pub key: Vec<u8>,
}

impl BKey {
    pub fn new(bucket: impl Into<Vec<u8>>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl std::fmt::Display for BKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}",
            String::from_utf8_lossy(&self.bucket),
            String::from_utf8_lossy(&self.key)
        )
    }
}

/// A preflist tag: a logical sub-range (hash subspace) within a
/// partition. Each partition owns a finite, ordered list of these.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct IndexN {
    /// Starting index of the hash subspace.
    pub index: u64,
    /// Replication factor selecting the subspace width.
    pub n: u32,
}

impl IndexN {
    pub fn new(index: u64, n: u32) -> Self {
        Self { index, n }
    }
}

impl std::fmt::Display for IndexN {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{{}, {}}}", self.index, self.n)
    }
}

/// The preflist a fold or vclock lookup runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preflist {
    pub partition: u64,
    pub n: u32,
}

/// A vector clock, opaque to the source. The sink is authoritative for
/// conflict resolution; the source only carries clocks through.
pub type VClock = Vec<u8>;

/// A fresh (empty) vector clock for keys the local side has never seen.
pub fn fresh_vclock() -> VClock {
    Vec::new()
}

/// Identifier of a cluster member node.
pub type NodeId = String;

/// Outcome of a divergent-object fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetResult {
    /// The object was found.
    Object(crate::object::ReplObject),
    /// The key does not exist locally.
    NotFound,
    /// The fetch failed for another reason (quorum, timeout, ...).
    Error(String),
}

/// What the host storage layer must provide.
///
/// All methods are async and dyn-safe so the engine can hold an
/// `Arc<dyn VnodeService>` and tests can substitute mocks.
#[async_trait]
pub trait VnodeService: Send + Sync {
    /// Fold every object in the preflist, streaming `(bkey, object
    /// bytes)` pairs into `tx`. Returns when the fold is finished;
    /// dropping `tx` signals completion to the receiver.
    async fn fold_objects(
        &self,
        preflist: Preflist,
        tx: mpsc::Sender<(BKey, Vec<u8>)>,
    ) -> Result<(), String>;

    /// Fetch one object with read quorum `r`.
    async fn get(&self, bkey: &BKey, r: u32, timeout: Duration) -> GetResult;

    /// Look up vector clocks for a batch of keys.
    async fn get_vclocks(&self, preflist: Preflist, bkeys: &[BKey]) -> Vec<(BKey, VClock)>;

    /// The ordered list of IndexN tags this partition is responsible
    /// for. Computed once at engine start.
    async fn responsible_preflists(&self, partition: u64) -> Vec<IndexN>;

    /// The node owning the partition in the current ring.
    async fn index_owner(&self, partition: u64) -> Option<NodeId>;

    /// Whether a node is currently reachable.
    async fn node_up(&self, node: &NodeId) -> bool;
}
