//! Hash-tree service integration traits.
//!
//! The local hash-tree subsystem is external: it owns the per-partition
//! Merkle-like trees, hands out locks, updates them, and drives the
//! segmented comparison. This module defines what the engine consumes
//! from it:
//!
//! - [`HashTreeService`]: lock / update / compare over a partition tree.
//! - [`TreeHandle`]: opaque tree identity plus a liveness watch; the
//!   engine treats the watch closing (or turning `false`) as the tree
//!   process dying.
//! - [`RemoteTree`]: the callback the comparison drives to fetch the
//!   *remote* side's bucket and segment hashes over the shared socket.
//! - [`DiffSink`]: the accumulator callback receiving batches of
//!   [`KeyDiff`]s as the comparison finds divergence.

use crate::vnode::{BKey, IndexN};
use async_trait::async_trait;
use tokio::sync::watch;

/// One divergent key found by tree comparison. A closed set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyDiff {
    /// The remote side lacks a key we have.
    Missing(BKey),
    /// The remote side has a key we lack.
    RemoteMissing(BKey),
    /// Both sides have the key with different hashes.
    Different(BKey),
}

impl KeyDiff {
    /// The key this diff is about.
    pub fn bkey(&self) -> &BKey {
        match self {
            KeyDiff::Missing(bkey) | KeyDiff::RemoteMissing(bkey) | KeyDiff::Different(bkey) => {
                bkey
            }
        }
    }
}

/// Opaque identity of a local hash tree plus its liveness signal.
///
/// The service constructs the handle with [`TreeHandle::new`] and keeps
/// the returned [`watch::Sender`] alive for as long as the tree process
/// runs. Dropping the sender, or sending `false`, tells every monitor
/// the tree went down.
#[derive(Debug, Clone)]
pub struct TreeHandle {
    id: u64,
    up: watch::Receiver<bool>,
}

impl TreeHandle {
    /// Create a handle and the liveness sender the tree service keeps.
    pub fn new(id: u64) -> (Self, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(true);
        (Self { id, up: rx }, tx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Resolve when the tree process dies. Never resolves while the
    /// tree is healthy.
    pub async fn down(&self) {
        let mut up = self.up.clone();
        loop {
            if !*up.borrow() {
                return;
            }
            if up.changed().await.is_err() {
                // Sender dropped: the tree process is gone.
                return;
            }
        }
    }
}

/// Outcome of a tree update request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The tree for this IndexN is built and current.
    Built,
    /// The tree service does not own this IndexN.
    NotResponsible,
}

/// The remote-side callback the comparison drives.
///
/// `init` is invoked once before any query and acquires the shared
/// socket; `finish` is invoked once after the last query and releases
/// it. Between the two, every call is a synchronous request/reply over
/// the socket under the worker's ownership.
#[async_trait]
pub trait RemoteTree: Send {
    async fn init(&mut self) -> std::io::Result<()>;

    /// Hashes of the child buckets of `bucket` at `level`.
    async fn get_bucket(&mut self, level: u64, bucket: u64)
        -> std::io::Result<Vec<(u64, Vec<u8>)>>;

    /// (packed bkey, hash) pairs for one leaf segment.
    async fn key_hashes(&mut self, segment: u64) -> std::io::Result<Vec<(Vec<u8>, Vec<u8>)>>;

    async fn finish(&mut self) -> std::io::Result<()>;
}

/// Receives batches of key diffs as the comparison finds them.
#[async_trait]
pub trait DiffSink: Send {
    async fn key_diffs(&mut self, diffs: Vec<KeyDiff>);
}

/// What the external hash-tree subsystem provides.
#[async_trait]
pub trait HashTreeService: Send + Sync {
    /// Handle of the tree managing `partition`, if one is running.
    async fn tree(&self, partition: u64) -> Option<TreeHandle>;

    /// Acquire a named lock on the tree. `Err` carries the reason.
    async fn get_lock(&self, tree: &TreeHandle, tag: &str) -> Result<(), String>;

    /// Bring the tree for one IndexN up to date.
    async fn update(&self, index_n: IndexN, tree: &TreeHandle) -> UpdateOutcome;

    /// Compare the local tree against the remote one, walking buckets
    /// and segments through `remote` and feeding divergent keys into
    /// `sink`. An I/O error from the remote callback aborts the
    /// comparison and is returned.
    async fn compare(
        &self,
        index_n: IndexN,
        remote: &mut (dyn RemoteTree + Send),
        sink: &mut (dyn DiffSink + Send),
        tree: &TreeHandle,
    ) -> std::io::Result<()>;
}

/// Lock tag the fullsync source uses on its local tree.
pub const FS_SOURCE_LOCK: &str = "fs_source";
