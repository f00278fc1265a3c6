// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Legacy Merkle-file helper.
//!
//! A one-shot worker that builds and diffs on-disk sorted key/hash
//! files for fullsync with sinks that predate hash-tree exchange. Four
//! operations:
//!
//! - [`make_merkle`](MerkleHelper::make_merkle): fold a partition into
//!   a key-ordered map file, buffering and flushing in batches.
//! - [`make_keylist`](MerkleHelper::make_keylist): fold a partition
//!   into a record stream, then sort it.
//! - [`merkle_to_keylist`](MerkleHelper::merkle_to_keylist): convert a
//!   map file into a sorted keylist.
//! - [`diff`](MerkleHelper::diff): merge-walk two sorted keylists and
//!   report divergent keys.
//!
//! Each operation registers a fresh [`OpRef`], returns it immediately,
//! and later posts exactly one terminal [`HelperEvent`] carrying that
//! reference to the owner channel (`diff` additionally posts one
//! `MerkleDiff` event per divergent key). Every partition-bound
//! operation first checks the partition's owner node is reachable and
//! fails with `node_not_available` otherwise.

pub mod keyfile;
pub mod store;

use crate::config::MerkleConfig;
use crate::error::HelperError;
use crate::metrics;
use crate::object::{binpack_bkey, binunpack_bkey, hash_object};
use crate::vnode::{fresh_vclock, BKey, Preflist, VClock, VnodeService};
use keyfile::{KeyFileReader, KeyFileWriter};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Opaque reference identifying one helper operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpRef(u64);

static NEXT_OP_REF: AtomicU64 = AtomicU64::new(1);

impl OpRef {
    fn fresh() -> Self {
        Self(NEXT_OP_REF.fetch_add(1, Ordering::Relaxed))
    }
}

/// One event posted to the helper's owner.
#[derive(Debug)]
pub struct HelperEvent {
    /// The operation this event belongs to.
    pub op: OpRef,
    pub report: HelperReport,
}

/// What a helper operation reports.
#[derive(Debug)]
pub enum HelperReport {
    /// `make_merkle` finished; the map file closed cleanly.
    MerkleBuilt,
    /// `make_keylist` finished; the file is sorted on disk.
    KeylistBuilt,
    /// `merkle_to_keylist` finished; output verified sorted.
    Converted,
    /// One divergent key found by `diff`.
    MerkleDiff { bkey: BKey, vclock: VClock },
    /// `diff` finished; final statistics.
    DiffDone(DiffStats),
    /// The operation failed.
    Error(HelperError),
}

/// Statistics from one keylist diff.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DiffStats {
    /// Keys present on both sides with differing hashes.
    pub differing: u64,
    /// Keys present remotely but missing locally.
    pub missing: u64,
    /// Read errors tallied by reason.
    pub errors: BTreeMap<String, u64>,
    /// Records read from the remote file.
    pub remote_reads: u64,
    /// Records read from the local file.
    pub local_reads: u64,
}

/// The one-shot Merkle helper. Created per fullsync operation.
pub struct MerkleHelper {
    owner: mpsc::Sender<HelperEvent>,
    vnode: Arc<dyn VnodeService>,
    config: MerkleConfig,
}

impl MerkleHelper {
    pub fn new(
        owner: mpsc::Sender<HelperEvent>,
        vnode: Arc<dyn VnodeService>,
        config: MerkleConfig,
    ) -> Self {
        Self {
            owner,
            vnode,
            config,
        }
    }

    /// Build a key-ordered Merkle map of `partition` at `filename`.
    pub fn make_merkle(&self, partition: u64, filename: &Path) -> OpRef {
        let op = OpRef::fresh();
        let owner = self.owner.clone();
        let vnode = Arc::clone(&self.vnode);
        let buffer_size = self.config.buffer_size;
        let path = filename.to_path_buf();

        tokio::spawn(async move {
            let started = Instant::now();
            let report = match build_merkle(vnode, partition, &path, buffer_size).await {
                Ok(entries) => {
                    info!(partition, entries, path = %path.display(), "merkle map built");
                    metrics::record_helper_op("make_merkle", "ok", started.elapsed());
                    HelperReport::MerkleBuilt
                }
                Err(e) => {
                    warn!(partition, error = %e, "merkle build failed");
                    metrics::record_helper_op("make_merkle", "error", started.elapsed());
                    HelperReport::Error(e)
                }
            };
            let _ = owner.send(HelperEvent { op, report }).await;
        });
        op
    }

    /// Build a sorted keylist of `partition` at `filename`.
    pub fn make_keylist(&self, partition: u64, filename: &Path) -> OpRef {
        let op = OpRef::fresh();
        let owner = self.owner.clone();
        let vnode = Arc::clone(&self.vnode);
        let path = filename.to_path_buf();

        tokio::spawn(async move {
            let started = Instant::now();
            let report = match build_keylist(vnode, partition, &path).await {
                Ok(entries) => {
                    info!(partition, entries, path = %path.display(), "keylist built");
                    metrics::record_helper_op("make_keylist", "ok", started.elapsed());
                    HelperReport::KeylistBuilt
                }
                Err(e) => {
                    warn!(partition, error = %e, "keylist build failed");
                    metrics::record_helper_op("make_keylist", "error", started.elapsed());
                    HelperReport::Error(e)
                }
            };
            let _ = owner.send(HelperEvent { op, report }).await;
        });
        op
    }

    /// Convert a Merkle map file into a sorted keylist.
    pub fn merkle_to_keylist(&self, merkle_fn: &Path, keylist_fn: &Path) -> OpRef {
        let op = OpRef::fresh();
        let owner = self.owner.clone();
        let merkle_path = merkle_fn.to_path_buf();
        let keylist_path = keylist_fn.to_path_buf();

        tokio::spawn(async move {
            let started = Instant::now();
            let report = match convert_merkle(&merkle_path, &keylist_path) {
                Ok(entries) => {
                    debug!(entries, path = %keylist_path.display(), "merkle converted to keylist");
                    metrics::record_helper_op("merkle_to_keylist", "ok", started.elapsed());
                    HelperReport::Converted
                }
                Err(e) => {
                    warn!(error = %e, "merkle conversion failed");
                    metrics::record_helper_op("merkle_to_keylist", "error", started.elapsed());
                    HelperReport::Error(e)
                }
            };
            let _ = owner.send(HelperEvent { op, report }).await;
        });
        op
    }

    /// Diff a remote keylist against ours, posting one `MerkleDiff`
    /// per divergent key, then `DiffDone`. Both input files are
    /// deleted afterwards regardless of outcome.
    pub fn diff(&self, partition: u64, remote_fn: &Path, our_fn: &Path) -> OpRef {
        let op = OpRef::fresh();
        let owner = self.owner.clone();
        let vnode = Arc::clone(&self.vnode);
        let remote_path = remote_fn.to_path_buf();
        let our_path = our_fn.to_path_buf();

        tokio::spawn(async move {
            let started = Instant::now();
            let report = if !node_available(vnode.as_ref(), partition).await {
                metrics::record_helper_op("diff", "node_not_available", started.elapsed());
                HelperReport::Error(HelperError::NodeNotAvailable)
            } else {
                let result =
                    run_diff(vnode.as_ref(), partition, &remote_path, &our_path, op, &owner)
                        .await;
                match result {
                    Ok(stats) => {
                        info!(
                            partition,
                            differing = stats.differing,
                            missing = stats.missing,
                            remote_reads = stats.remote_reads,
                            local_reads = stats.local_reads,
                            "keylist diff complete"
                        );
                        metrics::record_diff_keys(partition, stats.differing + stats.missing);
                        metrics::record_helper_op("diff", "ok", started.elapsed());
                        HelperReport::DiffDone(stats)
                    }
                    Err(e) => {
                        warn!(partition, error = %e, "keylist diff failed");
                        metrics::record_helper_op("diff", "error", started.elapsed());
                        HelperReport::Error(e)
                    }
                }
            };
            // Diff inputs are transient; always clean them up.
            let _ = std::fs::remove_file(&remote_path);
            let _ = std::fs::remove_file(&our_path);
            let _ = owner.send(HelperEvent { op, report }).await;
        });
        op
    }
}

async fn node_available(vnode: &dyn VnodeService, partition: u64) -> bool {
    match vnode.index_owner(partition).await {
        Some(node) => vnode.node_up(&node).await,
        None => false,
    }
}

/// Drive a partition fold into a channel, hashing each object.
///
/// Returns the receiver and the fold task handle; the caller drains
/// the receiver, then awaits the handle to learn how the fold ended.
fn spawn_fold(
    vnode: Arc<dyn VnodeService>,
    partition: u64,
) -> (
    mpsc::Receiver<(BKey, Vec<u8>)>,
    tokio::task::JoinHandle<Result<(), String>>,
) {
    let (tx, rx) = mpsc::channel(1024);
    let preflist = Preflist { partition, n: 1 };
    let handle = tokio::spawn(async move { vnode.fold_objects(preflist, tx).await });
    (rx, handle)
}

async fn finish_fold(
    handle: tokio::task::JoinHandle<Result<(), String>>,
) -> Result<(), HelperError> {
    match handle.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(HelperError::FoldFailed(e)),
        Err(e) => Err(HelperError::FoldFailed(e.to_string())),
    }
}

async fn build_merkle(
    vnode: Arc<dyn VnodeService>,
    partition: u64,
    path: &Path,
    buffer_size: usize,
) -> Result<usize, HelperError> {
    if !node_available(vnode.as_ref(), partition).await {
        return Err(HelperError::NodeNotAvailable);
    }

    let mut store = store::MerkleStore::create(path);
    let (mut rx, fold) = spawn_fold(vnode, partition);

    let mut buffer: Vec<keyfile::Record> = Vec::new();
    let mut buffered_bytes = 0usize;
    while let Some((bkey, object)) = rx.recv().await {
        let packed = binpack_bkey(&bkey).to_vec();
        // 4 bytes of hash overhead per buffered entry.
        buffered_bytes += packed.len() + 4;
        buffer.push((packed, hash_object(&object)));
        if buffered_bytes > buffer_size {
            store.insert_batch(std::mem::take(&mut buffer));
            buffered_bytes = 0;
        }
    }
    finish_fold(fold).await?;

    if !buffer.is_empty() {
        store.insert_batch(buffer);
    }
    let entries = store.len();
    store
        .close()
        .map_err(|e| HelperError::MerkleFailed(e.to_string()))?;
    Ok(entries)
}

async fn build_keylist(
    vnode: Arc<dyn VnodeService>,
    partition: u64,
    path: &Path,
) -> Result<u64, HelperError> {
    if !node_available(vnode.as_ref(), partition).await {
        return Err(HelperError::NodeNotAvailable);
    }

    let mut writer =
        KeyFileWriter::create(path).map_err(|e| HelperError::KeylistFailed(e.to_string()))?;
    let (mut rx, fold) = spawn_fold(vnode, partition);

    while let Some((bkey, object)) = rx.recv().await {
        let packed = binpack_bkey(&bkey).to_vec();
        writer
            .write_record(&(packed, hash_object(&object)))
            .map_err(|e| HelperError::KeylistFailed(e.to_string()))?;
    }
    finish_fold(fold).await?;

    let entries = writer.written();
    writer
        .sync()
        .map_err(|e| HelperError::KeylistFailed(e.to_string()))?;
    keyfile::sort_keyfile(path).map_err(|e| HelperError::KeylistFailed(e.to_string()))?;
    Ok(entries)
}

fn convert_merkle(merkle_path: &Path, keylist_path: &Path) -> Result<u64, HelperError> {
    let mut iter = store::MerkleIter::open(merkle_path)?;
    let mut writer = KeyFileWriter::create(keylist_path)?;
    while let Some(record) = iter.next_entry()? {
        writer.write_record(&record)?;
    }
    let entries = writer.written();
    writer.sync()?;

    match keyfile::check_sorted(keylist_path)? {
        Ok(()) => Ok(entries),
        Err(position) => Err(HelperError::Unsorted(format!(
            "record {position} out of order"
        ))),
    }
}

/// One side of the diff walk: a reader whose read errors end the
/// stream after being tallied.
struct DiffSide {
    reader: KeyFileReader,
    side: &'static str,
}

impl DiffSide {
    fn open(path: &Path, side: &'static str) -> Result<Self, HelperError> {
        Ok(Self {
            reader: KeyFileReader::open(path)?,
            side,
        })
    }

    fn next(&mut self, stats: &mut DiffStats) -> Option<keyfile::Record> {
        match self.reader.next_record() {
            Ok(record) => record,
            Err(e) => {
                debug!(side = self.side, error = %e, "keyfile read error");
                *stats.errors.entry(e.kind().to_string()).or_insert(0) += 1;
                None
            }
        }
    }
}

async fn run_diff(
    vnode: &dyn VnodeService,
    partition: u64,
    remote_path: &Path,
    our_path: &Path,
    op: OpRef,
    owner: &mpsc::Sender<HelperEvent>,
) -> Result<DiffStats, HelperError> {
    let mut stats = DiffStats::default();
    let mut remote = DiffSide::open(remote_path, "remote")?;
    let mut local = DiffSide::open(our_path, "local")?;
    let preflist = Preflist { partition, n: 1 };

    let mut r = remote.next(&mut stats);
    let mut l = local.next(&mut stats);

    loop {
        match (&r, &l) {
            // Remote exhausted: remaining local keys are possible
            // deletions on the remote; skip them.
            (None, _) => break,

            // Local exhausted: everything left on the remote is
            // missing here.
            (Some((rk, _)), None) => {
                post_diff(owner, op, rk, fresh_vclock()).await;
                stats.missing += 1;
                r = remote.next(&mut stats);
            }

            (Some((rk, rh)), Some((lk, lh))) => match rk.cmp(lk) {
                std::cmp::Ordering::Equal => {
                    if rh != lh {
                        let vclock = lookup_vclock(vnode, preflist, rk).await;
                        post_diff(owner, op, rk, vclock).await;
                        stats.differing += 1;
                    }
                    r = remote.next(&mut stats);
                    l = local.next(&mut stats);
                }
                std::cmp::Ordering::Less => {
                    post_diff(owner, op, rk, fresh_vclock()).await;
                    stats.missing += 1;
                    r = remote.next(&mut stats);
                }
                std::cmp::Ordering::Greater => {
                    l = local.next(&mut stats);
                }
            },
        }
    }

    stats.remote_reads = remote.reader.read_count();
    stats.local_reads = local.reader.read_count();
    Ok(stats)
}

async fn lookup_vclock(vnode: &dyn VnodeService, preflist: Preflist, packed: &[u8]) -> VClock {
    let Some(bkey) = binunpack_bkey(packed) else {
        return fresh_vclock();
    };
    vnode
        .get_vclocks(preflist, std::slice::from_ref(&bkey))
        .await
        .into_iter()
        .find(|(k, _)| *k == bkey)
        .map(|(_, vclock)| vclock)
        .unwrap_or_else(fresh_vclock)
}

async fn post_diff(owner: &mpsc::Sender<HelperEvent>, op: OpRef, packed: &[u8], vclock: VClock) {
    let Some(bkey) = binunpack_bkey(packed) else {
        warn!("undecodable packed bkey in diff; skipping");
        return;
    };
    let _ = owner
        .send(HelperEvent {
            op,
            report: HelperReport::MerkleDiff { bkey, vclock },
        })
        .await;
}
