// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Segment comparison worker.
//!
//! During KeyExchange the engine cedes socket ownership to a spawned
//! comparison task: the tree service walks buckets and segments through
//! [`RemoteTreeClient`] (each query a synchronous request/reply over
//! the shared socket) and feeds divergent keys into
//! [`DiffAccumulator`], which fetches the objects locally and streams
//! them to the sink as `PUT_OBJ` frames.
//!
//! The handoff protocol, in order:
//!
//! 1. the worker's `init` callback signals the engine (`ready`);
//! 2. the engine moves the transport into the shared [`SocketSlot`]
//!    and signals back (`granted`);
//! 3. queries and object sends borrow the slot per operation;
//! 4. `finish` marks the worker's last socket use; the worker then
//!    posts [`CompareOutcome`] and the engine reclaims the transport
//!    from the slot.

use crate::config::WireVersion;
use crate::error::ExchangeError;
use crate::metrics;
use crate::object::{encode_obj_msg, HelperOutcome, ObjTag, ReplHelper};
use crate::transport::SocketSlot;
use crate::tree::{DiffSink, HashTreeService, KeyDiff, RemoteTree, TreeHandle};
use crate::vnode::{GetResult, IndexN, VnodeService};
use crate::wire::{BucketQuery, Frame, MsgTag, SegmentQuery, SyncReply};
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

fn io_err(e: impl std::fmt::Display) -> io::Error {
    io::Error::other(e.to_string())
}

/// The remote-side callback driven by the tree comparison.
pub(crate) struct RemoteTreeClient {
    slot: SocketSlot,
    ready_tx: Option<oneshot::Sender<()>>,
    granted_rx: Option<oneshot::Receiver<()>>,
    index_n: IndexN,
}

impl RemoteTreeClient {
    pub(crate) fn new(
        slot: SocketSlot,
        ready_tx: oneshot::Sender<()>,
        granted_rx: oneshot::Receiver<()>,
        index_n: IndexN,
    ) -> Self {
        Self {
            slot,
            ready_tx: Some(ready_tx),
            granted_rx: Some(granted_rx),
            index_n,
        }
    }

    async fn query(&mut self, frame: Frame) -> io::Result<SyncReply> {
        let mut guard = self.slot.borrow().await;
        let transport = guard
            .as_mut()
            .ok_or_else(|| io_err("socket not owned by comparison worker"))?;
        transport.send_sync(frame).await.map_err(io_err)
    }
}

#[async_trait]
impl RemoteTree for RemoteTreeClient {
    async fn init(&mut self) -> io::Result<()> {
        let (ready_tx, granted_rx) = match (self.ready_tx.take(), self.granted_rx.take()) {
            (Some(tx), Some(rx)) => (tx, rx),
            _ => return Err(io_err("comparison init invoked twice")),
        };
        ready_tx
            .send(())
            .map_err(|_| io_err("exchange engine went away before handoff"))?;
        granted_rx
            .await
            .map_err(|_| io_err("exchange engine went away during handoff"))?;
        debug!(index_n = %self.index_n, "comparison worker owns the socket");
        Ok(())
    }

    async fn get_bucket(
        &mut self,
        level: u64,
        bucket: u64,
    ) -> io::Result<Vec<(u64, Vec<u8>)>> {
        let query = BucketQuery {
            level,
            bucket,
            index_n: self.index_n,
        };
        let frame = Frame::encoded(MsgTag::GetAaeBucket, &query)?;
        match self.query(frame).await? {
            SyncReply::BucketHashes(hashes) => Ok(hashes),
            other => Err(io_err(format!(
                "unexpected reply to GET_AAE_BUCKET: {other:?}"
            ))),
        }
    }

    async fn key_hashes(&mut self, segment: u64) -> io::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let query = SegmentQuery {
            segment,
            index_n: self.index_n,
        };
        let frame = Frame::encoded(MsgTag::GetAaeSegment, &query)?;
        match self.query(frame).await? {
            SyncReply::KeyHashes(hashes) => Ok(hashes),
            other => Err(io_err(format!(
                "unexpected reply to GET_AAE_SEGMENT: {other:?}"
            ))),
        }
    }

    async fn finish(&mut self) -> io::Result<()> {
        debug!(index_n = %self.index_n, "comparison worker releasing the socket");
        Ok(())
    }
}

/// Accumulates the repaired-object count while replicating diffs.
///
/// The count starts absent and becomes `Some` on the first diff
/// handled; each repaired key adds one for itself plus one per
/// helper-produced companion object.
pub(crate) struct DiffAccumulator {
    slot: SocketSlot,
    vnode: Arc<dyn VnodeService>,
    helper: Arc<dyn ReplHelper>,
    wire_version: WireVersion,
    partition: u64,
    fetch_r: u32,
    fetch_timeout: Duration,
    acc: Option<u64>,
    failure: Option<ExchangeError>,
}

impl DiffAccumulator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        slot: SocketSlot,
        vnode: Arc<dyn VnodeService>,
        helper: Arc<dyn ReplHelper>,
        wire_version: WireVersion,
        partition: u64,
        fetch_r: u32,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            slot,
            vnode,
            helper,
            wire_version,
            partition,
            fetch_r,
            fetch_timeout,
            acc: None,
            failure: None,
        }
    }

    /// Replicate one divergent key. Returns how many objects went out.
    async fn replicate(&mut self, diff: &KeyDiff) -> Result<u64, ExchangeError> {
        let bkey = match diff {
            // The remote has a key we lack; the sink resolves that
            // side on its own. Nothing to send.
            KeyDiff::RemoteMissing(_) => return Ok(0),
            KeyDiff::Missing(bkey) | KeyDiff::Different(bkey) => bkey,
        };

        let object = match self.vnode.get(bkey, self.fetch_r, self.fetch_timeout).await {
            GetResult::Object(object) => object,
            GetResult::NotFound => {
                warn!(partition = self.partition, bkey = %bkey, "divergent key vanished locally; skipping");
                metrics::record_fetch_miss(self.partition);
                return Ok(0);
            }
            GetResult::Error(reason) => {
                warn!(partition = self.partition, bkey = %bkey, reason = %reason, "divergent key fetch failed; skipping");
                return Ok(0);
            }
        };

        let related = match self.helper.send(&object).await {
            HelperOutcome::Cancel => {
                debug!(bkey = %bkey, "replication helper cancelled object");
                return Ok(0);
            }
            HelperOutcome::Objects(related) => related,
        };

        // Companions travel ahead of the primary object.
        let mut sent = 0u64;
        for companion in &related {
            self.put_obj(companion).await?;
            sent += 1;
        }
        self.put_obj(&object).await?;
        sent += 1;
        Ok(sent)
    }

    async fn put_obj(&mut self, object: &crate::object::ReplObject) -> Result<(), ExchangeError> {
        let payload = encode_obj_msg(self.wire_version, ObjTag::FsDiffObj, object)
            .map_err(ExchangeError::Protocol)?;
        let mut guard = self.slot.borrow().await;
        let transport = guard.as_mut().ok_or_else(|| {
            ExchangeError::Transport("socket not owned by comparison worker".to_string())
        })?;
        transport
            .send_async(Frame::new(MsgTag::PutObj, payload))
            .await
    }

    pub(crate) fn into_outcome(self) -> CompareOutcome {
        CompareOutcome {
            acc: self.acc,
            failure: self.failure,
        }
    }
}

#[async_trait]
impl DiffSink for DiffAccumulator {
    async fn key_diffs(&mut self, diffs: Vec<KeyDiff>) {
        if self.failure.is_some() {
            return;
        }
        for diff in &diffs {
            match self.replicate(diff).await {
                Ok(sent) => {
                    self.acc = Some(self.acc.unwrap_or(0) + sent);
                }
                Err(e) => {
                    self.failure = Some(e);
                    return;
                }
            }
        }
    }
}

/// What the comparison worker posts back to the engine.
#[derive(Debug)]
pub(crate) struct CompareOutcome {
    /// Objects sent, `None` when no diff was ever handled.
    pub acc: Option<u64>,
    /// A replication failure captured mid-comparison, if any.
    pub failure: Option<ExchangeError>,
}

impl CompareOutcome {
    pub(crate) fn into_result(self) -> Result<u64, ExchangeError> {
        match self.failure {
            Some(e) => Err(e),
            None => Ok(self.acc.unwrap_or(0)),
        }
    }
}

/// Run one IndexN's comparison to completion and post the outcome.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_compare(
    tree_service: Arc<dyn HashTreeService>,
    tree: TreeHandle,
    index_n: IndexN,
    slot: SocketSlot,
    ready_tx: oneshot::Sender<()>,
    granted_rx: oneshot::Receiver<()>,
    mut accumulator: DiffAccumulator,
    done_tx: oneshot::Sender<CompareOutcome>,
) {
    let mut remote = RemoteTreeClient::new(slot, ready_tx, granted_rx, index_n);
    let compared = tree_service
        .compare(index_n, &mut remote, &mut accumulator, &tree)
        .await;

    let mut outcome = accumulator.into_outcome();
    if let Err(e) = compared {
        // A transport fault beats a replication fault: the earlier
        // failure is the one that broke the exchange.
        outcome.failure = Some(outcome.failure.unwrap_or_else(|| ExchangeError::transport(e)));
    }
    let _ = done_tx.send(outcome);
}
