// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The AAE fullsync source exchange engine.
//!
//! One engine per partition, spawned by the fullsync coordinator. The
//! engine drives the finite state machine described on
//! [`ExchangeState`]: it locks the local and remote hash trees, brings both up
//! to date for each responsible IndexN, cedes the socket to a
//! comparison worker that walks buckets and segments against the sink,
//! and streams every divergent object across.
//!
//! # Lifecycle
//!
//! ```text
//! coordinator ── spawn() ──► engine task
//!      │                        │ Prepare: lock local tree, INIT, LOCK_TREE
//!      │ start_exchange()       │ UpdateTrees: local + remote update per IndexN
//!      │ cancel_fullsync()      │ KeyExchange: compare + replicate diffs
//!      │ status()               │ ... one cycle per IndexN ...
//!      ◄── SourceReport ────────┘ COMPLETE, stop
//! ```
//!
//! The engine owns the transport except while a comparison worker runs;
//! ownership moves through a [`SocketSlot`](crate::transport::SocketSlot)
//! and is always reclaimed before the next FSM cycle. The engine never
//! retries: every fatal error terminates this instance and is reported
//! to the owner.

mod key_exchange;
mod types;

pub use types::{ExchangeEvent, ExchangeState, ExchangeStatus, SourceReport};

use crate::config::FullsyncConfig;
use crate::error::{ExchangeError, Result};
use crate::metrics;
use crate::object::ReplHelper;
use crate::transport::{SocketSlot, Transport};
use crate::tree::{HashTreeService, TreeHandle, UpdateOutcome, FS_SOURCE_LOCK};
use crate::vnode::{IndexN, VnodeService};
use crate::wire::{Frame, MsgTag, SyncReply};
use key_exchange::DiffAccumulator;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Control flow outcome of one event in the FSM.
enum Step {
    Continue,
    Done,
}

/// What woke the engine out of its event wait.
enum Wake {
    Event(ExchangeEvent),
    TreeDown,
    OwnerGone,
    Timeout,
}

/// Handle to a running exchange engine.
pub struct ExchangeHandle {
    events: mpsc::Sender<ExchangeEvent>,
    task: tokio::task::JoinHandle<Result<()>>,
}

impl ExchangeHandle {
    /// Kick off the exchange. The engine must be in Prepare.
    pub async fn start_exchange(&self) {
        let _ = self.events.send(ExchangeEvent::StartExchange).await;
    }

    /// Abort the exchange cleanly from any state.
    pub async fn cancel_fullsync(&self) {
        let _ = self.events.send(ExchangeEvent::CancelFullsync).await;
    }

    /// Query current state without mutating it. `None` once the engine
    /// has stopped.
    pub async fn status(&self) -> Option<ExchangeStatus> {
        let (tx, rx) = oneshot::channel();
        self.events.send(ExchangeEvent::Status(tx)).await.ok()?;
        rx.await.ok()
    }

    /// Wait for the engine to terminate.
    pub async fn join(self) -> Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(ExchangeError::Transport(format!(
                "engine task failed: {e}"
            ))),
        }
    }
}

/// The per-partition exchange engine. See module docs.
pub struct ExchangeEngine {
    partition: u64,
    config: FullsyncConfig,
    transport: Option<Transport>,
    tree_service: Arc<dyn HashTreeService>,
    vnode: Arc<dyn VnodeService>,
    helper: Arc<dyn ReplHelper>,
    owner: mpsc::Sender<SourceReport>,
    events_rx: mpsc::Receiver<ExchangeEvent>,
    /// Weak so the channel closes once every handle is gone.
    self_tx: mpsc::WeakSender<ExchangeEvent>,
    tree: TreeHandle,
    state: ExchangeState,
    queue: VecDeque<IndexN>,
    trees_built: u8,
}

impl ExchangeEngine {
    /// Spawn an engine for one partition.
    ///
    /// Looks up the partition's tree handle and its responsible
    /// IndexN list, then starts the engine task in Prepare. The
    /// transport arrives already framed (4-byte length prefix, tag
    /// split, keepalive, no Nagle).
    pub async fn spawn(
        partition: u64,
        config: FullsyncConfig,
        transport: Transport,
        tree_service: Arc<dyn HashTreeService>,
        vnode: Arc<dyn VnodeService>,
        helper: Arc<dyn ReplHelper>,
        owner: mpsc::Sender<SourceReport>,
    ) -> Result<ExchangeHandle> {
        let tree = tree_service
            .tree(partition)
            .await
            .ok_or(ExchangeError::SomethingWentDown)?;
        let queue: VecDeque<IndexN> = vnode.responsible_preflists(partition).await.into();

        let (events_tx, events_rx) = mpsc::channel(32);
        let engine = Self {
            partition,
            config,
            transport: Some(transport),
            tree_service,
            vnode,
            helper,
            owner,
            events_rx,
            self_tx: events_tx.downgrade(),
            tree,
            state: ExchangeState::Prepare,
            queue,
            trees_built: 0,
        };

        let task = tokio::spawn(engine.run());
        Ok(ExchangeHandle {
            events: events_tx,
            task,
        })
    }

    async fn run(mut self) -> Result<()> {
        let started = Instant::now();
        metrics::record_exchange_started(self.partition);
        info!(
            partition = self.partition,
            cluster = %self.config.cluster_name,
            index_ns = self.queue.len(),
            "starting fullsync exchange"
        );

        let result = self.event_loop().await;

        self.transition(ExchangeState::Stopped);
        match &result {
            Ok(()) => {
                metrics::record_exchange_finished(self.partition, "ok", started.elapsed());
            }
            Err(reason) => {
                warn!(partition = self.partition, error = %reason, "exchange failed");
                metrics::record_exchange_finished(self.partition, "error", started.elapsed());
                let _ = self
                    .owner
                    .send(SourceReport::Error {
                        partition: self.partition,
                        reason: reason.clone(),
                    })
                    .await;
            }
        }
        result
    }

    async fn event_loop(&mut self) -> Result<()> {
        loop {
            let event = match self.next_wake().await {
                Wake::Event(event) => event,
                Wake::TreeDown => {
                    warn!(partition = self.partition, "local hash tree went down");
                    let _ = self.send_complete().await;
                    return Err(ExchangeError::SomethingWentDown);
                }
                Wake::OwnerGone => {
                    // Every handle dropped: nobody can cancel us any
                    // more, so treat it as cancellation.
                    info!(partition = self.partition, "all handles dropped; cancelling");
                    let _ = self.send_complete().await;
                    return Ok(());
                }
                Wake::Timeout => {
                    let _ = self.send_complete().await;
                    return Err(ExchangeError::Timeout {
                        waiting_for: self.waiting_for(),
                    });
                }
            };

            match event {
                ExchangeEvent::CancelFullsync => {
                    info!(partition = self.partition, "fullsync cancelled");
                    let _ = self.send_complete().await;
                    return Ok(());
                }
                ExchangeEvent::Status(reply) => {
                    let _ = reply.send(self.status());
                }
                event => {
                    let step = match self.state {
                        ExchangeState::Prepare => self.prepare(event).await?,
                        ExchangeState::UpdateTrees => self.update_trees(event).await?,
                        ExchangeState::KeyExchange => self.key_exchange(event).await?,
                        ExchangeState::Stopped => Step::Done,
                    };
                    if let Step::Done = step {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn next_wake(&mut self) -> Wake {
        let tree = self.tree.clone();
        let timeout = self.config.exchange.anti_entropy_timeout();
        tokio::select! {
            biased;
            () = tree.down() => Wake::TreeDown,
            event = self.events_rx.recv() => match event {
                Some(event) => Wake::Event(event),
                None => Wake::OwnerGone,
            },
            () = tokio::time::sleep(timeout) => Wake::Timeout,
        }
    }

    /// What the current state is waiting on, for timeout reports.
    fn waiting_for(&self) -> &'static str {
        match self.state {
            ExchangeState::Prepare => "start_exchange",
            ExchangeState::UpdateTrees => "tree_built",
            ExchangeState::KeyExchange => "start_key_exchange",
            ExchangeState::Stopped => "nothing",
        }
    }

    fn status(&self) -> ExchangeStatus {
        ExchangeStatus {
            state: self.state,
            partition: self.partition,
            wire_version: self.config.exchange.wire_version,
            trees_built: self.trees_built,
        }
    }

    fn transition(&mut self, state: ExchangeState) {
        debug!(partition = self.partition, from = %self.state, to = %state, "fsm transition");
        self.state = state;
        metrics::set_exchange_state(self.partition, &state.to_string());
    }

    fn self_send(&self, event: ExchangeEvent) {
        // The engine is its own consumer; the channel is amply sized
        // for the one self-dispatch per transition. An upgrade failure
        // means every handle is gone, which the event loop observes on
        // its own as cancellation.
        if let Some(events) = self.self_tx.upgrade() {
            if let Err(e) = events.try_send(event) {
                warn!(partition = self.partition, error = %e, "dropped self-dispatched event");
            }
        }
    }

    fn transport_mut(&mut self) -> Result<&mut Transport> {
        self.transport
            .as_mut()
            .ok_or_else(|| ExchangeError::Transport("socket not owned by engine".to_string()))
    }

    async fn send_complete(&mut self) -> Result<()> {
        let transport = self.transport_mut()?;
        transport.send_async(Frame::bare(MsgTag::Complete)).await
    }

    // ─── Prepare ────────────────────────────────────────────────────

    /// Negotiate locks: local fullsync-source lock, then `INIT` and
    /// `LOCK_TREE` with the sink.
    async fn prepare(&mut self, event: ExchangeEvent) -> Result<Step> {
        match event {
            ExchangeEvent::StartExchange => {}
            other => {
                warn!(partition = self.partition, ?other, "unexpected event in Prepare");
                return Ok(Step::Continue);
            }
        }

        let tree = self.tree.clone();
        if let Err(reason) = self.tree_service.get_lock(&tree, FS_SOURCE_LOCK).await {
            warn!(partition = self.partition, reason = %reason, "local tree lock rejected");
            let _ = self.send_complete().await;
            return Err(ExchangeError::LockFailed(reason));
        }

        let partition = self.partition;
        let init = Frame::encoded(MsgTag::Init, &partition)?;
        let reply = self.transport_mut()?.send_sync(init).await?;
        if reply != SyncReply::Ok {
            let _ = self.send_complete().await;
            return Err(ExchangeError::Protocol(format!(
                "unexpected reply to INIT: {reply:?}"
            )));
        }

        let reply = self
            .transport_mut()?
            .send_sync(Frame::bare(MsgTag::LockTree))
            .await?;
        if reply != SyncReply::Ok {
            warn!(partition = self.partition, ?reply, "remote tree lock rejected");
            let _ = self.send_complete().await;
            return Err(ExchangeError::RemoteLock(format!("{reply:?}")));
        }

        debug!(partition = self.partition, "local and remote trees locked");
        self.trees_built = 0;
        self.transition(ExchangeState::UpdateTrees);
        self.self_send(ExchangeEvent::StartExchange);
        Ok(Step::Continue)
    }

    // ─── UpdateTrees ────────────────────────────────────────────────

    /// Bring both trees up to date for the head IndexN, or finish the
    /// exchange when the queue has drained.
    async fn update_trees(&mut self, event: ExchangeEvent) -> Result<Step> {
        match event {
            ExchangeEvent::StartExchange => self.start_update().await,
            ExchangeEvent::TreeBuilt { index_n, .. } => {
                debug!(partition = self.partition, index_n = %index_n, "local tree built");
                self.tree_built();
                Ok(Step::Continue)
            }
            ExchangeEvent::NotResponsible { index_n, .. } => {
                warn!(partition = self.partition, index_n = %index_n, "local tree not responsible");
                let _ = self.send_complete().await;
                Err(ExchangeError::NotResponsible {
                    partition: self.partition,
                    index_n,
                })
            }
            other => {
                warn!(partition = self.partition, ?other, "unexpected event in UpdateTrees");
                Ok(Step::Continue)
            }
        }
    }

    async fn start_update(&mut self) -> Result<Step> {
        let Some(&index_n) = self.queue.front() else {
            // Every IndexN exchanged: the partition is converged.
            info!(partition = self.partition, "fullsync complete");
            let _ = self.send_complete().await;
            let _ = self
                .owner
                .send(SourceReport::FullsyncComplete {
                    partition: self.partition,
                })
                .await;
            return Ok(Step::Done);
        };

        debug!(partition = self.partition, index_n = %index_n, "updating trees");

        // Local update runs concurrently; its outcome arrives as an
        // event. The remote update is a synchronous request below.
        let service = Arc::clone(&self.tree_service);
        let tree = self.tree.clone();
        let events = self.self_tx.upgrade();
        let partition = self.partition;
        tokio::spawn(async move {
            let event = match service.update(index_n, &tree).await {
                UpdateOutcome::Built => ExchangeEvent::TreeBuilt { partition, index_n },
                UpdateOutcome::NotResponsible => {
                    ExchangeEvent::NotResponsible { partition, index_n }
                }
            };
            if let Some(events) = events {
                let _ = events.send(event).await;
            }
        });

        let update = Frame::encoded(MsgTag::UpdateTree, &index_n)?;
        let reply = self.transport_mut()?.send_sync(update).await?;
        match reply {
            SyncReply::Ok => {
                debug!(partition = self.partition, index_n = %index_n, "remote tree built");
                self.tree_built();
                Ok(Step::Continue)
            }
            SyncReply::NotResponsible => {
                warn!(partition = self.partition, index_n = %index_n, "remote tree not responsible");
                let _ = self.send_complete().await;
                Err(ExchangeError::NotResponsible {
                    partition: self.partition,
                    index_n,
                })
            }
            other => {
                let _ = self.send_complete().await;
                Err(ExchangeError::Protocol(format!(
                    "unexpected reply to UPDATE_TREE: {other:?}"
                )))
            }
        }
    }

    /// Count one tree-built acknowledgement; both sides current moves
    /// the FSM to KeyExchange.
    fn tree_built(&mut self) {
        self.trees_built += 1;
        if self.trees_built == 2 {
            self.trees_built = 0;
            self.transition(ExchangeState::KeyExchange);
            self.self_send(ExchangeEvent::StartKeyExchange);
        }
    }

    // ─── KeyExchange ────────────────────────────────────────────────

    /// Run one IndexN's comparison: hand the socket to a worker, wait
    /// for its outcome, reclaim the socket, then cycle back to
    /// UpdateTrees for the next IndexN.
    async fn key_exchange(&mut self, event: ExchangeEvent) -> Result<Step> {
        match event {
            ExchangeEvent::StartKeyExchange => {}
            other => {
                warn!(partition = self.partition, ?other, "unexpected event in KeyExchange");
                return Ok(Step::Continue);
            }
        }

        // The FSM only enters KeyExchange with a head IndexN in place.
        let Some(&index_n) = self.queue.front() else {
            return Err(ExchangeError::Protocol(
                "key exchange started with an empty IndexN queue".to_string(),
            ));
        };
        let timeout = self.config.exchange.anti_entropy_timeout();

        let slot = SocketSlot::empty();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (granted_tx, granted_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();

        let accumulator = DiffAccumulator::new(
            slot.clone(),
            Arc::clone(&self.vnode),
            Arc::clone(&self.helper),
            self.config.exchange.wire_version,
            self.partition,
            self.config.exchange.fetch_r,
            self.config.exchange.fetch_timeout(),
        );
        let worker = tokio::spawn(key_exchange::run_compare(
            Arc::clone(&self.tree_service),
            self.tree.clone(),
            index_n,
            slot.clone(),
            ready_tx,
            granted_rx,
            accumulator,
            done_tx,
        ));

        // Tight wait: only the worker's handoff signal advances us.
        match tokio::time::timeout(timeout, ready_rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                worker.abort();
                let _ = self.send_complete().await;
                return Err(ExchangeError::Transport(
                    "comparison worker died before handoff".to_string(),
                ));
            }
            Err(_) => {
                worker.abort();
                let _ = self.send_complete().await;
                return Err(ExchangeError::Timeout {
                    waiting_for: "comparison worker handoff",
                });
            }
        }

        let transport = self.transport.take().ok_or_else(|| {
            ExchangeError::Transport("socket not owned by engine".to_string())
        })?;
        slot.put(transport).await;
        let _ = granted_tx.send(());

        // Tight wait: only the worker's done message advances us.
        let outcome = match tokio::time::timeout(timeout, done_rx).await {
            Ok(Ok(outcome)) => Some(outcome),
            Ok(Err(_)) => None,
            Err(_) => {
                worker.abort();
                self.transport = slot.take().await;
                let _ = self.send_complete().await;
                return Err(ExchangeError::Timeout {
                    waiting_for: "comparison done",
                });
            }
        };

        // Reclaim the socket before looking at the outcome.
        self.transport = slot.take().await;
        let result = match outcome {
            Some(outcome) => outcome.into_result(),
            None => Err(ExchangeError::Transport(
                "comparison worker died mid-exchange".to_string(),
            )),
        };
        let repaired = match result {
            Ok(repaired) => repaired,
            Err(e) => {
                let _ = self.send_complete().await;
                return Err(e);
            }
        };
        if self.transport.is_none() {
            return Err(ExchangeError::Transport(
                "socket lost during comparison".to_string(),
            ));
        }

        info!(
            partition = self.partition,
            index_n = %index_n,
            repaired,
            "finished exchanging keys"
        );
        metrics::record_keys_repaired(self.partition, repaired);

        self.queue.pop_front();
        self.trees_built = 0;
        self.transition(ExchangeState::UpdateTrees);
        self.self_send(ExchangeEvent::StartExchange);
        Ok(Step::Continue)
    }
}
