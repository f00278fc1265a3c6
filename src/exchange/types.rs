//! Exchange engine state types.
//!
//! Defines the finite state machine for a single partition exchange.
//!
//! # State Transitions
//!
//! ```text
//!              start_exchange
//! Prepare ───────────────────→ UpdateTrees ←───────────────┐
//!    │                              │                      │
//!    │ (lock rejected)              │ (both trees built)   │ (IndexN done,
//!    ↓                              ↓                      │  queue popped)
//! Stopped ←──────────────────── KeyExchange ───────────────┘
//!    ↑
//!    │  cancel_fullsync / tree down / empty queue: COMPLETE then stop
//! ```
//!
//! # State Descriptions
//!
//! - **Prepare**: socket configured, local and remote tree locks
//!   negotiated.
//! - **UpdateTrees**: local and remote trees driven to a current
//!   state for the head IndexN; the built counter counts the two
//!   acknowledgements.
//! - **KeyExchange**: segmented tree comparison runs over the shared
//!   socket; divergent objects stream to the sink.
//! - **Stopped**: terminal; exactly one `COMPLETE` frame precedes it
//!   on every path where the transport is alive.

use crate::error::ExchangeError;
use crate::vnode::IndexN;
use tokio::sync::oneshot;

/// State of the exchange engine.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// Negotiating locks with the local tree and the sink.
    Prepare,
    /// Driving local and remote trees up to date for the head IndexN.
    UpdateTrees,
    /// Comparing trees and replicating divergent keys.
    KeyExchange,
    /// Terminal.
    Stopped,
}

impl std::fmt::Display for ExchangeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExchangeState::Prepare => write!(f, "Prepare"),
            ExchangeState::UpdateTrees => write!(f, "UpdateTrees"),
            ExchangeState::KeyExchange => write!(f, "KeyExchange"),
            ExchangeState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Events driving the exchange FSM.
#[derive(Debug)]
pub enum ExchangeEvent {
    /// Begin (or continue with the next IndexN of) the exchange.
    StartExchange,
    /// Both trees are current; begin the segment comparison.
    StartKeyExchange,
    /// Abort the exchange cleanly.
    CancelFullsync,
    /// The local tree service finished updating one IndexN.
    TreeBuilt { partition: u64, index_n: IndexN },
    /// The local tree service does not own this IndexN.
    NotResponsible { partition: u64, index_n: IndexN },
    /// Synchronous status query.
    Status(oneshot::Sender<ExchangeStatus>),
}

/// Snapshot answered by the status query. Read-only; never mutates
/// engine state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeStatus {
    pub state: ExchangeState,
    pub partition: u64,
    pub wire_version: crate::config::WireVersion,
    pub trees_built: u8,
}

impl std::fmt::Display for ExchangeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "partition {} in {} (wire {}, {}/2 trees built)",
            self.partition, self.state, self.wire_version, self.trees_built
        )
    }
}

/// Terminal reports sent to the owning fullsync coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceReport {
    /// Every IndexN was exchanged; the partition is converged.
    FullsyncComplete { partition: u64 },
    /// The exchange ended early.
    Error {
        partition: u64,
        reason: ExchangeError,
    },
}
