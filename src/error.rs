// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the fullsync engine.
//!
//! This module defines the error types used by the exchange engine and
//! the Merkle helper. Errors are categorized by their source (lock
//! negotiation, transport, tree service, helper sub-tasks) and include
//! context to help with debugging.
//!
//! # Error Categories
//!
//! | Error Type | Fatal | Description |
//! |------------|-------|-------------|
//! | `LockFailed` | Yes | Local fullsync-source lock rejected |
//! | `RemoteLock` | Yes | Sink rejected `LOCK_TREE` |
//! | `NotResponsible` | Yes | Tree service does not own the IndexN |
//! | `SomethingWentDown` | Yes | Monitored tree process exited |
//! | `Transport` | Yes | Framed send/receive failed or reply malformed |
//! | `Timeout` | Yes | No event within `anti_entropy_timeout` |
//! | `Protocol` | Yes | Sink reply violated the wire contract |
//!
//! # Propagation
//!
//! Every fatal error terminates the current engine instance: it is sent
//! to the owning coordinator as a [`SourceReport`](crate::exchange::SourceReport)
//! and returned from the engine task. The engine never retries
//! internally; retries are a coordinator-level policy.

use crate::vnode::IndexN;
use thiserror::Error;

/// Result type alias for exchange operations.
pub type Result<T> = std::result::Result<T, ExchangeError>;

/// Errors that terminate a partition exchange.
///
/// All variants are fatal to the current engine instance. Object fetch
/// misses during diff replication are *not* errors: the key is skipped
/// and logged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    /// The local hash tree rejected the fullsync-source lock.
    #[error("local tree lock failed: {0}")]
    LockFailed(String),

    /// The sink replied to `LOCK_TREE` with something other than `ok`.
    #[error("remote tree lock rejected: {0}")]
    RemoteLock(String),

    /// The tree service (local or remote) reported it does not own
    /// the requested preflist range.
    #[error("not responsible for partition {partition} index {index_n}")]
    NotResponsible { partition: u64, index_n: IndexN },

    /// The monitored local tree process exited.
    #[error("something went down")]
    SomethingWentDown,

    /// The framed transport failed while sending or awaiting a reply.
    #[error("transport failure: {0}")]
    Transport(String),

    /// No event arrived within the per-state `anti_entropy_timeout`.
    #[error("exchange timed out waiting for {waiting_for}")]
    Timeout { waiting_for: &'static str },

    /// The sink sent a frame that violates the wire contract
    /// (wrong tag, undecodable term, unexpected reply kind).
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl ExchangeError {
    /// Create a transport error from any I/O failure.
    pub fn transport(e: impl std::fmt::Display) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<std::io::Error> for ExchangeError {
    fn from(e: std::io::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

/// Errors terminating a Merkle helper operation.
///
/// Each helper operation posts exactly one terminal event to its owner;
/// these are the failure payloads.
#[derive(Error, Debug)]
pub enum HelperError {
    /// The partition's owner node is not currently reachable.
    #[error("node not available")]
    NodeNotAvailable,

    /// Building the on-disk Merkle map failed.
    #[error("merkle build failed: {0}")]
    MerkleFailed(String),

    /// Building or sorting the keylist file failed.
    #[error("keylist build failed: {0}")]
    KeylistFailed(String),

    /// A converted keylist came out unsorted.
    #[error("conversion produced unsorted output: {0}")]
    Unsorted(String),

    /// The vnode fold task died before finishing.
    #[error("fold worker failed: {0}")]
    FoldFailed(String),

    /// File I/O failure on a key-hash stream.
    #[error("keyfile io error: {0}")]
    Io(#[from] std::io::Error),
}
