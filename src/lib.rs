//! # Fullsync Engine
//!
//! The active anti-entropy (AAE) fullsync **source** of a distributed
//! key-value replication system: it brings a remote cluster's
//! partition into convergence with the local one by exchanging
//! hash-tree summaries and streaming divergent objects to the sink.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                           fullsync-engine                            │
//! │                                                                      │
//! │  ┌────────────────┐    ┌───────────────────┐    ┌────────────────┐   │
//! │  │ ExchangeEngine │───►│ comparison worker │───►│ PUT_OBJ stream │   │
//! │  │ (per-partition │    │ (bucket/segment   │    │ (divergent     │   │
//! │  │  FSM)          │    │  walk over socket)│    │  objects)      │   │
//! │  └────────────────┘    └───────────────────┘    └────────────────┘   │
//! │         │                                                            │
//! │         ▼                                                            │
//! │  ┌────────────────┐                       ┌─────────────────────┐    │
//! │  │ MerkleHelper   │                       │ CascadeTopology     │    │
//! │  │ (keyfile build │                       │ (next-hop selection │    │
//! │  │  and diff)     │                       │  over cascade graph)│    │
//! │  └────────────────┘                       └─────────────────────┘    │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Three Subsystems
//!
//! 1. **Exchange engine** ([`exchange`]): a per-partition finite state
//!    machine (Prepare → UpdateTrees → KeyExchange) over one framed
//!    transport, with explicit socket-ownership handoff to the
//!    comparison worker.
//! 2. **Merkle helper** ([`merkle`]): one-shot builder and differ of
//!    on-disk sorted key/hash files for legacy sinks.
//! 3. **Cascade topology** ([`cascade`]): a directed cluster graph
//!    answering tie-broken next-hop queries.
//!
//! The hash-tree subsystem and the vnode storage layer stay external;
//! the host provides them through the [`tree::HashTreeService`] and
//! [`vnode::VnodeService`] traits.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use fullsync_engine::{ExchangeEngine, FullsyncConfig, Transport};
//! use fullsync_engine::object::NoOpReplHelper;
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//!
//! # async fn example(
//! #     tree_service: Arc<dyn fullsync_engine::tree::HashTreeService>,
//! #     vnode: Arc<dyn fullsync_engine::vnode::VnodeService>,
//! # ) -> fullsync_engine::Result<()> {
//! let transport = Transport::connect("10.0.0.7:9803".parse().unwrap()).await?;
//! let (reports_tx, mut reports_rx) = mpsc::channel(8);
//!
//! let handle = ExchangeEngine::spawn(
//!     1_096_126_227,
//!     FullsyncConfig::default(),
//!     transport,
//!     tree_service,
//!     vnode,
//!     Arc::new(NoOpReplHelper),
//!     reports_tx,
//! )
//! .await?;
//!
//! handle.start_exchange().await;
//! let _report = reports_rx.recv().await;
//! # Ok(())
//! # }
//! ```

pub mod cascade;
pub mod config;
pub mod error;
pub mod exchange;
pub mod merkle;
pub mod metrics;
pub mod object;
pub mod transport;
pub mod tree;
pub mod vnode;
pub mod wire;

// Re-exports for convenience
pub use cascade::{CascadeGraph, CascadeTopology};
pub use config::{ExchangeConfig, FullsyncConfig, MerkleConfig, WireVersion};
pub use error::{ExchangeError, HelperError, Result};
pub use exchange::{ExchangeEngine, ExchangeHandle, ExchangeStatus, SourceReport};
pub use merkle::{HelperEvent, HelperReport, MerkleHelper, OpRef};
pub use transport::Transport;
pub use tree::{KeyDiff, TreeHandle};
pub use vnode::{BKey, IndexN};
