//! Configuration for the fullsync engine.
//!
//! This module defines all configuration types needed to run a
//! partition exchange and the Merkle helper. Configuration is passed to
//! [`ExchangeEngine::spawn()`](crate::exchange::ExchangeEngine::spawn)
//! and can be constructed programmatically or deserialized from
//! YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use fullsync_engine::config::FullsyncConfig;
//!
//! let config = FullsyncConfig {
//!     cluster_name: "site-b".into(),
//!     ..Default::default()
//! };
//! assert_eq!(config.exchange.anti_entropy_timeout_ms, 300_000);
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! cluster_name: "site-b"
//!
//! exchange:
//!   anti_entropy_timeout_ms: 300000
//!
//! merkle:
//!   buffer_size: 1048576
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Wire protocol versions understood by the object encoder.
///
/// AAE fullsync requires `W1`; older wire versions predate hash-tree
/// exchange and are rejected by the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireVersion {
    /// Original object framing, no AAE support.
    W0,
    /// Versioned object framing used by AAE fullsync.
    W1,
}

impl WireVersion {
    /// Whether this wire version can carry AAE diff objects.
    pub fn supports_aae(self) -> bool {
        matches!(self, WireVersion::W1)
    }
}

impl std::fmt::Display for WireVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireVersion::W0 => write!(f, "w0"),
            WireVersion::W1 => write!(f, "w1"),
        }
    }
}

/// Top-level configuration for a fullsync source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullsyncConfig {
    /// Name of the remote cluster this source replicates to.
    pub cluster_name: String,

    /// Exchange engine tunables.
    #[serde(default)]
    pub exchange: ExchangeConfig,

    /// Merkle helper tunables.
    #[serde(default)]
    pub merkle: MerkleConfig,
}

impl Default for FullsyncConfig {
    fn default() -> Self {
        Self {
            cluster_name: "remote".to_string(),
            exchange: ExchangeConfig::default(),
            merkle: MerkleConfig::default(),
        }
    }
}

impl FullsyncConfig {
    /// Create a minimal config for testing with a short timeout.
    pub fn for_testing(cluster_name: &str) -> Self {
        Self {
            cluster_name: cluster_name.to_string(),
            exchange: ExchangeConfig {
                anti_entropy_timeout_ms: 5_000,
                ..ExchangeConfig::default()
            },
            merkle: MerkleConfig::default(),
        }
    }
}

/// Exchange engine tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// Per-state transition timeout (milliseconds).
    ///
    /// If the engine sits in one FSM state longer than this without an
    /// event, the exchange is aborted.
    #[serde(default = "default_anti_entropy_timeout_ms")]
    pub anti_entropy_timeout_ms: u64,

    /// Wire version used to encode diff objects. AAE requires `w1`.
    #[serde(default = "default_wire_version")]
    pub wire_version: WireVersion,

    /// Read quorum for divergent-object fetches.
    #[serde(default = "default_fetch_r")]
    pub fetch_r: u32,

    /// Timeout for a single divergent-object fetch (milliseconds).
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
}

fn default_anti_entropy_timeout_ms() -> u64 {
    300_000
}

fn default_wire_version() -> WireVersion {
    WireVersion::W1
}

fn default_fetch_r() -> u32 {
    1
}

fn default_fetch_timeout_ms() -> u64 {
    60_000
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            anti_entropy_timeout_ms: 300_000,
            wire_version: WireVersion::W1,
            fetch_r: 1,
            fetch_timeout_ms: 60_000,
        }
    }
}

impl ExchangeConfig {
    /// Per-state timeout as a [`Duration`].
    pub fn anti_entropy_timeout(&self) -> Duration {
        Duration::from_millis(self.anti_entropy_timeout_ms)
    }

    /// Object fetch timeout as a [`Duration`].
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

/// Merkle helper tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerkleConfig {
    /// Byte threshold for buffered writes when building a Merkle map.
    ///
    /// The fold buffers packed-key bytes (plus a 4-byte per-entry hash
    /// overhead) and flushes to the map file when the buffer exceeds
    /// this size.
    #[serde(default = "default_merkle_buffer_size")]
    pub buffer_size: usize,
}

fn default_merkle_buffer_size() -> usize {
    1024 * 1024
}

impl Default for MerkleConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1024 * 1024,
        }
    }
}
