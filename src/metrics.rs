//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Exchange lifecycle (started/completed/failed)
//! - Divergent keys found and objects repaired
//! - Merkle helper operations
//!
//! All metrics are prefixed with `fullsync_` and follow Prometheus
//! conventions: counters end in `_total`, histograms track durations.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record an exchange starting for a partition.
pub fn record_exchange_started(partition: u64) {
    counter!("fullsync_exchanges_started_total", "partition" => partition.to_string())
        .increment(1);
}

/// Record an exchange finishing, successfully or not.
pub fn record_exchange_finished(partition: u64, outcome: &str, duration: Duration) {
    counter!(
        "fullsync_exchanges_finished_total",
        "partition" => partition.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("fullsync_exchange_duration_seconds", "outcome" => outcome.to_string())
        .record(duration.as_secs_f64());
}

/// Record the engine's current FSM state.
pub fn set_exchange_state(partition: u64, state: &str) {
    gauge!("fullsync_exchange_state", "partition" => partition.to_string(), "state" => state.to_string())
        .set(1.0);
}

/// Record objects repaired (sent as `PUT_OBJ`) for one IndexN.
pub fn record_keys_repaired(partition: u64, count: u64) {
    counter!("fullsync_keys_repaired_total", "partition" => partition.to_string())
        .increment(count);
}

/// Record a divergent key that could not be fetched locally.
pub fn record_fetch_miss(partition: u64) {
    counter!("fullsync_fetch_misses_total", "partition" => partition.to_string()).increment(1);
}

/// Record a Merkle helper operation finishing.
pub fn record_helper_op(op: &str, outcome: &str, duration: Duration) {
    counter!(
        "fullsync_helper_ops_total",
        "op" => op.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("fullsync_helper_op_duration_seconds", "op" => op.to_string())
        .record(duration.as_secs_f64());
}

/// Record keys that differed during a keyfile diff.
pub fn record_diff_keys(partition: u64, count: u64) {
    counter!("fullsync_diff_keys_total", "partition" => partition.to_string()).increment(count);
}
