//! Per-node execution counters.
//!
//! The plan records batches/rows emitted by every node and reports the totals
//! through `tracing` when the node stops. Counters are plain atomics so the
//! hot emit path never takes a lock.

use std::sync::atomic::{AtomicU64, Ordering};

/// Batch/row counters for a single exec node.
#[derive(Debug, Default)]
pub struct NodeMetrics {
    batches: AtomicU64,
    rows: AtomicU64,
}

impl NodeMetrics {
    /// Record one emitted batch carrying `rows` rows.
    pub fn record_batch(&self, rows: u64) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.rows.fetch_add(rows, Ordering::Relaxed);
    }

    /// Total batches emitted so far.
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    /// Total rows emitted so far.
    pub fn rows(&self) -> u64 {
        self.rows.load(Ordering::Relaxed)
    }
}
