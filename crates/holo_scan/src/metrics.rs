//! Per-scan resource counters and execution statistics.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

pub const CFILE_CACHE_HIT_BYTES: &str = "cfile_cache_hit_bytes";
pub const CFILE_CACHE_MISS_BYTES: &str = "cfile_cache_miss_bytes";
pub const BYTES_READ: &str = "bytes_read";
pub const ROWS_SCANNED: &str = "rows_scanned";

/// Named counters accumulated across every batch of one scan.
///
/// Cloning yields another handle to the same counters, so the metrics stay
/// readable after the scanner has been turned into a row stream.
#[derive(Debug, Clone, Default)]
pub struct ResourceMetrics {
    counters: Arc<Mutex<BTreeMap<String, u64>>>,
}

impl ResourceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `delta` to counter `name`, saturating at `u64::MAX`.
    pub fn increment(&self, name: &str, delta: u64) {
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let counter = counters.entry(name.to_string()).or_insert(0);
        *counter = counter.saturating_add(delta);
    }

    /// Folds a backend metrics delta into the totals.
    pub fn merge(&self, delta: &BTreeMap<String, u64>) {
        for (name, value) in delta {
            self.increment(name, *value);
        }
    }

    /// Returns a sorted copy of every counter.
    pub fn get(&self) -> BTreeMap<String, u64> {
        self.counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Returns one counter; unknown names read as zero.
    pub fn metric(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Renders counters as `name=value` lines.
    pub fn render_text(&self) -> String {
        self.get()
            .into_iter()
            .map(|(name, value)| format!("{name}={value}\n"))
            .collect()
    }
}

/// Execution statistics for one scan.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanStats {
    /// Batches fetched from the backend.
    pub rpc_pages: u64,
    /// Rows received from the backend, before duplicate suppression.
    pub rows_scanned: u64,
    pub rows_delivered: u64,
    pub bytes_scanned: u64,
    /// Recovery attempts after partition or replica failures.
    pub retries: u64,
    /// Recoveries that switched to another server or partition.
    pub reroutes: u64,
    pub partitions_visited: u64,
    pub duplicate_rows_skipped: u64,
    /// Waits for a snapshot timestamp to become safe.
    pub snapshot_waits: u64,
}
