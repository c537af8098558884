//! Diagnostic counters shared by the router and workers

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Rate for warn-level logs of per-record problems
pub const WARN_EVERY: u64 = 1_000;

#[derive(Debug, Default)]
pub struct PipelineStats {
    records_in: AtomicU64,
    malformed_records: AtomicU64,
    late_events: AtomicU64,
    windows_emitted: AtomicU64,
    windows_reopened: AtomicU64,
    checkpoints: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub records_in: u64,
    pub malformed_records: u64,
    pub late_events: u64,
    pub windows_emitted: u64,
    pub windows_reopened: u64,
    pub checkpoints: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the new total
    pub fn record_in(&self) -> u64 {
        self.records_in.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_malformed(&self) -> u64 {
        self.malformed_records.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_late(&self) -> u64 {
        self.late_events.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_emitted(&self) -> u64 {
        self.windows_emitted.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_reopened(&self) -> u64 {
        self.windows_reopened.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_checkpoint(&self) -> u64 {
        self.checkpoints.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            records_in: self.records_in.load(Ordering::Relaxed),
            malformed_records: self.malformed_records.load(Ordering::Relaxed),
            late_events: self.late_events.load(Ordering::Relaxed),
            windows_emitted: self.windows_emitted.load(Ordering::Relaxed),
            windows_reopened: self.windows_reopened.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
        }
    }
}

/// Whether the `count`-th occurrence should be logged at warn level
pub fn should_warn(count: u64) -> bool {
    count == 1 || count % WARN_EVERY == 0
}
