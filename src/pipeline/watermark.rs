//! Per-partition watermark tracking
//!
//! Each source partition's watermark is `max(event time seen) - allowed
//! lateness`. The global watermark is the minimum over all registered
//! partitions, so a partition that has produced nothing holds sealing back
//! for everyone. Both are monotonic: regressions are ignored.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Allowed lateness before a window seals (30 seconds)
pub const ALLOWED_LATENESS_SECS: i64 = 30;

/// Sentinel for a partition that has not reported yet
const WATERMARK_UNSET: i64 = i64::MIN;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatermarkTracker {
    allowed_lateness: i64,
    partitions: BTreeMap<u32, i64>,
    global: Option<i64>,
}

impl WatermarkTracker {
    pub fn new(partitions: impl IntoIterator<Item = u32>, allowed_lateness: i64) -> Self {
        Self {
            allowed_lateness,
            partitions: partitions
                .into_iter()
                .map(|p| (p, WATERMARK_UNSET))
                .collect(),
            global: None,
        }
    }

    pub fn allowed_lateness(&self) -> i64 {
        self.allowed_lateness
    }

    /// Add a source partition; it withholds the global watermark until it reports
    pub fn register(&mut self, partition: u32) {
        self.partitions.entry(partition).or_insert(WATERMARK_UNSET);
    }

    /// Record an observed event time
    ///
    /// Returns the new global watermark when it advanced.
    pub fn observe(&mut self, partition: u32, event_time: i64) -> Option<i64> {
        self.advance_partition(partition, event_time.saturating_sub(self.allowed_lateness))
    }

    /// Record an explicit watermark tick from the transport
    pub fn observe_watermark(&mut self, partition: u32, watermark: i64) -> Option<i64> {
        self.advance_partition(partition, watermark)
    }

    fn advance_partition(&mut self, partition: u32, candidate: i64) -> Option<i64> {
        let slot = self.partitions.entry(partition).or_insert(WATERMARK_UNSET);
        if candidate <= *slot {
            return None;
        }
        *slot = candidate;
        self.recompute()
    }

    fn recompute(&mut self) -> Option<i64> {
        let min = self.partitions.values().copied().min()?;
        if min == WATERMARK_UNSET {
            return None;
        }
        match self.global {
            Some(current) if min <= current => None,
            _ => {
                self.global = Some(min);
                Some(min)
            }
        }
    }

    pub fn partition_watermark(&self, partition: u32) -> Option<i64> {
        self.partitions
            .get(&partition)
            .copied()
            .filter(|w| *w != WATERMARK_UNSET)
    }

    /// Global watermark used for sealing decisions
    pub fn current(&self) -> Option<i64> {
        self.global
    }

    pub fn partitions(&self) -> impl Iterator<Item = u32> + '_ {
        self.partitions.keys().copied()
    }
}
