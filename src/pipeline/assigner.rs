//! Key and window assignment
//!
//! Every event maps to exactly one tumbling window aligned to the epoch, and
//! every pair maps to exactly one worker partition.

use super::types::{ParsedSwap, WindowKey};

/// Fixed window length (5 minutes)
pub const WINDOW_LENGTH_SECS: i64 = 300;

/// Tumbling event-time window assigner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowAssigner {
    length_secs: i64,
}

impl WindowAssigner {
    pub fn new(length_secs: i64) -> Self {
        Self {
            length_secs: length_secs.max(1),
        }
    }


    /// Half-open `[start, end)` bounds of the window containing `event_time`
    pub fn bounds(&self, event_time: i64) -> (i64, i64) {
        let start = event_time.div_euclid(self.length_secs) * self.length_secs;
        (start, start + self.length_secs)
    }

    pub fn assign(&self, swap: &ParsedSwap) -> WindowKey {
        let (window_start, window_end) = self.bounds(swap.event_time());
        WindowKey {
            pair_address: swap.pair_address.clone(),
            window_start,
            window_end,
        }
    }
}

impl Default for WindowAssigner {
    fn default() -> Self {
        Self::new(WINDOW_LENGTH_SECS)
    }
}

/// Worker partition owning `key`
///
/// FNV-1a over the key bytes; stable across processes and restarts.
pub fn partition_for(key: &str, partitions: usize) -> usize {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    if partitions <= 1 {
        return 0;
    }
    let hash = key
        .as_bytes()
        .iter()
        .fold(OFFSET, |acc, b| (acc ^ u64::from(*b)).wrapping_mul(PRIME));
    (hash % partitions as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_align_to_epoch() {
        let assigner = WindowAssigner::default();
        assert_eq!(assigner.bounds(0), (0, 300));
        assert_eq!(assigner.bounds(299), (0, 300));
        assert_eq!(assigner.bounds(1700000123), (1700000100, 1700000400));
    }

    #[test]
    fn test_window_end_belongs_to_next_window() {
        let assigner = WindowAssigner::default();
        let (_, end) = assigner.bounds(120);
        assert_eq!(end, 300);
        assert_eq!(assigner.bounds(end), (300, 600));
    }

    #[test]
    fn test_negative_times_floor() {
        let assigner = WindowAssigner::default();
        assert_eq!(assigner.bounds(-1), (-300, 0));
        assert_eq!(assigner.bounds(-300), (-300, 0));
    }

    #[test]
    fn test_partition_for_is_stable_and_in_range() {
        let pairs = ["0xaaa", "0xbbb", "0xccc", "0xddd", "0xeee"];
        for pair in pairs {
            let p = partition_for(pair, 4);
            assert!(p < 4);
            assert_eq!(p, partition_for(pair, 4));
        }
        assert_eq!(partition_for("0xaaa", 1), 0);
        assert_eq!(partition_for("0xaaa", 0), 0);
    }

    #[test]
    fn test_partition_for_spreads_keys() {
        let used: std::collections::HashSet<usize> = (0..64)
            .map(|i| partition_for(&format!("0x{:040x}", i), 4))
            .collect();
        assert_eq!(used.len(), 4);
    }
}
