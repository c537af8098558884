//! Window lifecycle manager
//!
//! Owns every accumulator of one worker partition, addressed by `WindowKey`.
//! Each window moves `Open → Sealed → Emitted → discarded`:
//!
//! - Open: accepts merges
//! - Sealed: global watermark reached `window_end`
//! - Emitted: `finalize` ran once and the record was handed out
//! - discarded: removed immediately under `LatePolicy::Drop`, or once the
//!   watermark passes `window_end + retention` under `LatePolicy::Reopen`

use super::accumulator::SwapAccumulator;
use super::assigner::WindowAssigner;
use super::error::PipelineError;
use super::late_policy::{LateAction, LatePolicy};
use super::snapshot::{PartitionState, WindowSnapshot};
use super::types::{AggregatedAnalytics, ParsedSwap, WindowKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WindowState {
    Open,
    Sealed,
    Emitted,
}

#[derive(Debug, Clone)]
struct WindowSlot {
    state: WindowState,
    accumulator: SwapAccumulator,
}

/// Result of processing one swap
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    Merged,
    /// Late swap merged into a retained window; corrected record to emit
    Reopened(AggregatedAnalytics),
    DroppedLate,
}

pub struct WindowManager {
    assigner: WindowAssigner,
    policy: LatePolicy,
    slots: HashMap<WindowKey, WindowSlot>,
    watermark: Option<i64>,
    late_events: u64,
    reopened: u64,
    /// Emission timestamp source, epoch millis (for testing)
    now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl WindowManager {
    pub fn new(assigner: WindowAssigner, policy: LatePolicy) -> Self {
        Self::with_clock(
            assigner,
            policy,
            Box::new(|| chrono::Utc::now().timestamp_millis()),
        )
    }

    pub fn with_clock(
        assigner: WindowAssigner,
        policy: LatePolicy,
        now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
    ) -> Self {
        Self {
            assigner,
            policy,
            slots: HashMap::new(),
            watermark: None,
            late_events: 0,
            reopened: 0,
            now_fn,
        }
    }

    pub fn policy(&self) -> LatePolicy {
        self.policy
    }

    pub fn watermark(&self) -> Option<i64> {
        self.watermark
    }

    /// Late events dropped so far
    pub fn late_events(&self) -> u64 {
        self.late_events
    }

    pub fn reopened_windows(&self) -> u64 {
        self.reopened
    }

    pub fn open_windows(&self) -> usize {
        self.slots
            .values()
            .filter(|s| s.state == WindowState::Open)
            .count()
    }

    /// Emitted windows still held for late corrections
    pub fn retained_windows(&self) -> usize {
        self.slots
            .values()
            .filter(|s| s.state == WindowState::Emitted)
            .count()
    }

    pub fn state(&self, key: &WindowKey) -> Option<WindowState> {
        self.slots.get(key).map(|s| s.state)
    }

    /// Route one swap to its window
    ///
    /// Errors are record-local: the affected accumulator is left unchanged.
    pub fn process(&mut self, swap: &ParsedSwap) -> Result<MergeOutcome, PipelineError> {
        let key = self.assigner.assign(swap);
        match self.policy.classify(key.window_end, self.watermark) {
            LateAction::Accept => {
                self.merge_into(&key, swap, WindowState::Open)?;
                Ok(MergeOutcome::Merged)
            }
            LateAction::Drop => {
                self.late_events += 1;
                log::debug!(
                    "⏰ Late swap {} for {} dropped (watermark {:?})",
                    swap.event_id,
                    key,
                    self.watermark
                );
                Ok(MergeOutcome::DroppedLate)
            }
            LateAction::Reopen => {
                self.merge_into(&key, swap, WindowState::Emitted)?;
                let processed_at = (self.now_fn)();
                match self.slots.get(&key).and_then(|s| s.accumulator.finalize(processed_at)) {
                    Some(record) => {
                        self.reopened += 1;
                        log::debug!("🔁 Reopened {} for late swap {}", key, swap.event_id);
                        Ok(MergeOutcome::Reopened(record))
                    }
                    None => Ok(MergeOutcome::Merged),
                }
            }
        }
    }

    fn merge_into(
        &mut self,
        key: &WindowKey,
        swap: &ParsedSwap,
        state_if_new: WindowState,
    ) -> Result<(), PipelineError> {
        if let Some(slot) = self.slots.get_mut(key) {
            return slot.accumulator.merge(swap);
        }
        let mut accumulator = SwapAccumulator::new(key.clone());
        accumulator.merge(swap)?;
        self.slots.insert(
            key.clone(),
            WindowSlot {
                state: state_if_new,
                accumulator,
            },
        );
        Ok(())
    }

    /// Seal every open window whose end the watermark reached
    ///
    /// Regressions are ignored. Returns the sealed keys in emission order
    /// (window end, then pair).
    pub fn seal(&mut self, watermark: i64) -> Vec<WindowKey> {
        if matches!(self.watermark, Some(current) if watermark <= current) {
            return Vec::new();
        }
        self.watermark = Some(watermark);

        let mut sealed: Vec<WindowKey> = self
            .slots
            .iter()
            .filter(|(key, slot)| slot.state == WindowState::Open && key.window_end <= watermark)
            .map(|(key, _)| key.clone())
            .collect();
        sealed.sort_by(|a, b| {
            (a.window_end, &a.pair_address).cmp(&(b.window_end, &b.pair_address))
        });
        for key in &sealed {
            if let Some(slot) = self.slots.get_mut(key) {
                slot.state = WindowState::Sealed;
            }
        }
        sealed
    }

    /// Finalize every sealed window exactly once and discard expired slots
    pub fn emit_sealed(&mut self, keys: &[WindowKey]) -> Vec<AggregatedAnalytics> {
        let processed_at = (self.now_fn)();
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(slot) = self.slots.get_mut(key) {
                if slot.state != WindowState::Sealed {
                    continue;
                }
                if let Some(record) = slot.accumulator.finalize(processed_at) {
                    records.push(record);
                }
                slot.state = WindowState::Emitted;
            }
        }
        self.discard_expired();
        records
    }

    /// Seal and emit in one step
    pub fn advance_watermark(&mut self, watermark: i64) -> Vec<AggregatedAnalytics> {
        let sealed = self.seal(watermark);
        if sealed.is_empty() {
            self.discard_expired();
            return Vec::new();
        }
        self.emit_sealed(&sealed)
    }

    fn discard_expired(&mut self) {
        let Some(watermark) = self.watermark else {
            return;
        };
        let policy = self.policy;
        self.slots.retain(|key, slot| {
            slot.state != WindowState::Emitted || policy.discard_at(key.window_end) > watermark
        });
    }

    /// Capture every retained accumulator, sorted by key
    pub fn export_state(&self) -> PartitionState {
        let mut windows: Vec<WindowSnapshot> = self
            .slots
            .values()
            .map(|slot| WindowSnapshot {
                state: slot.state,
                accumulator: slot.accumulator.clone(),
            })
            .collect();
        windows.sort_by(|a, b| a.accumulator.window().cmp(b.accumulator.window()));
        PartitionState {
            watermark: self.watermark,
            windows,
        }
    }

    /// Merge restored state in; overlapping windows are combined
    pub fn absorb(&mut self, state: PartitionState) -> Result<(), PipelineError> {
        self.watermark = self.watermark.max(state.watermark);
        for window in state.windows {
            let key = window.accumulator.window().clone();
            let slot = match self.slots.remove(&key) {
                Some(existing) => WindowSlot {
                    state: existing.state.max(window.state),
                    accumulator: existing.accumulator.combine(window.accumulator)?,
                },
                None => WindowSlot {
                    state: window.state,
                    accumulator: window.accumulator,
                },
            };
            self.slots.insert(key, slot);
        }
        Ok(())
    }

    /// Opaque state blob
    pub fn snapshot(&self) -> Result<Vec<u8>, PipelineError> {
        self.export_state().encode()
    }

    /// Replace all state with a blob produced by `snapshot`
    pub fn restore(&mut self, blob: &[u8]) -> Result<(), PipelineError> {
        let state = PartitionState::decode(blob)?;
        self.slots.clear();
        self.watermark = None;
        self.absorb(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::OrderKey;
    use crate::pipeline::types::dec;
    use bigdecimal::{BigDecimal, Zero};

    fn swap(pair: &str, t: i64, price: f64, sender: &str) -> ParsedSwap {
        ParsedSwap {
            event_id: format!("{}-{}", pair, t),
            transaction_hash: format!("0xtx{}", t),
            order: OrderKey {
                event_time: t,
                log_index: 0,
                block_number: t,
            },
            pair_address: pair.to_string(),
            token0: "0xt0".to_string(),
            token1: "0xt1".to_string(),
            token0_symbol: None,
            token1_symbol: None,
            sender: sender.to_string(),
            recipient: sender.to_string(),
            amount0_in: dec("5"),
            amount1_in: BigDecimal::zero(),
            amount0_out: BigDecimal::zero(),
            amount1_out: dec("1"),
            price,
            volume_usd: Some(dec("5")),
            gas_used: 21_000,
            gas_price: dec("1"),
            ingested_at: t,
        }
    }

    fn manager(policy: LatePolicy) -> WindowManager {
        WindowManager::with_clock(WindowAssigner::default(), policy, Box::new(|| 1_000))
    }

    fn key(pair: &str, start: i64) -> WindowKey {
        WindowKey {
            pair_address: pair.to_string(),
            window_start: start,
            window_end: start + 300,
        }
    }

    #[test]
    fn test_window_emits_once_watermark_reaches_end() {
        let mut windows = manager(LatePolicy::Drop);
        windows.process(&swap("0xp", 0, 10.0, "0xa")).unwrap();
        windows.process(&swap("0xp", 120, 12.0, "0xb")).unwrap();
        windows.process(&swap("0xp", 240, 11.0, "0xc")).unwrap();

        assert!(windows.advance_watermark(299).is_empty());
        assert_eq!(windows.state(&key("0xp", 0)), Some(WindowState::Open));

        let records = windows.advance_watermark(300);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].twap, 11.0);
        assert_eq!(records[0].processed_at, 1_000);
        // Emitted windows are discarded immediately under drop
        assert_eq!(windows.state(&key("0xp", 0)), None);

        assert!(windows.advance_watermark(900).is_empty());
    }

    #[test]
    fn test_seal_marks_state_before_emit() {
        let mut windows = manager(LatePolicy::Drop);
        windows.process(&swap("0xp", 10, 1.0, "0xa")).unwrap();
        let sealed = windows.seal(300);
        assert_eq!(sealed, vec![key("0xp", 0)]);
        assert_eq!(windows.state(&key("0xp", 0)), Some(WindowState::Sealed));

        let records = windows.emit_sealed(&sealed);
        assert_eq!(records.len(), 1);
        // A second emit of the same key produces nothing
        assert!(windows.emit_sealed(&sealed).is_empty());
    }

    #[test]
    fn test_event_at_window_end_opens_next_window() {
        let mut windows = manager(LatePolicy::Drop);
        windows.process(&swap("0xp", 300, 1.0, "0xa")).unwrap();
        assert_eq!(windows.state(&key("0xp", 300)), Some(WindowState::Open));
        assert_eq!(windows.state(&key("0xp", 0)), None);
        assert!(windows.advance_watermark(300).is_empty());
    }

    #[test]
    fn test_late_event_dropped_and_counted_once() {
        let mut windows = manager(LatePolicy::Drop);
        windows.process(&swap("0xp", 10, 1.0, "0xa")).unwrap();
        windows.advance_watermark(310);

        let outcome = windows.process(&swap("0xp", 20, 2.0, "0xb")).unwrap();
        assert_eq!(outcome, MergeOutcome::DroppedLate);
        assert_eq!(windows.late_events(), 1);
        assert_eq!(windows.open_windows(), 0);
    }

    #[test]
    fn test_regressed_watermark_is_ignored() {
        let mut windows = manager(LatePolicy::Drop);
        windows.process(&swap("0xp", 610, 1.0, "0xa")).unwrap();
        windows.advance_watermark(600);
        assert!(windows.advance_watermark(100).is_empty());
        assert_eq!(windows.watermark(), Some(600));
        // Window [0, 300) is still sealed for late events
        let outcome = windows.process(&swap("0xp", 5, 1.0, "0xa")).unwrap();
        assert_eq!(outcome, MergeOutcome::DroppedLate);
    }

    #[test]
    fn test_emission_order_by_end_then_pair() {
        let mut windows = manager(LatePolicy::Drop);
        windows.process(&swap("0xbb", 400, 1.0, "0xa")).unwrap();
        windows.process(&swap("0xbb", 10, 1.0, "0xa")).unwrap();
        windows.process(&swap("0xaa", 20, 1.0, "0xa")).unwrap();

        let ids: Vec<String> = windows
            .advance_watermark(600)
            .into_iter()
            .map(|r| r.window_id)
            .collect();
        assert_eq!(ids, vec!["0xaa_0", "0xbb_0", "0xbb_300"]);
    }

    #[test]
    fn test_reopen_re_emits_same_window_id() {
        let mut windows = manager(LatePolicy::Reopen { retention_secs: 300 });
        windows.process(&swap("0xp", 0, 10.0, "0xa")).unwrap();
        let first = windows.advance_watermark(300);
        assert_eq!(first[0].swap_count, 1);
        assert_eq!(windows.retained_windows(), 1);

        match windows.process(&swap("0xp", 150, 20.0, "0xb")).unwrap() {
            MergeOutcome::Reopened(record) => {
                assert_eq!(record.window_id, first[0].window_id);
                assert_eq!(record.swap_count, 2);
                assert_eq!(record.close_price, 20.0);
            }
            other => panic!("expected reopen, got {:?}", other),
        }
        assert_eq!(windows.reopened_windows(), 1);
        assert_eq!(windows.late_events(), 0);

        // Past retention the window is discarded and late swaps drop
        windows.advance_watermark(600);
        assert_eq!(windows.retained_windows(), 0);
        assert_eq!(
            windows.process(&swap("0xp", 200, 1.0, "0xc")).unwrap(),
            MergeOutcome::DroppedLate
        );
        assert_eq!(windows.late_events(), 1);
    }

    #[test]
    fn test_rejected_swap_leaves_window_unchanged() {
        let mut windows = manager(LatePolicy::Drop);
        let mut bad = swap("0xp", 10, 1.0, "0xa");
        bad.gas_used = u64::MAX;
        windows.process(&bad).unwrap();
        bad.order.log_index = 1;
        assert!(windows.process(&bad).is_err());
        assert_eq!(windows.open_windows(), 1);
        let records = windows.advance_watermark(300);
        assert_eq!(records[0].swap_count, 1);
    }

    #[test]
    fn test_snapshot_restore_preserves_open_windows() {
        let mut windows = manager(LatePolicy::Drop);
        windows.process(&swap("0xp", 10, 1.0, "0xa")).unwrap();
        windows.process(&swap("0xq", 20, 2.0, "0xb")).unwrap();
        windows.advance_watermark(5);
        let blob = windows.snapshot().unwrap();

        let mut restored = manager(LatePolicy::Drop);
        restored.restore(&blob).unwrap();
        assert_eq!(restored.watermark(), Some(5));
        assert_eq!(restored.open_windows(), 2);
        assert_eq!(restored.export_state(), windows.export_state());

        restored.process(&swap("0xp", 30, 3.0, "0xc")).unwrap();
        windows.process(&swap("0xp", 30, 3.0, "0xc")).unwrap();
        assert_eq!(restored.advance_watermark(300), windows.advance_watermark(300));
    }

    #[test]
    fn test_restore_rejects_corrupt_blob() {
        let mut windows = manager(LatePolicy::Drop);
        assert!(matches!(
            windows.restore(b"not a snapshot"),
            Err(PipelineError::Restore(_))
        ));
    }

    #[test]
    fn test_absorb_combines_overlapping_windows() {
        let mut left = manager(LatePolicy::Drop);
        left.process(&swap("0xp", 10, 1.0, "0xa")).unwrap();
        let mut right = manager(LatePolicy::Drop);
        right.process(&swap("0xp", 50, 3.0, "0xb")).unwrap();

        left.absorb(right.export_state()).unwrap();
        let records = left.advance_watermark(300);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].swap_count, 2);
        assert_eq!(records[0].unique_traders, 2);
    }
}
