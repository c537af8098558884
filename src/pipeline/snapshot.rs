//! Checkpoint persistence
//!
//! A checkpoint is taken at an in-band barrier, so every worker's partition
//! state reflects exactly the source records up to `positions`. Files are
//! written to a temp path and renamed into place, so a crash mid-write leaves
//! the previous checkpoint intact.

use super::accumulator::SwapAccumulator;
use super::assigner::partition_for;
use super::error::PipelineError;
use super::watermark::WatermarkTracker;
use super::windows::WindowState;
use super::types::WindowKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowSnapshot {
    pub state: WindowState,
    pub accumulator: SwapAccumulator,
}

/// Everything one worker partition owns
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionState {
    pub watermark: Option<i64>,
    pub windows: Vec<WindowSnapshot>,
}

impl PartitionState {
    pub fn encode(&self) -> Result<Vec<u8>, PipelineError> {
        serde_json::to_vec(self).map_err(|e| PipelineError::Snapshot(e.to_string()))
    }

    pub fn decode(blob: &[u8]) -> Result<Self, PipelineError> {
        serde_json::from_slice(blob).map_err(|e| PipelineError::Restore(e.to_string()))
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    /// Redistribute state captured at one parallelism onto `parallelism`
    /// workers by re-hashing each window's pair
    pub fn regroup(
        states: Vec<PartitionState>,
        parallelism: usize,
    ) -> Result<Vec<PartitionState>, PipelineError> {
        let parallelism = parallelism.max(1);
        let watermark = states.iter().filter_map(|s| s.watermark).max();
        let mut buckets: Vec<BTreeMap<WindowKey, WindowSnapshot>> =
            (0..parallelism).map(|_| BTreeMap::new()).collect();

        for window in states.into_iter().flat_map(|s| s.windows) {
            let key = window.accumulator.window().clone();
            let bucket = &mut buckets[partition_for(&key.pair_address, parallelism)];
            let merged = match bucket.remove(&key) {
                Some(existing) => WindowSnapshot {
                    state: existing.state.max(window.state),
                    accumulator: existing.accumulator.combine(window.accumulator)?,
                },
                None => window,
            };
            bucket.insert(key, merged);
        }

        Ok(buckets
            .into_iter()
            .map(|bucket| PartitionState {
                watermark,
                windows: bucket.into_values().collect(),
            })
            .collect())
    }
}

/// Atomic snapshot of the whole pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: u64,
    /// Wall clock, epoch millis
    pub created_at: i64,
    pub consumer_group: String,
    /// Next unread offset per source partition
    pub positions: BTreeMap<u32, u64>,
    pub watermarks: WatermarkTracker,
    /// Indexed by worker partition at the time of the checkpoint
    pub partitions: Vec<PartitionState>,
}

impl Checkpoint {
    pub fn open_windows(&self) -> usize {
        self.partitions
            .iter()
            .flat_map(|p| &p.windows)
            .filter(|w| w.state == WindowState::Open)
            .count()
    }
}

/// Durable checkpoint storage
pub trait SnapshotStore: Send + Sync {
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), PipelineError>;

    /// Latest checkpoint, or `None` on first start
    fn load(&self) -> Result<Option<Checkpoint>, PipelineError>;

    fn backend_type(&self) -> &'static str;
}

/// One JSON file per consumer group: `<dir>/<group>.checkpoint.json`
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl AsRef<Path>, consumer_group: &str) -> Result<Self, PipelineError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .map_err(|e| PipelineError::Snapshot(format!("{}: {}", dir.display(), e)))?;
        Ok(Self {
            path: dir.join(format!("{}.checkpoint.json", consumer_group)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), PipelineError> {
        let json = serde_json::to_vec_pretty(checkpoint)
            .map_err(|e| PipelineError::Snapshot(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .and_then(|_| fs::rename(&tmp, &self.path))
            .map_err(|e| PipelineError::Snapshot(format!("{}: {}", self.path.display(), e)))?;

        log::debug!("Saved checkpoint {} to {}", checkpoint.id, self.path.display());
        Ok(())
    }

    fn load(&self) -> Result<Option<Checkpoint>, PipelineError> {
        if !self.path.exists() {
            log::info!("No existing checkpoint found: {}", self.path.display());
            return Ok(None);
        }
        let json = fs::read(&self.path)
            .map_err(|e| PipelineError::Restore(format!("{}: {}", self.path.display(), e)))?;
        let checkpoint: Checkpoint =
            serde_json::from_slice(&json).map_err(|e| PipelineError::Restore(e.to_string()))?;

        log::info!(
            "Loaded checkpoint {} ({} partitions, {} open windows) from {}",
            checkpoint.id,
            checkpoint.partitions.len(),
            checkpoint.open_windows(),
            self.path.display()
        );
        Ok(Some(checkpoint))
    }

    fn backend_type(&self) -> &'static str {
        "file"
    }
}
