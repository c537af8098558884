//! # Windowed Swap Aggregation Pipeline
//!
//! Event-time, out-of-order tolerant, checkpointed aggregation of swap events
//! into per-pair tumbling-window summaries.
//!
//! ## Architecture
//!
//! ```text
//! SwapSource (partitioned, offset-addressed)
//!     ↓
//! PipelineRuntime (decode → validate → WatermarkTracker → hash(pair))
//!     ↓                                   ↓ barrier every SNAPSHOT_INTERVAL_MS
//! PartitionWorker × PARALLELISM           SnapshotStore (Checkpoint)
//!     ↓
//! WindowManager (WindowKey → SwapAccumulator, OPEN → SEALED → EMITTED)
//!     ↓
//! AnalyticsSink → JSONL | SQLite | channel
//! ```
//!
//! ## Key Principles
//!
//! - Event time comes from the block timestamp, never arrival order.
//! - A window seals once the global watermark (minimum across source
//!   partitions) reaches its end; it is finalized and emitted exactly once.
//! - Accumulators combine associatively and commutatively, so partial state
//!   restored from a checkpoint can be regrouped onto any parallelism.
//! - Each pair is owned by exactly one worker; no locks guard window state.
//!
//! ## Module Organization
//!
//! - `types` - Wire records (SwapEvent, AggregatedAnalytics) and keys
//! - `watermark` - Per-partition watermark tracking
//! - `assigner` - Window assignment and partition hashing
//! - `accumulator` - Mergeable per-window summary state
//! - `windows` - Window lifecycle manager
//! - `late_policy` - Late event handling
//! - `sink` / `db` - Emission boundary backends
//! - `source` - Input boundary backends
//! - `snapshot` - Checkpoint persistence
//! - `ingestion` - Per-partition worker loop
//! - `runtime` - Router, barriers and shutdown

pub mod accumulator;
pub mod assigner;
pub mod backoff;
pub mod config;
pub mod db;
pub mod error;
pub mod ingestion;
pub mod late_policy;
pub mod runtime;
pub mod sink;
pub mod snapshot;
pub mod source;
pub mod stats;
pub mod types;
pub mod watermark;
pub mod windows;

// Re-export commonly used types
pub use accumulator::SwapAccumulator;
pub use assigner::WindowAssigner;
pub use config::{PipelineConfig, SinkBackend};
pub use db::{AnalyticsSummary, SqliteAnalyticsSink};
pub use error::PipelineError;
pub use late_policy::LatePolicy;
pub use runtime::{PipelineRuntime, RunSummary, StopReason};
pub use sink::{AnalyticsSink, ChannelSink, JsonlAnalyticsSink, SinkError};
pub use snapshot::{Checkpoint, FileSnapshotStore, SnapshotStore};
pub use source::{JsonlPartitionSource, MemorySource, SourceEvent, SwapSource};
pub use stats::{PipelineStats, StatsSnapshot};
pub use types::{AggregatedAnalytics, OrderKey, ParsedSwap, SwapDirection, SwapEvent, WindowKey};
pub use watermark::WatermarkTracker;
pub use windows::{MergeOutcome, WindowManager, WindowState};
