//! Pipeline runtime: router, checkpoints and shutdown
//!
//! The router is the single reader of the source. For each record it:
//! 1. advances the source position (malformed records included)
//! 2. decodes and validates the payload
//! 3. sends the swap to the worker owning its pair
//! 4. feeds the event time to the watermark tracker and broadcasts any
//!    advance of the global watermark to every worker
//!
//! Every `snapshot_interval_ms` it sends a barrier down each worker queue and
//! saves the replies together with the source positions and watermarks as one
//! `Checkpoint`.

use super::assigner::{partition_for, WindowAssigner};
use super::config::PipelineConfig;
use super::error::PipelineError;
use super::ingestion::{PartitionMessage, PartitionReport, PartitionWorker};
use super::sink::AnalyticsSink;
use super::snapshot::{Checkpoint, PartitionState, SnapshotStore};
use super::source::{SourceEvent, SwapSource};
use super::stats::{should_warn, PipelineStats, StatsSnapshot};
use super::types::{ParsedSwap, SwapEvent};
use super::watermark::WatermarkTracker;
use super::windows::WindowManager;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant};

/// Throughput log interval
const STATS_INTERVAL_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Shutdown signal received
    Shutdown,
    /// Source reported end of stream
    EndOfStream,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub stats: StatsSnapshot,
    pub stop_reason: StopReason,
    pub checkpoints: u64,
    pub last_checkpoint: Option<u64>,
    /// Next unread offset per source partition
    pub positions: BTreeMap<u32, u64>,
    /// Open windows left unsealed at stop
    pub open_windows: usize,
}

type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

pub struct PipelineRuntime {
    config: PipelineConfig,
    store: Box<dyn SnapshotStore>,
    stats: Arc<PipelineStats>,
    restored: Option<Checkpoint>,
    clock: Clock,
}

impl PipelineRuntime {
    /// Load the latest checkpoint, if any
    ///
    /// A checkpoint that cannot be read is fatal.
    pub fn new(config: PipelineConfig, store: Box<dyn SnapshotStore>) -> Result<Self, PipelineError> {
        let restored = store.load()?;
        if let Some(cp) = &restored {
            if cp.consumer_group != config.consumer_group {
                return Err(PipelineError::Restore(format!(
                    "checkpoint {} belongs to consumer group '{}', not '{}'",
                    cp.id, cp.consumer_group, config.consumer_group
                )));
            }
            log::info!(
                "♻️  Resuming from checkpoint {} ({} open windows, positions {:?})",
                cp.id,
                cp.open_windows(),
                cp.positions
            );
        }

        Ok(Self {
            config,
            store,
            stats: Arc::new(PipelineStats::new()),
            restored,
            clock: Arc::new(|| chrono::Utc::now().timestamp_millis()),
        })
    }

    /// Override the wall clock (epoch millis) used for `processedAt`
    pub fn with_clock(mut self, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Positions the source must resume from
    pub fn resume_positions(&self) -> BTreeMap<u32, u64> {
        self.restored
            .as_ref()
            .map(|cp| cp.positions.clone())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// Run until `shutdown` resolves or the source ends
    ///
    /// Open windows are abandoned at stop; with `final_checkpoint_on_stop`
    /// they are checkpointed first so the next run continues them.
    pub async fn run<S, F>(
        self,
        mut source: S,
        sink: Arc<dyn AnalyticsSink>,
        shutdown: F,
    ) -> Result<RunSummary, PipelineError>
    where
        S: SwapSource,
        F: Future<Output = ()>,
    {
        let PipelineRuntime {
            config,
            store,
            stats,
            restored,
            clock,
        } = self;
        let parallelism = config.parallelism.max(1);

        let (mut watermarks, positions, next_checkpoint, states) = match restored {
            Some(cp) => {
                let states = PartitionState::regroup(cp.partitions, parallelism)?;
                (cp.watermarks, cp.positions, cp.id + 1, states)
            }
            None => (
                WatermarkTracker::new(source.partitions(), config.allowed_lateness_secs),
                BTreeMap::new(),
                1,
                vec![PartitionState::default(); parallelism],
            ),
        };
        for partition in source.partitions() {
            watermarks.register(partition);
        }

        log::info!(
            "🚀 Starting pipeline: {} workers, {} source ({} partitions), {} sink, lateness {}s",
            parallelism,
            source.source_type(),
            source.partitions().len(),
            sink.backend_type(),
            watermarks.allowed_lateness()
        );

        let mut senders = Vec::with_capacity(parallelism);
        let mut handles: Vec<JoinHandle<Result<PartitionReport, PipelineError>>> =
            Vec::with_capacity(parallelism);
        for (index, state) in states.into_iter().enumerate() {
            let worker_clock = clock.clone();
            let mut windows = WindowManager::with_clock(
                WindowAssigner::new(config.window_secs),
                config.late_policy,
                Box::new(move || worker_clock()),
            );
            windows.absorb(state)?;
            let (tx, rx) = mpsc::channel(config.channel_buffer.max(1));
            let worker = PartitionWorker::new(index, windows, sink.clone(), stats.clone(), &config);
            handles.push(tokio::spawn(worker.run(rx)));
            senders.push(tx);
        }

        let mut router = Router {
            config: &config,
            store: &*store,
            stats: stats.clone(),
            clock,
            watermarks,
            positions,
            senders,
            next_checkpoint,
            checkpoints: 0,
            last_checkpoint: None,
        };

        let mut outcome = router.drive(&mut source, shutdown).await;
        if config.final_checkpoint_on_stop {
            if let Ok(reason) = outcome {
                outcome = router.checkpoint().await.map(|_| reason);
            }
        }

        // Closing the queues stops the workers after they drain
        let Router {
            senders,
            positions,
            checkpoints,
            last_checkpoint,
            ..
        } = router;
        drop(senders);

        let mut open_windows = 0;
        let mut worker_error = None;
        for (index, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(Ok(report)) => open_windows += report.open_windows,
                Ok(Err(e)) => {
                    log::error!("❌ Partition {} failed: {}", index, e);
                    worker_error.get_or_insert(e);
                }
                Err(e) => {
                    log::error!("❌ Partition {} panicked: {}", index, e);
                    worker_error.get_or_insert(PipelineError::WorkerStopped(index));
                }
            }
        }

        let stop_reason = match (outcome, worker_error) {
            (Ok(reason), None) => reason,
            // A stopped worker surfaces to the router as a closed queue
            (Ok(_), Some(e)) | (Err(PipelineError::WorkerStopped(_)), Some(e)) => return Err(e),
            (Err(e), _) => return Err(e),
        };

        let summary = RunSummary {
            stats: stats.snapshot(),
            stop_reason,
            checkpoints,
            last_checkpoint,
            positions,
            open_windows,
        };
        log::info!(
            "✅ Pipeline stopped ({:?}): {} records, {} malformed, {} late, {} windows emitted, {} open windows left",
            summary.stop_reason,
            summary.stats.records_in,
            summary.stats.malformed_records,
            summary.stats.late_events,
            summary.stats.windows_emitted,
            summary.open_windows
        );
        Ok(summary)
    }
}

struct Router<'a> {
    config: &'a PipelineConfig,
    store: &'a dyn SnapshotStore,
    stats: Arc<PipelineStats>,
    clock: Clock,
    watermarks: WatermarkTracker,
    positions: BTreeMap<u32, u64>,
    senders: Vec<mpsc::Sender<PartitionMessage>>,
    next_checkpoint: u64,
    checkpoints: u64,
    last_checkpoint: Option<u64>,
}

impl Router<'_> {
    async fn drive<S, F>(&mut self, source: &mut S, shutdown: F) -> Result<StopReason, PipelineError>
    where
        S: SwapSource,
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let period = Duration::from_millis(self.config.snapshot_interval_ms.max(1));
        let mut checkpoint_ticker = interval_at(Instant::now() + period, period);
        let stats_period = Duration::from_secs(STATS_INTERVAL_SECS);
        let mut stats_ticker = interval_at(Instant::now() + stats_period, stats_period);
        let mut last_records = self.stats.snapshot().records_in;

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    log::info!("🛑 Shutdown requested");
                    return Ok(StopReason::Shutdown);
                }

                _ = checkpoint_ticker.tick() => {
                    self.checkpoint().await?;
                }

                _ = stats_ticker.tick() => {
                    let snap = self.stats.snapshot();
                    let per_sec = (snap.records_in - last_records) as f64 / STATS_INTERVAL_SECS as f64;
                    last_records = snap.records_in;
                    log::info!(
                        "📊 Ingestion rate: {:.1} records/sec (total: {}, malformed: {}, late: {}, emitted: {}) | watermark: {:?}",
                        per_sec,
                        snap.records_in,
                        snap.malformed_records,
                        snap.late_events,
                        snap.windows_emitted,
                        self.watermarks.current()
                    );
                }

                event = source.next_event() => {
                    match event? {
                        Some(event) => self.route(event).await?,
                        None => {
                            log::info!("📭 Source reached end of stream");
                            return Ok(StopReason::EndOfStream);
                        }
                    }
                }
            }
        }
    }

    async fn route(&mut self, event: SourceEvent) -> Result<(), PipelineError> {
        let partition = event.partition();
        match event {
            SourceEvent::Record {
                offset, payload, ..
            } => {
                self.positions.insert(partition, offset + 1);
                self.stats.record_in();

                let swap = match SwapEvent::from_json(&payload).and_then(ParsedSwap::try_from) {
                    Ok(swap) => swap,
                    Err(e) => {
                        self.skip_malformed(partition, offset, &e);
                        return Ok(());
                    }
                };

                let event_time = swap.event_time();
                let worker = partition_for(&swap.pair_address, self.senders.len());
                self.send(worker, PartitionMessage::Swap(swap)).await?;

                if let Some(watermark) = self.watermarks.observe(partition, event_time) {
                    self.broadcast_watermark(watermark).await?;
                }
            }
            SourceEvent::Undecodable { offset, reason, .. } => {
                self.positions.insert(partition, offset + 1);
                self.stats.record_in();
                self.skip_malformed(partition, offset, &reason);
            }
            SourceEvent::Tick { watermark, .. } => {
                if let Some(watermark) = self.watermarks.observe_watermark(partition, watermark) {
                    self.broadcast_watermark(watermark).await?;
                }
            }
        }
        Ok(())
    }

    fn skip_malformed(&self, partition: u32, offset: u64, reason: &dyn std::fmt::Display) {
        let count = self.stats.record_malformed();
        if should_warn(count) {
            log::warn!(
                "⚠️  Skipping malformed record at {}:{}: {} (total malformed: {})",
                partition,
                offset,
                reason,
                count
            );
        }
    }

    async fn send(&self, worker: usize, message: PartitionMessage) -> Result<(), PipelineError> {
        self.senders[worker]
            .send(message)
            .await
            .map_err(|_| PipelineError::WorkerStopped(worker))
    }

    async fn broadcast_watermark(&self, watermark: i64) -> Result<(), PipelineError> {
        log::debug!("Global watermark advanced to {}", watermark);
        for worker in 0..self.senders.len() {
            self.send(worker, PartitionMessage::Watermark(watermark)).await?;
        }
        Ok(())
    }

    /// Aligned checkpoint across all workers
    async fn checkpoint(&mut self) -> Result<(), PipelineError> {
        let id = self.next_checkpoint;
        let mut replies = Vec::with_capacity(self.senders.len());
        for worker in 0..self.senders.len() {
            let (reply, state) = oneshot::channel();
            self.send(
                worker,
                PartitionMessage::Barrier {
                    checkpoint_id: id,
                    reply,
                },
            )
            .await?;
            replies.push(state);
        }

        let mut partitions = Vec::with_capacity(replies.len());
        for (worker, state) in replies.into_iter().enumerate() {
            partitions.push(state.await.map_err(|_| PipelineError::WorkerStopped(worker))?);
        }

        let checkpoint = Checkpoint {
            id,
            created_at: (self.clock)(),
            consumer_group: self.config.consumer_group.clone(),
            positions: self.positions.clone(),
            watermarks: self.watermarks.clone(),
            partitions,
        };
        self.store.save(&checkpoint)?;

        self.next_checkpoint += 1;
        self.checkpoints += 1;
        self.last_checkpoint = Some(id);
        self.stats.record_checkpoint();

        let per_partition: Vec<usize> = checkpoint
            .partitions
            .iter()
            .map(PartitionState::window_count)
            .collect();
        let source_watermarks: BTreeMap<u32, Option<i64>> = self
            .watermarks
            .partitions()
            .map(|p| (p, self.watermarks.partition_watermark(p)))
            .collect();
        log::info!(
            "💾 Checkpoint {} saved ({}): positions {:?}, windows per partition {:?}, source watermarks {:?}",
            id,
            self.store.backend_type(),
            checkpoint.positions,
            per_partition,
            source_watermarks
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::sink::ChannelSink;
    use crate::pipeline::snapshot::FileSnapshotStore;
    use crate::pipeline::source::MemorySource;
    use tempfile::TempDir;

    fn payload(pair: &str, t: i64, price: f64) -> String {
        serde_json::json!({
            "eventId": format!("{}-{}", pair, t),
            "blockNumber": 100 + t,
            "blockTimestamp": t,
            "transactionHash": "0xtx",
            "logIndex": 0,
            "pairAddress": pair,
            "token0": "0xT0",
            "token1": "0xT1",
            "sender": "0xS",
            "recipient": "0xS",
            "amount0In": "1",
            "amount1In": "0",
            "amount0Out": "0",
            "amount1Out": "2",
            "price": price,
            "gasUsed": 100,
            "gasPrice": "3",
            "eventTimestamp": t + 1,
        })
        .to_string()
    }

    fn runtime(dir: &TempDir, config: PipelineConfig) -> PipelineRuntime {
        let store = FileSnapshotStore::new(dir.path(), &config.consumer_group).unwrap();
        PipelineRuntime::new(config, Box::new(store))
            .unwrap()
            .with_clock(|| 1_000)
    }

    #[tokio::test]
    async fn test_router_counts_malformed_and_advances_positions() {
        let dir = TempDir::new().unwrap();
        let source = MemorySource::from_payloads(
            0,
            vec![
                payload("0xP", 10, 1.0),
                "{not json".to_string(),
                payload("0xP", 400, 2.0),
            ],
        );
        let (sink, mut out) = ChannelSink::new(16);

        let summary = runtime(&dir, PipelineConfig::default())
            .run(source, Arc::new(sink), std::future::pending())
            .await
            .unwrap();

        assert_eq!(summary.stop_reason, StopReason::EndOfStream);
        assert_eq!(summary.stats.records_in, 3);
        assert_eq!(summary.stats.malformed_records, 1);
        assert_eq!(summary.positions, BTreeMap::from([(0, 3)]));
        assert_eq!(summary.open_windows, 1);

        let record = out.recv().await.unwrap();
        assert_eq!(record.window_id, "0xp_0");
        assert_eq!(record.processed_at, 1_000);
        assert!(out.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_abandons_open_windows() {
        let dir = TempDir::new().unwrap();
        let source = MemorySource::from_payloads(0, vec![payload("0xP", 10, 1.0)]);
        let (sink, mut out) = ChannelSink::new(16);

        let summary = runtime(&dir, PipelineConfig::default())
            .run(source, Arc::new(sink), std::future::ready(()))
            .await
            .unwrap();

        assert_eq!(summary.stop_reason, StopReason::Shutdown);
        assert_eq!(summary.checkpoints, 0);
        assert!(out.recv().await.is_none());
        assert!(!dir.path().join("dex-processor.checkpoint.json").exists());
    }

    #[tokio::test]
    async fn test_final_checkpoint_on_stop() {
        let dir = TempDir::new().unwrap();
        let mut config = PipelineConfig::default();
        config.final_checkpoint_on_stop = true;
        let source = MemorySource::from_payloads(0, vec![payload("0xP", 10, 1.0)]);
        let (sink, _out) = ChannelSink::new(16);

        let summary = runtime(&dir, config.clone())
            .run(source, Arc::new(sink), std::future::pending())
            .await
            .unwrap();
        assert_eq!(summary.last_checkpoint, Some(1));

        let resumed = runtime(&dir, config);
        assert_eq!(resumed.resume_positions(), BTreeMap::from([(0, 1)]));
    }

    #[tokio::test]
    async fn test_checkpoint_for_other_group_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = PipelineConfig::default();
        config.final_checkpoint_on_stop = true;
        let (sink, _out) = ChannelSink::new(16);
        runtime(&dir, config.clone())
            .run(MemorySource::new(vec![0], Vec::new()), Arc::new(sink), std::future::pending())
            .await
            .unwrap();

        // Same file, different group inside
        let store = FileSnapshotStore::new(dir.path(), "dex-processor").unwrap();
        config.consumer_group = "other".to_string();
        assert!(matches!(
            PipelineRuntime::new(config, Box::new(store)),
            Err(PipelineError::Restore(_))
        ));
    }
}
