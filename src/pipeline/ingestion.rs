//! Partition worker loop
//!
//! One worker owns the windows of every pair hashed to its partition and
//! processes its queue strictly in arrival order. Sealed records are written
//! to the sink before the next message is taken, so a stalled sink stops
//! merges on this worker and the bounded queue pushes back on the router.

use super::backoff::ExponentialBackoff;
use super::config::PipelineConfig;
use super::error::PipelineError;
use super::sink::AnalyticsSink;
use super::snapshot::PartitionState;
use super::stats::{should_warn, PipelineStats};
use super::types::{AggregatedAnalytics, ParsedSwap};
use super::windows::{MergeOutcome, WindowManager};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Messages from the router, in order
#[derive(Debug)]
pub enum PartitionMessage {
    Swap(ParsedSwap),
    /// New global watermark
    Watermark(i64),
    /// Reply with partition state once every earlier message is applied
    Barrier {
        checkpoint_id: u64,
        reply: oneshot::Sender<PartitionState>,
    },
}

/// Final state of a worker after its queue closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionReport {
    pub partition: usize,
    /// Windows still open at stop; never force-sealed
    pub open_windows: usize,
}

#[derive(Debug, Clone, Copy)]
struct RetrySettings {
    max_retries: u32,
    initial_ms: u64,
    max_ms: u64,
}

pub struct PartitionWorker {
    partition: usize,
    windows: WindowManager,
    sink: Arc<dyn AnalyticsSink>,
    stats: Arc<PipelineStats>,
    retry: RetrySettings,
}

impl PartitionWorker {
    pub fn new(
        partition: usize,
        windows: WindowManager,
        sink: Arc<dyn AnalyticsSink>,
        stats: Arc<PipelineStats>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            partition,
            windows,
            sink,
            stats,
            retry: RetrySettings {
                max_retries: config.sink_max_retries,
                initial_ms: config.sink_retry_initial_ms,
                max_ms: config.sink_retry_max_ms,
            },
        }
    }

    /// Process messages until the router closes the queue
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<PartitionMessage>,
    ) -> Result<PartitionReport, PipelineError> {
        log::info!(
            "🚀 Partition {} started ({} restored windows, late policy: {})",
            self.partition,
            self.windows.export_state().window_count(),
            self.windows.policy()
        );

        while let Some(message) = rx.recv().await {
            match message {
                PartitionMessage::Swap(swap) => self.handle_swap(swap).await?,
                PartitionMessage::Watermark(watermark) => {
                    for record in self.windows.advance_watermark(watermark) {
                        self.emit(&record).await?;
                        self.stats.record_emitted();
                    }
                }
                PartitionMessage::Barrier {
                    checkpoint_id,
                    reply,
                } => {
                    let state = self.windows.export_state();
                    log::debug!(
                        "Partition {} at barrier {}: {} windows",
                        self.partition,
                        checkpoint_id,
                        state.window_count()
                    );
                    if reply.send(state).is_err() {
                        log::warn!(
                            "⚠️  Partition {}: checkpoint {} abandoned by router",
                            self.partition,
                            checkpoint_id
                        );
                    }
                }
            }
        }

        let open_windows = self.windows.open_windows();
        if open_windows > 0 {
            log::info!(
                "🛑 Partition {} stopping with {} open windows (not emitted)",
                self.partition,
                open_windows
            );
        }
        if let Err(e) = self.sink.flush().await {
            log::warn!("⚠️  Partition {}: final sink flush failed: {}", self.partition, e);
        }

        log::info!("✅ Partition {} stopped", self.partition);
        Ok(PartitionReport {
            partition: self.partition,
            open_windows,
        })
    }

    async fn handle_swap(&mut self, swap: ParsedSwap) -> Result<(), PipelineError> {
        match self.windows.process(&swap) {
            Ok(MergeOutcome::Merged) => Ok(()),
            Ok(MergeOutcome::Reopened(record)) => {
                self.emit(&record).await?;
                self.stats.record_reopened();
                Ok(())
            }
            Ok(MergeOutcome::DroppedLate) => {
                let count = self.stats.record_late();
                if should_warn(count) {
                    log::warn!(
                        "⏰ Late swap dropped: {} on {} at {} (total late: {})",
                        swap.event_id,
                        swap.pair_address,
                        swap.event_time(),
                        count
                    );
                }
                Ok(())
            }
            Err(e) if e.is_record_local() => {
                let count = self.stats.record_malformed();
                if should_warn(count) {
                    log::warn!(
                        "⚠️  Swap {} rejected: {} (total malformed: {})",
                        swap.event_id,
                        e,
                        count
                    );
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Write with bounded retry; fails only once the retry window is spent
    async fn emit(&self, record: &AggregatedAnalytics) -> Result<(), PipelineError> {
        let mut backoff = ExponentialBackoff::new(
            self.retry.initial_ms,
            self.retry.max_ms,
            self.retry.max_retries,
        );
        loop {
            match self.sink.write(record).await {
                Ok(()) => {
                    log::debug!(
                        "📤 Emitted {} ({} swaps, twap {:.6})",
                        record.window_id,
                        record.swap_count,
                        record.twap
                    );
                    return Ok(());
                }
                Err(e) => {
                    log::warn!(
                        "⚠️  {} write failed for {}: {}",
                        self.sink.backend_type(),
                        record.window_id,
                        e
                    );
                    if backoff.sleep().await.is_err() {
                        log::error!(
                            "❌ Output unavailable after {} retries, stopping partition {}",
                            backoff.attempts(),
                            self.partition
                        );
                        return Err(PipelineError::SinkUnavailable {
                            window_id: record.window_id.clone(),
                            source: e,
                        });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::assigner::WindowAssigner;
    use crate::pipeline::late_policy::LatePolicy;
    use crate::pipeline::sink::{ChannelSink, SinkError};
    use crate::pipeline::types::OrderKey;
    use async_trait::async_trait;
    use crate::pipeline::types::dec;
    use bigdecimal::{BigDecimal, Zero};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn make_swap(pair: &str, t: i64, price: f64) -> ParsedSwap {
        ParsedSwap {
            event_id: format!("{}-{}", pair, t),
            transaction_hash: "0xtx".to_string(),
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
            sender: "0xs".to_string(),
            recipient: "0xs".to_string(),
            amount0_in: dec("1"),
            amount1_in: BigDecimal::zero(),
            amount0_out: BigDecimal::zero(),
            amount1_out: dec("1"),
            price,
            volume_usd: Some(dec("1")),
            gas_used: 1,
            gas_price: dec("1"),
            ingested_at: t,
        }
    }

    fn test_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.sink_max_retries = 2;
        config.sink_retry_initial_ms = 1;
        config.sink_retry_max_ms = 2;
        config
    }

    fn worker(sink: Arc<dyn AnalyticsSink>, stats: Arc<PipelineStats>) -> PartitionWorker {
        let windows =
            WindowManager::with_clock(WindowAssigner::default(), LatePolicy::Drop, Box::new(|| 7));
        PartitionWorker::new(0, windows, sink, stats, &test_config())
    }

    /// Fails the first `failures` writes
    struct FlakySink {
        failures: u32,
        attempts: AtomicU32,
        inner: ChannelSink,
    }

    #[async_trait]
    impl AnalyticsSink for FlakySink {
        async fn write(&self, record: &AggregatedAnalytics) -> Result<(), SinkError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                return Err(SinkError::Database("unavailable".to_string()));
            }
            self.inner.write(record).await
        }

        async fn flush(&self) -> Result<(), SinkError> {
            Ok(())
        }

        fn backend_type(&self) -> &'static str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_worker_emits_on_watermark_and_counts_late() {
        let (sink, mut out) = ChannelSink::new(16);
        let stats = Arc::new(PipelineStats::new());
        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(worker(Arc::new(sink), stats.clone()).run(rx));

        tx.send(PartitionMessage::Swap(make_swap("0xp", 0, 10.0))).await.unwrap();
        tx.send(PartitionMessage::Swap(make_swap("0xp", 120, 12.0))).await.unwrap();
        tx.send(PartitionMessage::Swap(make_swap("0xp", 240, 11.0))).await.unwrap();
        tx.send(PartitionMessage::Watermark(300)).await.unwrap();
        tx.send(PartitionMessage::Swap(make_swap("0xp", 250, 99.0))).await.unwrap();
        tx.send(PartitionMessage::Swap(make_swap("0xp", 400, 1.0))).await.unwrap();
        drop(tx);

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.open_windows, 1);

        let record = out.recv().await.unwrap();
        assert_eq!(record.twap, 11.0);
        assert_eq!(record.processed_at, 7);
        assert!(out.recv().await.is_none());

        let snap = stats.snapshot();
        assert_eq!(snap.late_events, 1);
        assert_eq!(snap.windows_emitted, 1);
    }

    #[tokio::test]
    async fn test_barrier_replies_after_earlier_messages() {
        let (sink, _out) = ChannelSink::new(16);
        let (tx, rx) = mpsc::channel(16);
        let handle =
            tokio::spawn(worker(Arc::new(sink), Arc::new(PipelineStats::new())).run(rx));

        tx.send(PartitionMessage::Swap(make_swap("0xp", 10, 1.0))).await.unwrap();
        tx.send(PartitionMessage::Swap(make_swap("0xq", 20, 1.0))).await.unwrap();
        let (reply, state) = oneshot::channel();
        tx.send(PartitionMessage::Barrier {
            checkpoint_id: 1,
            reply,
        })
        .await
        .unwrap();

        let state = state.await.unwrap();
        assert_eq!(state.window_count(), 2);
        drop(tx);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_transient_sink_failure_is_retried() {
        let (inner, mut out) = ChannelSink::new(16);
        let sink = Arc::new(FlakySink {
            failures: 2,
            attempts: AtomicU32::new(0),
            inner,
        });
        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(worker(sink.clone(), Arc::new(PipelineStats::new())).run(rx));

        tx.send(PartitionMessage::Swap(make_swap("0xp", 10, 1.0))).await.unwrap();
        tx.send(PartitionMessage::Watermark(300)).await.unwrap();
        drop(tx);

        handle.await.unwrap().unwrap();
        assert_eq!(out.recv().await.unwrap().window_id, "0xp_0");
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_sink_outage_surfaces_retryable_error() {
        let (inner, _out) = ChannelSink::new(16);
        let sink = Arc::new(FlakySink {
            failures: u32::MAX,
            attempts: AtomicU32::new(0),
            inner,
        });
        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(worker(sink, Arc::new(PipelineStats::new())).run(rx));

        tx.send(PartitionMessage::Swap(make_swap("0xp", 10, 1.0))).await.unwrap();
        tx.send(PartitionMessage::Watermark(300)).await.unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, PipelineError::SinkUnavailable { ref window_id, .. } if window_id == "0xp_0"));
    }
}
