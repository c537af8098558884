//! Pipeline Runtime - windowed swap analytics
//!
//! Reads swap events from the file-backed transport, aggregates them into
//! five-minute windows per pair and writes one analytics record per sealed
//! window to the output topic.
//!
//! Usage:
//!   cargo run --release --bin pipeline_runtime
//!
//! Environment variables:
//!   TRANSPORT_BOOTSTRAP | KAFKA_BOOTSTRAP - Transport root (default: data/broker)
//!   TOPIC_DEX_EVENTS - Input topic (default: dex-events)
//!   TOPIC_DEX_ANALYTICS - Output topic (default: dex-analytics)
//!   CONSUMER_GROUP | FLINK_CONSUMER_GROUP - Checkpoint identity (default: dex-processor)
//!   PARALLELISM | FLINK_PARALLELISM - Worker partitions (default: 2)
//!   SNAPSHOT_INTERVAL_MS | FLINK_CHECKPOINT_MS - Checkpoint interval (default: 10000)
//!
//! The second name of each pair is read when the first is unset or blank.
//!   SINK_BACKEND - jsonl or sqlite (default: jsonl)
//!   LATE_EVENT_POLICY - drop or reopen (default: drop)

use dotenv::dotenv;
use log::{error, info};
use std::sync::Arc;
use swapflow::pipeline::{
    AnalyticsSink, FileSnapshotStore, JsonlAnalyticsSink, JsonlPartitionSource, PipelineConfig,
    PipelineRuntime, SinkBackend, SqliteAnalyticsSink,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize environment and logging
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    info!("🚀 Pipeline Runtime - windowed swap analytics");
    info!("   └─ Version: {}", env!("CARGO_PKG_VERSION"));

    let config = PipelineConfig::from_env();
    config.log_summary();

    let store = FileSnapshotStore::new(&config.snapshot_dir, &config.consumer_group)?;
    info!("✅ Checkpoint store: {}", store.path().display());
    let runtime = PipelineRuntime::new(config.clone(), Box::new(store))?;

    let sink_path = config.sink_path();
    let sink: Arc<dyn AnalyticsSink> = match config.sink_backend {
        SinkBackend::Jsonl => Arc::new(JsonlAnalyticsSink::new(&sink_path)?),
        SinkBackend::Sqlite => Arc::new(SqliteAnalyticsSink::open(&sink_path)?),
    };
    info!("✅ Output: {} ({})", sink_path.display(), sink.backend_type());

    let source = JsonlPartitionSource::open(
        config.input_dir(),
        config.source_partitions(),
        &runtime.resume_positions(),
        config.channel_buffer,
    );
    info!("✅ Input: {}", config.input_dir().display());

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("❌ Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    };

    match runtime.run(source, sink, shutdown).await {
        Ok(summary) => {
            info!(
                "✅ Pipeline stopped: {} records, {} windows emitted, {} checkpoints",
                summary.stats.records_in, summary.stats.windows_emitted, summary.checkpoints
            );
            Ok(())
        }
        Err(e) => {
            error!(
                "❌ Pipeline failed ({}): {}",
                if e.is_retryable() { "retryable" } else { "fatal" },
                e
            );
            Err(e.into())
        }
    }
}
