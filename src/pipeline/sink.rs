//! Emission boundary
//!
//! Every sealed window produces one `AggregatedAnalytics` record handed to an
//! `AnalyticsSink`. Workers await each write, so a slow sink stalls merges on
//! that worker rather than buffering sealed records.

use super::types::AggregatedAnalytics;
use async_trait::async_trait;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, Mutex};

#[derive(Debug)]
pub enum SinkError {
    Io(std::io::Error),
    Serialization(serde_json::Error),
    Database(String),
    /// Receiving side is gone
    Closed,
}

impl From<std::io::Error> for SinkError {
    fn from(err: std::io::Error) -> Self {
        SinkError::Io(err)
    }
}

impl From<serde_json::Error> for SinkError {
    fn from(err: serde_json::Error) -> Self {
        SinkError::Serialization(err)
    }
}

impl From<rusqlite::Error> for SinkError {
    fn from(err: rusqlite::Error) -> Self {
        SinkError::Database(err.to_string())
    }
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkError::Io(e) => write!(f, "IO error: {}", e),
            SinkError::Serialization(e) => write!(f, "Serialization error: {}", e),
            SinkError::Database(e) => write!(f, "Database error: {}", e),
            SinkError::Closed => write!(f, "Sink closed"),
        }
    }
}

impl std::error::Error for SinkError {}

/// Backend trait for the output topic
///
/// Implementations must be idempotent per `window_id` or append-only with
/// downstream deduplication on `window_id`.
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    /// Write a single window record
    async fn write(&self, record: &AggregatedAnalytics) -> Result<(), SinkError>;

    /// Flush pending writes to storage
    async fn flush(&self) -> Result<(), SinkError>;

    /// Get backend type for logging
    fn backend_type(&self) -> &'static str;
}

/// Appends one JSON object per line
pub struct JsonlAnalyticsSink {
    path: PathBuf,
    writer: Mutex<BufWriter<std::fs::File>>,
}

impl JsonlAnalyticsSink {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        log::info!("📝 Writing window analytics to: {}", path.display());
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AnalyticsSink for JsonlAnalyticsSink {
    async fn write(&self, record: &AggregatedAnalytics) -> Result<(), SinkError> {
        let json = record.to_json()?;
        let mut writer = self.writer.lock().await;
        writeln!(writer, "{}", json)?;
        // One record per sealed window; flush so tailing consumers see it
        writer.flush()?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        self.writer.lock().await.flush()?;
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "JSONL"
    }
}

/// Forwards records over a bounded channel
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<AggregatedAnalytics>,
}

impl ChannelSink {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<AggregatedAnalytics>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl AnalyticsSink for ChannelSink {
    async fn write(&self, record: &AggregatedAnalytics) -> Result<(), SinkError> {
        self.tx
            .send(record.clone())
            .await
            .map_err(|_| SinkError::Closed)
    }

    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "channel"
    }
}
