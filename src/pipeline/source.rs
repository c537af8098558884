//! Input boundary
//!
//! A `SwapSource` yields serialized swap records tagged with their source
//! partition and offset, plus optional explicit watermark ticks. A record the
//! transport cannot decode still occupies its offset and is surfaced as
//! `Undecodable` so it is counted and skipped, never fatal. Offsets are
//! exactly-once positions: a checkpoint records the next unread offset per
//! partition and a restarted source resumes there.

use super::error::PipelineError;
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    Record {
        partition: u32,
        offset: u64,
        payload: String,
    },
    /// Record whose bytes are not valid text
    Undecodable {
        partition: u32,
        offset: u64,
        reason: String,
    },
    /// Transport-side assertion that `partition` holds nothing older
    Tick { partition: u32, watermark: i64 },
}

impl SourceEvent {
    pub fn partition(&self) -> u32 {
        match self {
            SourceEvent::Record { partition, .. }
            | SourceEvent::Undecodable { partition, .. }
            | SourceEvent::Tick { partition, .. } => *partition,
        }
    }
}

#[async_trait]
pub trait SwapSource: Send {
    /// Source partitions this source reads
    fn partitions(&self) -> Vec<u32>;

    /// Next event, or `None` at end of stream
    ///
    /// Must be cancel-safe: the runtime polls it inside `select!`.
    async fn next_event(&mut self) -> Result<Option<SourceEvent>, PipelineError>;

    fn source_type(&self) -> &'static str;
}

/// Ordered in-memory queue of events
pub struct MemorySource {
    partitions: Vec<u32>,
    events: VecDeque<SourceEvent>,
}

impl MemorySource {
    pub fn new(partitions: Vec<u32>, events: Vec<SourceEvent>) -> Self {
        Self {
            partitions,
            events: events.into(),
        }
    }

    /// One partition of records with offsets assigned in order
    pub fn from_payloads(partition: u32, payloads: impl IntoIterator<Item = String>) -> Self {
        let events = payloads
            .into_iter()
            .enumerate()
            .map(|(offset, payload)| SourceEvent::Record {
                partition,
                offset: offset as u64,
                payload,
            })
            .collect();
        Self::new(vec![partition], events)
    }

    /// Skip records already accounted for by a checkpoint
    pub fn resume_from(mut self, positions: &BTreeMap<u32, u64>) -> Self {
        self.events.retain(|event| match event {
            SourceEvent::Record {
                partition, offset, ..
            }
            | SourceEvent::Undecodable {
                partition, offset, ..
            } => positions.get(partition).map_or(true, |next| offset >= next),
            SourceEvent::Tick { .. } => true,
        });
        self
    }

}

#[async_trait]
impl SwapSource for MemorySource {
    fn partitions(&self) -> Vec<u32> {
        self.partitions.clone()
    }

    async fn next_event(&mut self) -> Result<Option<SourceEvent>, PipelineError> {
        Ok(self.events.pop_front())
    }

    fn source_type(&self) -> &'static str {
        "memory"
    }
}

/// Path of one partition file under a topic directory
pub fn partition_path(dir: &Path, partition: u32) -> PathBuf {
    dir.join(format!("partition-{}.jsonl", partition))
}

/// Tails one append-only JSONL file per partition
///
/// Offset is the zero-based line number. Each partition is read by its own
/// task into a shared bounded channel, so reads stay cancel-safe.
pub struct JsonlPartitionSource {
    partitions: Vec<u32>,
    rx: mpsc::Receiver<Result<SourceEvent, PipelineError>>,
    tasks: Vec<JoinHandle<()>>,
}

impl JsonlPartitionSource {
    pub fn open(
        dir: impl AsRef<Path>,
        partitions: Vec<u32>,
        positions: &BTreeMap<u32, u64>,
        buffer: usize,
    ) -> Self {
        Self::open_with_poll(dir, partitions, positions, buffer, Duration::from_millis(100))
    }

    pub fn open_with_poll(
        dir: impl AsRef<Path>,
        partitions: Vec<u32>,
        positions: &BTreeMap<u32, u64>,
        buffer: usize,
        poll_interval: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let tasks = partitions
            .iter()
            .map(|&partition| {
                let path = partition_path(dir.as_ref(), partition);
                let start = positions.get(&partition).copied().unwrap_or(0);
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = tail_partition(path, partition, start, poll_interval, &tx).await {
                        let _ = tx.send(Err(e)).await;
                    }
                })
            })
            .collect();

        Self {
            partitions,
            rx,
            tasks,
        }
    }
}

async fn open_when_present(path: &Path, poll_interval: Duration) -> Result<File, PipelineError> {
    let mut announced = false;
    loop {
        match File::open(path).await {
            Ok(file) => return Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if !announced {
                    log::info!("⏳ Waiting for partition file: {}", path.display());
                    announced = true;
                }
                sleep(poll_interval).await;
            }
            Err(e) => return Err(PipelineError::Source(format!("{}: {}", path.display(), e))),
        }
    }
}

async fn tail_partition(
    path: PathBuf,
    partition: u32,
    start: u64,
    poll_interval: Duration,
    tx: &mpsc::Sender<Result<SourceEvent, PipelineError>>,
) -> Result<(), PipelineError> {
    let file = open_when_present(&path, poll_interval).await?;
    let mut reader = BufReader::new(file);
    log::info!("📖 Reading partition {} from offset {}: {}", partition, start, path.display());

    let mut offset: u64 = 0;
    let mut pending: Vec<u8> = Vec::new();
    loop {
        let read = reader
            .read_until(b'\n', &mut pending)
            .await
            .map_err(|e| PipelineError::Source(format!("{}: {}", path.display(), e)))?;
        // A line without its newline is still being written
        if read == 0 || !pending.ends_with(b"\n") {
            sleep(poll_interval).await;
            continue;
        }

        if offset >= start {
            let event = match std::str::from_utf8(&pending) {
                Ok(line) if line.trim().is_empty() => None,
                Ok(line) => Some(SourceEvent::Record {
                    partition,
                    offset,
                    payload: line.trim().to_string(),
                }),
                Err(e) => Some(SourceEvent::Undecodable {
                    partition,
                    offset,
                    reason: e.to_string(),
                }),
            };
            if let Some(event) = event {
                if tx.send(Ok(event)).await.is_err() {
                    // Source dropped
                    return Ok(());
                }
            }
        }
        offset += 1;
        pending.clear();
    }
}

#[async_trait]
impl SwapSource for JsonlPartitionSource {
    fn partitions(&self) -> Vec<u32> {
        self.partitions.clone()
    }

    async fn next_event(&mut self) -> Result<Option<SourceEvent>, PipelineError> {
        match self.rx.recv().await {
            Some(Ok(event)) => Ok(Some(event)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    fn source_type(&self) -> &'static str {
        "jsonl"
    }
}

impl Drop for JsonlPartitionSource {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
