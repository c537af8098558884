//! Pipeline error classification
//!
//! Malformed input is isolated per record; snapshot and restore failures are
//! fatal; an unavailable output boundary is retryable.

use super::sink::SinkError;

#[derive(Debug)]
pub enum PipelineError {
    /// Record could not be decoded or failed validation
    Malformed(String),
    /// A 64-bit counter (swap count, gas used) overflowed; the window state
    /// can no longer be trusted
    Overflow(&'static str),
    /// Two accumulators for different windows were combined
    WindowMismatch { left: String, right: String },
    /// Checkpoint could not be written
    Snapshot(String),
    /// Checkpoint could not be read or decoded
    Restore(String),
    /// Output boundary rejected a sealed record beyond the retry window
    SinkUnavailable { window_id: String, source: SinkError },
    /// Source transport failed
    Source(String),
    /// A partition worker stopped unexpectedly
    WorkerStopped(usize),
}

impl PipelineError {
    /// Whether the platform restart policy may retry after this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::SinkUnavailable { .. } | PipelineError::Source(_)
        )
    }

    /// Whether the error only affects the record being processed
    pub fn is_record_local(&self) -> bool {
        matches!(self, PipelineError::Malformed(_))
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Malformed(format!("json: {}", err))
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::Malformed(msg) => write!(f, "Malformed record: {}", msg),
            PipelineError::Overflow(field) => write!(f, "Accumulator overflow in {}", field),
            PipelineError::WindowMismatch { left, right } => {
                write!(f, "Cannot combine window {} with window {}", left, right)
            }
            PipelineError::Snapshot(msg) => write!(f, "Snapshot failed: {}", msg),
            PipelineError::Restore(msg) => write!(f, "Restore failed: {}", msg),
            PipelineError::SinkUnavailable { window_id, source } => {
                write!(f, "Output unavailable for window {}: {}", window_id, source)
            }
            PipelineError::Source(msg) => write!(f, "Source error: {}", msg),
            PipelineError::WorkerStopped(idx) => write!(f, "Partition worker {} stopped", idx),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::SinkUnavailable { source, .. } => Some(source),
            _ => None,
        }
    }
}
