//! Late-event policy
//!
//! Decides what happens to an event whose window the global watermark has
//! already sealed.

use serde::{Deserialize, Serialize};

/// Configured handling for late events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LatePolicy {
    /// Drop and count
    #[default]
    Drop,
    /// Keep emitted windows for `retention_secs` past their end; a late event
    /// merges into the retained window and re-emits it under the same windowId
    Reopen { retention_secs: i64 },
}

/// Outcome of classifying one event against the watermark
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LateAction {
    /// Window still open
    Accept,
    /// Window sealed but still retained
    Reopen,
    /// Window sealed and gone
    Drop,
}

impl LatePolicy {
    /// Parse `LATE_EVENT_POLICY` ("drop" / "reopen")
    pub fn parse(mode: &str, retention_secs: i64) -> Option<Self> {
        match mode.trim().to_ascii_lowercase().as_str() {
            "drop" => Some(LatePolicy::Drop),
            "reopen" => Some(LatePolicy::Reopen {
                retention_secs: retention_secs.max(0),
            }),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LatePolicy::Drop => "drop",
            LatePolicy::Reopen { .. } => "reopen",
        }
    }

    pub fn retention_secs(&self) -> i64 {
        match self {
            LatePolicy::Drop => 0,
            LatePolicy::Reopen { retention_secs } => *retention_secs,
        }
    }

    /// Watermark at which an emitted window is discarded
    pub fn discard_at(&self, window_end: i64) -> i64 {
        window_end.saturating_add(self.retention_secs())
    }

    pub fn classify(&self, window_end: i64, watermark: Option<i64>) -> LateAction {
        let wm = match watermark {
            Some(wm) if window_end <= wm => wm,
            _ => return LateAction::Accept,
        };
        match self {
            LatePolicy::Drop => LateAction::Drop,
            LatePolicy::Reopen { .. } if self.discard_at(window_end) > wm => LateAction::Reopen,
            LatePolicy::Reopen { .. } => LateAction::Drop,
        }
    }
}

impl std::fmt::Display for LatePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LatePolicy::Drop => write!(f, "drop"),
            LatePolicy::Reopen { retention_secs } => {
                write!(f, "reopen (retention {}s)", retention_secs)
            }
        }
    }
}
