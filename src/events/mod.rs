//! Live progress from remote-execution output.
//!
//! The remote engine prints line-oriented text. [`StreamParser`] classifies
//! each line into an [`Event`] and applies progress signals to the run
//! journal; [`LogRollup`] folds the noisy polling steps into counters so a
//! dashboard log stays readable.

pub mod follow;
pub mod parser;
pub mod render;
pub mod rollup;

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::journal::RunStatus;

pub use follow::{follow_stream, FollowStats};
pub use parser::StreamParser;
pub use rollup::{LogRollup, RollupMode};

/// A line that looked like a structured event but could not be decoded.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EventError {
    #[error("malformed {what} event: {reason}")]
    Malformed { what: &'static str, reason: String },
}

impl EventError {
    pub(crate) fn malformed(what: &'static str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            what,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TaskStart,
    StatusLine,
    Progress,
    TaskTiming,
    PlainLog,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TaskStart => "task_start",
            Self::StatusLine => "status_line",
            Self::Progress => "progress",
            Self::TaskTiming => "task_timing",
            Self::PlainLog => "plain_log",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded inline progress payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    pub run_id: Option<String>,
    pub host: String,
    pub workload: String,
    pub repetition: u32,
    pub total_repetitions: Option<u32>,
    pub status: RunStatus,
    pub message: Option<String>,
    pub error_type: Option<String>,
    pub error_context: Option<String>,
}

/// Result class of a timed remote step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingOutcome {
    Done,
    Skipped,
    Failed,
    Unreachable,
}

impl TimingOutcome {
    /// Wire spellings; `ok` and `changed` both mean done.
    pub fn from_wire(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ok" | "changed" | "done" => Some(Self::Done),
            "skipped" | "skipping" => Some(Self::Skipped),
            "failed" | "fatal" => Some(Self::Failed),
            "unreachable" => Some(Self::Unreachable),
            _ => None,
        }
    }
}

/// Decoded task-timing payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskTiming {
    pub host: Option<String>,
    pub phase: Option<String>,
    pub task_label: String,
    pub duration_seconds: f64,
    pub outcome: TimingOutcome,
}

/// One classified line of remote output, with its rendered display line.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    TaskStart {
        phase: Option<String>,
        task_label: String,
        line: String,
    },
    StatusLine {
        host: String,
        status: String,
        line: String,
    },
    Progress {
        #[serde(flatten)]
        update: ProgressUpdate,
        line: String,
    },
    TaskTiming {
        #[serde(flatten)]
        timing: TaskTiming,
        line: String,
    },
    PlainLog {
        line: String,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::TaskStart { .. } => EventKind::TaskStart,
            Self::StatusLine { .. } => EventKind::StatusLine,
            Self::Progress { .. } => EventKind::Progress,
            Self::TaskTiming { .. } => EventKind::TaskTiming,
            Self::PlainLog { .. } => EventKind::PlainLog,
        }
    }

    /// The rendered bullet line.
    pub fn line(&self) -> &str {
        match self {
            Self::TaskStart { line, .. }
            | Self::StatusLine { line, .. }
            | Self::Progress { line, .. }
            | Self::TaskTiming { line, .. }
            | Self::PlainLog { line } => line,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.line())
    }
}
