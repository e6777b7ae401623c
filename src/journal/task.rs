//! One (host, workload, repetition) unit of work and its status transitions.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

// ---------------------------------------------------------------------------
// RunStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    #[serde(alias = "done", alias = "complete")]
    Completed,
    #[serde(alias = "error")]
    Failed,
    Skipped,
}

impl RunStatus {
    /// Completed, failed and skipped tasks never go back to pending or running
    /// on their own.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    /// Accepts the spellings remote engines emit, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "running" | "started" => Ok(Self::Running),
            "completed" | "complete" | "done" | "ok" | "success" => Ok(Self::Completed),
            "failed" | "error" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// TaskKey
// ---------------------------------------------------------------------------

/// Unique identity of a task inside a journal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey {
    pub host: String,
    pub workload: String,
    pub repetition: u32,
}

impl TaskKey {
    pub fn new(host: impl Into<String>, workload: impl Into<String>, repetition: u32) -> Self {
        Self {
            host: host.into(),
            workload: workload.into(),
            repetition,
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.host, self.workload, self.repetition)
    }
}

// ---------------------------------------------------------------------------
// TaskState
// ---------------------------------------------------------------------------

/// Tracked state of a single repetition of a workload on a host.
///
/// `finished_at` and `duration_seconds` are only ever stamped together, at the
/// moment the task leaves `Running`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub host: String,
    pub workload: String,
    pub repetition: u32,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_context: Option<String>,
}

impl TaskState {
    /// A fresh pending task.
    pub fn new(host: impl Into<String>, workload: impl Into<String>, repetition: u32) -> Self {
        Self {
            host: host.into(),
            workload: workload.into(),
            repetition,
            status: RunStatus::Pending,
            started_at: None,
            finished_at: None,
            duration_seconds: None,
            current_action: None,
            error_type: None,
            error_context: None,
        }
    }

    pub fn key(&self) -> TaskKey {
        TaskKey::new(self.host.clone(), self.workload.clone(), self.repetition)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a status reported at `now`.
    ///
    /// Returns `false` when the update was ignored: a terminal task cannot be
    /// moved back to pending or running. Terminal to terminal updates are
    /// last-write-wins.
    pub fn apply_status(&mut self, status: RunStatus, now: DateTime<Utc>) -> bool {
        if self.is_terminal() && !status.is_terminal() {
            warn!(
                task = %self.key(),
                from = %self.status,
                to = %status,
                "ignoring transition out of terminal status"
            );
            return false;
        }

        match status {
            RunStatus::Pending => {}
            RunStatus::Running => {
                if self.started_at.is_none() {
                    self.started_at = Some(now);
                }
            }
            RunStatus::Completed | RunStatus::Failed | RunStatus::Skipped => {
                if self.status == RunStatus::Running {
                    self.finished_at = Some(now);
                    self.duration_seconds = self
                        .started_at
                        .map(|start| (now - start).num_milliseconds().max(0) as f64 / 1000.0);
                }
            }
        }

        self.status = status;
        true
    }

    pub fn mark_running(&mut self) -> bool {
        self.apply_status(RunStatus::Running, Utc::now())
    }

    pub fn mark_finished(&mut self, status: RunStatus) -> bool {
        self.apply_status(status, Utc::now())
    }

    /// Attach a structured error to the task.
    pub fn record_error(&mut self, error_type: impl Into<String>, context: impl Into<String>) {
        self.error_type = Some(error_type.into());
        self.error_context = Some(context.into());
    }

    /// Put the task back to pending so it can be submitted again.
    pub fn reset_for_retry(&mut self) {
        self.status = RunStatus::Pending;
        self.started_at = None;
        self.finished_at = None;
        self.duration_seconds = None;
        self.current_action = None;
        self.error_type = None;
        self.error_context = None;
    }
}
