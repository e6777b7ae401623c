//! Pure progress queries over a journal.

use std::fmt;

use serde::Serialize;

use super::{RunJournal, RunStatus, TaskState};

/// Rolled-up status of one (host, workload) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PairStatus {
    Failed,
    Running,
    Skipped,
    Done,
    Partial,
    Pending,
}

impl PairStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Failed => "failed",
            Self::Running => "running",
            Self::Skipped => "skipped",
            Self::Done => "done",
            Self::Partial => "partial",
            Self::Pending => "pending",
        }
    }
}

impl fmt::Display for PairStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target repetitions for a run: the `repetitions` metadata when present,
/// otherwise the highest repetition number seen.
pub fn target_repetitions(journal: &RunJournal) -> u32 {
    journal.repetitions().unwrap_or_else(|| {
        journal
            .tasks()
            .iter()
            .map(|t| t.repetition)
            .max()
            .unwrap_or(0)
    })
}

/// Summarize the tasks of one pair as `(status, "completed/target")`.
///
/// Precedence: failed > running > skipped (all skipped) > done (completed
/// count equals target) > partial (some completed) > pending.
pub fn summarize_progress<'a, I>(tasks: I, target: u32) -> (PairStatus, String)
where
    I: IntoIterator<Item = &'a TaskState>,
{
    let mut total = 0usize;
    let mut completed = 0usize;
    let mut failed = false;
    let mut running = false;
    let mut skipped = 0usize;

    for task in tasks {
        total += 1;
        match task.status {
            RunStatus::Completed => completed += 1,
            RunStatus::Failed => failed = true,
            RunStatus::Running => running = true,
            RunStatus::Skipped => skipped += 1,
            RunStatus::Pending => {}
        }
    }

    let status = if failed {
        PairStatus::Failed
    } else if running {
        PairStatus::Running
    } else if total > 0 && skipped == total {
        PairStatus::Skipped
    } else if completed > 0 && completed == target as usize {
        PairStatus::Done
    } else if completed > 0 {
        PairStatus::Partial
    } else {
        PairStatus::Pending
    };

    (status, format!("{}/{}", completed, target))
}

/// One line of a progress table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressRow {
    pub host: String,
    pub workload: String,
    pub status: PairStatus,
    pub progress: String,
}

/// Progress of every (host, workload) pair in the journal.
pub fn progress_rows(journal: &RunJournal) -> Vec<ProgressRow> {
    let target = target_repetitions(journal);
    journal
        .pairs()
        .into_iter()
        .map(|(host, workload)| {
            let (status, progress) = summarize_progress(journal.tasks_for(&host, &workload), target);
            ProgressRow {
                host,
                workload,
                status,
                progress,
            }
        })
        .collect()
}
