//! Run journal: the single record of what work exists in a run and what has
//! finished, persisted so an interrupted run can be resumed.

pub mod persist;
pub mod progress;
pub mod task;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::BenchConfig;

pub use persist::{journal_path, JOURNAL_FILE_NAME};
pub use progress::{progress_rows, summarize_progress, target_repetitions, PairStatus, ProgressRow};
pub use task::{RunStatus, TaskKey, TaskState};

/// Recognized metadata keys.
pub const META_CREATED_AT: &str = "created_at";
pub const META_EXECUTION_MODE: &str = "execution_mode";
pub const META_NODE_COUNT: &str = "node_count";
pub const META_REPETITIONS: &str = "repetitions";

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal not found at {}", path.display())]
    Missing { path: PathBuf },

    #[error("journal at {} is corrupt: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("journal I/O failed for {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("journal metadata has no '{field}'; supply it explicitly to resume")]
    MissingMetadata { field: &'static str },
}

// ---------------------------------------------------------------------------
// ExecutionMode
// ---------------------------------------------------------------------------

/// How workloads are dispatched to their hosts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Remote,
    Docker,
    Multipass,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Remote => "remote",
            Self::Docker => "docker",
            Self::Multipass => "multipass",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "remote" => Ok(Self::Remote),
            "docker" => Ok(Self::Docker),
            "multipass" => Ok(Self::Multipass),
            other => Err(format!(
                "unknown execution mode '{}' (expected remote, docker or multipass)",
                other
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// RunJournal
// ---------------------------------------------------------------------------

/// All task states of one run, keyed by (host, workload, repetition).
#[derive(Debug, Clone, PartialEq)]
pub struct RunJournal {
    pub run_id: String,
    pub metadata: Map<String, Value>,
    tasks: HashMap<TaskKey, TaskState>,
}

impl RunJournal {
    /// An empty journal.
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            metadata: Map::new(),
            tasks: HashMap::new(),
        }
    }

    /// Seed one pending task per host x workload x repetition and stamp the
    /// run metadata.
    pub fn initialize(
        run_id: impl Into<String>,
        config: &BenchConfig,
        target_workloads: &[String],
    ) -> Self {
        let mut journal = Self::new(run_id);
        let repetitions = config.run.repetitions;
        let hosts = config.target_hosts();

        for workload in target_workloads {
            for host in &hosts {
                for repetition in 1..=repetitions {
                    journal.get_task(host, workload, repetition);
                }
            }
        }

        journal.metadata.insert(
            META_CREATED_AT.to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
        journal.set_execution_mode(config.run.execution_mode);
        journal.set_node_count(config.node_count());
        journal
            .metadata
            .insert(META_REPETITIONS.to_string(), Value::from(repetitions));

        info!(
            run_id = %journal.run_id,
            hosts = hosts.len(),
            workloads = target_workloads.len(),
            repetitions,
            tasks = journal.len(),
            "initialized run journal"
        );
        journal
    }

    /// The task for a key, created as pending on first access.
    pub fn get_task(&mut self, host: &str, workload: &str, repetition: u32) -> &mut TaskState {
        let key = TaskKey::new(host, workload, repetition);
        self.tasks
            .entry(key)
            .or_insert_with(|| TaskState::new(host, workload, repetition))
    }

    /// Read-only lookup that never creates a task.
    pub fn task(&self, key: &TaskKey) -> Option<&TaskState> {
        self.tasks.get(key)
    }

    pub fn task_mut(&mut self, key: &TaskKey) -> Option<&mut TaskState> {
        self.tasks.get_mut(key)
    }

    pub fn contains(&self, key: &TaskKey) -> bool {
        self.tasks.contains_key(key)
    }

    /// Insert or replace a whole task record.
    pub fn upsert(&mut self, task: TaskState) {
        self.tasks.insert(task.key(), task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks in key order.
    pub fn tasks(&self) -> Vec<&TaskState> {
        let mut tasks: Vec<&TaskState> = self.tasks.values().collect();
        tasks.sort_by(|a, b| {
            (&a.host, &a.workload, a.repetition).cmp(&(&b.host, &b.workload, b.repetition))
        });
        tasks
    }

    /// Tasks of one (host, workload) pair, ordered by repetition.
    pub fn tasks_for(&self, host: &str, workload: &str) -> Vec<&TaskState> {
        let mut tasks: Vec<&TaskState> = self
            .tasks
            .values()
            .filter(|t| t.host == host && t.workload == workload)
            .collect();
        tasks.sort_by_key(|t| t.repetition);
        tasks
    }

    /// Distinct (host, workload) pairs in stable order.
    pub fn pairs(&self) -> Vec<(String, String)> {
        self.tasks
            .keys()
            .map(|k| (k.host.clone(), k.workload.clone()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn hosts(&self) -> Vec<String> {
        self.tasks
            .keys()
            .map(|k| k.host.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn workloads(&self) -> Vec<String> {
        self.tasks
            .keys()
            .map(|k| k.workload.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Number of tasks in each status.
    pub fn counts(&self) -> HashMap<RunStatus, usize> {
        let mut counts = HashMap::new();
        for task in self.tasks.values() {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        counts
    }

    /// True once every task reached a terminal status.
    pub fn is_complete(&self) -> bool {
        self.tasks.values().all(TaskState::is_terminal)
    }

    /// Keys still waiting for work, in key order.
    pub fn pending_keys(&self) -> Vec<TaskKey> {
        self.tasks()
            .into_iter()
            .filter(|t| !t.is_terminal())
            .map(TaskState::key)
            .collect()
    }

    // -- metadata ----------------------------------------------------------

    pub fn execution_mode(&self) -> Option<ExecutionMode> {
        self.metadata
            .get(META_EXECUTION_MODE)
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
    }

    pub fn set_execution_mode(&mut self, mode: ExecutionMode) {
        self.metadata.insert(
            META_EXECUTION_MODE.to_string(),
            Value::String(mode.as_str().to_string()),
        );
    }

    pub fn node_count(&self) -> Option<u32> {
        self.metadata
            .get(META_NODE_COUNT)
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
    }

    pub fn set_node_count(&mut self, count: u32) {
        self.metadata
            .insert(META_NODE_COUNT.to_string(), Value::from(count));
    }

    pub fn repetitions(&self) -> Option<u32> {
        self.metadata
            .get(META_REPETITIONS)
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.metadata
            .get(META_CREATED_AT)
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    // -- resume --------------------------------------------------------------

    /// Work out which tasks a resumed run must submit again.
    ///
    /// Execution mode and node count change the invocation topology, so they
    /// are never defaulted: each must come from the journal or `overrides`.
    /// Failed and interrupted tasks are reset to pending; completed and skipped
    /// tasks are left alone.
    pub fn resume_plan(&mut self, overrides: &ResumeOverrides) -> Result<ResumePlan, JournalError> {
        let execution_mode = match (overrides.execution_mode, self.execution_mode()) {
            (Some(explicit), Some(stored)) if explicit != stored => {
                warn!(%explicit, %stored, "execution mode override differs from journal");
                explicit
            }
            (Some(explicit), _) => explicit,
            (None, Some(stored)) => stored,
            (None, None) => {
                return Err(JournalError::MissingMetadata {
                    field: META_EXECUTION_MODE,
                })
            }
        };
        let node_count = match (overrides.node_count, self.node_count()) {
            (Some(explicit), _) => explicit,
            (None, Some(stored)) => stored,
            (None, None) => {
                return Err(JournalError::MissingMetadata {
                    field: META_NODE_COUNT,
                })
            }
        };
        self.set_execution_mode(execution_mode);
        self.set_node_count(node_count);

        let mut submit = Vec::new();
        let mut skip = Vec::new();
        let mut keys: Vec<TaskKey> = self.tasks.keys().cloned().collect();
        keys.sort();
        for key in keys {
            let Some(task) = self.tasks.get_mut(&key) else {
                continue;
            };
            match task.status {
                RunStatus::Completed | RunStatus::Skipped => skip.push(key),
                RunStatus::Failed | RunStatus::Running => {
                    task.reset_for_retry();
                    submit.push(key);
                }
                RunStatus::Pending => submit.push(key),
            }
        }

        info!(
            run_id = %self.run_id,
            %execution_mode,
            node_count,
            submit = submit.len(),
            skip = skip.len(),
            "built resume plan"
        );
        Ok(ResumePlan {
            execution_mode,
            node_count,
            submit,
            skip,
        })
    }
}

/// Values the caller supplies when resuming.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResumeOverrides {
    pub execution_mode: Option<ExecutionMode>,
    pub node_count: Option<u32>,
}

/// What a resumed run has to do.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumePlan {
    pub execution_mode: ExecutionMode,
    pub node_count: u32,
    /// Tasks to submit, reset to pending.
    pub submit: Vec<TaskKey>,
    /// Tasks already done; the scheduler must not submit these.
    pub skip: Vec<TaskKey>,
}

impl ResumePlan {
    pub fn should_run(&self, key: &TaskKey) -> bool {
        self.submit.contains(key)
    }
}
