//! Local scheduler: drives pending repetitions through generators on this
//! machine and keeps the journal on disk current.

pub mod results;

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{BenchConfig, LOCAL_HOST};
use crate::generator::{Generator, GeneratorError, GeneratorFailure, GeneratorOutcome, GeneratorSettings};
use crate::journal::{journal_path, ResumePlan, RunJournal, RunStatus, TaskKey};
use crate::plugins::PluginRegistry;

pub use results::{read_result, result_path, write_result, ResultRecord};

/// Totals for one `Runner::run` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub completed: usize,
    pub failed: usize,
    /// Tasks for hosts this runner cannot reach, left for the remote engine.
    pub remote: usize,
    /// Tasks not attempted because the run was cancelled.
    pub remaining: usize,
    pub cancelled: bool,
}

pub struct Runner {
    config: BenchConfig,
    registry: PluginRegistry,
}

impl Runner {
    pub fn new(config: BenchConfig, registry: PluginRegistry) -> Self {
        Self { config, registry }
    }

    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    pub fn journal_path(&self, run_id: &str) -> PathBuf {
        journal_path(&self.config.run.output_root, run_id)
    }

    /// Fresh journal seeded from the enabled workloads.
    pub fn initialize(&self, run_id: &str) -> RunJournal {
        RunJournal::initialize(run_id, &self.config, &self.config.enabled_workloads())
    }

    /// Keys still to run, in (workload, repetition, host) order so each
    /// workload is prepared once and runs back to back.
    pub fn plan(&self, journal: &RunJournal) -> Vec<TaskKey> {
        let mut keys = journal.pending_keys();
        sort_for_execution(&mut keys);
        keys
    }

    /// Keys a resume plan resubmits, in execution order.
    pub fn plan_resume(&self, plan: &ResumePlan) -> Vec<TaskKey> {
        let mut keys = plan.submit.clone();
        sort_for_execution(&mut keys);
        keys
    }

    /// Run `keys` one at a time. The journal is saved before the first task
    /// and after every repetition; cancellation stops the in-flight
    /// generator and leaves the remaining tasks pending.
    pub async fn run(
        &self,
        journal: &mut RunJournal,
        keys: &[TaskKey],
        cancel: &CancellationToken,
    ) -> Result<RunSummary> {
        let path = self.journal_path(&journal.run_id);
        let run_dir = self.config.run_dir(&journal.run_id);
        journal.save(&path).context("failed to save run journal")?;
        info!(run_id = %journal.run_id, tasks = keys.len(), path = %path.display(), "starting local run");

        let mut summary = RunSummary::default();
        let mut prepared = HashSet::new();

        for (i, key) in keys.iter().enumerate() {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                summary.remaining = keys.len() - i;
                break;
            }
            if key.host != LOCAL_HOST {
                warn!(task = %key, "host is not local, leaving task to the remote engine");
                summary.remote += 1;
                continue;
            }

            let (outcome, attempts, generator) = self.run_task(journal, key, &mut prepared, cancel).await;
            let record = ResultRecord::from_outcome(&journal.run_id, key, &outcome, attempts);
            let result_file = result_path(&run_dir, key);
            if let Err(e) = write_result(&result_file, &record) {
                warn!(task = %key, error = %e, "failed to write result file");
            }

            let task = journal.get_task(&key.host, &key.workload, key.repetition);
            match &outcome {
                Ok(_) => {
                    task.mark_finished(RunStatus::Completed);
                    task.current_action = None;
                    summary.completed += 1;
                }
                Err(failure) => {
                    task.mark_finished(RunStatus::Failed);
                    task.record_error(failure.error.kind(), failure.error.to_string());
                    summary.failed += 1;
                }
            }
            let saved = journal.save(&path).context("failed to save run journal");
            // Teardown only once the result and journal are on disk.
            if let Some(generator) = generator {
                generator.cleanup().await;
            }
            saved?;

            if matches!(&outcome, Err(f) if f.error == GeneratorError::Stopped) && cancel.is_cancelled() {
                summary.cancelled = true;
                summary.remaining = keys.len() - i - 1;
                break;
            }
        }

        info!(
            run_id = %journal.run_id,
            completed = summary.completed,
            failed = summary.failed,
            remote = summary.remote,
            remaining = summary.remaining,
            cancelled = summary.cancelled,
            "local run finished"
        );
        Ok(summary)
    }

    /// Execute one task with up to `max_retries` extra attempts. Returns the
    /// last outcome, the number of attempts made, and the generator of the
    /// last attempt, whose cleanup is left to the caller. Earlier attempts
    /// are cleaned up here.
    async fn run_task(
        &self,
        journal: &mut RunJournal,
        key: &TaskKey,
        prepared: &mut HashSet<String>,
        cancel: &CancellationToken,
    ) -> (GeneratorOutcome, u32, Option<Generator>) {
        let Some(workload) = self.config.workloads.get(&key.workload) else {
            let error = GeneratorError::validation(format!("workload '{}' is not configured", key.workload));
            return (Err(GeneratorFailure::catastrophic(error)), 0, None);
        };
        let settings = GeneratorSettings::from_run_config(&self.config.run, workload.tags.clone());
        let max_attempts = settings.max_retries + 1;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let hooks = match self.registry.create_generator(&key.workload, workload) {
                Ok(hooks) => hooks,
                Err(e) => {
                    let error = GeneratorError::validation(format!("{:#}", e));
                    return (Err(GeneratorFailure::catastrophic(error)), attempt, None);
                }
            };
            // A fresh generator per attempt.
            let generator = Generator::new(hooks, settings.clone());
            if prepared.insert(key.workload.clone()) {
                generator.prepare().await;
            }

            let task = journal.get_task(&key.host, &key.workload, key.repetition);
            if task.status.is_terminal() {
                task.reset_for_retry();
            }
            task.mark_running();
            task.current_action = Some(format!("{} attempt {}/{}", workload.plugin, attempt, max_attempts));
            if let Err(e) = journal.save(&self.journal_path(&journal.run_id)) {
                warn!(task = %key, error = %e, "failed to save run journal");
            }

            let outcome = execute(&generator, cancel).await;

            let retryable = match &outcome {
                Ok(_) => false,
                Err(failure) => !matches!(
                    failure.error,
                    GeneratorError::Validation { .. } | GeneratorError::Stopped
                ),
            };
            if !retryable || attempt >= max_attempts || cancel.is_cancelled() {
                return (outcome, attempt, Some(generator));
            }
            generator.cleanup().await;
            if let Err(failure) = &outcome {
                warn!(task = %key, attempt, max_attempts, error = %failure.error, "repetition failed, retrying");
                // Only the final attempt is recorded as terminal.
                journal
                    .get_task(&key.host, &key.workload, key.repetition)
                    .mark_finished(RunStatus::Failed);
            }
        }
    }
}

async fn execute(generator: &Generator, cancel: &CancellationToken) -> GeneratorOutcome {
    if let Err(e) = generator.start() {
        return generator
            .outcome()
            .unwrap_or_else(|| Err(GeneratorFailure::catastrophic(e)));
    }
    tokio::select! {
        outcome = generator.wait() => outcome,
        _ = cancel.cancelled() => {
            info!(generator = %generator.name(), "run cancelled, stopping generator");
            generator.stop().await;
            generator.wait().await
        }
    }
}

fn sort_for_execution(keys: &mut [TaskKey]) {
    keys.sort_by(|a, b| {
        (&a.workload, a.repetition, &a.host).cmp(&(&b.workload, b.repetition, &b.host))
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::WorkloadConfig;
    use crate::generator::GeneratorHooks;
    use crate::plugins::{PluginMeta, WorkloadPlugin};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;

    fn shell_workload(script: &str) -> WorkloadConfig {
        let mut workload = WorkloadConfig {
            plugin: "shell".into(),
            timeout_secs: 10,
            ..WorkloadConfig::default()
        };
        workload.options.insert(
            "command".into(),
            toml::Value::Array(vec![
                toml::Value::String("sh".into()),
                toml::Value::String("-c".into()),
                toml::Value::String(script.into()),
            ]),
        );
        workload
    }

    fn config(dir: &TempDir) -> BenchConfig {
        let mut config = BenchConfig::default();
        config.run.output_root = dir.path().to_path_buf();
        config.run.repetitions = 2;
        config.run.timeout_buffer_secs = 1;
        config.workloads.insert("ok".into(), shell_workload("echo fine"));
        config.workloads.insert("bad".into(), shell_workload("echo nope >&2; exit 4"));
        config
    }

    #[tokio::test]
    async fn test_local_run_records_results_and_journal() {
        let dir = TempDir::new().unwrap();
        let runner = Runner::new(config(&dir), PluginRegistry::builtin());
        let mut journal = runner.initialize("run-1");
        let keys = runner.plan(&journal);
        assert_eq!(keys.len(), 4);
        assert_eq!(keys[0], TaskKey::new("localhost", "bad", 1));

        let summary = runner
            .run(&mut journal, &keys, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.failed, 2);
        assert!(!summary.cancelled);

        let bad = journal.task(&TaskKey::new("localhost", "bad", 1)).unwrap();
        assert_eq!(bad.status, RunStatus::Failed);
        assert_eq!(bad.error_type.as_deref(), Some("process"));

        let record = read_result(&result_path(
            &dir.path().join("run-1"),
            &TaskKey::new("localhost", "ok", 2),
        ))
        .unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.result.unwrap().stdout, "fine\n");

        let saved = RunJournal::load(&runner.journal_path("run-1")).unwrap();
        assert_eq!(saved, journal);
        assert!(saved.is_complete());
    }

    /// Records, at cleanup time, whether the repetition's result file exists.
    struct Recording {
        result_file: PathBuf,
        seen: Arc<Mutex<Vec<bool>>>,
    }

    #[async_trait]
    impl GeneratorHooks for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        fn command_args(&self) -> Result<Vec<String>, GeneratorError> {
            Ok(vec!["true".into()])
        }

        fn workload_timeout(&self) -> Duration {
            Duration::from_secs(5)
        }

        async fn cleanup(&self) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(self.result_file.exists());
            Ok(())
        }
    }

    struct RecordingPlugin {
        run_dir: PathBuf,
        seen: Arc<Mutex<Vec<bool>>>,
    }

    impl WorkloadPlugin for RecordingPlugin {
        fn meta(&self) -> PluginMeta {
            PluginMeta {
                name: "recording",
                description: "records cleanup ordering",
                requires: None,
            }
        }

        fn create_generator(
            &self,
            workload: &str,
            _config: &WorkloadConfig,
        ) -> anyhow::Result<Arc<dyn GeneratorHooks>> {
            Ok(Arc::new(Recording {
                result_file: result_path(&self.run_dir, &TaskKey::new(LOCAL_HOST, workload, 1)),
                seen: Arc::clone(&self.seen),
            }))
        }
    }

    #[tokio::test]
    async fn test_cleanup_runs_after_result_is_persisted() {
        let dir = TempDir::new().unwrap();
        let mut cfg = BenchConfig::default();
        cfg.run.output_root = dir.path().to_path_buf();
        cfg.run.timeout_buffer_secs = 1;
        cfg.workloads.insert(
            "ordered".into(),
            WorkloadConfig {
                plugin: "recording".into(),
                ..WorkloadConfig::default()
            },
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(RecordingPlugin {
            run_dir: dir.path().join("run-5"),
            seen: Arc::clone(&seen),
        }));

        let runner = Runner::new(cfg, registry);
        let mut journal = runner.initialize("run-5");
        let keys = runner.plan(&journal);
        let summary = runner.run(&mut journal, &keys, &CancellationToken::new()).await.unwrap();

        assert_eq!(summary.completed, 1);
        assert_eq!(*seen.lock().unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn test_retries_up_to_max() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir);
        cfg.run.max_retries = 2;
        cfg.run.repetitions = 1;
        cfg.workloads.remove("ok");
        let runner = Runner::new(cfg, PluginRegistry::builtin());
        let mut journal = runner.initialize("run-2");
        let keys = runner.plan(&journal);

        runner.run(&mut journal, &keys, &CancellationToken::new()).await.unwrap();
        let record = read_result(&result_path(
            &dir.path().join("run-2"),
            &TaskKey::new("localhost", "bad", 1),
        ))
        .unwrap();
        assert_eq!(record.attempts, 3);
        assert_eq!(record.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancel_before_start_leaves_tasks_pending() {
        let dir = TempDir::new().unwrap();
        let runner = Runner::new(config(&dir), PluginRegistry::builtin());
        let mut journal = runner.initialize("run-3");
        let keys = runner.plan(&journal);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = runner.run(&mut journal, &keys, &cancel).await.unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.remaining, 4);
        assert_eq!(journal.pending_keys().len(), 4);
    }

    #[tokio::test]
    async fn test_remote_hosts_are_left_alone() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir);
        cfg.remote_hosts.push(crate::config::RemoteHost {
            name: "node-a".into(),
            address: None,
        });
        let runner = Runner::new(cfg, PluginRegistry::builtin());
        let mut journal = runner.initialize("run-4");
        let keys = runner.plan(&journal);

        let summary = runner.run(&mut journal, &keys, &CancellationToken::new()).await.unwrap();
        assert_eq!(summary.remote, 4);
        assert_eq!(summary.completed + summary.failed, 0);
    }
}
