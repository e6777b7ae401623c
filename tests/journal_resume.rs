//! Interrupted and failed runs resumed from the journal on disk.

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use loadbench::config::{BenchConfig, WorkloadConfig};
use loadbench::journal::{
    summarize_progress, ExecutionMode, JournalError, PairStatus, ResumeOverrides, RunJournal,
    RunStatus, TaskKey,
};
use loadbench::plugins::PluginRegistry;
use loadbench::runner::Runner;

fn shell_workload(script: &str) -> WorkloadConfig {
    let mut workload = WorkloadConfig {
        plugin: "shell".into(),
        timeout_secs: 10,
        ..WorkloadConfig::default()
    };
    let command = ["sh", "-c", script]
        .iter()
        .map(|s| toml::Value::String(s.to_string()))
        .collect();
    workload.options.insert("command".into(), toml::Value::Array(command));
    workload
}

#[test]
fn test_saved_journal_reloads_with_same_tasks() {
    let dir = TempDir::new().unwrap();
    let mut config = BenchConfig::default();
    config.run.output_root = dir.path().to_path_buf();
    config.run.repetitions = 3;
    config.workloads.insert("cpu".into(), shell_workload("true"));

    let runner = Runner::new(config, PluginRegistry::builtin());
    let mut journal = runner.initialize("r1");
    journal.get_task("localhost", "cpu", 1).mark_running();
    journal.get_task("localhost", "cpu", 1).mark_finished(RunStatus::Completed);
    journal.get_task("localhost", "cpu", 2).mark_running();
    journal.save(&runner.journal_path("r1")).unwrap();

    let loaded = RunJournal::load(&runner.journal_path("r1")).unwrap();
    assert_eq!(loaded, journal);
    assert_eq!(
        summarize_progress(loaded.tasks_for("localhost", "cpu"), 3),
        (PairStatus::Running, "1/3".to_string())
    );
}

#[test]
fn test_resume_of_missing_journal_is_an_error() {
    let dir = TempDir::new().unwrap();
    let err = RunJournal::load(&dir.path().join("gone").join("run_journal.json")).unwrap_err();
    assert!(matches!(err, JournalError::Missing { .. }));
}

#[test]
fn test_resume_needs_node_count_when_journal_lacks_it() {
    let mut journal = RunJournal::new("legacy");
    journal.get_task("node-a", "cpu", 1);
    journal.set_execution_mode(ExecutionMode::Docker);

    let err = journal.resume_plan(&ResumeOverrides::default()).unwrap_err();
    assert!(matches!(err, JournalError::MissingMetadata { field: "node_count" }));

    let plan = journal
        .resume_plan(&ResumeOverrides {
            execution_mode: None,
            node_count: Some(4),
        })
        .unwrap();
    assert_eq!(plan.execution_mode, ExecutionMode::Docker);
    assert_eq!(plan.node_count, 4);
    assert_eq!(journal.node_count(), Some(4));
}

#[cfg(unix)]
#[test]
fn test_failed_tasks_are_rerun_and_completed_ones_skipped() {
    tokio_test::block_on(async {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("ready");
        let mut config = BenchConfig::default();
        config.run.output_root = dir.path().join("out");
        config.run.repetitions = 2;
        config.run.timeout_buffer_secs = 5;
        config.workloads.insert("steady".into(), shell_workload("echo ok"));
        config.workloads.insert(
            "flaky".into(),
            shell_workload(&format!("test -f {}", marker.display())),
        );

        let runner = Runner::new(config, PluginRegistry::builtin());
        let mut journal = runner.initialize("r2");
        let keys = runner.plan(&journal);
        let first = runner
            .run(&mut journal, &keys, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(first.completed, 2);
        assert_eq!(first.failed, 2);

        std::fs::write(&marker, b"").unwrap();

        let mut resumed = RunJournal::load(&runner.journal_path("r2")).unwrap();
        let plan = resumed.resume_plan(&ResumeOverrides::default()).unwrap();
        assert_eq!(plan.execution_mode, ExecutionMode::Remote);
        assert_eq!(plan.node_count, 1);
        assert_eq!(plan.skip.len(), 2);
        assert!(plan.skip.iter().all(|k| k.workload == "steady"));
        assert!(plan.should_run(&TaskKey::new("localhost", "flaky", 2)));
        assert_eq!(
            resumed.task(&TaskKey::new("localhost", "flaky", 1)).unwrap().status,
            RunStatus::Pending
        );

        let keys = runner.plan_resume(&plan);
        let second = runner
            .run(&mut resumed, &keys, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(second.completed, 2);
        assert_eq!(second.failed, 0);
        assert!(resumed.is_complete());

        let on_disk = RunJournal::load(&runner.journal_path("r2")).unwrap();
        assert!(on_disk
            .tasks()
            .iter()
            .all(|task| task.status == RunStatus::Completed));
    });
}
