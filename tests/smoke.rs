//! Smoke tests -- verify the binary runs and the subcommands are wired up.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn loadbench() -> Command {
    let mut cmd = Command::cargo_bin("loadbench").unwrap();
    cmd.env_remove("LOADBENCH_CONFIG").env_remove("RUST_LOG");
    cmd
}

/// Config with one quick shell workload and results under `dir`.
fn write_config(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("loadbench.toml");
    let content = format!(
        r#"
[run]
repetitions = 2
output_root = "{}"
timeout_buffer_secs = 5

[workloads.hello]
plugin = "shell"
timeout_secs = 10
options = {{ command = ["sh", "-c", "echo hello"] }}
"#,
        dir.join("results").display()
    );
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_cli_help() {
    loadbench()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("Resumable multi-host benchmark"));
}

#[test]
fn test_cli_version() {
    loadbench()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("loadbench"));
}

#[test]
fn test_subcommands_exist() {
    for sub in ["run", "resume", "status", "follow", "plugins"] {
        loadbench().args([sub, "--help"]).assert().success();
    }
}

#[test]
fn test_plugins_lists_builtins() {
    loadbench()
        .arg("plugins")
        .assert()
        .success()
        .stdout(
            predicates::str::contains("stress_ng")
                .and(predicates::str::contains("dd"))
                .and(predicates::str::contains("shell")),
        );
}

#[test]
fn test_status_of_unknown_run_fails() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path());
    loadbench()
        .args(["status", "--run-id", "nope", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicates::str::contains("journal not found"));
}

#[test]
fn test_broken_local_config_is_reported() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("loadbench.toml"), "[run]\nrepetitions = \"three\"\n").unwrap();

    loadbench()
        .current_dir(dir.path())
        .arg("plugins")
        .assert()
        .success()
        .stderr(predicates::str::contains("config file exists but could not be loaded"));
}

#[cfg(unix)]
#[test]
fn test_run_then_status() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path());

    loadbench()
        .args(["run", "--run-id", "smoke", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicates::str::contains("Completed: 2"));

    loadbench()
        .args(["status", "--run-id", "smoke", "--json", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicates::str::contains("\"progress\": \"2/2\"").and(predicates::str::contains("\"done\"")));

    // A second run with the same id must go through resume.
    loadbench()
        .args(["run", "--run-id", "smoke", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicates::str::contains("loadbench resume"));
}

#[test]
fn test_resume_without_execution_mode_fails_before_dispatch() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path());
    let run_dir = dir.path().join("results").join("old");
    std::fs::create_dir_all(&run_dir).unwrap();
    std::fs::write(
        run_dir.join("run_journal.json"),
        r#"{"run_id": "old", "metadata": {}, "tasks": [
            {"host": "localhost", "workload": "hello", "repetition": 1, "status": "failed"}
        ]}"#,
    )
    .unwrap();

    loadbench()
        .args(["resume", "--run-id", "old", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicates::str::contains("execution_mode"));

    assert!(!run_dir.join("results").exists());
}

#[test]
fn test_follow_rolls_up_polling() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("stream.log");
    std::fs::write(
        &input,
        concat!(
            "{\"host\": \"node-a\", \"task\": \"[run:lb-1] Poll LB_EVENT stream\", \"duration_s\": 1.0}\n",
            "{\"host\": \"node-a\", \"task\": \"[run:lb-1] Poll LB_EVENT stream\", \"duration_s\": 1.0}\n",
        ),
    )
    .unwrap();

    loadbench()
        .current_dir(dir.path())
        .arg("follow")
        .arg("--input")
        .arg(&input)
        .assert()
        .success()
        .stdout(predicates::str::contains("• [run:lb-1] (node-a) Polling loop poll x2 2.0s"));
}
