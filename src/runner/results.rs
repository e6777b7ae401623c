//! Per-repetition result files.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::generator::{GeneratorError, GeneratorOutcome, GeneratorResult};
use crate::journal::{RunStatus, TaskKey};

/// What is exported for one repetition, success or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub run_id: String,
    pub host: String,
    pub workload: String,
    pub repetition: u32,
    pub status: RunStatus,
    pub attempts: u32,
    pub recorded_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<GeneratorResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<GeneratorError>,
}

impl ResultRecord {
    pub fn from_outcome(run_id: &str, key: &TaskKey, outcome: &GeneratorOutcome, attempts: u32) -> Self {
        let (status, result, error) = match outcome {
            Ok(result) => (RunStatus::Completed, Some(result.clone()), None),
            Err(failure) => (
                RunStatus::Failed,
                failure.partial.clone(),
                Some(failure.error.clone()),
            ),
        };
        Self {
            run_id: run_id.to_string(),
            host: key.host.clone(),
            workload: key.workload.clone(),
            repetition: key.repetition,
            status,
            attempts,
            recorded_at: Utc::now(),
            result,
            error,
        }
    }
}

/// `<run_dir>/results/<host>/<workload>/rep-<n>.json`
pub fn result_path(run_dir: &Path, key: &TaskKey) -> PathBuf {
    run_dir
        .join("results")
        .join(&key.host)
        .join(&key.workload)
        .join(format!("rep-{}.json", key.repetition))
}

/// Write a record via temp file and rename.
pub fn write_result(path: &Path, record: &ResultRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let bytes = serde_json::to_vec_pretty(record).context("failed to serialize result")?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = std::fs::File::create(&tmp)
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to move result into {}", path.display()))?;
    Ok(())
}

pub fn read_result(path: &Path) -> Result<ResultRecord> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::{GeneratorFailure, GeneratorSettings};
    use tempfile::TempDir;

    #[test]
    fn test_failed_outcome_keeps_partial_result() {
        let key = TaskKey::new("localhost", "cpu", 2);
        let partial = GeneratorResult::empty("cpu", &GeneratorSettings::default(), Utc::now());
        let outcome: GeneratorOutcome = Err(GeneratorFailure::new(
            GeneratorError::Timeout { timeout_secs: 3.0 },
            partial,
        ));

        let dir = TempDir::new().unwrap();
        let path = result_path(dir.path(), &key);
        assert!(path.ends_with("results/localhost/cpu/rep-2.json"));

        let record = ResultRecord::from_outcome("r1", &key, &outcome, 2);
        write_result(&path, &record).unwrap();
        let loaded = read_result(&path).unwrap();

        assert_eq!(loaded.status, RunStatus::Failed);
        assert_eq!(loaded.attempts, 2);
        assert_eq!(loaded.error, Some(GeneratorError::Timeout { timeout_secs: 3.0 }));
        assert!(loaded.result.is_some());
    }
}
