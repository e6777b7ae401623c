//! JSON persistence for run journals.
//!
//! One document per run at `<output_root>/<run_id>/run_journal.json`. Writes go
//! to a sibling temp file first and are renamed into place, so a crash never
//! leaves a half-written journal behind.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::{JournalError, RunJournal, TaskState};

pub const JOURNAL_FILE_NAME: &str = "run_journal.json";

/// Well-known journal location for a run.
pub fn journal_path(output_root: &Path, run_id: &str) -> PathBuf {
    output_root.join(run_id).join(JOURNAL_FILE_NAME)
}

/// On-disk layout: tasks are a list sorted by key.
#[derive(Debug, Serialize, Deserialize)]
struct JournalDocument {
    run_id: String,
    #[serde(default)]
    metadata: Map<String, Value>,
    #[serde(default)]
    tasks: Vec<TaskState>,
}

impl RunJournal {
    /// Serialize the journal to pretty JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        let doc = JournalDocument {
            run_id: self.run_id.clone(),
            metadata: self.metadata.clone(),
            tasks: self.tasks().into_iter().cloned().collect(),
        };
        serde_json::to_string_pretty(&doc)
    }

    /// Parse a journal document. Duplicate keys collapse, last record wins.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        let doc: JournalDocument = serde_json::from_str(json)?;
        let mut journal = RunJournal::new(doc.run_id);
        journal.metadata = doc.metadata;
        let total = doc.tasks.len();
        for task in doc.tasks {
            journal.upsert(task);
        }
        if journal.len() != total {
            warn!(
                run_id = %journal.run_id,
                records = total,
                unique = journal.len(),
                "journal contained duplicate task records"
            );
        }
        Ok(journal)
    }

    /// Atomically write the journal to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), JournalError> {
        let io_err = |source: std::io::Error| JournalError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = self.to_json().map_err(|e| JournalError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let tmp = path.with_extension("json.tmp");
        {
            let mut file = std::fs::File::create(&tmp).map_err(io_err)?;
            file.write_all(json.as_bytes()).map_err(io_err)?;
            file.sync_all().map_err(io_err)?;
        }
        std::fs::rename(&tmp, path).map_err(io_err)?;

        debug!(run_id = %self.run_id, path = %path.display(), tasks = self.len(), "saved run journal");
        Ok(())
    }

    /// Load a journal. A missing or unparsable file is reported, not panicked on.
    pub fn load(path: &Path) -> Result<Self, JournalError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(JournalError::Missing {
                    path: path.to_path_buf(),
                })
            }
            Err(source) => {
                return Err(JournalError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let journal = Self::from_json(&content).map_err(|e| JournalError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        debug!(run_id = %journal.run_id, path = %path.display(), tasks = journal.len(), "loaded run journal");
        Ok(journal)
    }
}
