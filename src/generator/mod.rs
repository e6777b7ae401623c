//! Generator execution contract: run one workload repetition as a bounded
//! external process and report a structured result or error.
//!
//! Plugins implement [`GeneratorHooks`]; the [`Generator`] owns the process
//! lifecycle (start, stop, timeout) for exactly one repetition and hands the
//! outcome back over a channel.

pub mod process;
pub mod runner;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::RunConfig;

pub use runner::Generator;

/// Bytes of output quoted in a process failure.
const FAILURE_TAIL_BYTES: usize = 512;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Structured failure of a generator run. Stored in results, never raised out
/// of the background worker.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GeneratorError {
    #[error("environment validation failed: {reason}")]
    Validation { reason: String },

    #[error("generator '{name}' was already started")]
    AlreadyStarted { name: String },

    #[error("process exited with code {exit_code:?}: {detail}")]
    Process { exit_code: Option<i32>, detail: String },

    #[error("process exceeded its {timeout_secs}s timeout and was terminated")]
    Timeout { timeout_secs: f64 },

    #[error("could not interpret process output: {reason}")]
    Parse { reason: String },

    #[error("generator was stopped before the process finished")]
    Stopped,

    #[error("{context}: {cause}")]
    Unexpected { context: String, cause: String },
}

impl GeneratorError {
    /// Short machine-readable category, used as a task's `error_type`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::AlreadyStarted { .. } => "already_started",
            Self::Process { .. } => "process",
            Self::Timeout { .. } => "timeout",
            Self::Parse { .. } => "parse",
            Self::Stopped => "stopped",
            Self::Unexpected { .. } => "unexpected",
        }
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    pub fn parse(reason: impl Into<String>) -> Self {
        Self::Parse {
            reason: reason.into(),
        }
    }

    pub fn unexpected(context: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Self::Unexpected {
            context: context.into(),
            cause: cause.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Run-level knobs shared by every generator of a run.
#[derive(Debug, Clone)]
pub struct GeneratorSettings {
    /// Added on top of the workload timeout.
    pub timeout_buffer: Duration,
    /// Time between the graceful signal and the forced kill.
    pub kill_grace: Duration,
    /// How long `stop()` waits for the worker before escalating.
    pub stop_join_timeout: Duration,
    /// Retry hint for the caller, copied into results.
    pub max_retries: u32,
    /// Labels copied into results.
    pub tags: Vec<String>,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            timeout_buffer: Duration::from_secs(120),
            kill_grace: Duration::from_secs(5),
            stop_join_timeout: Duration::from_secs(5),
            max_retries: 0,
            tags: Vec::new(),
        }
    }
}

impl GeneratorSettings {
    pub fn from_run_config(run: &RunConfig, tags: Vec<String>) -> Self {
        Self {
            timeout_buffer: run.timeout_buffer(),
            kill_grace: run.kill_grace(),
            stop_join_timeout: run.stop_join_timeout(),
            max_retries: run.max_retries,
            tags,
        }
    }
}

// ---------------------------------------------------------------------------
// CommandSpec
// ---------------------------------------------------------------------------

/// What happens to one output stream of the child.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamPolicy {
    #[default]
    Capture,
    Discard,
    /// Only meaningful for stderr: lines are interleaved into stdout.
    MergeIntoStdout,
}

/// Process-launch options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchOptions {
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub stdout: StreamPolicy,
    pub stderr: StreamPolicy,
}

impl LaunchOptions {
    /// Stdout dropped, stderr captured.
    pub fn discard_stdout() -> Self {
        Self {
            stdout: StreamPolicy::Discard,
            ..Self::default()
        }
    }

    /// Both streams captured into stdout in arrival order.
    pub fn combined() -> Self {
        Self {
            stderr: StreamPolicy::MergeIntoStdout,
            ..Self::default()
        }
    }
}

/// The full invocation of one generator run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    pub options: LaunchOptions,
    /// Effective timeout, buffer included.
    pub timeout: Duration,
}

impl CommandSpec {
    /// Shell-quoted command line for logs and results.
    pub fn command_line(&self) -> String {
        self.argv
            .iter()
            .map(|part| shell_quote(part))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r#"'"'"'"#))
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// What the process produced, before any plugin interpretation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawOutput {
    pub argv: Vec<String>,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
    pub timed_out: bool,
    /// Effective timeout the process ran under.
    pub timeout: Duration,
}

impl RawOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }

    /// Last bytes of stderr, or of stdout when stderr is empty.
    pub fn failure_tail(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let text = text.trim_end();
        let mut start = text.len().saturating_sub(FAILURE_TAIL_BYTES);
        while !text.is_char_boundary(start) {
            start += 1;
        }
        text[start..].to_string()
    }
}

/// Result of one generator run, retained for export whether it succeeded or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorResult {
    pub generator: String,
    pub command_line: String,
    pub argv: Vec<String>,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub timeout_seconds: Option<f64>,
    /// Plugin-specific parsed fields.
    pub metrics: Map<String, Value>,
    pub max_retries: u32,
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<GeneratorError>,
}

impl GeneratorResult {
    /// A result with no process output yet.
    pub fn empty(generator: &str, settings: &GeneratorSettings, started_at: DateTime<Utc>) -> Self {
        Self {
            generator: generator.to_string(),
            command_line: String::new(),
            argv: Vec::new(),
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            started_at,
            finished_at: None,
            duration_seconds: None,
            timeout_seconds: None,
            metrics: Map::new(),
            max_retries: settings.max_retries,
            tags: settings.tags.clone(),
            error: None,
        }
    }

    /// A result filled from the raw process output.
    pub fn from_raw(
        generator: &str,
        spec: &CommandSpec,
        raw: &RawOutput,
        settings: &GeneratorSettings,
        started_at: DateTime<Utc>,
    ) -> Self {
        let mut result = Self::empty(generator, settings, started_at);
        result.command_line = spec.command_line();
        result.argv = raw.argv.clone();
        result.exit_code = raw.exit_code;
        result.stdout = raw.stdout.clone();
        result.stderr = raw.stderr.clone();
        result.finished_at = Some(Utc::now());
        result.duration_seconds = Some(raw.elapsed.as_secs_f64());
        result.timeout_seconds = Some(spec.timeout.as_secs_f64());
        result
    }

    pub fn with_error(mut self, error: GeneratorError) -> Self {
        self.error = Some(error);
        self
    }
}

/// A failed run: the error plus whatever result could still be assembled.
/// `partial` is only absent when the worker itself crashed.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorFailure {
    pub error: GeneratorError,
    pub partial: Option<GeneratorResult>,
}

impl GeneratorFailure {
    pub fn new(error: GeneratorError, partial: GeneratorResult) -> Self {
        let partial = partial.with_error(error.clone());
        Self {
            error,
            partial: Some(partial),
        }
    }

    pub fn catastrophic(error: GeneratorError) -> Self {
        Self {
            error,
            partial: None,
        }
    }
}

/// Typed outcome of one repetition.
pub type GeneratorOutcome = Result<GeneratorResult, GeneratorFailure>;

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

/// The plugin side of the contract. Everything the core needs to launch and
/// interpret a workload goes through these hooks.
#[async_trait]
pub trait GeneratorHooks: Send + Sync {
    /// Workload name, used in logs and results.
    fn name(&self) -> &str;

    /// Check prerequisites (binaries, devices) before anything is spawned.
    fn validate_environment(&self) -> Result<(), GeneratorError> {
        Ok(())
    }

    /// Argument vector; the first element is the program.
    fn command_args(&self) -> Result<Vec<String>, GeneratorError>;

    /// Launch options. Default: capture stdout and stderr as text.
    fn launch_options(&self) -> LaunchOptions {
        LaunchOptions::default()
    }

    /// How long the workload itself is expected to run.
    fn workload_timeout(&self) -> Duration;

    /// Timeout applied to the process.
    fn effective_timeout(&self, buffer: Duration) -> Duration {
        self.workload_timeout() + buffer
    }

    /// Full invocation. Override to take control of all three pieces at once.
    fn command_spec(&self, buffer: Duration) -> Result<CommandSpec, GeneratorError> {
        Ok(CommandSpec {
            argv: self.command_args()?,
            options: self.launch_options(),
            timeout: self.effective_timeout(buffer),
        })
    }

    /// Turn successful output into plugin-specific metrics.
    fn process_output(&self, _raw: &RawOutput) -> Result<Map<String, Value>, GeneratorError> {
        Ok(Map::new())
    }

    /// Map a non-zero or timed-out exit to a structured error.
    fn translate_failure(&self, raw: &RawOutput) -> GeneratorError {
        if raw.timed_out {
            GeneratorError::Timeout {
                timeout_secs: raw.timeout.as_secs_f64(),
            }
        } else {
            GeneratorError::Process {
                exit_code: raw.exit_code,
                detail: raw.failure_tail(),
            }
        }
    }

    /// One-time setup before the first repetition, outside the measurement window.
    async fn prepare(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Best-effort teardown of repetition-local artifacts.
    async fn cleanup(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Environment helpers
// ---------------------------------------------------------------------------

/// Locate an executable the way a shell would.
pub fn find_in_path(binary: &str) -> Option<PathBuf> {
    if binary.contains(std::path::MAIN_SEPARATOR) {
        let path = PathBuf::from(binary);
        return is_executable(&path).then_some(path);
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(binary))
        .find(|candidate| is_executable(candidate))
}

/// Validation error unless `binary` is on `PATH`.
pub fn require_binary(binary: &str) -> Result<PathBuf, GeneratorError> {
    find_in_path(binary)
        .ok_or_else(|| GeneratorError::validation(format!("required binary '{}' not found", binary)))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed;

    #[async_trait]
    impl GeneratorHooks for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        fn command_args(&self) -> Result<Vec<String>, GeneratorError> {
            Ok(vec!["echo".into(), "hello world".into()])
        }

        fn workload_timeout(&self) -> Duration {
            Duration::from_secs(10)
        }
    }

    #[test]
    fn test_default_command_spec_adds_buffer() {
        let spec = Fixed.command_spec(Duration::from_secs(3)).unwrap();
        assert_eq!(spec.timeout, Duration::from_secs(13));
        assert_eq!(spec.options, LaunchOptions::default());
        assert_eq!(spec.command_line(), "echo 'hello world'");
    }

    #[test]
    fn test_default_translate_failure() {
        let raw = RawOutput {
            exit_code: Some(2),
            stderr: "boom\n".into(),
            ..Default::default()
        };
        assert_eq!(
            Fixed.translate_failure(&raw),
            GeneratorError::Process {
                exit_code: Some(2),
                detail: "boom".into()
            }
        );

        let timed_out = RawOutput {
            timed_out: true,
            timeout: Duration::from_secs(2),
            ..Default::default()
        };
        assert_eq!(
            Fixed.translate_failure(&timed_out),
            GeneratorError::Timeout { timeout_secs: 2.0 }
        );
    }

    #[test]
    fn test_failure_tail_is_bounded() {
        let raw = RawOutput {
            stdout: "x".repeat(2000),
            ..Default::default()
        };
        assert_eq!(raw.failure_tail().len(), FAILURE_TAIL_BYTES);
    }

    #[test]
    fn test_error_serializes_with_kind_tag() {
        let err = GeneratorError::Timeout { timeout_secs: 2.0 };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "timeout");
        assert_eq!(err.kind(), "timeout");
        let back: GeneratorError = serde_json::from_value(json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn test_failure_carries_error_in_partial_result() {
        let settings = GeneratorSettings::default();
        let failure = GeneratorFailure::new(
            GeneratorError::Stopped,
            GeneratorResult::empty("fixed", &settings, Utc::now()),
        );
        assert_eq!(
            failure.partial.unwrap().error,
            Some(GeneratorError::Stopped)
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_find_in_path() {
        assert!(find_in_path("sh").is_some());
        assert!(find_in_path("definitely-not-a-real-binary-xyz").is_none());
        assert!(matches!(
            require_binary("definitely-not-a-real-binary-xyz"),
            Err(GeneratorError::Validation { .. })
        ));
    }
}
