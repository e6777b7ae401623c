//! TOML configuration for benchmark runs.
//!
//! Layered the same way everywhere: every section has sensible defaults, a
//! `LOADBENCH_CONFIG` environment variable can point at a file, and a
//! `loadbench.toml` in the working directory is picked up when present.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::journal::ExecutionMode;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "LOADBENCH_CONFIG";

/// Config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "loadbench.toml";

/// Host name used for locally executed workloads.
pub const LOCAL_HOST: &str = "localhost";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for a benchmark run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BenchConfig {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub remote_hosts: Vec<RemoteHost>,
    #[serde(default)]
    pub workloads: BTreeMap<String, WorkloadConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BenchConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), workloads = config.workloads.len(), "loaded benchmark configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path in the `LOADBENCH_CONFIG` environment variable.
    /// 2. `./loadbench.toml`.
    /// 3. Compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "LOADBENCH_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local_path = Path::new(DEFAULT_CONFIG_FILE);
        if local_path.exists() {
            match Self::load(local_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %local_path.display(),
                        error = %e,
                        "config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Reject configurations that cannot produce a meaningful run.
    pub fn validate(&self) -> Result<()> {
        if self.run.repetitions == 0 {
            anyhow::bail!("run.repetitions must be at least 1");
        }
        for host in &self.remote_hosts {
            if host.name.trim().is_empty() {
                anyhow::bail!("remote host entries need a non-empty name");
            }
        }
        for (name, workload) in &self.workloads {
            if workload.plugin.trim().is_empty() {
                anyhow::bail!("workload '{}' has no plugin", name);
            }
        }
        Ok(())
    }

    /// Hosts the run targets. Local execution uses a single `localhost` host.
    pub fn target_hosts(&self) -> Vec<String> {
        if self.remote_hosts.is_empty() {
            vec![LOCAL_HOST.to_string()]
        } else {
            self.remote_hosts.iter().map(|h| h.name.clone()).collect()
        }
    }

    /// Names of the enabled workloads, in stable order.
    pub fn enabled_workloads(&self) -> Vec<String> {
        self.workloads
            .iter()
            .filter(|(_, w)| w.enabled)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Node count stamped into a new journal: explicit value wins, otherwise the
    /// number of configured remote hosts (or one for a purely local run).
    pub fn node_count(&self) -> u32 {
        self.run
            .node_count
            .unwrap_or_else(|| self.remote_hosts.len().max(1) as u32)
    }

    /// Directory holding all artifacts for `run_id`.
    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.run.output_root.join(run_id)
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Run-wide execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Repetitions per (host, workload) pair.
    pub repetitions: u32,
    /// How workloads reach their hosts.
    pub execution_mode: ExecutionMode,
    /// Explicit node count for container/VM modes.
    pub node_count: Option<u32>,
    /// Root directory for journals and results.
    pub output_root: PathBuf,
    /// Seconds added on top of each workload's own timeout.
    pub timeout_buffer_secs: u64,
    /// Seconds between SIGTERM and SIGKILL.
    pub kill_grace_secs: u64,
    /// Seconds `stop()` waits for a generator worker to finish.
    pub stop_join_secs: u64,
    /// Retry hint passed through to results; nothing retries automatically.
    pub max_retries: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            repetitions: 1,
            execution_mode: ExecutionMode::Remote,
            node_count: None,
            output_root: PathBuf::from("benchmark_results"),
            timeout_buffer_secs: 120,
            kill_grace_secs: 5,
            stop_join_secs: 5,
            max_retries: 0,
        }
    }
}

impl RunConfig {
    pub fn timeout_buffer(&self) -> Duration {
        Duration::from_secs(self.timeout_buffer_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    pub fn stop_join_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_join_secs)
    }
}

// ---------------------------------------------------------------------------
// Remote hosts
// ---------------------------------------------------------------------------

/// A host reached through the remote execution engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteHost {
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
}

// ---------------------------------------------------------------------------
// Workloads
// ---------------------------------------------------------------------------

/// Named preset selecting workload parameters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Intensity {
    Low,
    #[default]
    Medium,
    High,
    /// Parameters come entirely from `options`.
    UserDefined,
}

/// One configured workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Plugin that builds the generator (`stress_ng`, `dd`, `shell`).
    pub plugin: String,
    pub enabled: bool,
    pub intensity: Intensity,
    /// Duration of the workload itself, before the safety buffer.
    pub timeout_secs: u64,
    /// Plugin-specific options.
    pub options: toml::Table,
    /// Free-form labels carried into each result.
    pub tags: Vec<String>,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            plugin: String::new(),
            enabled: true,
            intensity: Intensity::default(),
            timeout_secs: 60,
            options: toml::Table::new(),
            tags: Vec::new(),
        }
    }
}

impl WorkloadConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(|v| v.as_str())
    }

    pub fn option_u64(&self, key: &str) -> Option<u64> {
        self.options
            .get(key)
            .and_then(|v| v.as_integer())
            .and_then(|v| u64::try_from(v).ok())
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Tracing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
