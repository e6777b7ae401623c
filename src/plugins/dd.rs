//! Sequential write throughput with `dd`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{preset, PluginMeta, WorkloadPlugin};
use crate::config::WorkloadConfig;
use crate::generator::{require_binary, GeneratorError, GeneratorHooks, LaunchOptions, RawOutput};

const BINARY: &str = "dd";
const DEFAULT_DIR: &str = "/tmp/loadbench-dd";

pub struct DdPlugin;

impl WorkloadPlugin for DdPlugin {
    fn meta(&self) -> PluginMeta {
        PluginMeta {
            name: "dd",
            description: "Sequential write of zeros to a scratch file, reports MB/s",
            requires: Some(BINARY),
        }
    }

    fn create_generator(&self, workload: &str, config: &WorkloadConfig) -> Result<Arc<dyn GeneratorHooks>> {
        Ok(Arc::new(DdWrite::from_config(workload, config)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DdWrite {
    name: String,
    target: PathBuf,
    block_size: String,
    count: u64,
    sync: bool,
    duration: Duration,
}

impl DdWrite {
    pub fn from_config(workload: &str, config: &WorkloadConfig) -> Self {
        let dir = config.option_str("directory").unwrap_or(DEFAULT_DIR);
        Self {
            name: workload.to_string(),
            target: PathBuf::from(dir).join(format!("{}.img", workload)),
            block_size: config.option_str("block_size").unwrap_or("1M").to_string(),
            count: config
                .option_u64("count")
                .unwrap_or(preset(config.intensity, 64, 256, 1024)),
            sync: config
                .options
                .get("sync")
                .and_then(|v| v.as_bool())
                .unwrap_or(true),
            duration: config.timeout(),
        }
    }

    pub fn target(&self) -> &PathBuf {
        &self.target
    }
}

#[async_trait::async_trait]
impl GeneratorHooks for DdWrite {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate_environment(&self) -> Result<(), GeneratorError> {
        if self.count == 0 {
            return Err(GeneratorError::validation("dd count must be at least 1"));
        }
        require_binary(BINARY).map(|_| ())
    }

    fn command_args(&self) -> Result<Vec<String>, GeneratorError> {
        let mut argv = vec![
            BINARY.to_string(),
            "if=/dev/zero".to_string(),
            format!("of={}", self.target.display()),
            format!("bs={}", self.block_size),
            format!("count={}", self.count),
        ];
        if self.sync {
            argv.push("conv=fdatasync".to_string());
        }
        Ok(argv)
    }

    /// dd writes its statistics to stderr; stdout carries nothing useful.
    fn launch_options(&self) -> LaunchOptions {
        LaunchOptions::discard_stdout()
    }

    fn workload_timeout(&self) -> Duration {
        self.duration
    }

    fn process_output(&self, raw: &RawOutput) -> Result<Map<String, Value>, GeneratorError> {
        let (bytes, seconds) = parse_summary(&raw.stderr)
            .ok_or_else(|| GeneratorError::parse("no transfer summary in dd output"))?;
        let mut metrics = Map::new();
        metrics.insert("bytes".into(), json!(bytes));
        metrics.insert("seconds".into(), json!(seconds));
        if seconds > 0.0 {
            metrics.insert("throughput_mbps".into(), json!(bytes as f64 / seconds / 1_000_000.0));
        }
        Ok(metrics)
    }

    async fn prepare(&self) -> Result<()> {
        if let Some(dir) = self.target.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.target).await {
            Ok(()) => {
                debug!(path = %self.target.display(), "removed dd scratch file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to remove {}", self.target.display())),
        }
    }
}

/// Extract `(bytes, seconds)` from the GNU or BSD summary line, e.g.
/// `268435456 bytes (268 MB, 256 MiB) copied, 0.512 s, 524 MB/s`.
pub fn parse_summary(stderr: &str) -> Option<(u64, f64)> {
    stderr.lines().rev().find_map(|line| {
        let (bytes, rest) = line.trim().split_once(" bytes")?;
        let bytes = bytes.trim().parse::<u64>().ok()?;
        let after = rest.split_once("copied,").map(|(_, a)| a).or_else(|| {
            rest.split_once("transferred in").map(|(_, a)| a)
        })?;
        let seconds = after
            .split_whitespace()
            .next()?
            .trim_end_matches(',')
            .parse::<f64>()
            .ok()?;
        Some((bytes, seconds))
    })
}
