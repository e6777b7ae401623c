//! Arbitrary user command, for workloads without a dedicated plugin.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};

use super::{PluginMeta, WorkloadPlugin};
use crate::config::WorkloadConfig;
use crate::generator::{require_binary, GeneratorError, GeneratorHooks, LaunchOptions};

pub struct ShellPlugin;

impl WorkloadPlugin for ShellPlugin {
    fn meta(&self) -> PluginMeta {
        PluginMeta {
            name: "shell",
            description: "Runs the argv given in options.command",
            requires: None,
        }
    }

    fn create_generator(&self, workload: &str, config: &WorkloadConfig) -> Result<Arc<dyn GeneratorHooks>> {
        let Some(command) = config.options.get("command").and_then(|v| v.as_array()) else {
            bail!("workload '{}': shell plugin needs options.command as an array", workload);
        };
        let argv = command
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()
            .unwrap_or_default();
        if argv.is_empty() {
            bail!("workload '{}': options.command must be a non-empty list of strings", workload);
        }

        let merge = config
            .options
            .get("merge_stderr")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let options = if merge {
            LaunchOptions::combined()
        } else {
            LaunchOptions::default()
        };

        Ok(Arc::new(ShellCommand {
            name: workload.to_string(),
            argv,
            options,
            duration: config.timeout(),
        }))
    }
}

#[derive(Debug, Clone)]
pub struct ShellCommand {
    name: String,
    argv: Vec<String>,
    options: LaunchOptions,
    duration: Duration,
}

impl GeneratorHooks for ShellCommand {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate_environment(&self) -> Result<(), GeneratorError> {
        require_binary(&self.argv[0]).map(|_| ())
    }

    fn command_args(&self) -> Result<Vec<String>, GeneratorError> {
        Ok(self.argv.clone())
    }

    fn launch_options(&self) -> LaunchOptions {
        self.options.clone()
    }

    fn workload_timeout(&self) -> Duration {
        self.duration
    }
}
