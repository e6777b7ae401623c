//! stress-ng CPU/VM stressor.
//!
//! Runs `stress-ng --metrics-brief` with stdout and stderr combined, then
//! parses the per-stressor `bogo ops` table out of the output.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::{json, Map, Value};

use super::{preset, PluginMeta, WorkloadPlugin};
use crate::config::WorkloadConfig;
use crate::generator::{require_binary, GeneratorError, GeneratorHooks, LaunchOptions, RawOutput};

const BINARY: &str = "stress-ng";

pub struct StressNgPlugin;

impl WorkloadPlugin for StressNgPlugin {
    fn meta(&self) -> PluginMeta {
        PluginMeta {
            name: "stress_ng",
            description: "CPU and memory stressors via stress-ng, reports bogo ops per stressor",
            requires: Some(BINARY),
        }
    }

    fn create_generator(&self, workload: &str, config: &WorkloadConfig) -> Result<Arc<dyn GeneratorHooks>> {
        Ok(Arc::new(StressNg::from_config(workload, config)))
    }
}

/// One stress-ng invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct StressNg {
    name: String,
    cpu_workers: u64,
    vm_workers: u64,
    vm_bytes: String,
    duration: Duration,
}

impl StressNg {
    pub fn from_config(workload: &str, config: &WorkloadConfig) -> Self {
        let cpu = preset(config.intensity, 1, 2, 4);
        let vm = preset(config.intensity, 0, 1, 2);
        Self {
            name: workload.to_string(),
            cpu_workers: config.option_u64("cpu_workers").unwrap_or(cpu),
            vm_workers: config.option_u64("vm_workers").unwrap_or(vm),
            vm_bytes: config
                .option_str("vm_bytes")
                .unwrap_or(preset(config.intensity, "128M", "256M", "1G"))
                .to_string(),
            duration: config.timeout(),
        }
    }
}

#[async_trait::async_trait]
impl GeneratorHooks for StressNg {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate_environment(&self) -> Result<(), GeneratorError> {
        if self.cpu_workers == 0 && self.vm_workers == 0 {
            return Err(GeneratorError::validation("stress-ng needs at least one cpu or vm worker"));
        }
        require_binary(BINARY).map(|_| ())
    }

    fn command_args(&self) -> Result<Vec<String>, GeneratorError> {
        let mut argv = vec![BINARY.to_string()];
        if self.cpu_workers > 0 {
            argv.extend(["--cpu".to_string(), self.cpu_workers.to_string()]);
        }
        if self.vm_workers > 0 {
            argv.extend([
                "--vm".to_string(),
                self.vm_workers.to_string(),
                "--vm-bytes".to_string(),
                self.vm_bytes.clone(),
            ]);
        }
        argv.extend([
            "--timeout".to_string(),
            format!("{}s", self.duration.as_secs().max(1)),
            "--metrics-brief".to_string(),
        ]);
        Ok(argv)
    }

    fn launch_options(&self) -> LaunchOptions {
        LaunchOptions::combined()
    }

    fn workload_timeout(&self) -> Duration {
        self.duration
    }

    fn process_output(&self, raw: &RawOutput) -> Result<Map<String, Value>, GeneratorError> {
        let stressors = parse_metrics(&raw.stdout);
        if stressors.is_empty() {
            return Err(GeneratorError::parse("no bogo ops metrics in stress-ng output"));
        }
        let mut metrics = Map::new();
        metrics.insert("stressors".into(), Value::Object(stressors));
        Ok(metrics)
    }
}

/// Parse `stress-ng: metrc: [pid] cpu  12345  10.00  9.90  0.01  1234.5  1245.6`
/// rows into `{stressor: {bogo_ops, real_time_secs, ...}}`.
pub fn parse_metrics(output: &str) -> Map<String, Value> {
    let mut stressors = Map::new();
    for line in output.lines() {
        let Some((_, rest)) = line.split_once("metrc:").or_else(|| line.split_once("info:")) else {
            continue;
        };
        let mut fields = rest.split_whitespace().peekable();
        if fields.peek().is_some_and(|f| f.starts_with('[')) {
            fields.next();
        }
        let Some(stressor) = fields.next() else {
            continue;
        };
        let numbers: Vec<f64> = fields.map_while(|f| f.parse::<f64>().ok()).collect();
        if numbers.len() < 6 {
            continue;
        }
        stressors.insert(
            stressor.to_string(),
            json!({
                "bogo_ops": numbers[0],
                "real_time_secs": numbers[1],
                "usr_time_secs": numbers[2],
                "sys_time_secs": numbers[3],
                "bogo_ops_per_sec_real": numbers[4],
                "bogo_ops_per_sec_cpu": numbers[5],
            }),
        );
    }
    stressors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Intensity;
    use crate::generator::StreamPolicy;

    const SAMPLE: &str = "\
stress-ng: info:  [4121] setting to a 10 second run per stressor
stress-ng: info:  [4121] dispatching hogs: 2 cpu
stress-ng: metrc: [4121] stressor       bogo ops real time  usr time  sys time   bogo ops/s     bogo ops/s
stress-ng: metrc: [4121]                           (secs)    (secs)    (secs)   (real time) (usr+sys time)
stress-ng: metrc: [4121] cpu               20480     10.00     19.87      0.02      2047.91        1029.69
stress-ng: metrc: [4121] vm                 9000     10.01      5.00      4.80       899.10         918.37
stress-ng: info:  [4121] successful run completed in 10.02s
";

    #[test]
    fn test_parse_metrics_rows() {
        let metrics = parse_metrics(SAMPLE);
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics["cpu"]["bogo_ops"], json!(20480.0));
        assert_eq!(metrics["vm"]["bogo_ops_per_sec_real"], json!(899.10));
    }

    #[test]
    fn test_command_follows_intensity() {
        let config = WorkloadConfig {
            plugin: "stress_ng".into(),
            intensity: Intensity::High,
            timeout_secs: 30,
            ..WorkloadConfig::default()
        };
        let gen = StressNg::from_config("cpu", &config);
        assert_eq!(
            gen.command_args().unwrap(),
            vec!["stress-ng", "--cpu", "4", "--vm", "2", "--vm-bytes", "1G", "--timeout", "30s", "--metrics-brief"]
        );
        assert_eq!(gen.launch_options().stderr, StreamPolicy::MergeIntoStdout);
    }

    #[test]
    fn test_low_intensity_skips_vm_and_options_override() {
        let mut config = WorkloadConfig {
            intensity: Intensity::Low,
            ..WorkloadConfig::default()
        };
        let gen = StressNg::from_config("cpu", &config);
        assert!(!gen.command_args().unwrap().contains(&"--vm".to_string()));

        config.options.insert("cpu_workers".into(), toml::Value::Integer(8));
        let gen = StressNg::from_config("cpu", &config);
        assert_eq!(gen.command_args().unwrap()[2], "8");
    }

    #[test]
    fn test_missing_metrics_is_a_parse_error() {
        let gen = StressNg::from_config("cpu", &WorkloadConfig::default());
        let raw = RawOutput {
            stdout: "stress-ng: info: nothing here\n".into(),
            exit_code: Some(0),
            ..Default::default()
        };
        assert!(matches!(gen.process_output(&raw), Err(GeneratorError::Parse { .. })));
    }
}
