//! Workload plugins: the explicit registry of generator factories.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use crate::config::{Intensity, WorkloadConfig};
use crate::generator::GeneratorHooks;

pub mod dd;
pub mod shell;
pub mod stress_ng;

/// Static description of a plugin, used by `loadbench plugins`.
#[derive(Debug, Clone, Serialize)]
pub struct PluginMeta {
    pub name: &'static str,
    pub description: &'static str,
    /// External binary the generator needs, if any.
    pub requires: Option<&'static str>,
}

/// A factory for generators of one workload kind.
pub trait WorkloadPlugin: Send + Sync {
    fn meta(&self) -> PluginMeta;

    fn name(&self) -> &'static str {
        self.meta().name
    }

    fn description(&self) -> &'static str {
        self.meta().description
    }

    /// Build the hooks for one repetition of the workload named `workload`.
    fn create_generator(&self, workload: &str, config: &WorkloadConfig) -> Result<Arc<dyn GeneratorHooks>>;
}

/// Plugins by name.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<&'static str, Arc<dyn WorkloadPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every builtin plugin.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(stress_ng::StressNgPlugin));
        registry.register(Arc::new(dd::DdPlugin));
        registry.register(Arc::new(shell::ShellPlugin));
        registry
    }

    /// Add a plugin, replacing any previous one with the same name.
    pub fn register(&mut self, plugin: Arc<dyn WorkloadPlugin>) {
        if self.plugins.insert(plugin.name(), Arc::clone(&plugin)).is_some() {
            tracing::warn!(plugin = plugin.name(), "replaced an already registered plugin");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn WorkloadPlugin>> {
        self.plugins.get(name).cloned()
    }

    pub fn list(&self) -> Vec<PluginMeta> {
        self.plugins.values().map(|p| p.meta()).collect()
    }

    /// Build hooks for `workload` through the plugin its config names.
    pub fn create_generator(&self, workload: &str, config: &WorkloadConfig) -> Result<Arc<dyn GeneratorHooks>> {
        let plugin = self.get(&config.plugin).ok_or_else(|| {
            anyhow::anyhow!(
                "workload '{}' uses unknown plugin '{}' (known: {})",
                workload,
                config.plugin,
                self.plugins.keys().copied().collect::<Vec<_>>().join(", ")
            )
        })?;
        plugin.create_generator(workload, config)
    }
}

/// Pick a preset by intensity; `UserDefined` falls back to `medium`, callers
/// override individual values through options.
pub(crate) fn preset<T: Copy>(intensity: Intensity, low: T, medium: T, high: T) -> T {
    match intensity {
        Intensity::Low => low,
        Intensity::Medium | Intensity::UserDefined => medium,
        Intensity::High => high,
    }
}
