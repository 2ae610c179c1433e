use std::path::Path;

use anyhow::Context;
use cloudbench_core::prelude::ConfigurationError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::hooks::HookConfig;

/// A task file: an ordered list of workloads.
///
/// ```yaml
/// title: boot servers
/// workloads:
///   - scenario: Compute.boot_and_delete_server
///     args: {flavor: m1.tiny, image: cirros}
///     runner: {type: constant, times: 10, concurrency: 2}
///     contexts: {users: {tenants: 2, users_per_tenant: 1}}
///     sla: {failure_rate: {max: 0}}
///     hooks:
///       - action: {sys_call: "echo halfway"}
///         trigger: {event: {unit: iteration, at: [5]}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskConfig {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub workloads: Vec<WorkloadConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkloadConfig {
    pub scenario: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    /// Parsed into a runner policy when the workload starts, so an unknown type fails that
    /// workload rather than the whole file.
    #[serde(default = "default_runner")]
    pub runner: Value,
    #[serde(default)]
    pub contexts: Map<String, Value>,
    #[serde(default)]
    pub sla: Map<String, Value>,
    #[serde(default)]
    pub hooks: Vec<HookConfig>,
}

fn default_runner() -> Value {
    json!({"type": "serial", "times": 1})
}

impl WorkloadConfig {
    pub fn new(scenario: &str) -> Self {
        Self {
            scenario: scenario.to_string(),
            args: Map::new(),
            runner: default_runner(),
            contexts: Map::new(),
            sla: Map::new(),
            hooks: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args.as_object().cloned().unwrap_or_default();
        self
    }

    pub fn with_runner(mut self, runner: Value) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_context(mut self, name: &str, config: Value) -> Self {
        self.contexts.insert(name.to_string(), config);
        self
    }

    pub fn with_sla(mut self, sla: Value) -> Self {
        self.sla = sla.as_object().cloned().unwrap_or_default();
        self
    }

    pub fn with_hook(mut self, hook: HookConfig) -> Self {
        self.hooks.push(hook);
        self
    }
}

impl TaskConfig {
    pub fn new(workloads: Vec<WorkloadConfig>) -> Self {
        Self {
            title: None,
            description: None,
            workloads,
        }
    }

    /// Parse a task from YAML or JSON text.
    pub fn parse(content: &str) -> Result<Self, ConfigurationError> {
        let task: TaskConfig = serde_yaml::from_str(content)
            .map_err(|e| ConfigurationError(format!("invalid task file: {e}")))?;

        if task.workloads.is_empty() {
            return Err(ConfigurationError(
                "task must contain at least one workload".to_string(),
            ));
        }

        Ok(task)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read task file {}", path.display()))?;
        Ok(Self::parse(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_yaml_task() {
        let task = TaskConfig::parse(
            r#"
title: dummy
workloads:
  - scenario: Dummy.dummy
    args:
      sleep: 0.5
    runner:
      type: constant
      times: 10
      concurrency: 2
    sla:
      failure_rate: {max: 0}
    hooks:
      - description: restart
        action: {sys_call: "echo restart"}
        trigger: {event: {unit: iteration, at: [5]}}
  - scenario: Dummy.failure
"#,
        )
        .unwrap();

        assert_eq!(2, task.workloads.len());
        assert_eq!(json!(0.5), task.workloads[0].args["sleep"]);
        assert_eq!(json!("constant"), task.workloads[0].runner["type"]);
        assert_eq!(default_runner(), task.workloads[1].runner);
        assert_eq!("restart", task.workloads[0].hooks[0].description);
        assert!(task.workloads[1].hooks.is_empty());
    }

    #[test]
    fn parse_json_task() {
        let task = TaskConfig::parse(
            r#"{"workloads": [{"scenario": "Dummy.dummy", "contexts": {"users": {"tenants": 1}}}]}"#,
        )
        .unwrap();

        assert_eq!(json!({"tenants": 1}), task.workloads[0].contexts["users"]);
    }

    #[test]
    fn empty_task_is_rejected() {
        assert!(TaskConfig::parse("workloads: []").is_err());
        assert!(TaskConfig::parse("workloads: [{scenario: Dummy.dummy, typo: 1}]").is_err());
    }
}
