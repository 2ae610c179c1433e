use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha3::Digest;
use std::collections::HashMap;
use std::io::{BufRead, Read, Write};
use std::path::Path;

mod aggregate;
mod hook;
mod iteration;
mod sla;

pub use aggregate::{aggregate, percentile, ActionStats, AggregateResult, Aggregator, DurationStats};
pub use hook::{HookRunResult, HookStatus, HookTrigger};
pub use iteration::{AtomicActionRecord, ErrorInfo, IterationResult, ScenarioOutput};
pub use sla::{
    parse_sla, FailureRate, MaxAvgDuration, MaxAvgDurationPerAtomic, MaxSecondsPerIteration,
    Outliers, SlaAccumulator, SlaChecker, SlaCriterionResult, SlaResult, SlaRule, StreamingSla,
};

/// Result of running one workload of a task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkloadSummary {
    /// Position of the workload in the task file
    pub position: usize,
    /// The name of the scenario that was run
    pub scenario_name: String,
    /// The scenario arguments as configured
    pub args: Value,
    /// The runner configuration
    pub runner: Value,
    /// The contexts configuration
    pub contexts: Value,
    /// The SLA configuration
    pub sla: Value,
    /// The time the workload started
    ///
    /// This is a Unix timestamp in seconds.
    pub started_at: i64,
    /// Wall time from the first iteration being dispatched until the last one finished, in seconds
    pub load_duration: f64,
    /// Wall time including context setup and cleanup, in seconds
    pub full_duration: f64,
    /// Whether the run was stopped before it scheduled every iteration
    pub aborted: bool,
    /// Non-fatal anomalies observed during the run, such as `abort_not_honored`
    pub events: Vec<String>,
    /// Hooks started while the load ran, in the order they were triggered
    #[serde(default)]
    pub hooks: Vec<HookRunResult>,
    pub aggregate: AggregateResult,
}

impl WorkloadSummary {
    pub fn pass_sla(&self) -> bool {
        self.aggregate.sla.success
    }
}

/// Summary of a task run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSummary {
    /// The unique task id
    ///
    /// Chosen by the runner unless overridden on the command line. Also embedded in the names of
    /// resources created by the task.
    pub task_id: String,
    /// The time the task started
    ///
    /// This is a Unix timestamp in seconds.
    pub started_at: i64,
    /// One entry per workload, in the order they were run
    pub workloads: Vec<WorkloadSummary>,
    /// Environment variables set for the run
    ///
    /// This won't capture all environment variables. Just the ones the runner is aware of.
    pub env: HashMap<String, String>,
    /// The version of cloudbench that was used for this run
    pub cloudbench_version: String,
}

impl TaskSummary {
    pub fn new(task_id: String, started_at: i64, cloudbench_version: String) -> Self {
        Self {
            task_id,
            started_at,
            workloads: Vec::new(),
            env: HashMap::with_capacity(0),
            cloudbench_version,
        }
    }

    pub fn add_workload(&mut self, workload: WorkloadSummary) {
        self.workloads.push(workload);
    }

    pub fn add_env(&mut self, key: String, value: String) {
        self.env.insert(key, value);
    }

    /// True if every workload passed its SLA
    pub fn pass_sla(&self) -> bool {
        self.workloads.iter().all(WorkloadSummary::pass_sla)
    }

    /// Compute a fingerprint for this task
    ///
    /// The fingerprint identifies the configuration the task was run with, so that results of
    /// runs with the same configuration can be compared. It uses the
    ///     - Scenario name, arguments, runner, contexts and SLA of each workload
    ///     - Selected environment variables
    ///     - Cloudbench version
    ///
    /// The fingerprint is computed using [sha3::Sha3_256].
    pub fn fingerprint(&self) -> String {
        let mut hasher = sha3::Sha3_256::new();
        for workload in &self.workloads {
            Digest::update(&mut hasher, workload.scenario_name.as_bytes());
            // Object keys serialize in sorted order so this is stable.
            for config in [&workload.args, &workload.runner, &workload.contexts, &workload.sla] {
                Digest::update(&mut hasher, config.to_string().as_bytes());
            }
        }
        self.env
            .iter()
            .sorted_by_key(|(k, _)| k.to_owned())
            .for_each(|(k, v)| {
                Digest::update(&mut hasher, k.as_bytes());
                Digest::update(&mut hasher, v.as_bytes());
            });
        Digest::update(&mut hasher, self.cloudbench_version.as_bytes());

        format!("{:x}", hasher.finalize())
    }
}

/// Append the task summary to a file
///
/// The summary will be serialized to JSON and output as a single line followed by a newline. The
/// recommended file extension is `.jsonl`.
pub fn append_task_summary(summary: &TaskSummary, path: &Path) -> anyhow::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)?;
    store_task_summary(summary, &mut file)?;
    file.write_all(b"\n")?;
    Ok(())
}

/// Serialize the task summary to a writer
pub fn store_task_summary<W: Write>(summary: &TaskSummary, writer: &mut W) -> anyhow::Result<()> {
    serde_json::to_writer(writer, summary)?;
    Ok(())
}

/// Load a task summary from a reader
pub fn load_task_summary<R: Read>(reader: R) -> anyhow::Result<TaskSummary> {
    let reader = std::io::BufReader::new(reader);
    let summary: TaskSummary = serde_json::from_reader(reader)?;
    Ok(summary)
}

/// Load task summaries from a file
///
/// The file should contain one JSON object per line. This is the format produced by
/// [append_task_summary].
pub fn load_task_summaries(path: &Path) -> anyhow::Result<Vec<TaskSummary>> {
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);
    let mut summaries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        summaries.push(serde_json::from_str(&line)?);
    }
    Ok(summaries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn workload(scenario_name: &str, times: u64) -> WorkloadSummary {
        WorkloadSummary {
            position: 0,
            scenario_name: scenario_name.to_string(),
            args: json!({"sleep": 0.1}),
            runner: json!({"type": "constant", "times": times, "concurrency": 2}),
            contexts: json!({}),
            sla: json!({"failure_rate": {"max": 0}}),
            started_at: 1_700_000_000,
            load_duration: 1.5,
            full_duration: 2.0,
            aborted: false,
            events: Vec::new(),
            hooks: Vec::new(),
            aggregate: aggregate(&[]),
        }
    }

    #[test]
    fn fingerprint_tracks_configuration() {
        let mut first = TaskSummary::new("a".to_string(), 0, "0.1.0".to_string());
        first.add_workload(workload("Dummy.dummy", 10));
        let mut second = TaskSummary::new("b".to_string(), 100, "0.1.0".to_string());
        second.add_workload(workload("Dummy.dummy", 10));

        // Different task ids and times, same configuration
        assert_eq!(first.fingerprint(), second.fingerprint());

        second.workloads[0] = workload("Dummy.dummy", 20);
        assert_ne!(first.fingerprint(), second.fingerprint());
    }

    #[test]
    fn summaries_round_trip_through_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summaries.jsonl");

        let mut summary = TaskSummary::new("task".to_string(), 0, "0.1.0".to_string());
        summary.add_workload(workload("Dummy.dummy", 10));
        summary.add_env("CLOUDBENCH_REGION".to_string(), "sim".to_string());

        append_task_summary(&summary, &path).unwrap();
        append_task_summary(&summary, &path).unwrap();

        let loaded = load_task_summaries(&path).unwrap();
        assert_eq!(vec![summary.clone(), summary], loaded);
    }

    #[test]
    fn workloads_without_hooks_still_load() {
        let mut value = serde_json::to_value(workload("Dummy.dummy", 3)).unwrap();
        value.as_object_mut().unwrap().remove("hooks");

        let loaded: WorkloadSummary = serde_json::from_value(value).unwrap();
        assert!(loaded.hooks.is_empty());
    }

    #[test]
    fn hook_results_are_recorded_with_their_trigger() {
        let mut summary = workload("Dummy.dummy", 3);
        summary.hooks.push(HookRunResult {
            hook: "sys_call".to_string(),
            description: "restart".to_string(),
            triggered_by: HookTrigger {
                unit: "iteration".to_string(),
                value: 2,
            },
            status: HookStatus::Failed,
            started_at: 1.0,
            finished_at: 1.5,
            error: None,
        });

        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(json!("failed"), value["hooks"][0]["status"]);
        assert_eq!(json!({"unit": "iteration", "value": 2}), value["hooks"][0]["triggered_by"]);
        // Hook failures do not count against the SLA
        assert_eq!(summary.aggregate.sla.success, summary.pass_sla());
    }
}
