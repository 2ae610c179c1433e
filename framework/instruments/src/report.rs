mod jsonl_file_reporter;
mod summary_report;

use std::path::PathBuf;

use cloudbench_core::prelude::AbortListener;
use cloudbench_summary_model::{IterationResult, WorkloadSummary};
use parking_lot::Mutex;
use tokio::runtime::Runtime;

pub use jsonl_file_reporter::JsonlFileReportCollector;
pub use summary_report::SummaryReportCollector;

/// Receives results as a task runs.
pub trait ReportCollector {
    /// Called from the result consumer for every finished iteration, in completion order.
    fn add_iteration(&mut self, scenario_name: &str, result: &IterationResult);

    /// Called once a workload has been aggregated and checked against its SLA.
    fn add_workload(&mut self, _summary: &WorkloadSummary) {}

    fn finalize(&self);
}

/// Fans results out to every configured collector.
pub struct Reporter {
    collectors: Mutex<Vec<Box<dyn ReportCollector + Send>>>,
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter")
            .field("collectors", &self.collectors.lock().len())
            .finish()
    }
}

impl Reporter {
    pub fn new(collectors: Vec<Box<dyn ReportCollector + Send>>) -> Self {
        Self {
            collectors: Mutex::new(collectors),
        }
    }

    /// A reporter that discards everything.
    pub fn noop() -> Self {
        Self::new(Vec::new())
    }

    pub fn add_iteration(&self, scenario_name: &str, result: &IterationResult) {
        for collector in self.collectors.lock().iter_mut() {
            collector.add_iteration(scenario_name, result);
        }
    }

    pub fn add_workload(&self, summary: &WorkloadSummary) {
        for collector in self.collectors.lock().iter_mut() {
            collector.add_workload(summary);
        }
    }

    pub fn finalize(&self) {
        for collector in self.collectors.lock().iter() {
            collector.finalize();
        }
    }
}

/// Which collectors to create for a run.
#[derive(Debug, Clone, Default)]
pub struct ReportConfig {
    pub enable_summary: bool,
    pub jsonl_dir: Option<PathBuf>,
}

impl ReportConfig {
    pub fn enable_summary(mut self) -> Self {
        self.enable_summary = true;
        self
    }

    pub fn enable_jsonl(mut self, dir: PathBuf) -> Self {
        self.jsonl_dir = Some(dir);
        self
    }

    pub fn init_reporter(
        &self,
        runtime: &Runtime,
        abort: AbortListener,
        task_id: &str,
    ) -> anyhow::Result<Reporter> {
        let mut collectors: Vec<Box<dyn ReportCollector + Send>> = Vec::new();

        if self.enable_summary {
            collectors.push(Box::new(SummaryReportCollector::new()));
        }

        if let Some(dir) = &self.jsonl_dir {
            collectors.push(Box::new(JsonlFileReportCollector::new(
                runtime,
                abort,
                dir.clone(),
                task_id.to_string(),
            )?));
        }

        Ok(Reporter::new(collectors))
    }
}
