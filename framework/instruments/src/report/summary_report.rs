mod tables;

use cloudbench_summary_model::{DurationStats, IterationResult, WorkloadSummary};
use tabled::settings::Style;
use tabled::Table;

use crate::report::summary_report::tables::{ActionRow, SlaRow};
use crate::report::ReportCollector;

#[derive(Debug, Default)]
struct Samples {
    durations: Vec<f64>,
    failed: usize,
}

impl Samples {
    fn add(&mut self, duration: f64, failed: bool) {
        self.durations.push(duration);
        if failed {
            self.failed += 1;
        }
    }
}

/// Keeps every result in memory and prints the load table and SLA outcome at the end of the run.
///
/// Useful while developing scenarios and for interactive runs.
#[derive(Debug, Default)]
pub struct SummaryReportCollector {
    // (scenario, action) in first-seen order, the `total` row uses the iteration durations.
    samples: Vec<((String, String), Samples)>,
    sla_rows: Vec<SlaRow>,
}

impl SummaryReportCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn samples_for(&mut self, scenario_name: &str, action: &str) -> &mut Samples {
        let position = self
            .samples
            .iter()
            .position(|((s, a), _)| s == scenario_name && a == action);

        let index = match position {
            Some(index) => index,
            None => {
                self.samples.push((
                    (scenario_name.to_string(), action.to_string()),
                    Samples::default(),
                ));
                self.samples.len() - 1
            }
        };

        &mut self.samples[index].1
    }

    fn action_rows(&self) -> Vec<ActionRow> {
        let mut rows = self
            .samples
            .iter()
            .filter_map(|((scenario, action), samples)| {
                let stats = DurationStats::from_values(&samples.durations)?;
                Some(ActionRow {
                    scenario: scenario.clone(),
                    action: action.clone(),
                    min_s: stats.min,
                    median_s: stats.median,
                    p90_s: stats.p90,
                    p95_s: stats.p95,
                    max_s: stats.max,
                    avg_s: stats.avg,
                    success: (stats.count - samples.failed) as f64 * 100.0 / stats.count as f64,
                    count: stats.count,
                })
            })
            .collect::<Vec<_>>();

        // Totals after the actions of their scenario.
        rows.sort_by_key(|row| (row.scenario.clone(), row.action == "total"));
        rows
    }

    fn print_summary(&self) {
        println!("\nLoad duration summary");
        let mut table = Table::new(self.action_rows());
        table.with(Style::modern());
        println!("{table}");

        if !self.sla_rows.is_empty() {
            println!("\nSLA");
            let mut table = Table::new(&self.sla_rows);
            table.with(Style::modern());
            println!("{table}");
        }
    }
}

impl ReportCollector for SummaryReportCollector {
    fn add_iteration(&mut self, scenario_name: &str, result: &IterationResult) {
        for action in &result.atomic_actions {
            self.samples_for(scenario_name, &action.name)
                .add(action.duration, action.failed());
        }
        self.samples_for(scenario_name, "total")
            .add(result.duration, !result.is_success());
    }

    fn add_workload(&mut self, summary: &WorkloadSummary) {
        self.sla_rows
            .extend(summary.aggregate.sla.details.iter().map(|detail| SlaRow {
                workload: summary.position,
                scenario: summary.scenario_name.clone(),
                criterion: detail.criterion.clone(),
                status: if detail.success { "PASS" } else { "FAIL" }.to_string(),
                detail: detail.detail.clone(),
            }));
    }

    fn finalize(&self) {
        self.print_summary();
    }
}
