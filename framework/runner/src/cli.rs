use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReporterOpt {
    /// Discard iteration results, only the task summary is produced.
    Noop,
    /// Keep results in memory and print summary tables at the end of the run.
    InMemory,
    /// Write raw iteration results to a JSON lines file in the `reports` directory.
    Jsonl,
}

#[derive(Debug, Clone, Parser)]
#[command(about, long_about = None)]
pub struct CloudbenchCli {
    /// Path to the task file, in YAML or JSON
    pub task: Option<PathBuf>,

    /// Path to a TOML file with wait timings, abort grace period and deployment credentials
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// The reporter to use.
    #[arg(long, value_enum, default_value_t = ReporterOpt::InMemory)]
    pub reporter: ReporterOpt,

    /// Do not show a progress bar on the CLI.
    ///
    /// This is recommended for CI/CD environments where the progress bar isn't being looked at by anyone and is just adding noise to the logs.
    #[arg(long, default_value = "false")]
    pub no_progress: bool,

    /// Stop the task as soon as any SLA of the running workload fails
    #[arg(long, default_value = "false")]
    pub abort_on_sla_failure: bool,

    /// Append the task summary as one JSON line to this file
    #[arg(long)]
    pub run_summary: Option<PathBuf>,

    /// Set the ID of this task
    ///
    /// If not set, a random ID is used. The ID is embedded in the names of created resources.
    #[arg(long, short)]
    pub task_id: Option<String>,
}

impl Default for CloudbenchCli {
    fn default() -> Self {
        Self {
            task: None,
            config: None,
            reporter: ReporterOpt::InMemory,
            no_progress: false,
            abort_on_sla_failure: false,
            run_summary: None,
            task_id: None,
        }
    }
}
