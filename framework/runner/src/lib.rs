mod cli;
mod config;
mod consumer;
mod context;
mod definition;
mod dispatch;
mod executor;
mod hooks;
mod init;
mod iteration;
mod monitor;
mod progress;
mod run;
mod shutdown;
mod task;
mod types;
mod validation;

pub mod prelude {
    pub use crate::cli::{CloudbenchCli, ReporterOpt};
    pub use crate::config::{BenchConfig, Credential, DeploymentConfig};
    pub use crate::context::{RunnerContext, ScenarioContext, ServiceClients, UserValuesConstraint};
    pub use crate::definition::{
        number, required_args, ContextCleanupFn, ContextPlugin, ContextSetupFn, HookArgsCheck,
        HookPlugin, HookResult, Permission, ScenarioArgs, ScenarioFn, ScenarioMeta,
        ScenarioResult, TaskDefinition, TaskDefinitionBuilder, Validator, WorkloadHookFn,
    };
    pub use crate::dispatch::RunnerConfig;
    pub use crate::executor::Executor;
    pub use crate::hooks::{sys_call, HookConfig, TriggerConfig, TriggerUnit};
    pub use crate::init::init;
    pub use crate::run::run;
    pub use crate::task::{TaskConfig, WorkloadConfig};
    pub use crate::types::BenchResult;

    pub use cloudbench_core::prelude::*;
    pub use cloudbench_instruments::prelude::*;
    pub use cloudbench_summary_model::{HookRunResult, HookStatus, TaskSummary};
}
