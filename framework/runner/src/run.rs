use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use cloudbench_core::prelude::{
    AbortHandle, Clock, ContextSetupError, ResourceNameGenerator, SystemClock,
};
use cloudbench_instruments::{ReportConfig, Reporter};
use cloudbench_summary_model::{append_task_summary, TaskSummary, WorkloadSummary};
use serde_json::Value;

use crate::cli::ReporterOpt;
use crate::config::BenchConfig;
use crate::consumer::{start_consumer, ConsumerMessage};
use crate::context::{RunnerContext, UserValuesConstraint};
use crate::definition::{TaskDefinition, TaskDefinitionBuilder};
use crate::dispatch::dispatch;
use crate::executor::Executor;
use crate::hooks::{start_ticker, ArmedHook, HookExecutor};
use crate::iteration::run_iteration;
use crate::monitor::start_monitor;
use crate::progress::start_progress;
use crate::shutdown::start_signal_listener;
use crate::task::WorkloadConfig;
use crate::validation::{validate_credentials, validate_workload, ValidatedWorkload};

/// Shared by every workload of one task run.
struct TaskRun<'a, RV: UserValuesConstraint> {
    definition: &'a TaskDefinition<RV>,
    task_id: String,
    executor: Arc<Executor>,
    abort: AbortHandle,
    clock: Arc<dyn Clock>,
    config: Arc<BenchConfig>,
    name_generator: ResourceNameGenerator,
    reporter: Arc<Reporter>,
}

/// Run every workload of the task and return the task summary.
///
/// Configuration, validation and context setup errors stop the task and are returned. Everything
/// that goes wrong inside an iteration is recorded in the results instead.
pub fn run<RV: UserValuesConstraint>(
    definition: TaskDefinitionBuilder<RV>,
) -> anyhow::Result<TaskSummary> {
    let definition = definition.build()?;
    let task_id = definition
        .cli
        .task_id
        .clone()
        .unwrap_or_else(|| nanoid::nanoid!());

    log::info!(
        "Running task {task_id} from {} with {} workloads",
        definition.name,
        definition.task.workloads.len()
    );

    // Check every workload up front so a typo in the last one doesn't waste a long run.
    let validated = definition
        .task
        .workloads
        .iter()
        .enumerate()
        .map(|(position, workload)| {
            validate_workload(&definition, workload)
                .with_context(|| format!("Workload {position} ({}) is invalid", workload.scenario))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    let abort = start_signal_listener(&runtime);

    let report_config = match definition.cli.reporter {
        ReporterOpt::Noop => ReportConfig::default(),
        ReporterOpt::InMemory => ReportConfig::default().enable_summary(),
        ReporterOpt::Jsonl => ReportConfig::default()
            .enable_summary()
            .enable_jsonl(PathBuf::from("reports")),
    };
    let reporter = Arc::new(report_config.init_reporter(&runtime, abort.new_listener(), &task_id)?);

    let clock: Arc<dyn Clock> = match &definition.clock {
        Some(clock) => clock.clone(),
        None => Arc::new(SystemClock::with_abort(abort.new_listener())),
    };
    let config = Arc::new(definition.config.clone());
    let name_generator = ResourceNameGenerator::new(&config.resource_name_format)?;

    let monitor_stop = Arc::new(AtomicBool::new(false));
    start_monitor(monitor_stop.clone())?;

    let task_run = TaskRun {
        definition: &definition,
        task_id: task_id.clone(),
        executor: Arc::new(Executor::new(runtime, abort.clone())),
        abort: abort.clone(),
        clock,
        config,
        name_generator,
        reporter: reporter.clone(),
    };

    let mut summary = TaskSummary::new(
        task_id.clone(),
        chrono::Utc::now().timestamp(),
        env!("CARGO_PKG_VERSION").to_string(),
    );
    if let Ok(filter) = std::env::var("RUST_LOG") {
        summary.add_env("RUST_LOG".to_string(), filter);
    }

    let mut result = Ok(());
    for (position, (workload, validated)) in definition
        .task
        .workloads
        .iter()
        .zip(validated)
        .enumerate()
    {
        if abort.level().is_some() {
            log::warn!(
                "Skipping workload {position} ({}) and later ones because the task was aborted",
                workload.scenario
            );
            break;
        }

        match run_workload(&task_run, position, workload, validated) {
            Ok(workload_summary) => {
                reporter.add_workload(&workload_summary);
                summary.add_workload(workload_summary);
            }
            Err(e) => {
                log::error!("Workload {position} ({}) failed: {e:?}", workload.scenario);
                result = Err(e);
                break;
            }
        }
    }

    monitor_stop.store(true, Ordering::Relaxed);
    reporter.finalize();

    if let Some(path) = &definition.cli.run_summary {
        append_task_summary(&summary, path)
            .with_context(|| format!("Failed to write run summary to {}", path.display()))?;
    }

    result?;

    log::info!(
        "Task {task_id} finished, SLA {}",
        if summary.pass_sla() { "passed" } else { "failed" }
    );

    Ok(summary)
}

fn run_workload<RV: UserValuesConstraint>(
    task_run: &TaskRun<'_, RV>,
    position: usize,
    workload: &WorkloadConfig,
    validated: ValidatedWorkload<'_, RV>,
) -> anyhow::Result<WorkloadSummary> {
    let started_at = chrono::Utc::now().timestamp();
    let full_timer = Instant::now();
    let scenario_name = workload.scenario.clone();

    log::info!("Workload {position} ({scenario_name}) configured");

    let mut runner_context = RunnerContext::new(
        task_run.executor.clone(),
        task_run.abort.clone(),
        task_run.clock.clone(),
        task_run.task_id.clone(),
        task_run.config.clone(),
        task_run.name_generator.clone(),
    );

    let mut set_up = Vec::with_capacity(validated.contexts.len());
    for (plugin, plugin_config) in &validated.contexts {
        log::debug!("Setting up context {}", plugin.name);
        if let Err(e) = (plugin.setup)(&mut runner_context, plugin_config) {
            cleanup_contexts(&runner_context, &set_up);
            return Err(ContextSetupError {
                context: plugin.name.clone(),
                reason: format!("{e:#}"),
            }
            .into());
        }
        set_up.push((*plugin, plugin_config.clone()));
    }

    if let Err(e) = validate_credentials(
        &runner_context,
        &validated.scenario.meta.validators,
        &workload.args,
    ) {
        cleanup_contexts(&runner_context, &set_up);
        return Err(e.into());
    }

    let runner_context = Arc::new(runner_context);
    log::info!("Workload {position} ({scenario_name}) running");

    let progress = if task_run.definition.cli.no_progress {
        None
    } else {
        Some(start_progress(&scenario_name, &validated.runner)?)
    };
    let streaming_sla = if task_run.definition.cli.abort_on_sla_failure
        && validated.sla.has_rules()
    {
        Some((validated.sla.streaming(), task_run.abort.clone()))
    } else {
        None
    };

    let hooks = HookExecutor::new(
        validated
            .hooks
            .iter()
            .map(|hook| {
                let runner_context = runner_context.clone();
                let run = hook.plugin.run;
                let args = hook.args.clone();
                ArmedHook {
                    name: hook.plugin.name.clone(),
                    description: hook.description.clone(),
                    trigger: hook.trigger.clone(),
                    action: Arc::new(move || run(&runner_context, &args)),
                }
            })
            .collect(),
    );
    let needs_ticker = hooks.has_time_triggers();

    let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
    let consumer = start_consumer(
        scenario_name.clone(),
        receiver,
        task_run.reporter.clone(),
        streaming_sla,
        hooks,
        progress,
    )?;

    let ticker_stop = Arc::new(AtomicBool::new(false));
    let ticker = if needs_ticker {
        Some(start_ticker(sender.clone(), ticker_stop.clone())?)
    } else {
        None
    };

    let dispatch_result = {
        let runner_context = runner_context.clone();
        let scenario_fn = validated.scenario.scenario_fn;
        let args = workload.args.clone();
        let timeout = validated.runner.timeout();
        let scenario_name = scenario_name.clone();
        let sender = sender.clone();

        dispatch(
            &validated.runner,
            task_run.abort.new_listener(),
            task_run.config.abort_grace(),
            move |iteration| {
                if sender.send(ConsumerMessage::Started(iteration)).is_err() {
                    log::debug!("Iteration {iteration} started after collection ended");
                }
                let result = run_iteration(
                    &runner_context,
                    &scenario_name,
                    scenario_fn,
                    &args,
                    iteration,
                    timeout,
                );
                if sender.send(ConsumerMessage::Result(result)).is_err() {
                    log::debug!("Result of iteration {iteration} arrived after collection ended");
                }
            },
        )
    };

    ticker_stop.store(true, Ordering::Relaxed);
    if let Some(ticker) = ticker {
        if ticker.join().is_err() {
            log::warn!("Hook ticker panicked");
        }
    }

    if sender.send(ConsumerMessage::Stop).is_err() {
        log::warn!("Result consumer exited before the workload finished");
    }
    let consumer_outcome = consumer
        .join()
        .map_err(|_| anyhow::anyhow!("Result consumer panicked"))?;

    cleanup_contexts(&runner_context, &set_up);

    let mut sla = validated.sla;
    let mut events = Vec::new();
    let (load_duration, aborted) = match &dispatch_result {
        Ok(outcome) => {
            if outcome.abort_not_honored {
                events.push("abort_not_honored".to_string());
            }
            log::info!(
                "Workload {position} ({scenario_name}) {} after {} iterations",
                if outcome.aborted { "aborted" } else { "completed" },
                outcome.scheduled
            );
            (outcome.load_duration.as_secs_f64(), outcome.aborted)
        }
        Err(e) => {
            log::error!("Workload {position} ({scenario_name}) runner failed: {e:?}");
            sla.set_unexpected_failure(format!("{e:#}"));
            (0.0, true)
        }
    };

    if consumer_outcome.aborted_on_sla {
        sla.set_aborted_on_sla();
    } else if aborted {
        sla.set_aborted_manually();
    }

    let mut aggregate = consumer_outcome.aggregator.result();
    aggregate.sla = sla.evaluate(&aggregate);

    Ok(WorkloadSummary {
        position,
        scenario_name,
        args: Value::Object(workload.args.clone()),
        runner: workload.runner.clone(),
        contexts: Value::Object(validated.merged_contexts),
        sla: Value::Object(workload.sla.clone()),
        started_at,
        load_duration,
        full_duration: full_timer.elapsed().as_secs_f64(),
        aborted,
        events,
        hooks: consumer_outcome.hooks,
        aggregate,
    })
}

/// Clean up contexts in the reverse order of their setup. Failures are logged and don't stop the
/// remaining cleanups.
fn cleanup_contexts<RV: UserValuesConstraint>(
    runner_context: &RunnerContext<RV>,
    set_up: &[(&crate::definition::ContextPlugin<RV>, Value)],
) {
    for (plugin, plugin_config) in set_up.iter().rev() {
        let Some(cleanup) = plugin.cleanup else {
            continue;
        };

        log::debug!("Cleaning up context {}", plugin.name);
        if let Err(e) = cleanup(runner_context, plugin_config) {
            log::warn!("Cleanup of context {} failed: {e:?}", plugin.name);
        }
    }
}
