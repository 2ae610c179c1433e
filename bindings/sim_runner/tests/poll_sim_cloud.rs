use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::{json, Map};
use sim_cloud_runner::prelude::{
    run, sim_cloud_context, users_context, BenchConfig, CloudbenchCli, ComputeScenario,
    Credential, DeploymentConfig, ManualClock, OrchestrationScenario, ReporterOpt, ScenarioArgs,
    ScenarioMeta, ScenarioResult, SimRunnerContext, SimScenarioContext, TaskConfig,
    TaskDefinitionBuilder, TaskSummary, WaitConfig, WorkloadConfig, SIM_CLOUD_CONTEXT,
    USERS_CONTEXT,
};

fn sample_cli_cfg() -> CloudbenchCli {
    CloudbenchCli {
        no_progress: true,
        reporter: ReporterOpt::Noop,
        task_id: Some("simpolltest".to_string()),
        ..Default::default()
    }
}

fn bench_config() -> BenchConfig {
    BenchConfig {
        wait: WaitConfig {
            timeout_s: 10.0,
            check_interval_s: 1.0,
        },
        deployment: DeploymentConfig {
            admin: Some(Credential {
                username: "admin".to_string(),
                password: "secret".to_string(),
                project: "admin".to_string(),
                project_id: None,
            }),
            users: Vec::new(),
        },
        ..Default::default()
    }
}

fn create_stack(ctx: &mut SimScenarioContext, _: &ScenarioArgs) -> ScenarioResult {
    let stack = ctx.create_stack(&json!({"resources": {}}), &Map::new())?;
    ctx.add_output("stack_id", json!(stack.id));
    Ok(())
}

fn create_and_delete_stack(ctx: &mut SimScenarioContext, _: &ScenarioArgs) -> ScenarioResult {
    let stack = ctx.create_stack(&json!({"resources": {}}), &Map::new())?;
    ctx.delete_stack(stack)?;
    Ok(())
}

fn bounce_server(ctx: &mut SimScenarioContext, _: &ScenarioArgs) -> ScenarioResult {
    let server = ctx.boot_server("m1.tiny", "cirros")?;
    let server = ctx.stop_server(&server)?;
    let server = ctx.start_server(&server)?;
    let server = ctx.reboot_server(&server)?;
    ctx.delete_server(server)?;
    Ok(())
}

fn run_workload(
    name: &str,
    clock: Arc<ManualClock>,
    workload: WorkloadConfig,
) -> anyhow::Result<TaskSummary> {
    let _ = env_logger::builder().is_test(true).try_init();

    let definition = TaskDefinitionBuilder::<SimRunnerContext>::new(name, sample_cli_cfg())
        .use_context(sim_cloud_context())
        .use_context(users_context())
        .use_scenario(
            "Orchestration.create_stack",
            ScenarioMeta::default().default_context(SIM_CLOUD_CONTEXT, json!({})),
            create_stack,
        )
        .use_scenario(
            "Orchestration.create_and_delete_stack",
            ScenarioMeta::default()
                .default_context(SIM_CLOUD_CONTEXT, json!({}))
                .require_context(USERS_CONTEXT),
            create_and_delete_stack,
        )
        .use_scenario(
            "Compute.bounce_server",
            ScenarioMeta::default()
                .default_context(SIM_CLOUD_CONTEXT, json!({}))
                .require_context(USERS_CONTEXT),
            bounce_server,
        )
        .with_config(bench_config())
        .with_clock(clock)
        .with_task(TaskConfig::new(vec![workload]));

    run(definition)
}

#[test]
fn stack_create_polls_three_times_and_sleeps_twice() {
    let clock = Arc::new(ManualClock::new());
    let summary = run_workload(
        "stack_create_polls_three_times_and_sleeps_twice",
        clock.clone(),
        WorkloadConfig::new("Orchestration.create_stack").with_context(USERS_CONTEXT, json!({})),
    )
    .unwrap();

    let aggregate = &summary.workloads[0].aggregate;
    assert_eq!(1, aggregate.iterations_count);
    assert_eq!(0, aggregate.iterations_failed);
    assert_eq!(
        vec![Duration::from_secs(1), Duration::from_secs(1)],
        clock.sleeps()
    );
}

#[test]
fn stacks_are_created_and_deleted_by_every_user() {
    let summary = run_workload(
        "stacks_are_created_and_deleted_by_every_user",
        Arc::new(ManualClock::new()),
        WorkloadConfig::new("Orchestration.create_and_delete_stack")
            .with_runner(json!({"type": "serial", "times": 4}))
            .with_context(USERS_CONTEXT, json!({"tenants": 2, "users_per_tenant": 1})),
    )
    .unwrap();

    let aggregate = &summary.workloads[0].aggregate;
    assert_eq!(4, aggregate.iterations_count);
    assert_eq!(0, aggregate.iterations_failed);
    assert_eq!(4, aggregate.atomic_stats["heat.create_stack"].count);
    assert_eq!(4, aggregate.atomic_stats["heat.delete_stack"].count);
    assert!(summary.pass_sla());
}

#[test]
fn failed_stack_fails_only_its_iteration() {
    let summary = run_workload(
        "failed_stack_fails_only_its_iteration",
        Arc::new(ManualClock::new()),
        WorkloadConfig::new("Orchestration.create_and_delete_stack")
            .with_runner(json!({"type": "serial", "times": 3}))
            .with_context(USERS_CONTEXT, json!({}))
            .with_context(
                SIM_CLOUD_CONTEXT,
                json!({"faults": [{
                    "operation": "create_stack",
                    "fault": {"end_in": {"status": "CREATE_FAILED", "fault": "quota exceeded"}},
                }]}),
            )
            .with_sla(json!({"failure_rate": {"max": 0}})),
    )
    .unwrap();

    let aggregate = &summary.workloads[0].aggregate;
    assert_eq!(3, aggregate.iterations_count);
    assert_eq!(1, aggregate.iterations_failed);

    let create = &aggregate.atomic_stats["heat.create_stack"];
    assert_eq!(3, create.count);
    assert_eq!(1, create.failed);
    assert_eq!(2, aggregate.atomic_stats["heat.delete_stack"].count);
    assert!(!summary.pass_sla());
}

#[test]
fn stuck_stack_times_out() {
    let clock = Arc::new(ManualClock::new());
    let summary = run_workload(
        "stuck_stack_times_out",
        clock.clone(),
        WorkloadConfig::new("Orchestration.create_stack")
            .with_context(USERS_CONTEXT, json!({}))
            .with_context(
                SIM_CLOUD_CONTEXT,
                json!({"faults": [{"operation": "create_stack", "fault": "stuck"}]}),
            ),
    )
    .unwrap();

    assert_eq!(1, summary.workloads[0].aggregate.iterations_failed);
    assert_eq!(Duration::from_secs(10), clock.elapsed());
}

#[test]
fn server_goes_through_stop_start_and_reboot() {
    let summary = run_workload(
        "server_goes_through_stop_start_and_reboot",
        Arc::new(ManualClock::new()),
        WorkloadConfig::new("Compute.bounce_server")
            .with_runner(json!({"type": "constant", "times": 2, "concurrency": 1}))
            .with_context(USERS_CONTEXT, json!({"tenants": 1, "users_per_tenant": 2})),
    )
    .unwrap();

    let aggregate = &summary.workloads[0].aggregate;
    assert_eq!(0, aggregate.iterations_failed);
    assert_eq!(
        vec![
            "nova.boot_server",
            "nova.delete_server",
            "nova.reboot_server",
            "nova.start_server",
            "nova.stop_server",
        ],
        aggregate.atomic_stats.keys().map(String::as_str).collect::<Vec<_>>()
    );
}

#[test]
fn users_context_needs_an_admin() {
    let _ = env_logger::builder().is_test(true).try_init();

    let definition = TaskDefinitionBuilder::<SimRunnerContext>::new(
        "users_context_needs_an_admin",
        sample_cli_cfg(),
    )
    .use_context(sim_cloud_context())
    .use_context(users_context())
    .use_scenario(
        "Orchestration.create_stack",
        ScenarioMeta::default().default_context(SIM_CLOUD_CONTEXT, json!({})),
        create_stack,
    )
    .with_config(BenchConfig::default())
    .with_clock(Arc::new(ManualClock::new()))
    .with_task(TaskConfig::new(vec![
        WorkloadConfig::new("Orchestration.create_stack").with_context(USERS_CONTEXT, json!({}))
    ]));

    let err = run(definition).unwrap_err();
    assert!(format!("{err:#}").contains("users"));
}
