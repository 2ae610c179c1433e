use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use cloudbench_runner::prelude::{
    required_args, run, BenchConfig, CloudbenchCli, ConfigurationError, ContextPlugin,
    ContextSetupError, Credential, HookConfig, HookResult, Permission, ReporterOpt,
    RunnerContext, ScenarioArgs, ScenarioContext, ScenarioMeta, ScenarioResult, TaskConfig,
    TaskDefinitionBuilder, TriggerConfig, TriggerUnit, UserValuesConstraint, ValidationError,
    Validator, WorkloadConfig,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

#[derive(Default, Debug)]
struct TestValues {
    setup_calls: usize,
}

impl UserValuesConstraint for TestValues {}

fn sample_cli_cfg() -> CloudbenchCli {
    CloudbenchCli {
        no_progress: true,
        reporter: ReporterOpt::Noop,
        ..Default::default()
    }
}

fn noop(_: &mut ScenarioContext<TestValues>, _: &ScenarioArgs) -> ScenarioResult {
    Ok(())
}

fn builder(name: &str, workloads: Vec<WorkloadConfig>) -> TaskDefinitionBuilder<TestValues> {
    let _ = env_logger::builder().is_test(true).try_init();

    TaskDefinitionBuilder::<TestValues>::new(name, sample_cli_cfg())
        .use_scenario("Test.noop", ScenarioMeta::default(), noop)
        .with_task(TaskConfig::new(workloads))
}

#[test]
fn unknown_scenario_is_a_configuration_error() {
    let err = run(builder(
        "unknown_scenario_is_a_configuration_error",
        vec![WorkloadConfig::new("Test.missing")],
    ))
    .unwrap_err();

    assert!(err.is::<ConfigurationError>());
    assert!(format!("{err:#}").contains("Test.noop"));
}

#[test]
fn unknown_runner_type_is_a_configuration_error() {
    let err = run(builder(
        "unknown_runner_type_is_a_configuration_error",
        vec![WorkloadConfig::new("Test.noop").with_runner(json!({"type": "bursty"}))],
    ))
    .unwrap_err();

    assert!(err.is::<ConfigurationError>());
}

#[test]
fn unknown_sla_rule_is_a_configuration_error() {
    let err = run(builder(
        "unknown_sla_rule_is_a_configuration_error",
        vec![WorkloadConfig::new("Test.noop").with_sla(json!({"max_fun": 1}))],
    ))
    .unwrap_err();

    assert!(err.is::<ConfigurationError>());
}

#[test]
fn unknown_hook_is_a_configuration_error() {
    let err = run(builder(
        "unknown_hook_is_a_configuration_error",
        vec![WorkloadConfig::new("Test.noop").with_hook(HookConfig::new(
            "reboot_everything",
            json!({}),
            TriggerConfig::Event {
                unit: TriggerUnit::Iteration,
                at: vec![1],
            },
        ))],
    ))
    .unwrap_err();

    assert!(err.is::<ConfigurationError>());
    assert!(format!("{err:#}").contains("sys_call"));
}

#[test]
fn invalid_hook_trigger_is_a_configuration_error() {
    let err = run(builder(
        "invalid_hook_trigger_is_a_configuration_error",
        vec![WorkloadConfig::new("Test.noop").with_hook(HookConfig::new(
            "sys_call",
            json!("true"),
            TriggerConfig::Periodic {
                unit: TriggerUnit::Time,
                step: 0,
                start: None,
                end: None,
            },
        ))],
    ))
    .unwrap_err();

    assert!(err.is::<ConfigurationError>());
}

#[test]
fn invalid_hook_args_fail_validation() {
    let err = run(builder(
        "invalid_hook_args_fail_validation",
        vec![WorkloadConfig::new("Test.noop").with_hook(HookConfig::new(
            "sys_call",
            json!({"cmd": "true"}),
            TriggerConfig::Event {
                unit: TriggerUnit::Time,
                at: vec![0],
            },
        ))],
    ))
    .unwrap_err();

    assert!(err.is::<ValidationError>());
}

#[test]
fn invalid_later_workload_stops_the_task_before_it_starts() {
    let err = run(builder(
        "invalid_later_workload_stops_the_task_before_it_starts",
        vec![
            WorkloadConfig::new("Test.noop"),
            WorkloadConfig::new("Test.noop").with_context("missing", json!({})),
        ],
    ))
    .unwrap_err();

    assert!(err.is::<ConfigurationError>());
    assert!(format!("{err:#}").contains("Workload 1"));
}

#[test]
fn missing_required_context_fails_validation() {
    let _ = env_logger::builder().is_test(true).try_init();
    let definition = TaskDefinitionBuilder::<TestValues>::new(
        "missing_required_context_fails_validation",
        sample_cli_cfg(),
    )
    .use_scenario(
        "Test.needs_users",
        ScenarioMeta::default().require_context("users"),
        noop,
    )
    .with_task(TaskConfig::new(vec![WorkloadConfig::new("Test.needs_users")]));

    let err = run(definition).unwrap_err();
    assert!(err.is::<ValidationError>());
}

#[test]
fn args_validators_run_before_anything_else() {
    let _ = env_logger::builder().is_test(true).try_init();
    let definition = TaskDefinitionBuilder::<TestValues>::new(
        "args_validators_run_before_anything_else",
        sample_cli_cfg(),
    )
    .use_scenario(
        "Test.boot",
        ScenarioMeta::default().validator(required_args(&["flavor", "image"])),
        noop,
    )
    .with_task(TaskConfig::new(vec![
        WorkloadConfig::new("Test.boot").with_args(json!({"flavor": "m1.tiny"}))
    ]));

    let err = run(definition).unwrap_err();
    assert!(err.is::<ValidationError>());
    assert!(format!("{err:#}").contains("image"));
}

#[test]
fn admin_only_needs_an_admin() {
    let _ = env_logger::builder().is_test(true).try_init();
    let definition =
        TaskDefinitionBuilder::<TestValues>::new("admin_only_needs_an_admin", sample_cli_cfg())
            .use_scenario("Test.admin", ScenarioMeta::default().admin_only(), noop)
            .with_task(TaskConfig::new(vec![WorkloadConfig::new("Test.admin")]));

    let err = run(definition).unwrap_err();
    assert!(err.is::<ValidationError>());
}

static FIRST_CLEANED_UP: AtomicBool = AtomicBool::new(false);

#[test]
fn failed_context_setup_cleans_up_earlier_contexts() {
    fn first_setup(ctx: &mut RunnerContext<TestValues>, _: &Value) -> HookResult {
        ctx.get_mut().setup_calls += 1;
        Ok(())
    }

    fn first_cleanup(ctx: &RunnerContext<TestValues>, _: &Value) -> HookResult {
        assert_eq!(1, ctx.get().setup_calls);
        FIRST_CLEANED_UP.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn broken_setup(_: &mut RunnerContext<TestValues>, _: &Value) -> HookResult {
        anyhow::bail!("quota exceeded")
    }

    let _ = env_logger::builder().is_test(true).try_init();
    let definition = TaskDefinitionBuilder::<TestValues>::new(
        "failed_context_setup_cleans_up_earlier_contexts",
        sample_cli_cfg(),
    )
    .use_scenario("Test.noop", ScenarioMeta::default(), noop)
    .use_context(ContextPlugin::new("first", 10, first_setup).with_cleanup(first_cleanup))
    .use_context(ContextPlugin::new("broken", 20, broken_setup))
    .with_task(TaskConfig::new(vec![WorkloadConfig::new("Test.noop")
        .with_context("broken", json!({}))
        .with_context("first", json!({}))]));

    let err = run(definition).unwrap_err();

    let setup_error = err.downcast_ref::<ContextSetupError>().unwrap();
    assert_eq!("broken", setup_error.context);
    assert!(setup_error.reason.contains("quota exceeded"));
    assert!(FIRST_CLEANED_UP.load(Ordering::SeqCst));
}

static ITERATIONS_WITH_USER: AtomicUsize = AtomicUsize::new(0);

#[test]
fn contexts_provide_round_robin_users() {
    fn users_setup(ctx: &mut RunnerContext<TestValues>, config: &Value) -> HookResult {
        let count = config["count"].as_u64().unwrap_or(1);
        ctx.set_users(
            (0..count)
                .map(|i| Credential {
                    username: format!("user-{i}"),
                    password: String::new(),
                    project: "demo".to_string(),
                    project_id: None,
                })
                .collect(),
        );
        Ok(())
    }

    fn check_user(ctx: &mut ScenarioContext<TestValues>, _: &ScenarioArgs) -> ScenarioResult {
        let expected = format!("user-{}", (ctx.iteration() - 1) % 2);
        anyhow::ensure!(
            ctx.user().map(|u| u.username.as_str()) == Some(expected.as_str()),
            "wrong user for iteration {}",
            ctx.iteration()
        );
        ITERATIONS_WITH_USER.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    let _ = env_logger::builder().is_test(true).try_init();
    let definition = TaskDefinitionBuilder::<TestValues>::new(
        "contexts_provide_round_robin_users",
        sample_cli_cfg(),
    )
    .use_scenario(
        "Test.check_user",
        ScenarioMeta::default().default_context("users", json!({"count": 2})),
        check_user,
    )
    .use_context(ContextPlugin::new("users", 0, users_setup))
    .with_task(TaskConfig::new(vec![WorkloadConfig::new("Test.check_user")
        .with_runner(json!({"type": "serial", "times": 4}))]));

    let summary = run(definition).unwrap();

    assert_eq!(0, summary.workloads[0].aggregate.iterations_failed);
    assert_eq!(4, ITERATIONS_WITH_USER.load(Ordering::SeqCst));
    assert_eq!(json!({"users": {"count": 2}}), summary.workloads[0].contexts);
}

#[test]
fn user_validators_check_every_user() {
    let _ = env_logger::builder().is_test(true).try_init();

    let config = BenchConfig {
        deployment: cloudbench_runner::prelude::DeploymentConfig {
            admin: None,
            users: vec![
                Credential {
                    username: "alice".to_string(),
                    password: String::new(),
                    project: "demo".to_string(),
                    project_id: None,
                },
                Credential {
                    username: "bob".to_string(),
                    password: String::new(),
                    project: "other".to_string(),
                    project_id: None,
                },
            ],
        },
        ..Default::default()
    };

    let definition = TaskDefinitionBuilder::<TestValues>::new(
        "user_validators_check_every_user",
        sample_cli_cfg(),
    )
    .use_scenario(
        "Test.demo_only",
        ScenarioMeta::default().validator(Validator::credential(
            "demo_project",
            Permission::User,
            |_, credential, _| {
                if credential.project == "demo" {
                    Ok(())
                } else {
                    Err(ValidationError(format!("project {} is not demo", credential.project)))
                }
            },
        )),
        noop,
    )
    .with_config(config)
    .with_task(TaskConfig::new(vec![WorkloadConfig::new("Test.demo_only")]));

    let err = run(definition).unwrap_err();
    assert!(err.is::<ValidationError>());
    assert!(err.to_string().contains("bob"));
}
