use anyhow::Context;
use serde_json::{json, Value};
use sim_cloud_runner::prelude::*;

const BOUNCE_ACTIONS: [&str; 3] = ["hard_reboot", "soft_reboot", "stop_start"];

fn create_and_delete_stack(ctx: &mut SimScenarioContext, args: &ScenarioArgs) -> ScenarioResult {
    let template = args
        .get("template")
        .context("the template argument is required")?;
    let parameters = args
        .get("parameters")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let stack = ctx.create_stack(template, &parameters)?;
    ctx.add_output("stack_name", json!(stack.name));
    ctx.delete_stack(stack)?;

    Ok(())
}

fn str_arg<'a>(args: &'a ScenarioArgs, name: &str) -> anyhow::Result<&'a str> {
    args.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| InvalidArgument(format!("'{name}' must be a string")).into())
}

fn boot_and_delete_server(ctx: &mut SimScenarioContext, args: &ScenarioArgs) -> ScenarioResult {
    let server = ctx.boot_server(str_arg(args, "flavor")?, str_arg(args, "image")?)?;

    let min_sleep = args.get("min_sleep").and_then(Value::as_f64).unwrap_or(0.0);
    let max_sleep = args.get("max_sleep").and_then(Value::as_f64).unwrap_or(0.0);
    ctx.sleep_between(min_sleep, max_sleep)?;

    ctx.delete_server(server)?;

    Ok(())
}

/// The server the action is applied to, looked up fresh by the id passed to every action.
fn target_server(ctx: &SimScenarioContext, args: &ActionArgs) -> anyhow::Result<Server> {
    let id = args
        .named
        .get("server_id")
        .and_then(Value::as_str)
        .ok_or_else(|| InvalidArgument("bounce actions need a server_id".to_string()))?;

    Ok(ctx.compute_client()?.get_server(id)?)
}

fn reboot(ctx: &mut SimScenarioContext, args: &ActionArgs) -> anyhow::Result<()> {
    let server = target_server(ctx, args)?;
    log::debug!(
        "{} reboot of {}",
        args.named.get("reboot_type").and_then(Value::as_str).unwrap_or("HARD"),
        server.name
    );
    ctx.reboot_server(&server)?;
    Ok(())
}

fn stop_start(ctx: &mut SimScenarioContext, args: &ActionArgs) -> anyhow::Result<()> {
    let server = target_server(ctx, args)?;
    let server = ctx.stop_server(&server)?;
    ctx.start_server(&server)?;
    Ok(())
}

fn bounce_actions() -> anyhow::Result<ActionBuilder<SimScenarioContext>> {
    let mut builder = ActionBuilder::new(BOUNCE_ACTIONS);
    builder
        .bind("hard_reboot", reboot, ActionArgs::new().named("reboot_type", "HARD"))?
        .bind("soft_reboot", reboot, ActionArgs::new().named("reboot_type", "SOFT"))?
        .bind("stop_start", stop_start, ActionArgs::new())?;
    Ok(builder)
}

fn boot_and_bounce_server(ctx: &mut SimScenarioContext, args: &ScenarioArgs) -> ScenarioResult {
    let actions = args.get("actions").cloned().unwrap_or_else(|| json!([]));
    let builder = bounce_actions()?;

    let server = ctx.boot_server(str_arg(args, "flavor")?, str_arg(args, "image")?)?;
    for action in builder.build(&actions, ActionArgs::new().named("server_id", server.id.clone()))? {
        action
            .call(ctx)
            .with_context(|| format!("bounce action {} failed", action.name()))?;
    }
    ctx.delete_server(server)?;

    Ok(())
}

fn valid_bounce_actions() -> Validator<SimRunnerContext> {
    Validator::args("bounce_actions", |args| {
        let builder = bounce_actions().map_err(|e| ValidationError(format!("{e:#}")))?;
        builder.validate(args.get("actions").unwrap_or(&json!([])))?;
        Ok(())
    })
}

fn definition(
    builder: TaskDefinitionBuilder<SimRunnerContext>,
) -> TaskDefinitionBuilder<SimRunnerContext> {
    builder
        .use_context(sim_cloud_context())
        .use_context(users_context())
        .use_scenario(
            "Orchestration.create_and_delete_stack",
            ScenarioMeta::default()
                .default_context(SIM_CLOUD_CONTEXT, json!({}))
                .require_context(USERS_CONTEXT)
                .validator(required_args(&["template"]))
                .validator(required_services(&[ORCHESTRATION])),
            create_and_delete_stack,
        )
        .use_scenario(
            "Compute.boot_and_delete_server",
            ScenarioMeta::default()
                .default_context(SIM_CLOUD_CONTEXT, json!({}))
                .require_context(USERS_CONTEXT)
                .validator(required_args(&["flavor", "image"]))
                .validator(number("min_sleep", Some(0.0), None, false, true))
                .validator(number("max_sleep", Some(0.0), None, false, true))
                .validator(required_services(&[COMPUTE])),
            boot_and_delete_server,
        )
        .use_scenario(
            "Compute.boot_and_bounce_server",
            ScenarioMeta::default()
                .default_context(SIM_CLOUD_CONTEXT, json!({}))
                .require_context(USERS_CONTEXT)
                .validator(required_args(&["flavor", "image"]))
                .validator(valid_bounce_actions())
                .validator(required_services(&[COMPUTE])),
            boot_and_bounce_server,
        )
}

fn main() -> BenchResult<()> {
    let builder = definition(TaskDefinitionBuilder::new_with_init(env!("CARGO_PKG_NAME")));

    let summary = run(builder)?;
    if !summary.pass_sla() {
        log::warn!("Task {} did not pass its SLA", summary.task_id);
    }

    Ok(())
}
