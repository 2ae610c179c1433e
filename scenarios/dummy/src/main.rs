use std::time::Duration;

use anyhow::bail;
use cloudbench_runner::prelude::*;
use rand::Rng;
use serde_json::{json, Value};

/// Scenarios that exercise the task engine itself, without any cloud.
#[derive(Debug, Default)]
struct DummyValues;

impl UserValuesConstraint for DummyValues {}

type DummyContext = ScenarioContext<DummyValues>;

#[derive(Debug, thiserror::Error)]
#[error("Dummy scenario expected exception: '{0}'")]
struct DummyScenarioError(String);

fn arg_f64(args: &ScenarioArgs, name: &str, default: f64) -> anyhow::Result<f64> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(default),
        Some(value) => value
            .as_f64()
            .ok_or_else(|| InvalidArgument(format!("'{name}' must be a number, got {value}")).into()),
    }
}

fn arg_u64(args: &ScenarioArgs, name: &str, default: u64) -> anyhow::Result<u64> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(default),
        Some(value) => value.as_u64().ok_or_else(|| {
            InvalidArgument(format!("'{name}' must be a non-negative integer, got {value}")).into()
        }),
    }
}

/// Sleep as part of the work of the iteration, interrupted by a hard abort.
fn busy_sleep(ctx: &DummyContext, seconds: f64) -> anyhow::Result<()> {
    if seconds > 0.0 {
        let duration = Duration::try_from_secs_f64(seconds)
            .map_err(|e| InvalidArgument(format!("cannot sleep for {seconds}s: {e}")))?;
        ctx.abort_listener().sleep(duration)?;
    }
    Ok(())
}

fn dummy(ctx: &mut DummyContext, args: &ScenarioArgs) -> ScenarioResult {
    let sleep = arg_f64(args, "sleep", 0.0)?;
    let ctx = &*ctx;

    let actions = ctx.atomic_actions();
    actions.time("foo", || actions.time("bar", || busy_sleep(ctx, sleep)))
}

fn failure(ctx: &mut DummyContext, args: &ScenarioArgs) -> ScenarioResult {
    busy_sleep(ctx, arg_f64(args, "sleep", 0.1)?)?;

    let iteration = ctx.iteration() as u64;
    let from = arg_u64(args, "from_iteration", 0)?;
    let to = arg_u64(args, "to_iteration", 0)?;
    let each = arg_u64(args, "each", 1)?;

    if (from..=to).contains(&iteration) && each != 0 && iteration % each == 0 {
        bail!(DummyScenarioError("Expected failure".to_string()));
    }
    Ok(())
}

fn dummy_exception(ctx: &mut DummyContext, args: &ScenarioArgs) -> ScenarioResult {
    busy_sleep(ctx, arg_f64(args, "sleep", 1.0)?)?;

    let message = match args.get("message").and_then(Value::as_str) {
        Some(message) if !message.is_empty() => message.to_string(),
        _ => "M".repeat(arg_u64(args, "size_of_message", 1)? as usize),
    };
    bail!(DummyScenarioError(message))
}

fn dummy_exception_probability(_: &mut DummyContext, args: &ScenarioArgs) -> ScenarioResult {
    let probability = arg_f64(args, "exception_probability", 0.5)?;
    if rand::thread_rng().gen::<f64>() < probability {
        bail!(DummyScenarioError(format!(
            "Dummy Scenario Exception: Probability: {probability}"
        )));
    }
    Ok(())
}

fn dummy_output(ctx: &mut DummyContext, args: &ScenarioArgs) -> ScenarioResult {
    let range = arg_u64(args, "random_range", 25)?.max(1);
    let mut rng = rand::thread_rng();
    let mut sample = |label: &str| json!([label, rng.gen_range(1..=range)]);

    let stats = ["foo stat", "bar stat", "spam stat"].map(&mut sample);
    let lines = ["bar 1", "bar 2", "bar 3"].map(&mut sample);
    let pie = ["delta", "epsilon", "zeta"].map(&mut sample);

    ctx.add_output(
        "additive",
        json!([
            {"title": "Additive StatsTable", "chart_plugin": "StatsTable", "data": stats},
            {
                "title": "Additive Lines",
                "chart_plugin": "Lines",
                "data": lines,
                "label": "Measure this in Bar units",
            },
        ]),
    );
    ctx.add_output(
        "complete",
        json!([
            {"title": "Complete Pie", "chart_plugin": "Pie", "data": pie},
            {
                "title": "Arbitrary Text",
                "chart_plugin": "TextArea",
                "data": ["Lorem ipsum dolor sit amet, consectetur adipiscing elit."],
            },
        ]),
    );

    Ok(())
}

fn roulette(probability: f64) -> anyhow::Result<()> {
    if rand::thread_rng().gen::<f64>() < probability {
        bail!("Dummy test exception");
    }
    Ok(())
}

fn dummy_random_fail_in_atomic(ctx: &mut DummyContext, args: &ScenarioArgs) -> ScenarioResult {
    let mut probability = arg_f64(args, "exception_probability", 0.5)?;
    // Spread the probability over the four places that can fail.
    if probability != 1.0 {
        probability /= 4.0;
    }

    let actions = ctx.atomic_actions();
    for _ in 0..2 {
        actions.time("dummy_fail_test", || {
            roulette(probability)?;
            actions.time("dummy_fail_inner_test", || roulette(probability))
        })?;
    }
    Ok(())
}

fn dummy_random_action(ctx: &mut DummyContext, args: &ScenarioArgs) -> ScenarioResult {
    let actions_num = arg_u64(args, "actions_num", 5)?;
    let sleep_min = arg_f64(args, "sleep_min", 0.0)?;
    let sleep_max = arg_f64(args, "sleep_max", 0.0)?;
    if sleep_min > sleep_max {
        bail!(InvalidArgument(format!(
            "sleep_min {sleep_min} is greater than sleep_max {sleep_max}"
        )));
    }

    let ctx = &*ctx;
    for idx in 0..actions_num {
        let duration = if sleep_min == sleep_max {
            sleep_min
        } else {
            rand::thread_rng().gen_range(sleep_min..sleep_max)
        };
        ctx.atomic_actions()
            .time(&format!("action_{idx}"), || busy_sleep(ctx, duration))?;
    }
    Ok(())
}

fn dummy_timed_atomic_actions(ctx: &mut DummyContext, args: &ScenarioArgs) -> ScenarioResult {
    let number_of_actions = arg_u64(args, "number_of_actions", 5)?;
    let sleep_factor = arg_f64(args, "sleep_factor", 1.0)?;

    let ctx = &*ctx;
    for idx in 0..number_of_actions {
        ctx.atomic_actions().time(&format!("action_{idx}"), || {
            busy_sleep(ctx, idx as f64 * sleep_factor)
        })?;
    }
    Ok(())
}

fn definition(builder: TaskDefinitionBuilder<DummyValues>) -> TaskDefinitionBuilder<DummyValues> {
    builder
        .use_scenario("Dummy.dummy", ScenarioMeta::default(), dummy)
        .use_scenario("Dummy.failure", ScenarioMeta::default(), failure)
        .use_scenario(
            "Dummy.dummy_exception",
            ScenarioMeta::default().validator(number(
                "size_of_message",
                Some(1.0),
                None,
                true,
                true,
            )),
            dummy_exception,
        )
        .use_scenario(
            "Dummy.dummy_exception_probability",
            ScenarioMeta::default().validator(number(
                "exception_probability",
                Some(0.0),
                Some(1.0),
                false,
                true,
            )),
            dummy_exception_probability,
        )
        .use_scenario("Dummy.dummy_output", ScenarioMeta::default(), dummy_output)
        .use_scenario(
            "Dummy.dummy_random_fail_in_atomic",
            ScenarioMeta::default().validator(number(
                "exception_probability",
                Some(0.0),
                Some(1.0),
                false,
                true,
            )),
            dummy_random_fail_in_atomic,
        )
        .use_scenario(
            "Dummy.dummy_random_action",
            ScenarioMeta::default(),
            dummy_random_action,
        )
        .use_scenario(
            "Dummy.dummy_timed_atomic_actions",
            ScenarioMeta::default(),
            dummy_timed_atomic_actions,
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
