use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use cloudbench_core::prelude::error_kind;
use cloudbench_instruments::AtomicActionsHost;
use cloudbench_summary_model::{ErrorInfo, IterationResult, ScenarioOutput};

use crate::context::{RunnerContext, ScenarioContext, UserValuesConstraint};
use crate::definition::{ScenarioArgs, ScenarioFn};

pub(crate) fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Turn the outcome of a caught call into an error record, `None` when it succeeded.
pub(crate) fn capture_error(
    outcome: std::thread::Result<anyhow::Result<()>>,
    panic_msg: &str,
) -> Option<ErrorInfo> {
    match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(ErrorInfo::new(
            error_kind(&e),
            e.to_string(),
            format!("{e:?}"),
        )),
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| panic_msg.to_string());
            Some(ErrorInfo::new("Panic", msg.clone(), msg))
        }
    }
}

/// Run one scenario invocation with a fresh context and capture everything about it.
///
/// Errors and panics from the scenario become the iteration's error, they are never propagated.
pub(crate) fn run_iteration<RV: UserValuesConstraint>(
    runner_context: &Arc<RunnerContext<RV>>,
    scenario_name: &str,
    scenario_fn: ScenarioFn<RV>,
    args: &ScenarioArgs,
    iteration: usize,
    timeout: Option<std::time::Duration>,
) -> IterationResult {
    let clock = runner_context.clock().clone();
    let started = clock.now();
    let deadline = timeout.and_then(|timeout| started.checked_add(timeout));
    let timestamp = unix_now();

    let mut ctx = ScenarioContext::new(runner_context.clone(), iteration, deadline);

    log::info!(
        "Task {} | ITER: {iteration} START {scenario_name}",
        runner_context.task_id()
    );

    let outcome = catch_unwind(AssertUnwindSafe(|| scenario_fn(&mut ctx, args)));

    let finished = clock.now();
    let wall = finished.saturating_duration_since(started);
    let idle = ctx.idle_duration();

    let mut error = capture_error(outcome, "scenario panicked");

    if error.is_none() {
        if let (Some(timeout), Some(deadline)) = (timeout, deadline) {
            if finished > deadline {
                let msg = format!(
                    "Iteration took {:.3}s, more than the {:.3}s timeout",
                    wall.as_secs_f64(),
                    timeout.as_secs_f64()
                );
                error = Some(ErrorInfo::new("IterationTimeout", msg.clone(), msg));
            }
        }
    }

    let output = if error.is_some() {
        ScenarioOutput::default()
    } else {
        ctx.take_output()
    };

    let status = match &error {
        None => "OK".to_string(),
        Some(e) => format!("FAILED: {}: {}", e.etype, e.msg),
    };
    log::info!(
        "Task {} | ITER: {iteration} END: {status}",
        runner_context.task_id()
    );

    IterationResult {
        iteration,
        timestamp,
        duration: wall.saturating_sub(idle).as_secs_f64(),
        idle_duration: idle.as_secs_f64(),
        error,
        atomic_actions: ctx.atomic_actions().records(),
        output,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BenchConfig;
    use crate::executor::Executor;
    use crate::definition::ScenarioResult;
    use cloudbench_core::prelude::{
        AbortHandle, Clock, ManualClock, ResourceNameGenerator, SystemClock,
    };
    use cloudbench_instruments::AtomicTimer;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct TestValues;
    impl crate::context::UserValuesConstraint for TestValues {}

    fn runner_context() -> Arc<RunnerContext<TestValues>> {
        let abort = AbortHandle::new();
        let clock = Arc::new(SystemClock::with_abort(abort.new_listener()));
        runner_context_with_clock(abort, clock)
    }

    fn runner_context_with_clock(
        abort: AbortHandle,
        clock: Arc<dyn Clock>,
    ) -> Arc<RunnerContext<TestValues>> {
        Arc::new(RunnerContext::new(
            Arc::new(Executor::new(
                tokio::runtime::Runtime::new().unwrap(),
                abort.clone(),
            )),
            abort,
            clock,
            "iterationtest".to_string(),
            Arc::new(BenchConfig::default()),
            ResourceNameGenerator::default(),
        ))
    }

    fn iterate(
        scenario_fn: ScenarioFn<TestValues>,
        timeout: Option<Duration>,
    ) -> IterationResult {
        run_iteration(
            &runner_context(),
            "Test.scenario",
            scenario_fn,
            &ScenarioArgs::new(),
            1,
            timeout,
        )
    }

    #[test]
    fn successful_iteration_keeps_output() {
        fn scenario(ctx: &mut ScenarioContext<TestValues>, _: &ScenarioArgs) -> ScenarioResult {
            ctx.add_output("servers", json!(3));
            ctx.atomic_actions().time("boot", || Ok::<_, anyhow::Error>(()))?;
            Ok(())
        }

        let result = iterate(scenario, None);

        assert!(result.is_success());
        assert_eq!(json!(3), result.output.data["servers"]);
        assert_eq!("boot", result.atomic_actions[0].name);
    }

    #[test]
    fn typed_errors_keep_their_kind() {
        fn scenario(ctx: &mut ScenarioContext<TestValues>, _: &ScenarioArgs) -> ScenarioResult {
            ctx.add_output("partial", json!(true));
            ctx.sleep_between(2.0, 1.0)
        }

        let result = iterate(scenario, None);

        let error = result.error.unwrap();
        assert_eq!("InvalidArgument", error.etype);
        assert!(result.output.is_empty());
    }

    #[test]
    fn panics_are_captured() {
        fn scenario(_: &mut ScenarioContext<TestValues>, _: &ScenarioArgs) -> ScenarioResult {
            panic!("oops");
        }

        let result = iterate(scenario, None);

        let error = result.error.unwrap();
        assert_eq!("Panic", error.etype);
        assert_eq!("oops", error.msg);
    }

    #[test]
    fn overrun_is_reported_as_timeout() {
        fn scenario(_: &mut ScenarioContext<TestValues>, _: &ScenarioArgs) -> ScenarioResult {
            std::thread::sleep(Duration::from_millis(50));
            Ok(())
        }

        let result = iterate(scenario, Some(Duration::from_millis(10)));

        assert_eq!("IterationTimeout", result.error.unwrap().etype);
    }

    #[test]
    fn sleep_inside_an_action_is_not_idle() {
        fn scenario(ctx: &mut ScenarioContext<TestValues>, _: &ScenarioArgs) -> ScenarioResult {
            let actions = ctx.atomic_actions().clone();
            let timer = AtomicTimer::start(&actions, "nova.wait_for_boot");
            ctx.sleep_between(2.0, 2.0)?;
            timer.finish();

            ctx.sleep_between(1.0, 1.0)
        }

        let result = run_iteration(
            &runner_context_with_clock(AbortHandle::new(), Arc::new(ManualClock::new())),
            "Test.scenario",
            scenario,
            &ScenarioArgs::new(),
            1,
            None,
        );

        assert!(result.is_success());
        assert_eq!(1.0, result.idle_duration);
        assert_eq!(2.0, result.duration);
        assert_eq!(2.0, result.top_level_action_time());
    }

    #[test]
    fn top_level_actions_fit_in_the_iteration() {
        fn scenario(ctx: &mut ScenarioContext<TestValues>, _: &ScenarioArgs) -> ScenarioResult {
            let actions = ctx.atomic_actions().clone();
            for _ in 0..3 {
                let outer = AtomicTimer::start(&actions, "heat.create_stack");
                let inner = AtomicTimer::start(&actions, "heat.wait_for_stack");
                ctx.sleep_between(1.5, 1.5)?;
                inner.finish();
                outer.finish();
                ctx.sleep_between(0.25, 0.25)?;
            }
            Ok(())
        }

        let result = run_iteration(
            &runner_context_with_clock(AbortHandle::new(), Arc::new(ManualClock::new())),
            "Test.scenario",
            scenario,
            &ScenarioArgs::new(),
            1,
            None,
        );

        assert!(result.is_success());
        assert_eq!(6, result.atomic_actions.len());
        assert!(result.top_level_action_time() <= result.duration);
    }

    #[test]
    fn sleeps_are_clamped_to_the_deadline() {
        fn scenario(ctx: &mut ScenarioContext<TestValues>, _: &ScenarioArgs) -> ScenarioResult {
            ctx.sleep_between(5.0, 5.0)
        }

        let result = iterate(scenario, Some(Duration::from_millis(50)));

        assert!(result.idle_duration < 1.0);
    }
}
