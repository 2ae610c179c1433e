use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use cloudbench_core::prelude::{AbortListener, ConfigurationError};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use serde_json::Value;

fn one() -> usize {
    1
}

/// Seconds that must fit in a [Duration].
fn checked_seconds(what: &str, seconds: f64) -> Result<Duration, ConfigurationError> {
    Duration::try_from_secs_f64(seconds)
        .map_err(|e| ConfigurationError(format!("{what} of {seconds}s is out of range: {e}")))
}

/// Only for values that passed [checked_seconds] during validation.
fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
}

/// How iterations of a workload are scheduled, from the `runner` section of a workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerConfig {
    /// One worker running `times` iterations in order.
    Serial {
        #[serde(default = "one")]
        times: usize,
    },
    /// `concurrency` workers sharing `times` iterations.
    Constant {
        times: usize,
        #[serde(default = "one")]
        concurrency: usize,
        #[serde(default)]
        timeout: Option<f64>,
    },
    /// `concurrency` workers running iterations until `duration` seconds have passed.
    ConstantForDuration {
        duration: f64,
        #[serde(default = "one")]
        concurrency: usize,
        #[serde(default)]
        timeout: Option<f64>,
    },
    /// Start `times` iterations at `rps` per second, whether or not earlier ones finished.
    Rps {
        times: usize,
        rps: f64,
        #[serde(default)]
        max_concurrency: Option<usize>,
        #[serde(default)]
        timeout: Option<f64>,
    },
}

impl RunnerConfig {
    pub fn parse(value: &Value) -> Result<Self, ConfigurationError> {
        let config: RunnerConfig = serde_json::from_value(value.clone())
            .map_err(|e| ConfigurationError(format!("invalid runner {value}: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        let fail = |msg: String| Err(ConfigurationError(msg));

        match self {
            RunnerConfig::Serial { .. } => {}
            RunnerConfig::Constant {
                times, concurrency, ..
            } => {
                if *concurrency == 0 {
                    return fail("constant runner needs a concurrency of at least 1".to_string());
                }
                if concurrency > times {
                    return fail(format!(
                        "constant runner concurrency ({concurrency}) must not be greater than times ({times})"
                    ));
                }
            }
            RunnerConfig::ConstantForDuration {
                duration,
                concurrency,
                ..
            } => {
                if *concurrency == 0 {
                    return fail(
                        "constant_for_duration runner needs a concurrency of at least 1"
                            .to_string(),
                    );
                }
                if !duration.is_finite() || *duration < 0.0 {
                    return fail(format!(
                        "constant_for_duration runner needs a non-negative duration, got {duration}"
                    ));
                }
                checked_seconds("constant_for_duration runner duration", *duration)?;
            }
            RunnerConfig::Rps {
                times,
                rps,
                max_concurrency,
                ..
            } => {
                if !rps.is_finite() || *rps <= 0.0 {
                    return fail(format!("rps runner needs a positive rps, got {rps}"));
                }
                if *max_concurrency == Some(0) {
                    return fail("rps runner needs a max_concurrency of at least 1".to_string());
                }
                // The last iteration starts the latest.
                checked_seconds(
                    "rps runner start offset",
                    times.saturating_sub(1) as f64 / rps,
                )?;
            }
        }

        if let Some(timeout) = self.timeout_s() {
            if !timeout.is_finite() || timeout <= 0.0 {
                return fail(format!("runner timeout must be positive, got {timeout}"));
            }
            checked_seconds("runner timeout", timeout)?;
        }

        Ok(())
    }

    /// The number of iterations this runner will start, if it is count based.
    pub fn times(&self) -> Option<usize> {
        match self {
            RunnerConfig::Serial { times }
            | RunnerConfig::Constant { times, .. }
            | RunnerConfig::Rps { times, .. } => Some(*times),
            RunnerConfig::ConstantForDuration { .. } => None,
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        match self {
            RunnerConfig::ConstantForDuration { duration, .. } => Some(seconds(*duration)),
            _ => None,
        }
    }

    /// The most scenario invocations that can be in flight at once.
    pub fn concurrency(&self) -> usize {
        match self {
            RunnerConfig::Serial { .. } => 1,
            RunnerConfig::Constant { concurrency, .. }
            | RunnerConfig::ConstantForDuration { concurrency, .. } => *concurrency,
            RunnerConfig::Rps {
                times,
                max_concurrency,
                ..
            } => max_concurrency.unwrap_or(*times).max(1),
        }
    }

    fn timeout_s(&self) -> Option<f64> {
        match self {
            RunnerConfig::Serial { .. } => None,
            RunnerConfig::Constant { timeout, .. }
            | RunnerConfig::ConstantForDuration { timeout, .. }
            | RunnerConfig::Rps { timeout, .. } => *timeout,
        }
    }

    /// Per-iteration time limit.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_s().map(seconds)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DispatchOutcome {
    /// Number of iterations that were started
    pub scheduled: usize,
    /// An abort stopped the runner before it had started everything it planned to
    pub aborted: bool,
    /// In-flight iterations were still running when the abort grace period ran out
    pub abort_not_honored: bool,
    pub load_duration: Duration,
}

/// Counts the scenario invocations in flight.
#[derive(Debug, Default)]
struct WorkerGroup {
    running: Mutex<usize>,
    changed: Condvar,
}

struct WorkerGuard(Arc<WorkerGroup>);

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        let mut running = self.0.running.lock();
        *running -= 1;
        self.0.changed.notify_all();
    }
}

impl WorkerGroup {
    fn enter(self: &Arc<Self>) -> WorkerGuard {
        *self.running.lock() += 1;
        WorkerGuard(self.clone())
    }

    /// Wait for a free slot under `limit`. Gives up and returns `None` on abort.
    fn acquire(self: &Arc<Self>, limit: usize, abort: &AbortListener) -> Option<WorkerGuard> {
        let mut running = self.running.lock();
        while *running >= limit {
            if abort.should_stop() {
                return None;
            }
            self.changed
                .wait_for(&mut running, Duration::from_millis(50));
        }
        *running += 1;
        Some(WorkerGuard(self.clone()))
    }

    /// Wait for every guard to be dropped. After an abort, only waits for `grace`.
    fn wait(&self, abort: &AbortListener, grace: Duration) -> bool {
        let mut aborted_at: Option<Instant> = None;
        let mut running = self.running.lock();
        while *running > 0 {
            if abort.should_stop() {
                let aborted_at = *aborted_at.get_or_insert_with(Instant::now);
                if aborted_at.elapsed() >= grace {
                    log::warn!(
                        "{} iterations did not finish within {:.1}s of the abort, giving up on them",
                        *running,
                        grace.as_secs_f64()
                    );
                    return false;
                }
            }
            self.changed
                .wait_for(&mut running, Duration::from_millis(50));
        }
        true
    }
}

/// Run iterations according to `config`. `run_one` is called with the 1-based iteration number and
/// is responsible for reporting the result.
pub(crate) fn dispatch<F>(
    config: &RunnerConfig,
    abort: AbortListener,
    abort_grace: Duration,
    run_one: F,
) -> anyhow::Result<DispatchOutcome>
where
    F: Fn(usize) + Send + Sync + 'static,
{
    let run_one = Arc::new(run_one);
    let group = Arc::new(WorkerGroup::default());
    let counter = Arc::new(AtomicUsize::new(0));
    let started = Instant::now();

    log::debug!("Dispatching iterations with {config:?}");

    let spawn_result = match config {
        RunnerConfig::Serial { times } => spawn_workers(
            1,
            *times,
            None,
            &group,
            &counter,
            &abort,
            &run_one,
        ),
        RunnerConfig::Constant {
            times, concurrency, ..
        } => spawn_workers(
            *concurrency,
            *times,
            None,
            &group,
            &counter,
            &abort,
            &run_one,
        ),
        RunnerConfig::ConstantForDuration { concurrency, .. } => spawn_workers(
            *concurrency,
            usize::MAX,
            // Past the end of time there is no deadline to check.
            config.duration().and_then(|duration| started.checked_add(duration)),
            &group,
            &counter,
            &abort,
            &run_one,
        ),
        RunnerConfig::Rps {
            times, rps, ..
        } => dispatch_rps(
            *times,
            *rps,
            config.concurrency(),
            &group,
            &counter,
            &abort,
            &run_one,
        ),
    };

    // Workers that did start must be waited for even when starting others failed.
    let finished = group.wait(&abort, abort_grace);
    spawn_result?;

    let scheduled = counter.load(Ordering::SeqCst);
    let aborted =
        abort.should_stop() && config.times().map_or(true, |times| scheduled < times);

    Ok(DispatchOutcome {
        scheduled,
        aborted,
        abort_not_honored: !finished,
        load_duration: started.elapsed(),
    })
}

/// Start `concurrency` workers that each take the next iteration number until `times` are taken,
/// the `until` deadline passes or the run is aborted.
///
/// A deadline is checked after an iteration, so every worker runs at least once.
fn spawn_workers<F>(
    concurrency: usize,
    times: usize,
    until: Option<Instant>,
    group: &Arc<WorkerGroup>,
    counter: &Arc<AtomicUsize>,
    abort: &AbortListener,
    run_one: &Arc<F>,
) -> anyhow::Result<()>
where
    F: Fn(usize) + Send + Sync + 'static,
{
    for worker in 0..concurrency {
        let guard = group.enter();
        let counter = counter.clone();
        let abort = abort.clone();
        let run_one = run_one.clone();

        std::thread::Builder::new()
            .name(format!("worker-{worker}"))
            .spawn(move || {
                let _guard = guard;
                log::trace!("Worker {worker} started");

                loop {
                    if abort.should_stop() {
                        log::debug!("Worker {worker} stopping on abort");
                        break;
                    }

                    let taken = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                        (n < times).then_some(n + 1)
                    });
                    let Ok(previous) = taken else {
                        break;
                    };
                    run_one(previous + 1);

                    if until.is_some_and(|until| Instant::now() >= until) {
                        break;
                    }
                }

                log::trace!("Worker {worker} finished");
            })
            .with_context(|| format!("Failed to start worker {worker}"))?;
    }

    Ok(())
}

/// Start iteration `i` at `i / rps` seconds after the first, each on its own thread. Dispatch waits
/// while `max_concurrency` iterations are in flight.
fn dispatch_rps<F>(
    times: usize,
    rps: f64,
    max_concurrency: usize,
    group: &Arc<WorkerGroup>,
    counter: &Arc<AtomicUsize>,
    abort: &AbortListener,
    run_one: &Arc<F>,
) -> anyhow::Result<()>
where
    F: Fn(usize) + Send + Sync + 'static,
{
    let started = Instant::now();

    for i in 0..times {
        let Some(start_at) = started.checked_add(seconds(i as f64 / rps)) else {
            anyhow::bail!(ConfigurationError(format!(
                "rps runner cannot schedule iteration {} at {rps} per second",
                i + 1
            )));
        };
        let wait = start_at.saturating_duration_since(Instant::now());
        if abort.wait_for_stop(wait) {
            log::debug!("Stopping rps dispatch after {i} iterations on abort");
            break;
        }

        let Some(guard) = group.acquire(max_concurrency, abort) else {
            break;
        };

        let iteration = counter.fetch_add(1, Ordering::SeqCst) + 1;
        let run_one = run_one.clone();
        std::thread::Builder::new()
            .name(format!("iteration-{iteration}"))
            .spawn(move || {
                let _guard = guard;
                run_one(iteration);
            })
            .with_context(|| format!("Failed to start iteration {iteration}"))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudbench_core::prelude::AbortHandle;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn parse_runner_types() {
        assert_eq!(
            RunnerConfig::Serial { times: 1 },
            RunnerConfig::parse(&json!({"type": "serial"})).unwrap()
        );
        assert_eq!(
            RunnerConfig::Constant {
                times: 10,
                concurrency: 2,
                timeout: Some(5.0)
            },
            RunnerConfig::parse(&json!({"type": "constant", "times": 10, "concurrency": 2, "timeout": 5})).unwrap()
        );
        assert_eq!(
            10,
            RunnerConfig::parse(&json!({"type": "rps", "times": 10, "rps": 2}))
                .unwrap()
                .concurrency()
        );
    }

    #[test]
    fn reject_invalid_runners() {
        assert!(RunnerConfig::parse(&json!({"type": "random"})).is_err());
        assert!(
            RunnerConfig::parse(&json!({"type": "constant", "times": 2, "concurrency": 3}))
                .is_err()
        );
        assert!(RunnerConfig::parse(&json!({"type": "rps", "times": 2, "rps": 0})).is_err());
        assert!(RunnerConfig::parse(
            &json!({"type": "constant_for_duration", "duration": -1})
        )
        .is_err());
    }

    #[test]
    fn reject_durations_that_do_not_fit() {
        for runner in [
            json!({"type": "constant_for_duration", "duration": 1e20}),
            json!({"type": "constant", "times": 1, "timeout": 1e20}),
            json!({"type": "constant_for_duration", "duration": 5, "timeout": 1e300}),
            json!({"type": "rps", "times": 3, "rps": 1e-300}),
        ] {
            let err = RunnerConfig::parse(&runner).unwrap_err();
            assert!(err.to_string().contains("out of range"), "{runner}: {err}");
        }

        let accepted =
            RunnerConfig::parse(&json!({"type": "constant", "times": 1, "timeout": 1e9})).unwrap();
        assert_eq!(Some(Duration::from_secs(1_000_000_000)), accepted.timeout());
    }

    #[test]
    fn constant_runs_each_iteration_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_workers = seen.clone();

        let outcome = dispatch(
            &RunnerConfig::Constant {
                times: 20,
                concurrency: 4,
                timeout: None,
            },
            AbortHandle::new().new_listener(),
            Duration::from_secs(1),
            move |i| seen_by_workers.lock().push(i),
        )
        .unwrap();

        let mut seen = seen.lock().clone();
        seen.sort();
        assert_eq!((1..=20).collect::<Vec<_>>(), seen);
        assert_eq!(20, outcome.scheduled);
        assert!(!outcome.aborted);
    }

    #[test]
    fn soft_abort_stops_scheduling() {
        let abort = AbortHandle::new();
        let abort_in_worker = abort.clone();

        let outcome = dispatch(
            &RunnerConfig::Serial { times: 100 },
            abort.new_listener(),
            Duration::from_secs(1),
            move |i| {
                if i == 3 {
                    abort_in_worker.soft_abort();
                }
            },
        )
        .unwrap();

        assert_eq!(3, outcome.scheduled);
        assert!(outcome.aborted);
        assert!(!outcome.abort_not_honored);
    }

    #[test]
    fn stuck_iteration_is_given_up_after_grace() {
        let abort = AbortHandle::new();
        let abort_in_worker = abort.clone();

        let outcome = dispatch(
            &RunnerConfig::Serial { times: 2 },
            abort.new_listener(),
            Duration::from_millis(100),
            move |_| {
                abort_in_worker.soft_abort();
                std::thread::sleep(Duration::from_secs(2));
            },
        )
        .unwrap();

        assert!(outcome.abort_not_honored);
        assert!(outcome.load_duration < Duration::from_secs(2));
    }
}
