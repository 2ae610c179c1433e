use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::Context;
use cloudbench_core::prelude::AbortHandle;
use cloudbench_instruments::Reporter;
use cloudbench_summary_model::{Aggregator, HookRunResult, IterationResult, StreamingSla};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::hooks::{HookExecutor, TriggerUnit};
use crate::progress::Progress;

pub(crate) enum ConsumerMessage {
    /// An iteration with this 1-based number is about to run.
    Started(usize),
    Result(IterationResult),
    /// Whole seconds since the load started.
    Tick(u64),
    /// Sent once dispatch is done. Results from iterations that were given up on are dropped.
    Stop,
}

pub(crate) struct ConsumerOutcome {
    pub aggregator: Aggregator,
    pub aborted_on_sla: bool,
    pub hooks: Vec<HookRunResult>,
}

/// Collects results as they are produced, on a single thread, so that workers never wait for
/// reporting.
///
/// With `abort_on_sla` set, every result is fed to the SLA as it arrives and the run is soft
/// aborted on the first failure. Hooks are started from here when an iteration or a tick matches
/// their trigger.
pub(crate) fn start_consumer(
    scenario_name: String,
    mut receiver: UnboundedReceiver<ConsumerMessage>,
    reporter: Arc<Reporter>,
    mut abort_on_sla: Option<(StreamingSla, AbortHandle)>,
    mut hooks: HookExecutor,
    progress: Option<Progress>,
) -> anyhow::Result<JoinHandle<ConsumerOutcome>> {
    std::thread::Builder::new()
        .name("result-consumer".to_string())
        .spawn(move || {
            let mut aggregator = Aggregator::new();
            let mut aborted_on_sla = false;

            while let Some(message) = receiver.blocking_recv() {
                let result = match message {
                    ConsumerMessage::Started(iteration) => {
                        hooks.on_event(TriggerUnit::Iteration, iteration as u64);
                        continue;
                    }
                    ConsumerMessage::Tick(seconds) => {
                        hooks.on_event(TriggerUnit::Time, seconds);
                        continue;
                    }
                    ConsumerMessage::Stop => break,
                    ConsumerMessage::Result(result) => result,
                };

                reporter.add_iteration(&scenario_name, &result);
                if let Some(progress) = &progress {
                    progress.inc();
                }

                if let Some((sla, abort)) = &mut abort_on_sla {
                    let failing = sla.add_iteration(&result);
                    if !aborted_on_sla && !failing.is_empty() {
                        log::warn!(
                            "SLA {} failed after {} iterations of {scenario_name}, aborting",
                            failing.join(", "),
                            aggregator.len() + 1
                        );
                        aborted_on_sla = true;
                        abort.soft_abort();
                    }
                }

                aggregator.add(result);
            }

            if let Some(progress) = progress {
                progress.finish();
            }

            ConsumerOutcome {
                aggregator,
                aborted_on_sla,
                hooks: hooks.results(),
            }
        })
        .context("Failed to start result consumer")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::HookResult;
    use crate::hooks::{ArmedHook, TriggerConfig};
    use cloudbench_summary_model::{ErrorInfo, HookStatus, ScenarioOutput, SlaChecker};
    use serde_json::json;
    use std::collections::HashMap;

    fn result(iteration: usize, failed: bool) -> IterationResult {
        IterationResult {
            iteration,
            timestamp: 0.0,
            duration: 0.01,
            idle_duration: 0.0,
            error: failed.then(|| ErrorInfo::new("Error", "boom", "boom")),
            atomic_actions: Vec::new(),
            output: ScenarioOutput::default(),
        }
    }

    #[test]
    fn sla_failure_aborts_the_run() {
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        let abort = AbortHandle::new();
        let sla = SlaChecker::from_config(
            json!({"failure_rate": {"max": 0}}).as_object().unwrap(),
        )
        .unwrap()
        .streaming();

        let consumer = start_consumer(
            "Dummy.dummy".to_string(),
            receiver,
            Arc::new(Reporter::noop()),
            Some((sla, abort.clone())),
            HookExecutor::default(),
            None,
        )
        .unwrap();

        sender.send(ConsumerMessage::Result(result(1, false))).unwrap();
        sender.send(ConsumerMessage::Result(result(2, true))).unwrap();
        sender.send(ConsumerMessage::Stop).unwrap();

        let outcome = consumer.join().unwrap();
        assert_eq!(2, outcome.aggregator.len());
        assert!(outcome.aborted_on_sla);
        assert!(abort.level().is_some());
    }

    #[test]
    fn every_result_is_kept_once_with_its_error() {
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        let consumer = start_consumer(
            "Dummy.dummy".to_string(),
            receiver,
            Arc::new(Reporter::noop()),
            None,
            HookExecutor::default(),
            None,
        )
        .unwrap();

        let failing = [2, 3, 4, 6, 8, 10];
        let stop = sender.clone();
        let dispatch = crate::dispatch::dispatch(
            &crate::dispatch::RunnerConfig::parse(
                &json!({"type": "constant", "times": 10, "concurrency": 3}),
            )
            .unwrap(),
            AbortHandle::new().new_listener(),
            std::time::Duration::from_secs(5),
            move |iteration| {
                let _ = sender.send(ConsumerMessage::Result(result(
                    iteration,
                    failing.contains(&iteration),
                )));
            },
        )
        .unwrap();
        assert_eq!(10, dispatch.scheduled);
        stop.send(ConsumerMessage::Stop).unwrap();

        let outcome = consumer.join().unwrap();
        let mut seen = HashMap::new();
        for result in outcome.aggregator.results() {
            *seen.entry(result.iteration).or_insert(0) += 1;
        }
        assert_eq!((1..=10).map(|i| (i, 1)).collect::<HashMap<_, _>>(), seen);

        let mut failed = outcome
            .aggregator
            .results()
            .iter()
            .filter(|r| r.error.is_some())
            .map(|r| r.iteration)
            .collect::<Vec<_>>();
        failed.sort();
        assert_eq!(failing.to_vec(), failed);
    }

    #[test]
    fn hooks_fire_on_started_iterations_and_ticks() {
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        let hooks = HookExecutor::new(vec![
            ArmedHook {
                name: "on_iteration".to_string(),
                description: String::new(),
                trigger: TriggerConfig::Event {
                    unit: TriggerUnit::Iteration,
                    at: vec![2],
                },
                action: Arc::new(|| -> HookResult { Ok(()) }),
            },
            ArmedHook {
                name: "on_time".to_string(),
                description: String::new(),
                trigger: TriggerConfig::Periodic {
                    unit: TriggerUnit::Time,
                    step: 1,
                    start: None,
                    end: Some(1),
                },
                action: Arc::new(|| -> HookResult { anyhow::bail!("unreachable host") }),
            },
        ]);
        let consumer = start_consumer(
            "Dummy.dummy".to_string(),
            receiver,
            Arc::new(Reporter::noop()),
            None,
            hooks,
            None,
        )
        .unwrap();

        sender.send(ConsumerMessage::Tick(0)).unwrap();
        for iteration in 1..=3 {
            sender.send(ConsumerMessage::Started(iteration)).unwrap();
            sender
                .send(ConsumerMessage::Result(result(iteration, false)))
                .unwrap();
        }
        sender.send(ConsumerMessage::Tick(1)).unwrap();
        sender.send(ConsumerMessage::Tick(2)).unwrap();
        sender.send(ConsumerMessage::Stop).unwrap();

        let outcome = consumer.join().unwrap();
        assert_eq!(3, outcome.aggregator.len());
        let fired = outcome
            .hooks
            .iter()
            .map(|h| {
                (
                    h.hook.as_str(),
                    h.triggered_by.unit.as_str(),
                    h.triggered_by.value,
                    h.status,
                )
            })
            .collect::<Vec<_>>();
        assert_eq!(
            vec![
                ("on_time", "time", 0, HookStatus::Failed),
                ("on_iteration", "iteration", 2, HookStatus::Success),
                ("on_time", "time", 1, HookStatus::Failed),
            ],
            fired
        );
    }
}
