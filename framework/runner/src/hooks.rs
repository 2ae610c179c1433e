use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Context;
use cloudbench_core::prelude::{ConfigurationError, ValidationError};
use cloudbench_summary_model::{ErrorInfo, HookRunResult, HookStatus, HookTrigger};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc::UnboundedSender;

use crate::consumer::ConsumerMessage;
use crate::context::{RunnerContext, UserValuesConstraint};
use crate::definition::{HookPlugin, HookResult};
use crate::iteration::{capture_error, unix_now};

/// What a trigger counts: started iterations, or whole seconds since the load started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerUnit {
    Iteration,
    Time,
}

impl TriggerUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerUnit::Iteration => "iteration",
            TriggerUnit::Time => "time",
        }
    }

    /// Iterations are numbered from 1, time is counted from 0.
    fn first_value(&self) -> u64 {
        match self {
            TriggerUnit::Iteration => 1,
            TriggerUnit::Time => 0,
        }
    }
}

/// When a hook runs.
///
/// ```yaml
/// trigger: {event: {unit: iteration, at: [5, 10]}}
/// trigger: {periodic: {unit: time, step: 30, start: 0, end: 120}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum TriggerConfig {
    /// Fire once for each listed value.
    Event { unit: TriggerUnit, at: Vec<u64> },
    /// Fire every `step` from `start` up to and including `end`.
    Periodic {
        unit: TriggerUnit,
        step: u64,
        #[serde(default)]
        start: Option<u64>,
        #[serde(default)]
        end: Option<u64>,
    },
}

impl TriggerConfig {
    pub fn unit(&self) -> TriggerUnit {
        match self {
            TriggerConfig::Event { unit, .. } | TriggerConfig::Periodic { unit, .. } => *unit,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let first = self.unit().first_value();
        match self {
            TriggerConfig::Event { unit, at } => {
                if at.is_empty() {
                    return Err(ConfigurationError(
                        "event trigger needs at least one value in 'at'".to_string(),
                    ));
                }
                if let Some(value) = at.iter().find(|v| **v < first) {
                    return Err(ConfigurationError(format!(
                        "event trigger value {value} is below {first}, the first {} value",
                        unit.as_str()
                    )));
                }
            }
            TriggerConfig::Periodic {
                unit,
                step,
                start,
                end,
            } => {
                if *step == 0 {
                    return Err(ConfigurationError(
                        "periodic trigger 'step' must be at least 1".to_string(),
                    ));
                }
                let start = start.unwrap_or(first);
                if start < first {
                    return Err(ConfigurationError(format!(
                        "periodic trigger 'start' is {start}, below {first}, the first {} value",
                        unit.as_str()
                    )));
                }
                if end.is_some_and(|end| end < start) {
                    return Err(ConfigurationError(format!(
                        "periodic trigger 'end' is before its 'start' of {start}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Whether the trigger fires when its unit reaches `value`.
    pub fn fires_at(&self, value: u64) -> bool {
        match self {
            TriggerConfig::Event { at, .. } => at.contains(&value),
            TriggerConfig::Periodic {
                unit,
                step,
                start,
                end,
            } => {
                let start = start.unwrap_or(unit.first_value());
                *step > 0
                    && value >= start
                    && end.map_or(true, |end| value <= end)
                    && (value - start) % step == 0
            }
        }
    }
}

/// A hook of a workload, from its `hooks` list.
///
/// ```yaml
/// hooks:
///   - description: restart the api
///     action: {sys_call: "systemctl restart api"}
///     trigger: {event: {unit: iteration, at: [50]}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HookConfig {
    #[serde(default)]
    pub description: String,
    /// A single entry, the registered hook name mapped to its arguments
    pub action: Map<String, Value>,
    pub trigger: TriggerConfig,
}

impl HookConfig {
    pub fn new(action: &str, args: Value, trigger: TriggerConfig) -> Self {
        let mut entry = Map::new();
        entry.insert(action.to_string(), args);
        Self {
            description: String::new(),
            action: entry,
            trigger,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// The hook name and its arguments.
    pub fn action(&self) -> Result<(&str, &Value), ConfigurationError> {
        let mut entries = self.action.iter();
        match (entries.next(), entries.next()) {
            (Some((name, args)), None) => Ok((name.as_str(), args)),
            _ => Err(ConfigurationError(format!(
                "hook action must name exactly one hook, got {}",
                self.action.len()
            ))),
        }
    }
}

/// Run a shell command, failing when it exits with a non-zero status.
pub fn sys_call<RV: UserValuesConstraint>(_: &RunnerContext<RV>, args: &Value) -> HookResult {
    let command = args
        .as_str()
        .context("sys_call needs the command to run as a string")?;

    let output = std::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .with_context(|| format!("Failed to start '{command}'"))?;

    log::debug!(
        "sys_call '{command}' printed: {}",
        String::from_utf8_lossy(&output.stdout).trim()
    );
    if !output.status.success() {
        anyhow::bail!(
            "'{command}' exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(())
}

fn check_sys_call_args(args: &Value) -> Result<(), ValidationError> {
    match args.as_str() {
        Some(command) if !command.trim().is_empty() => Ok(()),
        _ => Err(ValidationError(format!(
            "sys_call needs a non-empty command string, got {args}"
        ))),
    }
}

/// The hooks every task definition starts with.
pub(crate) fn builtin_hooks<RV: UserValuesConstraint>() -> Vec<HookPlugin<RV>> {
    vec![HookPlugin::new("sys_call", sys_call::<RV>).with_args_check(check_sys_call_args)]
}

pub(crate) type HookAction = Arc<dyn Fn() -> HookResult + Send + Sync>;

/// A configured hook bound to the workload it runs for.
pub(crate) struct ArmedHook {
    pub name: String,
    pub description: String,
    pub trigger: TriggerConfig,
    pub action: HookAction,
}

enum Launched {
    Running {
        hook: String,
        description: String,
        triggered_by: HookTrigger,
        handle: JoinHandle<HookRunResult>,
    },
    Finished(HookRunResult),
}

/// Starts hooks when their trigger fires and collects their results.
///
/// Every run gets its own thread so a slow hook never holds up result collection.
#[derive(Default)]
pub(crate) struct HookExecutor {
    hooks: Vec<ArmedHook>,
    launched: Vec<Launched>,
}

impl HookExecutor {
    pub fn new(hooks: Vec<ArmedHook>) -> Self {
        Self {
            hooks,
            launched: Vec::new(),
        }
    }

    pub fn has_time_triggers(&self) -> bool {
        self.hooks
            .iter()
            .any(|hook| hook.trigger.unit() == TriggerUnit::Time)
    }

    pub fn on_event(&mut self, unit: TriggerUnit, value: u64) {
        for hook in &self.hooks {
            if hook.trigger.unit() != unit || !hook.trigger.fires_at(value) {
                continue;
            }

            log::info!(
                "Hook {} triggered by {}={value}",
                hook.name,
                unit.as_str()
            );
            let triggered_by = HookTrigger {
                unit: unit.as_str().to_string(),
                value,
            };

            let name = hook.name.clone();
            let description = hook.description.clone();
            let action = hook.action.clone();
            let thread_trigger = triggered_by.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("hook-{}", hook.name))
                .spawn(move || run_hook(name, description, thread_trigger, action));

            self.launched.push(match spawned {
                Ok(handle) => Launched::Running {
                    hook: hook.name.clone(),
                    description: hook.description.clone(),
                    triggered_by,
                    handle,
                },
                Err(e) => {
                    let now = unix_now();
                    Launched::Finished(failed_result(
                        hook.name.clone(),
                        hook.description.clone(),
                        triggered_by,
                        now,
                        ErrorInfo::new("HookStartError", e.to_string(), format!("{e:?}")),
                    ))
                }
            });
        }
    }

    /// Wait for every started hook and return their results in trigger order.
    pub fn results(self) -> Vec<HookRunResult> {
        self.launched
            .into_iter()
            .map(|launched| match launched {
                Launched::Finished(result) => result,
                Launched::Running {
                    hook,
                    description,
                    triggered_by,
                    handle,
                } => handle.join().unwrap_or_else(|_| {
                    let msg = "hook thread panicked".to_string();
                    failed_result(
                        hook,
                        description,
                        triggered_by,
                        unix_now(),
                        ErrorInfo::new("Panic", msg.clone(), msg),
                    )
                }),
            })
            .collect()
    }
}

fn run_hook(
    hook: String,
    description: String,
    triggered_by: HookTrigger,
    action: HookAction,
) -> HookRunResult {
    let started_at = unix_now();
    let error = capture_error(catch_unwind(AssertUnwindSafe(|| action())), "hook panicked");
    let finished_at = unix_now();

    match &error {
        None => log::info!("Hook {hook} finished"),
        Some(e) => log::error!("Hook {hook} failed: {}: {}", e.etype, e.msg),
    }

    HookRunResult {
        hook,
        description,
        triggered_by,
        status: if error.is_none() {
            HookStatus::Success
        } else {
            HookStatus::Failed
        },
        started_at,
        finished_at,
        error,
    }
}

fn failed_result(
    hook: String,
    description: String,
    triggered_by: HookTrigger,
    at: f64,
    error: ErrorInfo,
) -> HookRunResult {
    HookRunResult {
        hook,
        description,
        triggered_by,
        status: HookStatus::Failed,
        started_at: at,
        finished_at: at,
        error: Some(error),
    }
}

/// Send a [ConsumerMessage::Tick] for every whole second since the start, beginning with 0, until
/// `stop` is set or the consumer is gone.
pub(crate) fn start_ticker(
    sender: UnboundedSender<ConsumerMessage>,
    stop: Arc<AtomicBool>,
) -> anyhow::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("hook-ticker".to_string())
        .spawn(move || {
            let started = Instant::now();
            let mut seconds = 0u64;
            while !stop.load(Ordering::Relaxed) {
                if sender.send(ConsumerMessage::Tick(seconds)).is_err() {
                    break;
                }
                seconds += 1;

                let next = started + Duration::from_secs(seconds);
                while !stop.load(Ordering::Relaxed) {
                    let now = Instant::now();
                    if now >= next {
                        break;
                    }
                    std::thread::sleep((next - now).min(Duration::from_millis(50)));
                }
            }
        })
        .context("Failed to start hook ticker")
}
