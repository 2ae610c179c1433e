use std::fmt::Display;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// One status a resource moves to, `after_s` seconds after the operation started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineStep {
    pub after_s: f64,
    pub status: String,
}

/// The statuses an operation moves a resource through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timeline(pub Vec<TimelineStep>);

impl Timeline {
    pub fn new<S: Into<String>>(steps: impl IntoIterator<Item = (f64, S)>) -> Self {
        Timeline(
            steps
                .into_iter()
                .map(|(after_s, status)| TimelineStep {
                    after_s,
                    status: status.into(),
                })
                .collect(),
        )
    }

    /// Immediately end in `status`.
    pub fn instant(status: &str) -> Self {
        Timeline::new([(0.0, status)])
    }

    pub fn final_status(&self) -> Option<&str> {
        self.0.last().map(|s| s.status.as_str())
    }
}

/// The API operations that faults can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    CreateStack,
    DeleteStack,
    GetStack,
    BootServer,
    DeleteServer,
    RebootServer,
    StopServer,
    StartServer,
    GetServer,
    CreateUser,
}

impl Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Operation::CreateStack => "create_stack",
            Operation::DeleteStack => "delete_stack",
            Operation::GetStack => "get_stack",
            Operation::BootServer => "boot_server",
            Operation::DeleteServer => "delete_server",
            Operation::RebootServer => "reboot_server",
            Operation::StopServer => "stop_server",
            Operation::StartServer => "start_server",
            Operation::GetServer => "get_server",
            Operation::CreateUser => "create_user",
        };
        f.write_str(name)
    }
}

/// Something going wrong with the next call of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fault {
    /// The operation is accepted but the resource ends in `status`, reporting `fault`.
    EndIn { status: String, fault: String },
    /// The resource never leaves the first status of the operation's timeline.
    Stuck,
    /// The API call itself fails.
    ApiError(String),
}

/// A fault and how many calls of its operation it applies to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultSpec {
    pub operation: Operation,
    pub fault: Fault,
    #[serde(default = "one")]
    pub times: usize,
}

fn one() -> usize {
    1
}

/// Status history of one resource, as points in time at which a status takes effect.
#[derive(Debug, Clone, Default)]
pub(crate) struct History {
    changes: Vec<(Instant, String)>,
    fault: Option<String>,
}

impl History {
    /// Schedule the steps of `timeline` from `now`, as modified by `fault`.
    pub(crate) fn schedule(&mut self, now: Instant, timeline: &Timeline, fault: Option<&Fault>) {
        // Anything scheduled but not reached yet is superseded by the new operation.
        self.changes.retain(|(at, _)| *at <= now);
        self.fault = None;

        let steps = timeline.0.as_slice();
        let at = |step: &TimelineStep| now + Duration::from_secs_f64(step.after_s.max(0.0));

        match fault {
            None | Some(Fault::ApiError(_)) => {
                self.changes
                    .extend(steps.iter().map(|s| (at(s), s.status.clone())));
            }
            Some(Fault::Stuck) => {
                if let Some(first) = steps.first() {
                    self.changes.push((at(first), first.status.clone()));
                }
            }
            Some(Fault::EndIn { status, fault }) => {
                if let Some((last, rest)) = steps.split_last() {
                    self.changes
                        .extend(rest.iter().map(|s| (at(s), s.status.clone())));
                    self.changes.push((at(last), status.clone()));
                } else {
                    self.changes.push((now, status.clone()));
                }
                self.fault = Some(fault.clone());
            }
        }
    }

    pub(crate) fn status_at(&self, now: Instant) -> Option<&str> {
        self.changes
            .iter()
            .rev()
            .find(|(at, _)| *at <= now)
            .map(|(_, status)| status.as_str())
    }

    pub(crate) fn fault(&self) -> Option<&str> {
        self.fault.as_deref()
    }
}
