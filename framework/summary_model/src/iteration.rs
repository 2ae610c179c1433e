use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Why an iteration or an atomic action failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// The kind of error, such as `TimeoutError` or `Panic`
    pub etype: String,
    pub msg: String,
    /// The full error chain
    pub trace: String,
}

impl ErrorInfo {
    pub fn new(etype: impl Into<String>, msg: impl Into<String>, trace: impl Into<String>) -> Self {
        Self {
            etype: etype.into(),
            msg: msg.into(),
            trace: trace.into(),
        }
    }
}

/// Timing of one named sub-operation inside an iteration.
///
/// Times are Unix timestamps in seconds, durations are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomicActionRecord {
    pub name: String,
    pub started_at: f64,
    pub finished_at: f64,
    pub duration: f64,
    /// Nesting depth, 0 for actions started outside any other action
    pub depth: usize,
    pub error: Option<ErrorInfo>,
}

impl AtomicActionRecord {
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Additional output a scenario produced during an iteration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioOutput {
    pub data: Map<String, Value>,
    pub errors: String,
}

impl ScenarioOutput {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.errors.is_empty()
    }
}

/// The outcome of a single scenario invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationResult {
    /// 1-based iteration number
    pub iteration: usize,
    /// Unix timestamp in seconds at which the iteration started
    pub timestamp: f64,
    /// Wall time of the iteration excluding idle time, in seconds
    pub duration: f64,
    /// Time spent in deliberate sleeps outside of any atomic action, in seconds
    pub idle_duration: f64,
    pub error: Option<ErrorInfo>,
    pub atomic_actions: Vec<AtomicActionRecord>,
    pub output: ScenarioOutput,
}

impl IterationResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Sum of the durations of the actions that were not nested in another action.
    ///
    /// This is at most `duration`: top level actions do not overlap, and idle time is only
    /// counted outside of them.
    pub fn top_level_action_time(&self) -> f64 {
        self.atomic_actions
            .iter()
            .filter(|a| a.depth == 0)
            .map(|a| a.duration)
            .sum()
    }
}
