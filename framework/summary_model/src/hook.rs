use serde::{Deserialize, Serialize};

use crate::iteration::ErrorInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookStatus {
    Success,
    Failed,
}

/// The event that started a hook: `unit` is `iteration` or `time`, and `value` is the number of
/// finished iterations or the seconds since the load started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookTrigger {
    pub unit: String,
    pub value: u64,
}

/// One run of a workload hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookRunResult {
    pub hook: String,
    pub description: String,
    pub triggered_by: HookTrigger,
    pub status: HookStatus,
    /// Unix timestamps in seconds
    pub started_at: f64,
    pub finished_at: f64,
    pub error: Option<ErrorInfo>,
}

impl HookRunResult {
    pub fn is_success(&self) -> bool {
        self.status == HookStatus::Success
    }
}
