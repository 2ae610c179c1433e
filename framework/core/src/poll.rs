//! Polling of asynchronous cloud resources until they reach a desired status.
//!
//! Cloud APIs accept a request and then converge in the background, so every scenario utility that
//! creates, changes or deletes something ends with a call into this module. The [Poller] fetches
//! the latest representation of the resource, compares its status against the ready and failure
//! sets and sleeps between checks until the deadline passes.

use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::{Clock, SystemClock};
use crate::error::{
    AbortedError, ConfigurationError, GetResourceFailure, ResourceDescription, ResourceErrorStatus,
    ResourceNotFound, TimeoutError,
};

pub const DEFAULT_STATUS_ATTR: &str = "status";
pub const DEFAULT_ID_ATTR: &str = "id";
pub const DEFAULT_ERROR_STATUSES: &[&str] = &["ERROR"];

const DELETED_STATUSES: &[&str] = &["DELETED", "DELETE_COMPLETE"];

/// Anything with a type, a name and string attributes that a status can be read from.
pub trait Resource: Debug {
    fn resource_type(&self) -> String;

    fn attribute(&self, attr: &str) -> Option<String>;

    fn name(&self) -> Option<String> {
        self.attribute("name")
    }

    fn fault(&self) -> Option<String> {
        self.attribute("fault")
    }
}

impl Resource for Value {
    fn resource_type(&self) -> String {
        self.get("resource_type")
            .and_then(Value::as_str)
            .unwrap_or("Resource")
            .to_string()
    }

    fn attribute(&self, attr: &str) -> Option<String> {
        match self.get(attr)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

/// Upper-cased status of a resource, looked up as `stack_status`, then `state`, then `status_attr`.
pub fn get_status<R: Resource + ?Sized>(resource: &R, status_attr: &str) -> String {
    ["stack_status", "state", status_attr]
        .into_iter()
        .find_map(|attr| resource.attribute(attr))
        .map(|status| status.to_uppercase())
        .unwrap_or_else(|| "NONE".to_string())
}

pub fn describe<R: Resource + ?Sized>(resource: &R, id_attr: &str) -> ResourceDescription {
    ResourceDescription {
        resource_type: resource.resource_type(),
        name: resource.name().unwrap_or_else(|| "<unnamed>".to_string()),
        id: resource
            .attribute(id_attr)
            .unwrap_or_else(|| "<unknown>".to_string()),
    }
}

/// Default timing for polls, usually loaded from the `[wait]` section of the bench config.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitConfig {
    pub timeout_s: f64,
    pub check_interval_s: f64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            timeout_s: 60.0,
            check_interval_s: 1.0,
        }
    }
}

impl WaitConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_s.max(0.0))
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.check_interval_s.max(0.0))
    }
}

/// What a single `wait_for` call is waiting for.
#[derive(Debug, Clone)]
pub struct WaitSpec {
    ready_statuses: BTreeSet<String>,
    failure_statuses: BTreeSet<String>,
    status_attr: String,
    id_attr: String,
    check_deletion: bool,
    timeout: Option<Duration>,
    check_interval: Option<Duration>,
}

fn upper_set<I, S>(statuses: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    statuses
        .into_iter()
        .map(|s| s.as_ref().to_uppercase())
        .collect()
}

impl WaitSpec {
    pub fn ready<I, S>(statuses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            ready_statuses: upper_set(statuses),
            failure_statuses: BTreeSet::new(),
            status_attr: DEFAULT_STATUS_ATTR.to_string(),
            id_attr: DEFAULT_ID_ATTR.to_string(),
            check_deletion: false,
            timeout: None,
            check_interval: None,
        }
    }

    /// Wait for the resource to disappear.
    pub fn deletion() -> Self {
        Self::ready(Vec::<String>::new()).check_deletion(true)
    }

    pub fn failure<I, S>(mut self, statuses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.failure_statuses = upper_set(statuses);
        self
    }

    pub fn status_attr(mut self, attr: &str) -> Self {
        self.status_attr = attr.to_string();
        self
    }

    pub fn id_attr(mut self, attr: &str) -> Self {
        self.id_attr = attr.to_string();
        self
    }

    /// Treat the resource disappearing as success.
    pub fn check_deletion(mut self, check_deletion: bool) -> Self {
        self.check_deletion = check_deletion;
        self
    }

    /// Override the poller's default timeout for this wait.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn check_interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = Some(check_interval);
        self
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.ready_statuses.is_empty() && !self.check_deletion {
            return Err(ConfigurationError(
                "ready statuses must not be empty unless waiting for deletion".to_string(),
            ));
        }

        let overlap = self
            .ready_statuses
            .intersection(&self.failure_statuses)
            .collect::<Vec<_>>();
        if !overlap.is_empty() {
            return Err(ConfigurationError(format!(
                "statuses {} are in both the ready and failure lists",
                overlap.iter().join(", ")
            )));
        }

        Ok(())
    }

    fn desired_status(&self) -> String {
        if self.ready_statuses.is_empty() {
            "deleted".to_string()
        } else {
            self.ready_statuses.iter().join(" or ")
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    ErrorStatus(#[from] ResourceErrorStatus),
    #[error(transparent)]
    NotFound(#[from] ResourceNotFound),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    #[error(transparent)]
    Aborted(#[from] AbortedError),
    /// Fetching the latest state of the resource failed for another reason.
    #[error("{0:#}")]
    Update(anyhow::Error),
}

impl PollError {
    pub fn kind(&self) -> &'static str {
        match self {
            PollError::Configuration(_) => "ConfigurationError",
            PollError::ErrorStatus(_) => "ResourceErrorStatus",
            PollError::NotFound(_) => "ResourceNotFound",
            PollError::Timeout(_) => "TimeoutError",
            PollError::Aborted(_) => "AbortedError",
            PollError::Update(err) => crate::error::error_kind(err),
        }
    }
}

enum Check {
    Ready,
    Failed(String),
    Pending,
}

enum Fetched<R> {
    Resource(R),
    Gone(ResourceNotFound),
}

fn fetch<R, F>(resource: &R, update_resource: &mut F, id_attr: &str) -> Result<Fetched<R>, PollError>
where
    R: Resource,
    F: FnMut(&R) -> anyhow::Result<R>,
{
    let err = match update_resource(resource) {
        Ok(updated) => return Ok(Fetched::Resource(updated)),
        Err(err) => err,
    };

    let err = match err.downcast::<ResourceNotFound>() {
        Ok(not_found) => return Ok(Fetched::Gone(not_found)),
        Err(err) => err,
    };
    if err.chain().any(|cause| cause.is::<ResourceNotFound>()) {
        return Ok(Fetched::Gone(ResourceNotFound {
            resource: describe(resource, id_attr),
        }));
    }

    let err = match err.downcast::<ResourceErrorStatus>() {
        Ok(status) => return Err(status.into()),
        Err(err) => err,
    };
    match err.downcast::<AbortedError>() {
        Ok(aborted) => Err(aborted.into()),
        Err(err) => Err(PollError::Update(err)),
    }
}

/// Waits on resources using a shared clock and default timing.
#[derive(Debug, Clone)]
pub struct Poller {
    config: WaitConfig,
    clock: Arc<dyn Clock>,
    deadline: Option<Instant>,
}

impl Default for Poller {
    fn default() -> Self {
        Self::new(WaitConfig::default(), Arc::new(SystemClock::new()))
    }
}

impl Poller {
    pub fn new(config: WaitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            deadline: None,
        }
    }

    /// Clamp every wait to an outer deadline, such as the end of an iteration's time budget.
    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn config(&self) -> &WaitConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Poll until the resource reaches one of the ready statuses.
    ///
    /// Returns `Ok(None)` only when `check_deletion` is set and the resource has gone.
    pub fn wait_for<R, F>(
        &self,
        resource: R,
        update_resource: F,
        spec: &WaitSpec,
    ) -> Result<Option<R>, PollError>
    where
        R: Resource,
        F: FnMut(&R) -> anyhow::Result<R>,
    {
        spec.validate()?;

        let plan = Plan {
            timeout: spec.timeout.unwrap_or_else(|| self.config.timeout()),
            check_interval: spec
                .check_interval
                .unwrap_or_else(|| self.config.check_interval()),
            status_attr: &spec.status_attr,
            id_attr: &spec.id_attr,
            check_deletion: spec.check_deletion,
            desired_status: spec.desired_status(),
        };

        self.run(resource, update_resource, &plan, |_, status| {
            if spec.ready_statuses.contains(status) {
                Check::Ready
            } else if spec.failure_statuses.contains(status) {
                Check::Failed(format!(
                    "status is one of the failure statuses {}",
                    spec.failure_statuses.iter().join(", ")
                ))
            } else {
                Check::Pending
            }
        })
    }

    /// As [Poller::wait_for] but the resource disappearing is an error.
    pub fn wait_for_status<R, F>(
        &self,
        resource: R,
        update_resource: F,
        spec: &WaitSpec,
    ) -> Result<R, PollError>
    where
        R: Resource,
        F: FnMut(&R) -> anyhow::Result<R>,
    {
        let description = describe(&resource, &spec.id_attr);
        let spec = spec.clone().check_deletion(false);
        self.wait_for(resource, update_resource, &spec)?
            .ok_or(PollError::NotFound(ResourceNotFound {
                resource: description,
            }))
    }

    /// Poll until fetching the resource reports that it no longer exists.
    pub fn wait_for_delete<R, F>(&self, resource: R, update_resource: F) -> Result<(), PollError>
    where
        R: Resource,
        F: FnMut(&R) -> anyhow::Result<R>,
    {
        self.wait_for(resource, update_resource, &WaitSpec::deletion())
            .map(|_| ())
    }

    /// Poll until `is_ready` holds for the latest representation of the resource.
    pub fn wait_is_ready<R, F, P>(
        &self,
        resource: R,
        update_resource: F,
        is_ready: P,
        desired_status: &str,
    ) -> Result<R, PollError>
    where
        R: Resource,
        F: FnMut(&R) -> anyhow::Result<R>,
        P: Fn(&R) -> bool,
    {
        let description = describe(&resource, DEFAULT_ID_ATTR);
        let plan = Plan {
            timeout: self.config.timeout(),
            check_interval: self.config.check_interval(),
            status_attr: DEFAULT_STATUS_ATTR,
            id_attr: DEFAULT_ID_ATTR,
            check_deletion: false,
            desired_status: desired_status.to_string(),
        };

        self.run(resource, update_resource, &plan, |resource, _| {
            if is_ready(resource) {
                Check::Ready
            } else {
                Check::Pending
            }
        })?
        .ok_or(PollError::NotFound(ResourceNotFound {
            resource: description,
        }))
    }

    fn run<R, F, C>(
        &self,
        mut resource: R,
        mut update_resource: F,
        plan: &Plan<'_>,
        check: C,
    ) -> Result<Option<R>, PollError>
    where
        R: Resource,
        F: FnMut(&R) -> anyhow::Result<R>,
        C: Fn(&R, &str) -> Check,
    {
        let start = self.clock.now();
        let deadline = match self.deadline {
            Some(outer) => (start + plan.timeout).min(outer),
            None => start + plan.timeout,
        };

        let mut latest_status = get_status(&resource, plan.status_attr);
        let mut latest_status_update = start;

        loop {
            resource = match fetch(&resource, &mut update_resource, plan.id_attr)? {
                Fetched::Resource(updated) => updated,
                Fetched::Gone(not_found) => {
                    if plan.check_deletion {
                        log::debug!("{} has been deleted", not_found.resource);
                        return Ok(None);
                    }
                    return Err(not_found.into());
                }
            };

            let status = get_status(&resource, plan.status_attr);
            let now = self.clock.now();
            if status != latest_status {
                log::debug!(
                    "Waiting for {} to become {}, status changed {} => {} after {:.2}s",
                    describe(&resource, plan.id_attr),
                    plan.desired_status,
                    latest_status,
                    status,
                    (now - latest_status_update).as_secs_f64()
                );
                latest_status = status.clone();
                latest_status_update = now;
            }

            match check(&resource, &status) {
                Check::Ready => return Ok(Some(resource)),
                Check::Failed(fault) => {
                    return Err(ResourceErrorStatus {
                        resource: describe(&resource, plan.id_attr),
                        status,
                        fault,
                    }
                    .into())
                }
                Check::Pending => {}
            }

            if now >= deadline {
                return Err(TimeoutError {
                    resource: describe(&resource, plan.id_attr),
                    desired_status: plan.desired_status.clone(),
                    resource_status: status,
                }
                .into());
            }

            // Never sleep past the deadline, the final check happens on it.
            self.clock.sleep(plan.check_interval.min(deadline - now))?;
        }
    }
}

struct Plan<'a> {
    timeout: Duration,
    check_interval: Duration,
    status_attr: &'a str,
    id_attr: &'a str,
    check_deletion: bool,
    desired_status: String,
}

/// [Poller::wait_for] on the system clock with default timing.
pub fn wait_for<R, F>(resource: R, update_resource: F, spec: &WaitSpec) -> Result<Option<R>, PollError>
where
    R: Resource,
    F: FnMut(&R) -> anyhow::Result<R>,
{
    Poller::default().wait_for(resource, update_resource, spec)
}

/// [Poller::wait_for_delete] on the system clock with default timing.
pub fn wait_for_delete<R, F>(resource: R, update_resource: F) -> Result<(), PollError>
where
    R: Resource,
    F: FnMut(&R) -> anyhow::Result<R>,
{
    Poller::default().wait_for_delete(resource, update_resource)
}

/// A client-side collection of resources that can be looked up by id.
pub trait ResourceManager {
    type Resource: Resource;

    /// Fetch the current representation, `None` if the resource does not exist.
    fn get(&self, id: &str) -> anyhow::Result<Option<Self::Resource>>;
}

/// Build an `update_resource` function that re-fetches a resource from its manager.
///
/// A missing or deleted resource is reported as [ResourceNotFound], a status listed in
/// `error_statuses` as [ResourceErrorStatus] and any other failure as [GetResourceFailure].
pub fn get_from_manager<'a, M>(
    manager: &'a M,
    error_statuses: &[&str],
) -> impl FnMut(&M::Resource) -> anyhow::Result<M::Resource> + 'a
where
    M: ResourceManager,
{
    let error_statuses = upper_set(error_statuses);

    move |resource| {
        let description = describe(resource, DEFAULT_ID_ATTR);
        let Some(id) = resource.attribute(DEFAULT_ID_ATTR) else {
            return Err(GetResourceFailure {
                resource: description,
                reason: "resource has no id".to_string(),
            }
            .into());
        };

        let fresh = match manager.get(&id) {
            Ok(Some(fresh)) => fresh,
            Ok(None) => {
                return Err(ResourceNotFound {
                    resource: description,
                }
                .into())
            }
            Err(err) => {
                return Err(GetResourceFailure {
                    resource: description,
                    reason: format!("{err:#}"),
                }
                .into())
            }
        };

        let status = get_status(&fresh, DEFAULT_STATUS_ATTR);
        if DELETED_STATUSES.contains(&status.as_str()) {
            return Err(ResourceNotFound {
                resource: describe(&fresh, DEFAULT_ID_ATTR),
            }
            .into());
        }
        if error_statuses.contains(&status) {
            return Err(ResourceErrorStatus {
                resource: describe(&fresh, DEFAULT_ID_ATTR),
                fault: fresh.fault().unwrap_or_else(|| "no fault reported".to_string()),
                status,
            }
            .into());
        }

        Ok(fresh)
    }
}
