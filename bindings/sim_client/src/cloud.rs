use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use cloudbench_core::prelude::{Clock, ConfigurationError, SystemClock};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::compute::{ComputeClient, ServerRecord};
use crate::error::{SimApiError, SimResult};
use crate::identity::{IdentityClient, ProjectRecord, UserRecord};
use crate::orchestration::{OrchestrationClient, StackRecord};
use crate::timeline::{Fault, FaultSpec, Operation, Timeline};

pub const ORCHESTRATION: &str = "orchestration";
pub const COMPUTE: &str = "compute";
pub const IDENTITY: &str = "identity";

/// How long operations take and which of them fail.
///
/// Every field has a default, so an empty mapping is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimCloudConfig {
    pub stack_create: Timeline,
    pub stack_delete: Timeline,
    pub server_boot: Timeline,
    pub server_delete: Timeline,
    pub server_reboot: Timeline,
    pub server_stop: Timeline,
    pub server_start: Timeline,
    /// Services listed in the catalog, clients for anything else can't be created
    pub services: BTreeSet<String>,
    pub faults: Vec<FaultSpec>,
}

impl Default for SimCloudConfig {
    fn default() -> Self {
        Self {
            stack_create: Timeline::new([(0.0, "CREATE_IN_PROGRESS"), (2.0, "CREATE_COMPLETE")]),
            stack_delete: Timeline::new([(0.0, "DELETE_IN_PROGRESS"), (1.0, "DELETE_COMPLETE")]),
            server_boot: Timeline::new([(0.0, "BUILD"), (1.5, "ACTIVE")]),
            server_delete: Timeline::new([(0.0, "DELETING"), (1.0, "DELETED")]),
            server_reboot: Timeline::new([(0.0, "REBOOT"), (1.0, "ACTIVE")]),
            server_stop: Timeline::new([(0.0, "POWERING_OFF"), (0.5, "SHUTOFF")]),
            server_start: Timeline::new([(0.0, "POWERING_ON"), (0.5, "ACTIVE")]),
            services: [ORCHESTRATION, COMPUTE, IDENTITY]
                .into_iter()
                .map(String::from)
                .collect(),
            faults: Vec::new(),
        }
    }
}

impl SimCloudConfig {
    pub fn from_value(value: &serde_json::Value) -> Result<Self, ConfigurationError> {
        let config: SimCloudConfig = serde_json::from_value(value.clone())
            .map_err(|e| ConfigurationError(format!("invalid sim_cloud configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let timelines = [
            ("stack_create", &self.stack_create),
            ("stack_delete", &self.stack_delete),
            ("server_boot", &self.server_boot),
            ("server_delete", &self.server_delete),
            ("server_reboot", &self.server_reboot),
            ("server_stop", &self.server_stop),
            ("server_start", &self.server_start),
        ];
        for (name, timeline) in timelines {
            if timeline.0.is_empty() {
                return Err(ConfigurationError(format!("timeline {name} has no steps")));
            }
            if let Some(step) = timeline
                .0
                .iter()
                .find(|s| !s.after_s.is_finite() || s.after_s < 0.0)
            {
                return Err(ConfigurationError(format!(
                    "timeline {name} has an invalid offset {}",
                    step.after_s
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Account {
    pub(crate) user_id: String,
    pub(crate) password: String,
    pub(crate) project_id: String,
    pub(crate) is_admin: bool,
}

/// An authenticated identity, scoped to one project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub username: String,
    pub user_id: String,
    pub project_id: String,
    pub is_admin: bool,
}

#[derive(Debug, Default)]
pub(crate) struct CloudState {
    pub(crate) stacks: BTreeMap<String, StackRecord>,
    pub(crate) servers: BTreeMap<String, ServerRecord>,
    pub(crate) projects: BTreeMap<String, ProjectRecord>,
    pub(crate) users: BTreeMap<String, UserRecord>,
    /// Login name to account
    pub(crate) accounts: HashMap<String, Account>,
    faults: HashMap<Operation, VecDeque<Fault>>,
    next_id: u64,
}

impl CloudState {
    pub(crate) fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:06}", self.next_id)
    }

    /// Take the next scheduled fault for `operation`. An API error fails the call right away.
    pub(crate) fn take_fault(&mut self, operation: Operation) -> SimResult<Option<Fault>> {
        let fault = self
            .faults
            .get_mut(&operation)
            .and_then(|queue| queue.pop_front());

        if let Some(fault) = &fault {
            log::debug!("Injecting {fault:?} into {operation}");
        }

        match fault {
            Some(Fault::ApiError(message)) => Err(SimApiError::Injected {
                operation: operation.to_string(),
                message,
            }),
            fault => Ok(fault),
        }
    }
}

/// Shared handle to one simulated cloud. Clones see the same resources.
///
/// Resources move through the configured timelines as the clock advances, so polling them shows
/// the same eventual consistency as a real cloud API.
#[derive(Debug, Clone)]
pub struct SimCloud {
    state: Arc<Mutex<CloudState>>,
    config: Arc<SimCloudConfig>,
    clock: Arc<dyn Clock>,
}

impl Default for SimCloud {
    fn default() -> Self {
        Self::new(SimCloudConfig::default(), Arc::new(SystemClock::new()))
    }
}

impl SimCloud {
    pub fn new(config: SimCloudConfig, clock: Arc<dyn Clock>) -> Self {
        let mut state = CloudState::default();
        for spec in &config.faults {
            let queue = state.faults.entry(spec.operation).or_default();
            queue.extend(std::iter::repeat(spec.fault.clone()).take(spec.times));
        }

        Self {
            state: Arc::new(Mutex::new(state)),
            config: Arc::new(config),
            clock,
        }
    }

    pub fn config(&self) -> &SimCloudConfig {
        &self.config
    }

    pub(crate) fn now(&self) -> Instant {
        self.clock.now()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CloudState> {
        self.state.lock()
    }

    /// Schedule `fault` for the next call of `operation`, after any already scheduled.
    pub fn inject(&self, operation: Operation, fault: Fault) {
        self.lock()
            .faults
            .entry(operation)
            .or_default()
            .push_back(fault);
    }

    /// Register an admin account in a new `admin` project.
    pub fn add_admin(&self, username: &str, password: &str) -> Session {
        self.add_account(username, password, "admin", true)
    }

    /// Register a regular account, creating its project if there is none with that name.
    pub fn add_user(&self, username: &str, password: &str, project: &str) -> Session {
        self.add_account(username, password, project, false)
    }

    fn add_account(&self, username: &str, password: &str, project: &str, is_admin: bool) -> Session {
        let mut state = self.lock();

        let project_id = match state.projects.values().find(|p| p.name == project) {
            Some(existing) => existing.id.clone(),
            None => {
                let id = state.next_id("prj");
                state.projects.insert(
                    id.clone(),
                    ProjectRecord {
                        id: id.clone(),
                        name: project.to_string(),
                    },
                );
                id
            }
        };

        let user_id = state.next_id("usr");
        state.users.insert(
            user_id.clone(),
            UserRecord {
                id: user_id.clone(),
                name: username.to_string(),
                project_id: project_id.clone(),
            },
        );
        state.accounts.insert(
            username.to_string(),
            Account {
                user_id: user_id.clone(),
                password: password.to_string(),
                project_id: project_id.clone(),
                is_admin,
            },
        );

        Session {
            username: username.to_string(),
            user_id,
            project_id,
            is_admin,
        }
    }

    pub fn login(&self, username: &str, password: &str) -> SimResult<Session> {
        let state = self.lock();
        match state.accounts.get(username) {
            Some(account) if account.password == password => Ok(Session {
                username: username.to_string(),
                user_id: account.user_id.clone(),
                project_id: account.project_id.clone(),
                is_admin: account.is_admin,
            }),
            _ => Err(SimApiError::Unauthorized(username.to_string())),
        }
    }

    pub fn has_service(&self, service: &str) -> bool {
        self.config.services.contains(service)
    }

    /// Authenticate and create clients for every service in the catalog.
    pub fn connect(&self, username: &str, password: &str) -> SimResult<SimClients> {
        let session = self.login(username, password)?;
        Ok(SimClients {
            cloud: self.clone(),
            session,
        })
    }

    /// Number of stacks and servers that have not been fully deleted.
    pub fn live_resources(&self) -> usize {
        let now = self.now();
        let state = self.lock();
        state.stacks.values().filter(|s| !s.is_deleted(now)).count()
            + state.servers.values().filter(|s| !s.is_deleted(now)).count()
    }
}

/// Clients for one session.
#[derive(Debug, Clone)]
pub struct SimClients {
    cloud: SimCloud,
    session: Session,
}

impl SimClients {
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn orchestration(&self) -> SimResult<OrchestrationClient> {
        self.require(ORCHESTRATION)?;
        Ok(OrchestrationClient::new(self.cloud.clone(), self.session.clone()))
    }

    pub fn compute(&self) -> SimResult<ComputeClient> {
        self.require(COMPUTE)?;
        Ok(ComputeClient::new(self.cloud.clone(), self.session.clone()))
    }

    pub fn identity(&self) -> SimResult<IdentityClient> {
        self.require(IDENTITY)?;
        if !self.session.is_admin {
            return Err(SimApiError::Forbidden("the identity API".to_string()));
        }
        Ok(IdentityClient::new(self.cloud.clone(), self.session.clone()))
    }

    fn require(&self, service: &str) -> SimResult<()> {
        if self.cloud.has_service(service) {
            Ok(())
        } else {
            Err(SimApiError::ServiceUnavailable(service.to_string()))
        }
    }
}
