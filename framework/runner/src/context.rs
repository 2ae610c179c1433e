use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::bail;
use cloudbench_core::prelude::{
    AbortHandle, AbortListener, Clock, InvalidArgument, Poller, ResourceNameGenerator,
};
use cloudbench_instruments::{AtomicActions, AtomicActionsHost};
use cloudbench_summary_model::ScenarioOutput;
use rand::Rng;
use serde_json::Value;

use crate::config::{BenchConfig, Credential};
use crate::executor::Executor;

pub trait UserValuesConstraint: Default + Debug + Send + Sync + 'static {}

/// Binds a runner context value to the clients of a cloud.
pub trait ServiceClients: UserValuesConstraint {
    type Client;

    /// Create a client for `service` authenticated as `credential`.
    fn client(&self, credential: &Credential, service: &str) -> anyhow::Result<Self::Client>;
}

/// State shared by every iteration of one workload.
///
/// Contexts set this up before the first iteration and tear it down after the last one.
#[derive(Debug)]
pub struct RunnerContext<RV: UserValuesConstraint> {
    executor: Arc<Executor>,
    abort: AbortHandle,
    clock: Arc<dyn Clock>,
    task_id: String,
    config: Arc<BenchConfig>,
    name_generator: ResourceNameGenerator,
    users: Vec<Credential>,
    value: RV,
}

impl<RV: UserValuesConstraint> RunnerContext<RV> {
    pub(crate) fn new(
        executor: Arc<Executor>,
        abort: AbortHandle,
        clock: Arc<dyn Clock>,
        task_id: String,
        config: Arc<BenchConfig>,
        name_generator: ResourceNameGenerator,
    ) -> Self {
        let users = config.deployment.users.clone();
        Self {
            executor,
            abort,
            clock,
            task_id,
            config,
            name_generator,
            users,
            value: Default::default(),
        }
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    pub fn admin(&self) -> Option<&Credential> {
        self.config.deployment.admin.as_ref()
    }

    pub fn users(&self) -> &[Credential] {
        &self.users
    }

    /// Replace the users that iterations run as. Used by contexts that create users.
    pub fn set_users(&mut self, users: Vec<Credential>) {
        self.users = users;
    }

    pub fn generate_random_name(&self) -> String {
        self.name_generator.generate(&self.task_id)
    }

    pub fn name_generator(&self) -> &ResourceNameGenerator {
        &self.name_generator
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// A poller using the configured wait timings, interruptible by a hard abort.
    pub fn poller(&self) -> Poller {
        Poller::new(self.config.wait, self.clock.clone())
    }

    pub fn abort_listener(&self) -> AbortListener {
        self.abort.new_listener()
    }

    /// Stop scheduling new iterations of every remaining workload.
    pub fn force_stop_task(&self) {
        self.abort.soft_abort();
    }

    pub fn get_mut(&mut self) -> &mut RV {
        &mut self.value
    }

    pub fn get(&self) -> &RV {
        &self.value
    }
}

/// Everything one scenario invocation has access to. Created fresh for every iteration.
pub struct ScenarioContext<RV: UserValuesConstraint> {
    runner_context: Arc<RunnerContext<RV>>,
    iteration: usize,
    user: Option<Credential>,
    atomic_actions: AtomicActions,
    poller: Poller,
    deadline: Option<Instant>,
    idle: Duration,
    output: ScenarioOutput,
    abort_listener: AbortListener,
}

impl<RV: UserValuesConstraint> Debug for ScenarioContext<RV> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScenarioContext")
            .field("iteration", &self.iteration)
            .field("user", &self.user.as_ref().map(|u| &u.username))
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl<RV: UserValuesConstraint> ScenarioContext<RV> {
    pub(crate) fn new(
        runner_context: Arc<RunnerContext<RV>>,
        iteration: usize,
        deadline: Option<Instant>,
    ) -> Self {
        let users = runner_context.users();
        let user = (!users.is_empty()).then(|| users[(iteration - 1) % users.len()].clone());
        let poller = runner_context.poller().with_deadline(deadline);
        let abort_listener = runner_context.abort_listener();
        let atomic_actions = AtomicActions::with_clock(runner_context.clock().clone());

        Self {
            runner_context,
            iteration,
            user,
            atomic_actions,
            poller,
            deadline,
            idle: Duration::ZERO,
            output: ScenarioOutput::default(),
            abort_listener,
        }
    }

    pub fn runner_context(&self) -> &Arc<RunnerContext<RV>> {
        &self.runner_context
    }

    /// The 1-based number of this iteration.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// The user this iteration runs as, chosen round-robin over the available users.
    pub fn user(&self) -> Option<&Credential> {
        self.user.as_ref()
    }

    pub fn poller(&self) -> &Poller {
        &self.poller
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn abort_listener(&self) -> &AbortListener {
        &self.abort_listener
    }

    pub fn generate_random_name(&self) -> String {
        self.runner_context.generate_random_name()
    }

    /// Sleep a random time in `[min_s, max_s]` seconds.
    ///
    /// Outside of any atomic action the time is reported as idle and excluded from the iteration's
    /// duration. Inside an atomic action it is part of that action, and so of the iteration.
    pub fn sleep_between(&mut self, min_s: f64, max_s: f64) -> anyhow::Result<()> {
        if !(min_s >= 0.0 && min_s <= max_s && max_s.is_finite()) {
            bail!(InvalidArgument(format!(
                "sleep_between needs 0 <= min <= max, got min={min_s} max={max_s}"
            )));
        }

        let seconds = if min_s == max_s {
            min_s
        } else {
            rand::thread_rng().gen_range(min_s..=max_s)
        };
        let mut duration = Duration::try_from_secs_f64(seconds).map_err(|e| {
            InvalidArgument(format!("sleep_between cannot sleep for {seconds}s: {e}"))
        })?;

        let clock = self.runner_context.clock();
        if let Some(deadline) = self.deadline {
            duration = duration.min(deadline.saturating_duration_since(clock.now()));
        }

        let started = clock.now();
        let result = clock.sleep(duration);
        if self.atomic_actions.open_count() == 0 {
            self.idle += clock.now().saturating_duration_since(started);
        }
        result?;

        Ok(())
    }

    pub(crate) fn idle_duration(&self) -> Duration {
        self.idle
    }

    pub fn add_output(&mut self, key: &str, value: Value) {
        self.output.data.insert(key.to_string(), value);
    }

    pub fn add_output_error(&mut self, error: &str) {
        if !self.output.errors.is_empty() {
            self.output.errors.push('\n');
        }
        self.output.errors.push_str(error);
    }

    pub(crate) fn take_output(&mut self) -> ScenarioOutput {
        std::mem::take(&mut self.output)
    }

    pub fn get(&self) -> &RV {
        self.runner_context.get()
    }
}

impl<RV: ServiceClients> ScenarioContext<RV> {
    /// Client for `service` authenticated as this iteration's user.
    pub fn clients(&self, service: &str) -> anyhow::Result<RV::Client> {
        let Some(user) = &self.user else {
            bail!(InvalidArgument(format!(
                "no users are available for a '{service}' client, configure a users context or deployment users"
            )));
        };
        self.runner_context.get().client(user, service)
    }

    /// Client for `service` authenticated as the deployment admin.
    pub fn admin_clients(&self, service: &str) -> anyhow::Result<RV::Client> {
        let Some(admin) = self.runner_context.admin() else {
            bail!(InvalidArgument(format!(
                "no admin credential is configured for a '{service}' client"
            )));
        };
        self.runner_context.get().client(admin, service)
    }
}

impl<RV: UserValuesConstraint> AtomicActionsHost for ScenarioContext<RV> {
    fn atomic_actions(&self) -> &AtomicActions {
        &self.atomic_actions
    }
}
