use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use anyhow::Context as _;
use cloudbench_core::prelude::{Clock, ConfigurationError, ValidationError};
use serde_json::{Map, Value};

use crate::cli::CloudbenchCli;
use crate::config::{BenchConfig, Credential};
use crate::context::{RunnerContext, ScenarioContext, UserValuesConstraint};
use crate::task::TaskConfig;

pub type HookResult = anyhow::Result<()>;

/// The result of one scenario invocation. An error fails the iteration, not the workload.
pub type ScenarioResult = anyhow::Result<()>;

/// Scenario arguments from the task file, as a JSON mapping.
pub type ScenarioArgs = Map<String, Value>;

pub type ScenarioFn<RV> = fn(&mut ScenarioContext<RV>, &ScenarioArgs) -> ScenarioResult;
pub type ContextSetupFn<RV> = fn(&mut RunnerContext<RV>, &Value) -> HookResult;
pub type ContextCleanupFn<RV> = fn(&RunnerContext<RV>, &Value) -> HookResult;
/// A workload hook. Gets the arguments from the hook's `action` entry.
pub type WorkloadHookFn<RV> = fn(&RunnerContext<RV>, &Value) -> HookResult;
pub type HookArgsCheck = fn(&Value) -> Result<(), ValidationError>;

/// Prepares shared state before a workload's first iteration and removes it after the last one.
///
/// Contexts are set up in ascending `order` and cleaned up in the reverse order.
pub struct ContextPlugin<RV: UserValuesConstraint> {
    pub name: String,
    pub order: i32,
    pub setup: ContextSetupFn<RV>,
    pub cleanup: Option<ContextCleanupFn<RV>>,
}

impl<RV: UserValuesConstraint> ContextPlugin<RV> {
    pub fn new(name: &str, order: i32, setup: ContextSetupFn<RV>) -> Self {
        Self {
            name: name.to_string(),
            order,
            setup,
            cleanup: None,
        }
    }

    pub fn with_cleanup(mut self, cleanup: ContextCleanupFn<RV>) -> Self {
        self.cleanup = Some(cleanup);
        self
    }
}

impl<RV: UserValuesConstraint> Debug for ContextPlugin<RV> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextPlugin")
            .field("name", &self.name)
            .field("order", &self.order)
            .field("has_cleanup", &self.cleanup.is_some())
            .finish()
    }
}

/// An action that a workload's `hooks` can run while the load is going.
pub struct HookPlugin<RV: UserValuesConstraint> {
    pub name: String,
    pub run: WorkloadHookFn<RV>,
    /// Checked against the configured arguments before any workload starts
    pub check_args: Option<HookArgsCheck>,
}

impl<RV: UserValuesConstraint> HookPlugin<RV> {
    pub fn new(name: &str, run: WorkloadHookFn<RV>) -> Self {
        Self {
            name: name.to_string(),
            run,
            check_args: None,
        }
    }

    pub fn with_args_check(mut self, check: HookArgsCheck) -> Self {
        self.check_args = Some(check);
        self
    }
}

impl<RV: UserValuesConstraint> Debug for HookPlugin<RV> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookPlugin")
            .field("name", &self.name)
            .field("has_args_check", &self.check_args.is_some())
            .finish()
    }
}

/// Which identity a credential validator checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Admin,
    User,
}

pub type ArgsCheck = Arc<dyn Fn(&ScenarioArgs) -> Result<(), ValidationError> + Send + Sync>;
pub type CredentialCheck<RV> = Arc<
    dyn Fn(&RunnerContext<RV>, &Credential, &ScenarioArgs) -> Result<(), ValidationError>
        + Send
        + Sync,
>;

/// A pre-flight check for a workload.
///
/// Argument checks run before any context is set up. Credential checks run once the contexts are
/// ready, against the admin or against every user depending on their [Permission].
pub enum Validator<RV: UserValuesConstraint> {
    Args {
        name: String,
        check: ArgsCheck,
    },
    Credential {
        name: String,
        permission: Permission,
        check: CredentialCheck<RV>,
    },
}

impl<RV: UserValuesConstraint> Validator<RV> {
    pub fn args(
        name: &str,
        check: impl Fn(&ScenarioArgs) -> Result<(), ValidationError> + Send + Sync + 'static,
    ) -> Self {
        Validator::Args {
            name: name.to_string(),
            check: Arc::new(check),
        }
    }

    pub fn credential(
        name: &str,
        permission: Permission,
        check: impl Fn(&RunnerContext<RV>, &Credential, &ScenarioArgs) -> Result<(), ValidationError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Validator::Credential {
            name: name.to_string(),
            permission,
            check: Arc::new(check),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Validator::Args { name, .. } | Validator::Credential { name, .. } => name,
        }
    }
}

impl<RV: UserValuesConstraint> Debug for Validator<RV> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Validator::Args { name, .. } => f.debug_tuple("Args").field(name).finish(),
            Validator::Credential {
                name, permission, ..
            } => f
                .debug_tuple("Credential")
                .field(name)
                .field(permission)
                .finish(),
        }
    }
}

/// Fails unless every one of `names` is present in the scenario arguments.
pub fn required_args<RV: UserValuesConstraint>(names: &[&str]) -> Validator<RV> {
    let names = names.iter().map(|n| n.to_string()).collect::<Vec<_>>();
    Validator::args("required_args", move |args| {
        let missing = names
            .iter()
            .filter(|n| !args.contains_key(n.as_str()))
            .cloned()
            .collect::<Vec<_>>();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ValidationError(format!(
                "missing required arguments: {}",
                missing.join(", ")
            )))
        }
    })
}

/// Checks that argument `param` is a number within `[min, max]`.
///
/// A missing or null value passes only when `nullable` is set.
pub fn number<RV: UserValuesConstraint>(
    param: &str,
    min: Option<f64>,
    max: Option<f64>,
    integer_only: bool,
    nullable: bool,
) -> Validator<RV> {
    let param = param.to_string();
    Validator::args("number", move |args| {
        let value = match args.get(&param) {
            None | Some(Value::Null) if nullable => return Ok(()),
            None | Some(Value::Null) => {
                return Err(ValidationError(format!("'{param}' is required")))
            }
            Some(value) => value,
        };

        let Some(number) = value.as_f64() else {
            return Err(ValidationError(format!(
                "'{param}' must be a number, got {value}"
            )));
        };
        if integer_only && !(value.is_i64() || value.is_u64()) {
            return Err(ValidationError(format!(
                "'{param}' must be an integer, got {value}"
            )));
        }
        if min.is_some_and(|min| number < min) || max.is_some_and(|max| number > max) {
            return Err(ValidationError(format!(
                "'{param}' is {number}, which is outside of [{}, {}]",
                min.map_or("-inf".to_string(), |v| v.to_string()),
                max.map_or("inf".to_string(), |v| v.to_string()),
            )));
        }
        Ok(())
    })
}

/// Metadata stored next to a scenario function in the registry.
pub struct ScenarioMeta<RV: UserValuesConstraint> {
    /// The scenario needs admin credentials. Workloads fail validation when no admin is configured.
    pub admin_only: bool,
    /// Contexts that must be present once the workload's contexts and the defaults are merged.
    pub required_contexts: Vec<String>,
    /// Contexts added to the workload unless the task file configures them itself.
    pub default_contexts: Map<String, Value>,
    pub validators: Vec<Validator<RV>>,
}

impl<RV: UserValuesConstraint> Default for ScenarioMeta<RV> {
    fn default() -> Self {
        Self {
            admin_only: false,
            required_contexts: Vec::new(),
            default_contexts: Map::new(),
            validators: Vec::new(),
        }
    }
}

impl<RV: UserValuesConstraint> Debug for ScenarioMeta<RV> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScenarioMeta")
            .field("admin_only", &self.admin_only)
            .field("required_contexts", &self.required_contexts)
            .field("default_contexts", &self.default_contexts)
            .field("validators", &self.validators)
            .finish()
    }
}

impl<RV: UserValuesConstraint> ScenarioMeta<RV> {
    pub fn admin_only(mut self) -> Self {
        self.admin_only = true;
        self
    }

    pub fn require_context(mut self, name: &str) -> Self {
        self.required_contexts.push(name.to_string());
        self
    }

    pub fn default_context(mut self, name: &str, config: Value) -> Self {
        self.default_contexts.insert(name.to_string(), config);
        self
    }

    pub fn validator(mut self, validator: Validator<RV>) -> Self {
        self.validators.push(validator);
        self
    }
}

pub(crate) struct RegisteredScenario<RV: UserValuesConstraint> {
    pub(crate) meta: ScenarioMeta<RV>,
    pub(crate) scenario_fn: ScenarioFn<RV>,
}

/// The builder for a task definition.
///
/// This must be used in the binary's `main` to register the scenarios and contexts that task files
/// may refer to.
pub struct TaskDefinitionBuilder<RV: UserValuesConstraint> {
    /// The name of the binary, recommended value is `env!("CARGO_PKG_NAME")`.
    name: String,
    /// This value is initialised for you and you cannot change it.
    #[doc(hidden)]
    cli: CloudbenchCli,
    scenarios: HashMap<String, RegisteredScenario<RV>>,
    contexts: HashMap<String, ContextPlugin<RV>>,
    hooks: HashMap<String, HookPlugin<RV>>,
    task: Option<TaskConfig>,
    config: Option<BenchConfig>,
    clock: Option<Arc<dyn Clock>>,
}

pub struct TaskDefinition<RV: UserValuesConstraint> {
    pub name: String,
    pub cli: CloudbenchCli,
    pub task: TaskConfig,
    pub config: BenchConfig,
    pub(crate) scenarios: HashMap<String, RegisteredScenario<RV>>,
    pub(crate) contexts: HashMap<String, ContextPlugin<RV>>,
    pub(crate) hooks: HashMap<String, HookPlugin<RV>>,
    pub(crate) clock: Option<Arc<dyn Clock>>,
}

impl<RV: UserValuesConstraint> TaskDefinitionBuilder<RV> {
    /// Initialise a new task definition from the process's command line.
    pub fn new_with_init(name: &str) -> Self {
        Self::new(name, crate::init::init())
    }

    pub fn new(name: &str, cli: CloudbenchCli) -> Self {
        Self {
            name: name.to_string(),
            cli,
            scenarios: HashMap::new(),
            contexts: HashMap::new(),
            hooks: crate::hooks::builtin_hooks()
                .into_iter()
                .map(|hook| (hook.name.clone(), hook))
                .collect(),
            task: None,
            config: None,
            clock: None,
        }
    }

    /// Register a scenario under a `Group.name` style name.
    pub fn use_scenario(
        mut self,
        name: &str,
        meta: ScenarioMeta<RV>,
        scenario_fn: ScenarioFn<RV>,
    ) -> Self {
        if !name.contains('.') {
            panic!("Scenario name [{}] must have the form Group.name", name);
        }

        let previous = self
            .scenarios
            .insert(name.to_string(), RegisteredScenario { meta, scenario_fn });
        if previous.is_some() {
            panic!("Scenario [{}] is already defined", name);
        }

        self
    }

    pub fn use_context(mut self, plugin: ContextPlugin<RV>) -> Self {
        let name = plugin.name.clone();
        let previous = self.contexts.insert(name.clone(), plugin);
        if previous.is_some() {
            panic!("Context [{}] is already defined", name);
        }

        self
    }

    /// Register a hook that workloads can name in their `hooks` actions.
    ///
    /// `sys_call` is always available.
    pub fn use_hook(mut self, plugin: HookPlugin<RV>) -> Self {
        let name = plugin.name.clone();
        let previous = self.hooks.insert(name.clone(), plugin);
        if previous.is_some() {
            panic!("Hook [{}] is already defined", name);
        }

        self
    }

    /// Use this task instead of loading the task file named on the command line.
    pub fn with_task(mut self, task: TaskConfig) -> Self {
        self.task = Some(task);
        self
    }

    /// Use this configuration instead of loading the config file named on the command line.
    pub fn with_config(mut self, config: BenchConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Replace the system clock, mostly useful in tests.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub(crate) fn build(self) -> anyhow::Result<TaskDefinition<RV>> {
        let task = match (self.task, &self.cli.task) {
            (Some(task), _) => task,
            (None, Some(path)) => TaskConfig::load(path)?,
            (None, None) => {
                return Err(ConfigurationError(
                    "no task file given, pass the path to a task file".to_string(),
                )
                .into())
            }
        };

        let config = match (self.config, &self.cli.config) {
            (Some(config), _) => config,
            (None, Some(path)) => BenchConfig::load(path)
                .with_context(|| format!("Failed to load config for {}", self.name))?,
            (None, None) => BenchConfig::default(),
        };
        config.validate()?;

        Ok(TaskDefinition {
            name: self.name,
            cli: self.cli,
            task,
            config,
            scenarios: self.scenarios,
            contexts: self.contexts,
            hooks: self.hooks,
            clock: self.clock,
        })
    }
}
