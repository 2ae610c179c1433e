use cloudbench_core::prelude::{ConfigurationError, ValidationError};
use cloudbench_summary_model::SlaChecker;
use itertools::Itertools;
use serde_json::{Map, Value};

use crate::context::{RunnerContext, UserValuesConstraint};
use crate::definition::{
    ContextPlugin, HookPlugin, Permission, RegisteredScenario, TaskDefinition, Validator,
};
use crate::dispatch::RunnerConfig;
use crate::hooks::TriggerConfig;
use crate::task::WorkloadConfig;

/// A workload that passed its pre-flight checks, with everything resolved from the registries.
pub(crate) struct ValidatedWorkload<'a, RV: UserValuesConstraint> {
    pub scenario: &'a RegisteredScenario<RV>,
    pub runner: RunnerConfig,
    pub sla: SlaChecker,
    /// Contexts to set up, in setup order, with their configuration
    pub contexts: Vec<(&'a ContextPlugin<RV>, Value)>,
    /// The configured contexts merged with the scenario's defaults
    pub merged_contexts: Map<String, Value>,
    pub hooks: Vec<ValidatedHook<'a, RV>>,
}

pub(crate) struct ValidatedHook<'a, RV: UserValuesConstraint> {
    pub plugin: &'a HookPlugin<RV>,
    pub args: Value,
    pub description: String,
    pub trigger: TriggerConfig,
}

/// Check everything about a workload that can be checked without touching the cloud.
pub(crate) fn validate_workload<'a, RV: UserValuesConstraint>(
    definition: &'a TaskDefinition<RV>,
    workload: &WorkloadConfig,
) -> anyhow::Result<ValidatedWorkload<'a, RV>> {
    let Some(scenario) = definition.scenarios.get(&workload.scenario) else {
        return Err(ConfigurationError(format!(
            "unknown scenario '{}', available scenarios are: {}",
            workload.scenario,
            definition.scenarios.keys().sorted().join(", ")
        ))
        .into());
    };

    let runner = RunnerConfig::parse(&workload.runner)?;
    let sla = SlaChecker::from_config(&workload.sla)?;

    let mut merged_contexts = scenario.meta.default_contexts.clone();
    for (name, config) in &workload.contexts {
        merged_contexts.insert(name.clone(), config.clone());
    }

    let mut contexts = Vec::with_capacity(merged_contexts.len());
    for (name, config) in &merged_contexts {
        let Some(plugin) = definition.contexts.get(name) else {
            return Err(ConfigurationError(format!(
                "unknown context '{name}' for scenario '{}'",
                workload.scenario
            ))
            .into());
        };
        contexts.push((plugin, config.clone()));
    }
    contexts.sort_by(|(a, _), (b, _)| a.order.cmp(&b.order).then_with(|| a.name.cmp(&b.name)));

    for required in &scenario.meta.required_contexts {
        if !merged_contexts.contains_key(required) {
            return Err(ValidationError(format!(
                "scenario '{}' requires the '{required}' context",
                workload.scenario
            ))
            .into());
        }
    }

    if scenario.meta.admin_only && definition.config.deployment.admin.is_none() {
        return Err(ValidationError(format!(
            "scenario '{}' needs admin credentials but none are configured",
            workload.scenario
        ))
        .into());
    }

    for validator in &scenario.meta.validators {
        if let Validator::Args { name, check } = validator {
            check(&workload.args)
                .map_err(|e| ValidationError(format!("{name}: {}", e.0)))?;
        }
    }

    let mut hooks = Vec::with_capacity(workload.hooks.len());
    for (index, hook) in workload.hooks.iter().enumerate() {
        let (name, args) = hook
            .action()
            .map_err(|e| ConfigurationError(format!("hook {index}: {}", e.0)))?;
        let Some(plugin) = definition.hooks.get(name) else {
            return Err(ConfigurationError(format!(
                "hook {index}: unknown hook '{name}', available hooks are: {}",
                definition.hooks.keys().sorted().join(", ")
            ))
            .into());
        };
        hook.trigger
            .validate()
            .map_err(|e| ConfigurationError(format!("hook {index} ({name}): {}", e.0)))?;
        if let Some(check) = plugin.check_args {
            check(args).map_err(|e| ValidationError(format!("hook {index} ({name}): {}", e.0)))?;
        }

        hooks.push(ValidatedHook {
            plugin,
            args: args.clone(),
            description: hook.description.clone(),
            trigger: hook.trigger.clone(),
        });
    }

    Ok(ValidatedWorkload {
        scenario,
        runner,
        sla,
        contexts,
        merged_contexts,
        hooks,
    })
}

/// Run credential validators once contexts have set up the users.
pub(crate) fn validate_credentials<RV: UserValuesConstraint>(
    runner_context: &RunnerContext<RV>,
    validators: &[Validator<RV>],
    args: &Map<String, Value>,
) -> Result<(), ValidationError> {
    for validator in validators {
        let Validator::Credential {
            name,
            permission,
            check,
        } = validator
        else {
            continue;
        };

        let credentials = match permission {
            Permission::Admin => runner_context.admin().into_iter().collect::<Vec<_>>(),
            Permission::User => runner_context.users().iter().collect::<Vec<_>>(),
        };
        if credentials.is_empty() {
            return Err(ValidationError(format!(
                "{name}: no {} credentials are available",
                match permission {
                    Permission::Admin => "admin",
                    Permission::User => "user",
                }
            )));
        }

        for credential in credentials {
            check(runner_context, credential, args).map_err(|e| {
                ValidationError(format!("{name} as {}: {}", credential.username, e.0))
            })?;
        }
    }

    Ok(())
}
