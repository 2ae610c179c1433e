//! Turn a declarative list of `{action: repeat_count}` entries into a sequence of bound calls.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use itertools::Itertools;
use serde_json::{Map, Value};

use crate::error::{ConfigurationError, ValidationError};

/// Arguments passed to an action when it is invoked.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionArgs {
    pub positional: Vec<Value>,
    pub named: Map<String, Value>,
}

impl ActionArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    pub fn named(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.named.insert(name.to_string(), value.into());
        self
    }

    /// Positional args are `self ++ extra`, named args from `extra` win on collision.
    pub fn merged(&self, extra: &ActionArgs) -> ActionArgs {
        let mut named = self.named.clone();
        named.extend(extra.named.iter().map(|(k, v)| (k.clone(), v.clone())));

        ActionArgs {
            positional: self
                .positional
                .iter()
                .chain(extra.positional.iter())
                .cloned()
                .collect(),
            named,
        }
    }
}

pub type ActionFn<T> = Arc<dyn Fn(&mut T, &ActionArgs) -> anyhow::Result<()> + Send + Sync>;

struct Binding<T> {
    action: ActionFn<T>,
    args: ActionArgs,
}

/// One validated `{name: times}` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionEntry {
    pub name: String,
    pub times: u64,
}

/// An action ready to run against a target of type `T`.
pub struct BoundAction<T> {
    name: String,
    action: ActionFn<T>,
    args: ActionArgs,
}

impl<T> BoundAction<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &ActionArgs {
        &self.args
    }

    pub fn call(&self, target: &mut T) -> anyhow::Result<()> {
        (self.action)(target, &self.args)
    }
}

impl<T> Debug for BoundAction<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundAction")
            .field("name", &self.name)
            .field("args", &self.args)
            .finish()
    }
}

pub struct ActionBuilder<T> {
    known: BTreeSet<String>,
    bindings: BTreeMap<String, Binding<T>>,
}

impl<T> Debug for ActionBuilder<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionBuilder")
            .field("known", &self.known)
            .field("bound", &self.bindings.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<T> ActionBuilder<T> {
    pub fn new<I, S>(action_keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            known: action_keywords.into_iter().map(Into::into).collect(),
            bindings: BTreeMap::new(),
        }
    }

    pub fn bind<F>(
        &mut self,
        name: &str,
        action: F,
        args: ActionArgs,
    ) -> Result<&mut Self, ConfigurationError>
    where
        F: Fn(&mut T, &ActionArgs) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        if !self.known.contains(name) {
            return Err(ConfigurationError(format!(
                "cannot bind unknown action '{name}', expected one of: {}",
                self.known.iter().join(", ")
            )));
        }

        self.bindings.insert(
            name.to_string(),
            Binding {
                action: Arc::new(action),
                args,
            },
        );

        Ok(self)
    }

    /// Check that `actions` is a list of single-key mappings from a known action to a positive
    /// repeat count.
    pub fn validate(&self, actions: &Value) -> Result<Vec<ActionEntry>, ValidationError> {
        let Some(entries) = actions.as_array() else {
            return Err(ValidationError(format!(
                "actions must be a list, got {actions}"
            )));
        };

        entries
            .iter()
            .map(|entry| {
                let Some((name, times)) = entry
                    .as_object()
                    .filter(|obj| obj.len() == 1)
                    .and_then(|obj| obj.iter().next())
                else {
                    return Err(ValidationError(format!(
                        "each action must be a mapping with a single key, got {entry}"
                    )));
                };

                if !self.known.contains(name) {
                    return Err(ValidationError(format!(
                        "unknown action '{name}', expected one of: {}",
                        self.known.iter().join(", ")
                    )));
                }

                match times.as_u64() {
                    Some(times) if times >= 1 => Ok(ActionEntry {
                        name: name.clone(),
                        times,
                    }),
                    _ => Err(ValidationError(format!(
                        "action '{name}' must repeat a positive integer number of times, got {times}"
                    ))),
                }
            })
            .collect()
    }

    /// Validate `actions` and lazily produce one bound action per repetition, in declaration order.
    pub fn build<'a>(
        &'a self,
        actions: &Value,
        extra: ActionArgs,
    ) -> anyhow::Result<impl Iterator<Item = BoundAction<T>> + 'a> {
        let entries = self.validate(actions)?;

        if let Some(unbound) = entries
            .iter()
            .find(|entry| !self.bindings.contains_key(&entry.name))
        {
            return Err(ConfigurationError(format!(
                "action '{}' is known but was never bound",
                unbound.name
            ))
            .into());
        }

        Ok(entries
            .into_iter()
            .filter_map(move |entry| self.bindings.get(&entry.name).map(|b| (entry, b)))
            .flat_map(move |(entry, binding)| {
                let args = binding.args.merged(&extra);
                (0..entry.times).map(move |_| BoundAction {
                    name: entry.name.clone(),
                    action: binding.action.clone(),
                    args: args.clone(),
                })
            }))
    }
}
