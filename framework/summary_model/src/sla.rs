//! Service level agreement checks evaluated against an aggregated workload.

use std::collections::BTreeMap;
use std::fmt::Debug;

use cloudbench_core::prelude::ConfigurationError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::aggregate::AggregateResult;
use crate::iteration::IterationResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaCriterionResult {
    pub criterion: String,
    pub success: bool,
    pub detail: String,
}

impl SlaCriterionResult {
    fn new(criterion: &str, success: bool, detail: String) -> Self {
        Self {
            criterion: criterion.to_string(),
            success,
            detail,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaResult {
    pub success: bool,
    pub details: Vec<SlaCriterionResult>,
}

impl Default for SlaResult {
    fn default() -> Self {
        Self {
            success: true,
            details: Vec::new(),
        }
    }
}

pub trait SlaRule: Debug + Send + Sync {
    /// The key this rule is configured under in a workload's `sla` mapping.
    fn criterion(&self) -> &'static str;

    /// Check the limits of the rule itself.
    fn validate(&self) -> Result<(), ConfigurationError> {
        Ok(())
    }

    fn evaluate(&self, aggregate: &AggregateResult) -> SlaCriterionResult;

    /// A fresh accumulator that checks this rule while results arrive.
    fn accumulator(&self) -> Box<dyn SlaAccumulator>;
}

/// Keeps just enough state to check a rule after every result, in constant time per result for
/// the duration based rules.
pub trait SlaAccumulator: Send {
    /// Account for one more result and report whether the rule still holds.
    fn add_iteration(&mut self, result: &IterationResult) -> bool;
}

fn positive_limit(criterion: &str, limit: f64) -> Result<(), ConfigurationError> {
    if limit.is_finite() && limit > 0.0 {
        Ok(())
    } else {
        Err(ConfigurationError(format!(
            "{criterion} needs a positive limit, got {limit}"
        )))
    }
}

fn status(success: bool) -> &'static str {
    if success {
        "Passed"
    } else {
        "Failed"
    }
}

/// Percentage of failed iterations must lie within `[min, max]`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FailureRate {
    #[serde(default)]
    pub min: f64,
    #[serde(default = "FailureRate::default_max")]
    pub max: f64,
}

impl FailureRate {
    fn default_max() -> f64 {
        100.0
    }
}

impl SlaRule for FailureRate {
    fn criterion(&self) -> &'static str {
        "failure_rate"
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        let percent = 0.0..=100.0;
        if !percent.contains(&self.min) || !percent.contains(&self.max) {
            return Err(ConfigurationError(format!(
                "failure_rate min and max must be percentages in [0, 100], got min={} max={}",
                self.min, self.max
            )));
        }
        if self.min > self.max {
            return Err(ConfigurationError(format!(
                "failure_rate min {} is greater than max {}",
                self.min, self.max
            )));
        }
        Ok(())
    }

    fn accumulator(&self) -> Box<dyn SlaAccumulator> {
        Box::new(FailureRateAccumulator {
            rule: self.clone(),
            total: 0,
            failed: 0,
        })
    }

    fn evaluate(&self, aggregate: &AggregateResult) -> SlaCriterionResult {
        let rate = aggregate.failure_rate();
        let success = self.min <= rate && rate <= self.max;
        SlaCriterionResult::new(
            self.criterion(),
            success,
            format!(
                "Failure rate criteria {:.2}% <= {:.2}% <= {:.2}% - {}",
                self.min,
                rate,
                self.max,
                status(success)
            ),
        )
    }
}

struct FailureRateAccumulator {
    rule: FailureRate,
    total: usize,
    failed: usize,
}

impl SlaAccumulator for FailureRateAccumulator {
    fn add_iteration(&mut self, result: &IterationResult) -> bool {
        self.total += 1;
        if !result.is_success() {
            self.failed += 1;
        }
        let rate = self.failed as f64 * 100.0 / self.total as f64;
        self.rule.min <= rate && rate <= self.rule.max
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct MaxSecondsPerIteration(pub f64);

impl SlaRule for MaxSecondsPerIteration {
    fn criterion(&self) -> &'static str {
        "max_seconds_per_iteration"
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        positive_limit(self.criterion(), self.0)
    }

    fn accumulator(&self) -> Box<dyn SlaAccumulator> {
        Box::new(MaxSecondsAccumulator {
            limit: self.0,
            max: 0.0,
        })
    }

    fn evaluate(&self, aggregate: &AggregateResult) -> SlaCriterionResult {
        let max = aggregate.duration_stats.as_ref().map_or(0.0, |s| s.max);
        let success = max <= self.0;
        SlaCriterionResult::new(
            self.criterion(),
            success,
            format!(
                "Maximum seconds per iteration {max:.2}s <= {:.2}s - {}",
                self.0,
                status(success)
            ),
        )
    }
}

struct MaxSecondsAccumulator {
    limit: f64,
    max: f64,
}

impl SlaAccumulator for MaxSecondsAccumulator {
    fn add_iteration(&mut self, result: &IterationResult) -> bool {
        if result.is_success() {
            self.max = self.max.max(result.duration);
        }
        self.max <= self.limit
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct MaxAvgDuration(pub f64);

impl SlaRule for MaxAvgDuration {
    fn criterion(&self) -> &'static str {
        "max_avg_duration"
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        positive_limit(self.criterion(), self.0)
    }

    fn accumulator(&self) -> Box<dyn SlaAccumulator> {
        Box::new(MaxAvgAccumulator {
            limit: self.0,
            mean: RunningMean::default(),
        })
    }

    fn evaluate(&self, aggregate: &AggregateResult) -> SlaCriterionResult {
        let avg = aggregate.duration_stats.as_ref().map_or(0.0, |s| s.avg);
        let success = avg <= self.0;
        SlaCriterionResult::new(
            self.criterion(),
            success,
            format!(
                "Average duration of one iteration {avg:.2}s <= {:.2}s - {}",
                self.0,
                status(success)
            ),
        )
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct RunningMean {
    sum: f64,
    count: usize,
}

impl RunningMean {
    fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    fn within(&self, limit: f64) -> bool {
        self.count == 0 || self.sum / self.count as f64 <= limit
    }
}

struct MaxAvgAccumulator {
    limit: f64,
    mean: RunningMean,
}

impl SlaAccumulator for MaxAvgAccumulator {
    fn add_iteration(&mut self, result: &IterationResult) -> bool {
        if result.is_success() {
            self.mean.add(result.duration);
        }
        self.mean.within(self.limit)
    }
}

/// Maximum average duration for each named atomic action. Actions that never ran are ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct MaxAvgDurationPerAtomic(pub BTreeMap<String, f64>);

impl SlaRule for MaxAvgDurationPerAtomic {
    fn criterion(&self) -> &'static str {
        "max_avg_duration_per_atomic"
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        self.0.iter().try_for_each(|(name, limit)| {
            positive_limit(&format!("{} for {name}", self.criterion()), *limit)
        })
    }

    fn accumulator(&self) -> Box<dyn SlaAccumulator> {
        Box::new(PerAtomicAccumulator {
            limits: self.0.clone(),
            means: BTreeMap::new(),
        })
    }

    fn evaluate(&self, aggregate: &AggregateResult) -> SlaCriterionResult {
        let checks = self
            .0
            .iter()
            .filter_map(|(name, limit)| {
                aggregate
                    .atomic_stats
                    .get(name)
                    .map(|stats| (name, stats.durations.avg, *limit))
            })
            .collect::<Vec<_>>();

        let success = checks.iter().all(|(_, avg, limit)| avg <= limit);
        let parts = checks
            .iter()
            .map(|(name, avg, limit)| format!("{name} {avg:.2}s <= {limit:.2}s"))
            .collect::<Vec<_>>()
            .join(", ");

        SlaCriterionResult::new(
            self.criterion(),
            success,
            format!(
                "Average duration of atomic actions: {parts} - {}",
                status(success)
            ),
        )
    }
}

struct PerAtomicAccumulator {
    limits: BTreeMap<String, f64>,
    means: BTreeMap<String, RunningMean>,
}

impl SlaAccumulator for PerAtomicAccumulator {
    fn add_iteration(&mut self, result: &IterationResult) -> bool {
        for action in &result.atomic_actions {
            if self.limits.contains_key(&action.name) {
                self.means
                    .entry(action.name.clone())
                    .or_default()
                    .add(action.duration);
            }
        }

        self.means.iter().all(|(name, mean)| {
            self.limits
                .get(name)
                .map_or(true, |limit| mean.within(*limit))
        })
    }
}

/// Limit on iterations that took longer than `sigmas` standard deviations above the mean.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Outliers {
    pub max: usize,
    pub min_iterations: usize,
    pub sigmas: f64,
}

impl Default for Outliers {
    fn default() -> Self {
        Self {
            max: 0,
            min_iterations: 3,
            sigmas: 3.0,
        }
    }
}

impl SlaRule for Outliers {
    fn criterion(&self) -> &'static str {
        "outliers"
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.min_iterations < 3 {
            return Err(ConfigurationError(format!(
                "outliers needs min_iterations of at least 3, got {}",
                self.min_iterations
            )));
        }
        positive_limit("outliers sigmas", self.sigmas)
    }

    fn accumulator(&self) -> Box<dyn SlaAccumulator> {
        Box::new(OutliersAccumulator {
            rule: self.clone(),
            count: 0,
            mean: 0.0,
            m2: 0.0,
            threshold: None,
            outliers: 0,
        })
    }

    fn evaluate(&self, aggregate: &AggregateResult) -> SlaCriterionResult {
        let durations = &aggregate.durations;
        let n = durations.len();
        if n < self.min_iterations.max(2) {
            return SlaCriterionResult::new(
                self.criterion(),
                true,
                format!(
                    "Maximum number of outliers: not enough iterations ({n} < {}) - Passed",
                    self.min_iterations
                ),
            );
        }

        let mean = durations.iter().sum::<f64>() / n as f64;
        let variance = durations.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
        let threshold = mean + self.sigmas * variance.sqrt();
        let outliers = durations.iter().filter(|d| **d > threshold).count();

        let success = outliers <= self.max;
        SlaCriterionResult::new(
            self.criterion(),
            success,
            format!(
                "Maximum number of outliers {outliers} <= {} - {}",
                self.max,
                status(success)
            ),
        )
    }
}

/// Compares each successful duration with the threshold from the ones before it, so an outlier
/// is counted once and never revisited. Mean and variance are kept with Welford's method.
struct OutliersAccumulator {
    rule: Outliers,
    count: usize,
    mean: f64,
    m2: f64,
    threshold: Option<f64>,
    outliers: usize,
}

impl SlaAccumulator for OutliersAccumulator {
    fn add_iteration(&mut self, result: &IterationResult) -> bool {
        if result.is_success() {
            let duration = result.duration;
            self.count += 1;
            if self.count >= self.rule.min_iterations
                && self.threshold.is_some_and(|threshold| duration > threshold)
            {
                self.outliers += 1;
            }

            let delta = duration - self.mean;
            self.mean += delta / self.count as f64;
            self.m2 += delta * (duration - self.mean);
            if self.count >= 2 {
                let std = (self.m2 / (self.count - 1) as f64).sqrt();
                self.threshold = Some(self.mean + self.rule.sigmas * std);
            }
        }
        self.outliers <= self.rule.max
    }
}

fn rule<R>(name: &str, value: &Value) -> Result<Box<dyn SlaRule>, ConfigurationError>
where
    R: SlaRule + DeserializeOwned + 'static,
{
    let rule = serde_json::from_value::<R>(value.clone())
        .map_err(|e| ConfigurationError(format!("invalid config for SLA '{name}': {e}")))?;
    rule.validate()
        .map_err(|e| ConfigurationError(format!("invalid config for SLA '{name}': {}", e.0)))?;
    Ok(Box::new(rule))
}

/// Build the rules named in a workload's `sla` mapping.
pub fn parse_sla(config: &Map<String, Value>) -> Result<Vec<Box<dyn SlaRule>>, ConfigurationError> {
    config
        .iter()
        .map(|(name, value)| match name.as_str() {
            "failure_rate" => rule::<FailureRate>(name, value),
            "max_seconds_per_iteration" => rule::<MaxSecondsPerIteration>(name, value),
            "max_avg_duration" => rule::<MaxAvgDuration>(name, value),
            "max_avg_duration_per_atomic" => rule::<MaxAvgDurationPerAtomic>(name, value),
            "outliers" => rule::<Outliers>(name, value),
            other => Err(ConfigurationError(format!("unknown SLA '{other}'"))),
        })
        .collect()
}

/// Evaluates the configured rules plus the run-level abort conditions.
#[derive(Debug, Default)]
pub struct SlaChecker {
    rules: Vec<Box<dyn SlaRule>>,
    aborted_on_sla: bool,
    aborted_manually: bool,
    unexpected_failure: Option<String>,
}

impl SlaChecker {
    pub fn new(rules: Vec<Box<dyn SlaRule>>) -> Self {
        Self {
            rules,
            ..Default::default()
        }
    }

    pub fn from_config(config: &Map<String, Value>) -> Result<Self, ConfigurationError> {
        Ok(Self::new(parse_sla(config)?))
    }

    pub fn has_rules(&self) -> bool {
        !self.rules.is_empty()
    }

    /// Accumulators for the configured rules, to check the SLA while results arrive.
    pub fn streaming(&self) -> StreamingSla {
        StreamingSla {
            accumulators: self
                .rules
                .iter()
                .map(|rule| (rule.criterion(), rule.accumulator()))
                .collect(),
        }
    }

    pub fn set_aborted_on_sla(&mut self) {
        self.aborted_on_sla = true;
    }

    pub fn set_aborted_manually(&mut self) {
        self.aborted_manually = true;
    }

    pub fn set_unexpected_failure(&mut self, msg: impl Into<String>) {
        self.unexpected_failure = Some(msg.into());
    }

    pub fn evaluate(&self, aggregate: &AggregateResult) -> SlaResult {
        let mut details = self
            .rules
            .iter()
            .map(|rule| rule.evaluate(aggregate))
            .collect::<Vec<_>>();

        if self.aborted_on_sla {
            details.push(SlaCriterionResult::new(
                "aborted_on_sla",
                false,
                "Task was aborted due to SLA failure(s).".to_string(),
            ));
        }
        if self.aborted_manually {
            details.push(SlaCriterionResult::new(
                "aborted_manually",
                false,
                "Task was aborted due to abort signal.".to_string(),
            ));
        }
        if let Some(msg) = &self.unexpected_failure {
            details.push(SlaCriterionResult::new(
                "something_went_wrong",
                false,
                format!("Unexpected error: {msg}"),
            ));
        }

        SlaResult {
            success: details.iter().all(|d| d.success),
            details,
        }
    }
}

/// Checks the configured rules one result at a time.
pub struct StreamingSla {
    accumulators: Vec<(&'static str, Box<dyn SlaAccumulator>)>,
}

impl StreamingSla {
    /// Account for one more result. Returns the rules that no longer hold.
    pub fn add_iteration(&mut self, result: &IterationResult) -> Vec<&'static str> {
        // Every accumulator must see every result, even once one has failed.
        self.accumulators
            .iter_mut()
            .filter_map(|(criterion, accumulator)| {
                (!accumulator.add_iteration(result)).then_some(*criterion)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{aggregate, tests::result};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn sla(config: Value) -> SlaChecker {
        SlaChecker::from_config(config.as_object().unwrap()).unwrap()
    }

    #[test]
    fn no_rules_is_success() {
        let aggregate = aggregate(&[result(1, 1.0, true)]);
        let result = SlaChecker::default().evaluate(&aggregate);

        assert!(result.success);
        assert!(result.details.is_empty());
    }

    #[test]
    fn failure_rate_detail() {
        let results = (1..=4).map(|i| result(i, 1.0, i == 4)).collect::<Vec<_>>();
        let result = sla(json!({"failure_rate": {"max": 10}})).evaluate(&aggregate(&results));

        assert!(!result.success);
        assert_eq!(
            "Failure rate criteria 0.00% <= 25.00% <= 10.00% - Failed",
            result.details[0].detail
        );
    }

    #[test]
    fn duration_limits() {
        let results = vec![result(1, 1.0, false), result(2, 3.0, false)];
        let aggregate = aggregate(&results);

        let checked = sla(json!({"max_seconds_per_iteration": 2.5, "max_avg_duration": 2.5}))
            .evaluate(&aggregate);

        let by_name = checked
            .details
            .iter()
            .map(|d| (d.criterion.as_str(), d.success))
            .collect::<BTreeMap<_, _>>();
        assert_eq!(Some(&false), by_name.get("max_seconds_per_iteration"));
        assert_eq!(Some(&true), by_name.get("max_avg_duration"));
        assert!(!checked.success);
    }

    #[test]
    fn per_atomic_ignores_missing_actions() {
        let results = vec![result(1, 2.0, false), result(2, 4.0, false)];
        let checked = sla(json!({"max_avg_duration_per_atomic": {"boot": 1.0, "delete": 0.1}}))
            .evaluate(&aggregate(&results));

        // boot takes half of each iteration, avg 1.5s
        assert!(!checked.success);
        assert!(checked.details[0].detail.contains("boot 1.50s <= 1.00s"));
        assert!(!checked.details[0].detail.contains("delete"));
    }

    #[test]
    fn outliers_need_enough_iterations() {
        let few = vec![result(1, 1.0, false), result(2, 100.0, false)];
        assert!(sla(json!({"outliers": {}})).evaluate(&aggregate(&few)).success);

        let mut many = (1..=20).map(|i| result(i, 1.0, false)).collect::<Vec<_>>();
        many.push(result(21, 100.0, false));
        let checked = sla(json!({"outliers": {"max": 0}})).evaluate(&aggregate(&many));

        assert!(!checked.success);
        assert_eq!(
            "Maximum number of outliers 1 <= 0 - Failed",
            checked.details[0].detail
        );
    }

    #[test]
    fn abort_flags_fail_the_sla() {
        let mut checker = SlaChecker::default();
        checker.set_aborted_manually();

        let result = checker.evaluate(&aggregate(&[]));

        assert!(!result.success);
        assert_eq!("aborted_manually", result.details[0].criterion);
    }

    #[test]
    fn out_of_range_limits_are_rejected() {
        for config in [
            json!({"failure_rate": {"max": -5}}),
            json!({"failure_rate": {"min": 150}}),
            json!({"failure_rate": {"min": 50, "max": 10}}),
            json!({"max_seconds_per_iteration": -1}),
            json!({"max_avg_duration": 0}),
            json!({"max_avg_duration_per_atomic": {"nova.boot_server": -2}}),
            json!({"outliers": {"min_iterations": 0}}),
            json!({"outliers": {"sigmas": -2}}),
        ] {
            let err = SlaChecker::from_config(config.as_object().unwrap()).unwrap_err();
            let criterion = config.as_object().unwrap().keys().next().unwrap().clone();
            assert!(err.to_string().contains(&criterion), "{config}: {err}");
        }

        assert!(SlaChecker::from_config(
            json!({"failure_rate": {"min": 0, "max": 100}, "outliers": {"min_iterations": 3}})
                .as_object()
                .unwrap()
        )
        .is_ok());
    }

    #[test]
    fn streaming_check_agrees_with_the_final_evaluation() {
        let config = json!({
            "failure_rate": {"max": 20},
            "max_seconds_per_iteration": 5.0,
            "max_avg_duration": 3.0,
            "max_avg_duration_per_atomic": {"boot": 1.2},
        });
        let checker = sla(config);
        let mut streaming = checker.streaming();

        let durations = [1.0, 2.0, 1.5, 3.0, 2.5, 4.0, 6.0];
        let mut results = Vec::new();
        for (i, duration) in durations.iter().enumerate() {
            let result = result(i + 1, *duration, i == 4);
            let failing = streaming.add_iteration(&result);
            results.push(result);

            let failed_in_full = checker
                .evaluate(&aggregate(&results))
                .details
                .into_iter()
                .filter(|d| !d.success)
                .map(|d| d.criterion)
                .collect::<Vec<_>>();
            assert_eq!(failed_in_full, failing, "after {} results", i + 1);
        }
    }

    #[test]
    fn streaming_outliers_count_each_slow_iteration_once() {
        let mut streaming = sla(json!({"outliers": {"max": 1}})).streaming();

        for i in 1..=10 {
            let steady = result(i, 1.0 + (i % 2) as f64 * 0.1, false);
            assert!(streaming.add_iteration(&steady).is_empty());
        }
        assert!(streaming.add_iteration(&result(11, 50.0, false)).is_empty());
        assert!(streaming.add_iteration(&result(12, 1.0, true)).is_empty());
        assert_eq!(vec!["outliers"], streaming.add_iteration(&result(13, 500.0, false)));
    }

    #[test]
    fn unknown_rule_is_a_configuration_error() {
        let config = json!({"max_happiness": 1});
        let err = SlaChecker::from_config(config.as_object().unwrap()).unwrap_err();

        assert!(err.to_string().contains("max_happiness"));
    }
}
