use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::iteration::IterationResult;
use crate::sla::SlaResult;

/// Statistics over a set of durations, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurationStats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub median: f64,
    pub p90: f64,
    pub p95: f64,
}

impl DurationStats {
    /// `None` for an empty set. Values do not need to be sorted.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }

        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);
        let count = sorted.len();

        // Summing in sorted order keeps the result independent of arrival order.
        let avg = sorted.iter().sum::<f64>() / count as f64;
        let median = if count % 2 == 1 {
            sorted[count / 2]
        } else {
            (sorted[count / 2 - 1] + sorted[count / 2]) / 2.0
        };

        Some(Self {
            count,
            min: sorted[0],
            max: sorted[count - 1],
            avg,
            median,
            p90: percentile(&sorted, 90.0),
            p95: percentile(&sorted, 95.0),
        })
    }
}

/// Nearest-rank percentile of sorted values.
pub fn percentile(sorted: &[f64], percent: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }

    let rank = (percent / 100.0 * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Statistics for every occurrence of one named atomic action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionStats {
    pub count: usize,
    pub failed: usize,
    pub durations: DurationStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub iterations_count: usize,
    pub iterations_failed: usize,
    /// Over successful iterations only, `None` if there were none
    pub duration_stats: Option<DurationStats>,
    /// Sorted durations of the successful iterations
    pub durations: Vec<f64>,
    pub atomic_stats: BTreeMap<String, ActionStats>,
    #[serde(default)]
    pub sla: SlaResult,
}

impl AggregateResult {
    /// Failure rate as a percentage, 0 when there were no iterations.
    pub fn failure_rate(&self) -> f64 {
        if self.iterations_count == 0 {
            0.0
        } else {
            self.iterations_failed as f64 * 100.0 / self.iterations_count as f64
        }
    }
}

/// Accumulates iteration results as they arrive.
#[derive(Debug, Default, Clone)]
pub struct Aggregator {
    results: Vec<IterationResult>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, result: IterationResult) {
        self.results.push(result);
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn results(&self) -> &[IterationResult] {
        &self.results
    }

    pub fn result(&self) -> AggregateResult {
        aggregate(&self.results)
    }
}

/// Reduce iteration results to statistics. The output does not depend on the order of `results`.
pub fn aggregate(results: &[IterationResult]) -> AggregateResult {
    let durations = {
        let mut durations = results
            .iter()
            .filter(|r| r.is_success())
            .map(|r| r.duration)
            .collect::<Vec<_>>();
        durations.sort_by(f64::total_cmp);
        durations
    };

    let mut per_action: BTreeMap<&str, (Vec<f64>, usize)> = BTreeMap::new();
    for action in results.iter().flat_map(|r| r.atomic_actions.iter()) {
        let (durations, failed) = per_action.entry(action.name.as_str()).or_default();
        durations.push(action.duration);
        if action.failed() {
            *failed += 1;
        }
    }

    let atomic_stats = per_action
        .into_iter()
        .filter_map(|(name, (durations, failed))| {
            DurationStats::from_values(&durations).map(|stats| {
                (
                    name.to_string(),
                    ActionStats {
                        count: durations.len(),
                        failed,
                        durations: stats,
                    },
                )
            })
        })
        .collect();

    AggregateResult {
        iterations_count: results.len(),
        iterations_failed: results.iter().filter(|r| !r.is_success()).count(),
        duration_stats: DurationStats::from_values(&durations),
        durations,
        atomic_stats,
        sla: SlaResult::default(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::iteration::{AtomicActionRecord, ErrorInfo, ScenarioOutput};
    use pretty_assertions::assert_eq;

    pub(crate) fn result(iteration: usize, duration: f64, failed: bool) -> IterationResult {
        IterationResult {
            iteration,
            timestamp: 1_700_000_000.0 + iteration as f64,
            duration,
            idle_duration: 0.0,
            error: failed.then(|| ErrorInfo::new("Error", "failed", "")),
            atomic_actions: vec![AtomicActionRecord {
                name: "boot".to_string(),
                started_at: 0.0,
                finished_at: duration / 2.0,
                duration: duration / 2.0,
                depth: 0,
                error: None,
            }],
            output: ScenarioOutput::default(),
        }
    }

    #[test]
    fn stats_exclude_failed_iterations() {
        let results = vec![result(1, 1.0, false), result(2, 9.0, true), result(3, 3.0, false)];

        let aggregate = aggregate(&results);

        assert_eq!(3, aggregate.iterations_count);
        assert_eq!(1, aggregate.iterations_failed);
        let stats = aggregate.duration_stats.unwrap();
        assert_eq!(2, stats.count);
        assert_eq!(1.0, stats.min);
        assert_eq!(3.0, stats.max);
        assert_eq!(2.0, stats.avg);
        assert_eq!(2.0, stats.median);

        // Atomic actions count every iteration that recorded them
        assert_eq!(3, aggregate.atomic_stats["boot"].count);
    }

    #[test]
    fn order_does_not_matter() {
        let results = (1..=50)
            .map(|i| result(i, (i as f64).sqrt() / 7.0, i % 7 == 0))
            .collect::<Vec<_>>();
        let mut shuffled = results.clone();
        shuffled.reverse();
        shuffled.rotate_left(13);

        assert_eq!(aggregate(&results), aggregate(&shuffled));
    }

    #[test]
    fn nearest_rank_percentiles() {
        let values = (1..=20).map(f64::from).collect::<Vec<_>>();
        let stats = DurationStats::from_values(&values).unwrap();

        assert_eq!(18.0, stats.p90);
        assert_eq!(19.0, stats.p95);
        assert_eq!(10.5, stats.median);
        assert_eq!(5.0, percentile(&[5.0], 99.0));
    }

    #[test]
    fn empty_input() {
        let aggregate = aggregate(&[]);

        assert_eq!(0, aggregate.iterations_count);
        assert_eq!(None, aggregate.duration_stats);
        assert_eq!(0.0, aggregate.failure_rate());
        assert!(aggregate.atomic_stats.is_empty());
    }
}
