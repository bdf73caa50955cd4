//! Negative log-likelihood evaluation over an event dataset.

mod kahan;
mod partitioned;

pub use kahan::KahanSum;
pub use partitioned::{ParallelLikelihood, PartitionResult, PartitionedLikelihood};

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::job::EvalError;

/// The objective a likelihood fit minimizes: an event dataset plus a
/// parameterized probability model. The engine treats it as opaque; all it
/// needs is per-event log-probabilities and weights under the current
/// parameter values.
pub trait UnbinnedObjective {
    fn n_events(&self) -> usize;

    fn n_parameters(&self) -> usize;

    fn parameter(&self, index: usize) -> f64;

    fn set_parameter(&mut self, index: usize, value: f64);

    /// `log p(x_event | θ)` under the current parameters. Non-finite values
    /// are reported as evaluation errors and surface at the minimizer as an
    /// error-wall return.
    fn log_prob(&self, event: usize) -> f64;

    fn weight(&self, _event: usize) -> f64 {
        1.0
    }

    fn weight_squared(&self, event: usize) -> f64 {
        let w = self.weight(event);
        w * w
    }

    /// Expected event yield, used by the extended term.
    fn expected_events(&self) -> f64 {
        self.n_events() as f64
    }

    /// Observed yield: the compensated sum of event weights.
    fn sum_entries(&self) -> f64 {
        let mut sum = KahanSum::new();
        for event in 0..self.n_events() {
            sum.add(self.weight(event));
        }
        sum.sum()
    }
}

/// How event indices map onto tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionStrategy {
    /// Contiguous ranges, one per task.
    Bulk,
    /// Stride-`n_tasks` interleaving.
    Interleaved,
    /// One task per event.
    PerEvent,
}

impl fmt::Display for PartitionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionStrategy::Bulk => write!(f, "bulk"),
            PartitionStrategy::Interleaved => write!(f, "interleaved"),
            PartitionStrategy::PerEvent => write!(f, "per-event"),
        }
    }
}

impl PartitionStrategy {
    /// Number of tasks one submission produces.
    pub fn n_tasks(&self, n_events: usize, n_workers: usize) -> usize {
        match self {
            PartitionStrategy::Bulk | PartitionStrategy::Interleaved => n_workers,
            PartitionStrategy::PerEvent => n_events,
        }
    }

    /// The event indices of one task, in canonical (ascending) order.
    pub fn task_events(
        &self,
        n_events: usize,
        n_tasks: usize,
        task: usize,
    ) -> impl Iterator<Item = usize> {
        let (start, end, step) = match self {
            PartitionStrategy::Bulk => {
                let chunk = n_events.div_ceil(n_tasks.max(1));
                (task * chunk, ((task + 1) * chunk).min(n_events), 1)
            }
            PartitionStrategy::Interleaved => (task, n_events, n_tasks),
            PartitionStrategy::PerEvent => (task, (task + 1).min(n_events), 1),
        };
        (start.min(end)..end).step_by(step.max(1))
    }
}

/// Compensated `Σ -w·log p` over one event subset. Zero-weight events are
/// skipped; non-finite log-probabilities are recorded and still folded in so
/// the combined value carries the poison to the error wall.
pub(crate) fn partition_sum<O: UnbinnedObjective + ?Sized>(
    objective: &O,
    events: impl Iterator<Item = usize>,
    apply_weight_squared: bool,
    eval_errors: &mut Vec<EvalError>,
) -> KahanSum {
    let mut acc = KahanSum::new();
    for event in events {
        let mut weight = objective.weight(event);
        if weight * weight == 0.0 {
            continue;
        }
        if apply_weight_squared {
            weight = objective.weight_squared(event);
        }
        let log_prob = objective.log_prob(event);
        if !log_prob.is_finite() {
            eval_errors.push(EvalError {
                arg_id: event,
                message: "log-probability is not finite".into(),
                value: log_prob,
            });
        }
        acc.add(-weight * log_prob);
    }
    acc
}

/// Serial full-dataset NLL in plain event order: the scalar function the
/// gradient kernel differentiates, identical on master and workers.
pub(crate) fn serial_nll<O: UnbinnedObjective + ?Sized>(
    objective: &O,
    extended: bool,
    apply_weight_squared: bool,
    eval_errors: &mut Vec<EvalError>,
) -> f64 {
    let mut acc = partition_sum(
        objective,
        0..objective.n_events(),
        apply_weight_squared,
        eval_errors,
    );
    if extended {
        acc.add(extended_term(objective, apply_weight_squared));
    }
    acc.sum()
}

/// The extended maximum-likelihood contribution `μ − N·log μ`, or its
/// weight-squared-adjusted variant.
pub(crate) fn extended_term<O: UnbinnedObjective + ?Sized>(
    objective: &O,
    apply_weight_squared: bool,
) -> f64 {
    let expected = objective.expected_events();
    if apply_weight_squared && objective.n_events() > 0 {
        // Rescale the Poisson term by the effective weight sum[w]/sum[w^2] so
        // the yield estimate keeps its value but acquires the weighted
        // variance.
        let mut sum_w2 = KahanSum::new();
        for event in 0..objective.n_events() {
            sum_w2.add(objective.weight_squared(event));
        }
        let sum_w2 = sum_w2.sum();
        let expected_w2 = expected * sum_w2 / objective.sum_entries();
        expected_w2 - sum_w2 * expected.ln()
    } else {
        expected - objective.sum_entries() * expected.ln()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_tasks_cover_contiguous_ranges() {
        let events: Vec<Vec<usize>> = (0..3)
            .map(|t| PartitionStrategy::Bulk.task_events(10, 3, t).collect())
            .collect();
        assert_eq!(events[0], vec![0, 1, 2, 3]);
        assert_eq!(events[1], vec![4, 5, 6, 7]);
        assert_eq!(events[2], vec![8, 9]);
    }

    #[test]
    fn interleaved_tasks_stride_by_task_count() {
        let events: Vec<Vec<usize>> = (0..3)
            .map(|t| PartitionStrategy::Interleaved.task_events(10, 3, t).collect())
            .collect();
        assert_eq!(events[0], vec![0, 3, 6, 9]);
        assert_eq!(events[1], vec![1, 4, 7]);
        assert_eq!(events[2], vec![2, 5, 8]);
    }

    #[test]
    fn every_strategy_covers_each_event_exactly_once() {
        for strategy in [
            PartitionStrategy::Bulk,
            PartitionStrategy::Interleaved,
            PartitionStrategy::PerEvent,
        ] {
            for n_workers in 1..=5 {
                let n_events = 23;
                let n_tasks = strategy.n_tasks(n_events, n_workers);
                let mut seen = vec![0u32; n_events];
                for task in 0..n_tasks {
                    for event in strategy.task_events(n_events, n_tasks, task) {
                        seen[event] += 1;
                    }
                }
                assert!(
                    seen.iter().all(|&count| count == 1),
                    "strategy {} with {} workers lost or duplicated events",
                    strategy,
                    n_workers
                );
            }
        }
    }

    #[test]
    fn more_workers_than_events_yields_empty_tail_tasks() {
        let collected: Vec<Vec<usize>> = (0..4)
            .map(|t| PartitionStrategy::Bulk.task_events(2, 4, t).collect())
            .collect();
        assert_eq!(collected[0], vec![0]);
        assert_eq!(collected[1], vec![1]);
        assert!(collected[2].is_empty());
        assert!(collected[3].is_empty());
    }
}
