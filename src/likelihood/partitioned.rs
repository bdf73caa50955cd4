use std::any::Any;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::{FleetError, Result};
use crate::job::{EvalError, Job, ManagerHandle, Task, TaskOutcome};
use crate::likelihood::{extended_term, partition_sum, KahanSum, PartitionStrategy, UnbinnedObjective};

/// One task's share of the NLL: the compensated partial sum and its carry,
/// so the reduction can continue the fold bit-exactly.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PartitionResult {
    pub sum: f64,
    pub carry: f64,
}

/// A [`Job`] computing `Σ -w·log p` over an event dataset, split across
/// tasks by a [`PartitionStrategy`].
///
/// Results are folded in ascending `task_id`: the reduction resumes task 0's
/// compensated sum and merges each later partial sum together with its
/// carry. That order is a property of the partition, not of scheduling, so
/// any worker count reproduces the serial fold bit for bit.
pub struct PartitionedLikelihood<O: UnbinnedObjective + 'static> {
    objective: O,
    strategy: PartitionStrategy,
    n_tasks: usize,
    extended: bool,
    apply_weight_squared: bool,
    do_offset: bool,
    offset: Option<PartitionResult>,
    offset_save_weight_squared: Option<PartitionResult>,
    task_results: BTreeMap<Task, PartitionResult>,
    pending_errors: Vec<EvalError>,
}

impl<O: UnbinnedObjective + 'static> PartitionedLikelihood<O> {
    pub fn new(objective: O, strategy: PartitionStrategy, n_tasks: usize) -> Self {
        let n_tasks = match strategy {
            // one task per event, however many were asked for
            PartitionStrategy::PerEvent => objective.n_events(),
            _ => n_tasks.max(1),
        };
        Self {
            objective,
            strategy,
            n_tasks,
            extended: false,
            apply_weight_squared: false,
            do_offset: false,
            offset: None,
            offset_save_weight_squared: None,
            task_results: BTreeMap::new(),
            pending_errors: Vec::new(),
        }
    }

    /// Configure partitioning and likelihood flags from the engine options.
    pub fn from_config(objective: O, config: &EngineConfig) -> Self {
        let strategy = config.partition_strategy;
        let n_tasks = strategy.n_tasks(objective.n_events(), config.n_workers);
        let mut likelihood = Self::new(objective, strategy, n_tasks);
        likelihood.extended = config.extended_likelihood;
        likelihood.apply_weight_squared = config.apply_weight_squared;
        likelihood.do_offset = config.likelihood_offsetting;
        likelihood
    }

    pub fn with_extended(mut self, flag: bool) -> Self {
        self.extended = flag;
        self
    }

    pub fn with_offsetting(mut self, flag: bool) -> Self {
        self.do_offset = flag;
        self
    }

    /// Toggle weight-squared mode. Each mode keeps its own likelihood
    /// offset, so the stored offset is swapped with the saved slot.
    pub fn set_apply_weight_squared(&mut self, flag: bool) {
        if flag != self.apply_weight_squared {
            self.apply_weight_squared = flag;
            std::mem::swap(&mut self.offset, &mut self.offset_save_weight_squared);
        }
    }

    pub fn objective(&self) -> &O {
        &self.objective
    }

    pub fn objective_mut(&mut self) -> &mut O {
        &mut self.objective
    }

    /// The captured likelihood offset, zero until the first non-zero
    /// evaluation when offsetting is enabled.
    pub fn offset(&self) -> f64 {
        self.offset.map(|o| o.sum).unwrap_or(0.0)
    }

    fn compute_partition(&self, task: Task) -> (PartitionResult, Vec<EvalError>) {
        let mut eval_errors = Vec::new();
        let events = self
            .strategy
            .task_events(self.objective.n_events(), self.n_tasks, task as usize);
        let mut acc = partition_sum(
            &self.objective,
            events,
            self.apply_weight_squared,
            &mut eval_errors,
        );
        if self.extended && task == 0 {
            acc.add(extended_term(&self.objective, self.apply_weight_squared));
        }
        (
            PartitionResult {
                sum: acc.sum(),
                carry: acc.carry(),
            },
            eval_errors,
        )
    }

    /// Fold the buffered task results into the final NLL, applying the
    /// one-shot offset. Fails unless every task has reported.
    pub fn combine(&mut self) -> Result<(f64, Vec<EvalError>)> {
        if self.n_tasks == 0 {
            // an empty per-event partition never ran; the extended term is
            // still owed
            let value = if self.extended {
                extended_term(&self.objective, self.apply_weight_squared)
            } else {
                0.0
            };
            return Ok((value, std::mem::take(&mut self.pending_errors)));
        }
        if self.task_results.len() != self.n_tasks {
            return Err(FleetError::Protocol(format!(
                "likelihood has {} of {} task results",
                self.task_results.len(),
                self.n_tasks
            )));
        }
        let mut total = KahanSum::new();
        for (ix, result) in std::mem::take(&mut self.task_results).into_values().enumerate() {
            if ix == 0 {
                total = KahanSum::from_parts(result.sum, result.carry);
            } else {
                total.add_carried(result.sum, result.carry);
            }
        }

        if self.do_offset {
            if self.offset.is_none() && total.sum() != 0.0 {
                tracing::info!(offset = total.sum(), "likelihood offset captured");
                self.offset = Some(PartitionResult {
                    sum: total.sum(),
                    carry: total.carry(),
                });
            }
            if let Some(offset) = self.offset {
                total.subtract_carried(offset.sum, offset.carry);
            }
        }

        Ok((total.sum(), std::mem::take(&mut self.pending_errors)))
    }

    /// Execute every task on this process and fold, in the same canonical
    /// order the fleet uses. This is the serial reference the parallel path
    /// must match bit for bit.
    pub fn evaluate_local(&mut self) -> Result<(f64, Vec<EvalError>)> {
        for task in 0..self.n_tasks as Task {
            let outcome = self.execute_task(task)?;
            self.receive_task_result(task, outcome)?;
        }
        self.combine()
    }
}

impl<O: UnbinnedObjective + 'static> Job for PartitionedLikelihood<O> {
    fn partition(&self) -> Vec<Task> {
        (0..self.n_tasks as Task).collect()
    }

    fn execute_task(&mut self, task: Task) -> Result<TaskOutcome> {
        let (result, eval_errors) = self.compute_partition(task);
        Ok(TaskOutcome {
            payload: bincode::serialize(&result)?,
            eval_errors,
        })
    }

    fn receive_task_result(&mut self, task: Task, outcome: TaskOutcome) -> Result<()> {
        let result: PartitionResult = bincode::deserialize(&outcome.payload)?;
        self.task_results.insert(task, result);
        self.pending_errors.extend(outcome.eval_errors);
        Ok(())
    }

    fn update_parameter(&mut self, index: usize, value: f64, _is_constant: bool) {
        self.objective.set_parameter(index, value);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Master-side handle submitting a [`PartitionedLikelihood`] to the fleet.
///
/// The first evaluation activates the fleet if nobody has yet; every job
/// meant for that activation must already be registered by then.
pub struct ParallelLikelihood<O: UnbinnedObjective + 'static> {
    manager: ManagerHandle,
    job_id: u64,
    _objective: PhantomData<O>,
}

impl<O: UnbinnedObjective + 'static> ParallelLikelihood<O> {
    pub fn new(manager: &ManagerHandle, likelihood: PartitionedLikelihood<O>) -> Result<Self> {
        let job_id = manager.borrow_mut().register(Box::new(likelihood))?;
        Ok(Self {
            manager: Rc::clone(manager),
            job_id,
            _objective: PhantomData,
        })
    }

    pub fn job_id(&self) -> u64 {
        self.job_id
    }

    /// Push one parameter to the master copy and every worker shadow.
    pub fn set_parameter(&self, index: usize, value: f64) -> Result<()> {
        self.manager
            .borrow_mut()
            .update_parameter(self.job_id, index, value, false)
    }

    pub fn evaluate(&self) -> Result<f64> {
        self.evaluate_with_errors().map(|(value, _)| value)
    }

    /// Evaluate the NLL across the fleet, returning any numerical errors
    /// workers hit.
    pub fn evaluate_with_errors(&self) -> Result<(f64, Vec<EvalError>)> {
        let mut manager = self.manager.borrow_mut();
        if !manager.is_activated() {
            manager.activate()?;
        }
        let n_tasks =
            manager.with_job::<PartitionedLikelihood<O>, _>(self.job_id, |j| j.n_tasks)?;
        if n_tasks == 0 {
            return manager
                .with_job_mut::<PartitionedLikelihood<O>, _>(self.job_id, |j| j.evaluate_local())?;
        }
        manager.submit(self.job_id)?;
        manager.retrieve()?;
        manager.with_job_mut::<PartitionedLikelihood<O>, _>(self.job_id, |j| j.combine())?
    }

    pub fn offset(&self) -> Result<f64> {
        self.manager
            .borrow()
            .with_job::<PartitionedLikelihood<O>, _>(self.job_id, |j| j.offset())
    }
}

impl<O: UnbinnedObjective + 'static> Drop for ParallelLikelihood<O> {
    fn drop(&mut self) {
        if let Ok(mut manager) = self.manager.try_borrow_mut() {
            manager.deregister(self.job_id);
        }
    }
}
