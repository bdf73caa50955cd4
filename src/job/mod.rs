//! The contract between parallelizable computations and the scheduler.

pub mod manager;

pub use manager::{JobManager, ManagerHandle};

use std::any::Any;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Opaque task identifier; its meaning is owned by the job (event-range
/// index, parameter index, ...).
pub type Task = u64;

/// One unit of schedulable work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobTask {
    pub job_id: u64,
    pub task_id: Task,
}

/// A numerical problem reported by a worker while executing a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalError {
    /// Index of the offending argument (event or parameter, job-defined).
    pub arg_id: usize,
    pub message: String,
    /// The troublesome value, kept for diagnostics.
    pub value: f64,
}

/// What a worker ships back per task: the job-encoded payload plus any
/// numerical errors hit along the way.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub payload: Vec<u8>,
    pub eval_errors: Vec<EvalError>,
}

/// A parallelizable computation.
///
/// A job is registered with the [`JobManager`] before the fleet forks, so
/// every process holds its own cloned copy. Task execution happens on
/// workers against that copy; results flow back to the master copy through
/// `receive_task_result`, which must fold them associatively in the job's
/// canonical (ascending `task_id`) order.
pub trait Job: Any {
    /// The task ids of one submission, in enqueue order.
    fn partition(&self) -> Vec<Task>;

    /// Run one task on a worker against the local parameter shadow. Must be
    /// deterministic given that shadow.
    fn execute_task(&mut self, task: Task) -> Result<TaskOutcome>;

    /// Accept one task's outcome on the master. Called in ascending
    /// `task_id` order for all tasks of a submission.
    fn receive_task_result(&mut self, task: Task, outcome: TaskOutcome) -> Result<()>;

    /// Apply a parameter update to the local shadow (worker side, and the
    /// master's own copy for serial reference evaluations).
    fn update_parameter(&mut self, index: usize, value: f64, is_constant: bool);

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}
