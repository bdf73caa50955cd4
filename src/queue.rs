use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::job::{JobTask, Task, TaskOutcome};
use crate::messenger::{JobResultSet, ResultBundle};

/// Task FIFO and result buffer living on the queue process.
///
/// Tracks how many tasks were received and completed since the last drain,
/// which workers are idle, and every job's returned outcomes keyed by task
/// id so a drain ships them in canonical order.
#[derive(Default)]
pub struct Queue {
    tasks: VecDeque<JobTask>,
    idle_workers: BTreeSet<usize>,
    n_tasks: usize,
    n_tasks_completed: usize,
    results: BTreeMap<u64, BTreeMap<Task, TaskOutcome>>,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_from_master(&mut self, job_task: JobTask) {
        self.tasks.push_back(job_task);
        self.n_tasks += 1;
    }

    pub fn pop_for_worker(&mut self) -> Option<JobTask> {
        self.tasks.pop_front()
    }

    pub fn size(&self) -> usize {
        self.tasks.len()
    }

    /// Lowest idle worker id, removed from the idle set.
    pub fn take_idle_worker(&mut self) -> Option<usize> {
        let worker_id = self.idle_workers.iter().next().copied()?;
        self.idle_workers.remove(&worker_id);
        Some(worker_id)
    }

    pub fn mark_idle(&mut self, worker_id: usize) {
        self.idle_workers.insert(worker_id);
    }

    pub fn store_result(&mut self, job_task: JobTask, outcome: TaskOutcome) {
        self.results
            .entry(job_task.job_id)
            .or_default()
            .insert(job_task.task_id, outcome);
        self.n_tasks_completed += 1;
    }

    /// Whether any tasks were submitted since the last drain.
    pub fn has_received_tasks(&self) -> bool {
        self.n_tasks > 0
    }

    pub fn all_tasks_completed(&self) -> bool {
        self.n_tasks > 0 && self.n_tasks_completed == self.n_tasks
    }

    /// Ship every buffered result and reset the submission counters.
    pub fn drain_results(&mut self) -> ResultBundle {
        self.n_tasks = 0;
        self.n_tasks_completed = 0;
        let jobs = std::mem::take(&mut self.results)
            .into_iter()
            .map(|(job_id, results)| JobResultSet {
                job_id,
                results: results.into_iter().collect(),
            })
            .collect();
        ResultBundle { jobs }
    }
}
