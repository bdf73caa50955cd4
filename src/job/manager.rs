use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::config::EngineConfig;
use crate::error::{FleetError, Result};
use crate::job::{Job, JobTask, Task};
use crate::messenger::{
    FleetLinks, Messenger, ParameterUpdate, ResultBundle, TaskResult, M2Q, Q2M, Q2W, W2Q,
};
use crate::process::{ProcessManager, Role};
use crate::queue::Queue;

/// Shared handle through which jobs and minimizer wrappers reach the one
/// JobManager of their fleet.
pub type ManagerHandle = Rc<RefCell<JobManager>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Uninitialized,
    Activated,
    Terminated,
}

/// Registry of jobs plus the role-dispatched control loops.
///
/// Exactly one JobManager exists per master process for the lifetime of its
/// jobs. All jobs must be registered before [`JobManager::activate`], which
/// forks the fleet; after the fork every process owns a cloned copy of the
/// registry, and the role decides which loop runs against it.
pub struct JobManager {
    config: EngineConfig,
    jobs: BTreeMap<u64, Box<dyn Job>>,
    next_job_id: u64,
    state: State,
    process_manager: Option<ProcessManager>,
    messenger: Option<Messenger>,
    queue: Queue,
}

impl JobManager {
    pub fn new(config: EngineConfig) -> ManagerHandle {
        Rc::new(RefCell::new(Self {
            config,
            jobs: BTreeMap::new(),
            next_job_id: 0,
            state: State::Uninitialized,
            process_manager: None,
            messenger: None,
            queue: Queue::new(),
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_activated(&self) -> bool {
        self.state == State::Activated
    }

    /// Register a job; ids are assigned monotonically. Registration after
    /// the fleet has forked is a configuration error.
    pub fn register(&mut self, job: Box<dyn Job>) -> Result<u64> {
        if self.state != State::Uninitialized {
            return Err(FleetError::Config(
                "cannot register a job: forking has already taken place".into(),
            ));
        }
        let job_id = self.next_job_id;
        self.next_job_id += 1;
        self.jobs.insert(job_id, job);
        Ok(job_id)
    }

    /// Drop a job from the registry (master side, after its results are no
    /// longer needed). Once the last job is gone the fleet has nothing left
    /// to compute and is torn down.
    pub fn deregister(&mut self, job_id: u64) -> bool {
        let removed = self.jobs.remove(&job_id).is_some();
        if removed && self.jobs.is_empty() {
            self.terminate();
        }
        removed
    }

    /// Fork the fleet and dispatch control by role.
    ///
    /// On the master this establishes the channels, runs the connection
    /// test, and returns. The queue and worker processes run their loops and
    /// then leave through an immediate process exit, never unwinding the
    /// master's cloned state.
    pub fn activate(&mut self) -> Result<()> {
        if self.state != State::Uninitialized {
            return Err(FleetError::Config("fleet is already activated".into()));
        }
        if self.config.n_workers == 0 {
            return Err(FleetError::Config("need at least one worker".into()));
        }

        let links = FleetLinks::create(self.config.n_workers)?;
        let process_manager = ProcessManager::fork_fleet(self.config.n_workers)?;
        process_manager.identify_process();
        let mut messenger = Messenger::new(
            &process_manager,
            links,
            self.config.handshake_timeout,
        );
        let handshake = messenger.test_connections(&process_manager);
        let role = process_manager.role();

        match role {
            Role::Master => {
                handshake?;
                if self.config.send_nonblocking {
                    messenger.set_send_nonblocking()?;
                }
                self.process_manager = Some(process_manager);
                self.messenger = Some(messenger);
                self.state = State::Activated;
                tracing::info!(n_workers = self.config.n_workers, "fleet activated");
                Ok(())
            }
            Role::Queue | Role::Worker(_) => {
                self.process_manager = Some(process_manager);
                self.messenger = Some(messenger);
                self.state = State::Activated;
                let outcome = handshake.and_then(|_| match role {
                    Role::Queue => self.queue_loop(),
                    _ => self.worker_loop(),
                });
                let code = match outcome {
                    Ok(()) => 0,
                    Err(e) => {
                        tracing::error!(role = ?role, error = %e, "fleet child failed");
                        1
                    }
                };
                if let Some(messenger) = self.messenger.as_mut() {
                    messenger.close_all();
                }
                // The child cloned the master's memory graph; none of it may
                // be torn down here, so leave without running destructors.
                std::process::exit(code);
            }
        }
    }

    // ---------------------------------------------------------------- master

    /// Enqueue every task of one job submission, in partition order.
    pub fn submit(&mut self, job_id: u64) -> Result<()> {
        self.expect_master("submit")?;
        let tasks = self
            .jobs
            .get(&job_id)
            .ok_or_else(|| FleetError::Protocol(format!("unknown job {}", job_id)))?
            .partition();
        let messenger = self.messenger_mut()?;
        for task_id in tasks {
            messenger.send_from_master_to_queue(&M2Q::Enqueue)?;
            messenger.send_from_master_to_queue(&JobTask { job_id, task_id })?;
        }
        Ok(())
    }

    /// The master-side retrieve handshake: spin on `RETRIEVE` until the
    /// queue accepts, then hand every job its buffered results in ascending
    /// task order.
    pub fn retrieve(&mut self) -> Result<()> {
        self.expect_master("retrieve")?;
        loop {
            if self.sigterm_received() {
                self.terminate();
                return Err(FleetError::Terminated);
            }
            let messenger = self.messenger_mut()?;
            messenger.send_from_master_to_queue(&M2Q::Retrieve)?;

            let poller = messenger.master_poller()?;
            loop {
                match poller.poll(None) {
                    Err(FleetError::Interrupted) => {
                        if self.sigterm_received() {
                            self.terminate();
                            return Err(FleetError::Terminated);
                        }
                    }
                    Err(e) => return Err(e),
                    Ok(ready) if ready.is_empty() => continue,
                    Ok(_) => break,
                }
            }

            let messenger = self.messenger_mut()?;
            let reply: Q2M = messenger.receive_from_queue_on_master()?;
            tracing::trace!(reply = %reply, "retrieve handshake");
            match reply {
                Q2M::RetrieveLater => continue,
                Q2M::RetrieveRejected => {
                    return Err(FleetError::Protocol(
                        "queue rejected retrieve: no tasks were submitted".into(),
                    ))
                }
                Q2M::RetrieveAccepted => {
                    let bundle: ResultBundle = messenger.receive_from_queue_on_master()?;
                    tracing::debug!(n_jobs = bundle.jobs.len(), "retrieve accepted");
                    for set in bundle.jobs {
                        let job = self.jobs.get_mut(&set.job_id).ok_or_else(|| {
                            FleetError::Protocol(format!("results for unknown job {}", set.job_id))
                        })?;
                        for (task_id, outcome) in set.results {
                            job.receive_task_result(task_id, outcome)?;
                        }
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Mutate one parameter of one job: the master's own copy immediately,
    /// every worker shadow through an `UPDATE_REAL` broadcast.
    pub fn update_parameter(
        &mut self,
        job_id: u64,
        index: usize,
        value: f64,
        is_constant: bool,
    ) -> Result<()> {
        if let Some(job) = self.jobs.get_mut(&job_id) {
            job.update_parameter(index, value, is_constant);
        }
        if self.state == State::Activated && self.is_master() {
            let messenger = self.messenger_mut()?;
            messenger.send_from_master_to_queue(&M2Q::UpdateReal)?;
            messenger.send_from_master_to_queue(&ParameterUpdate {
                job_id,
                index,
                value,
                is_constant,
            })?;
        }
        Ok(())
    }

    /// Orderly teardown: broadcast `TERMINATE`, reap every child within the
    /// grace period.
    pub fn terminate(&mut self) {
        if self.state != State::Activated || !self.is_master() {
            return;
        }
        tracing::info!("terminating fleet");
        if let Some(messenger) = self.messenger.as_mut() {
            let _ = messenger.send_from_master_to_queue(&M2Q::Terminate);
        }
        let grace = self.config.termination_grace;
        if let Some(process_manager) = self.process_manager.as_mut() {
            if let Some(queue_pid) = process_manager.queue_pid() {
                tracing::debug!(
                    %queue_pid,
                    n_workers = process_manager.worker_pids().len(),
                    "reaping fleet children"
                );
            }
            let _ = process_manager.wait_for_children(grace);
        }
        if let Some(messenger) = self.messenger.as_mut() {
            messenger.close_all();
        }
        self.state = State::Terminated;
        ProcessManager::acknowledge_sigterm();
    }

    /// Borrow a registered job as its concrete type.
    pub fn with_job_mut<J: Job, R>(
        &mut self,
        job_id: u64,
        f: impl FnOnce(&mut J) -> R,
    ) -> Result<R> {
        let job = self
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| FleetError::Protocol(format!("unknown job {}", job_id)))?;
        let job = job
            .as_any_mut()
            .downcast_mut::<J>()
            .ok_or_else(|| FleetError::Protocol(format!("job {} has another type", job_id)))?;
        Ok(f(job))
    }

    pub fn with_job<J: Job, R>(&self, job_id: u64, f: impl FnOnce(&J) -> R) -> Result<R> {
        let job = self
            .jobs
            .get(&job_id)
            .ok_or_else(|| FleetError::Protocol(format!("unknown job {}", job_id)))?;
        let job = job
            .as_any()
            .downcast_ref::<J>()
            .ok_or_else(|| FleetError::Protocol(format!("job {} has another type", job_id)))?;
        Ok(f(job))
    }

    /// Worker pids of the fleet; master side, for teardown assertions.
    pub fn worker_pids(&self) -> Vec<i32> {
        self.process_manager
            .as_ref()
            .map(|pm| pm.worker_pids().iter().map(|pid| pid.as_raw()).collect())
            .unwrap_or_default()
    }

    // ----------------------------------------------------------------- queue

    /// Main routine of the queue process.
    fn queue_loop(&mut self) -> Result<()> {
        debug_assert!(self
            .process_manager
            .as_ref()
            .is_some_and(|pm| pm.is_queue()));
        let n_workers = self.config.n_workers;
        let (poller, master_ix) = self.messenger_ref()?.queue_poller()?;

        'serve: loop {
            if self.sigterm_received() {
                break 'serve;
            }
            let ready = match poller.poll(None) {
                Err(FleetError::Interrupted) => continue,
                other => other?,
            };
            for ix in ready {
                if ix == master_ix {
                    if !self.serve_master()? {
                        break 'serve;
                    }
                } else if !self.serve_worker(ix - 1)? {
                    break 'serve;
                }
            }
        }

        self.release_workers(n_workers);
        Ok(())
    }

    /// Handle one master verb on the queue. Returns false on termination.
    fn serve_master(&mut self) -> Result<bool> {
        let verb: M2Q = match self.messenger_mut()?.receive_from_master_on_queue() {
            Err(FleetError::PeerClosed) => {
                tracing::warn!("master pipe closed, terminating queue");
                return Ok(false);
            }
            other => other?,
        };
        tracing::trace!(verb = %verb, "serving master");
        match verb {
            M2Q::Terminate => Ok(false),
            M2Q::Enqueue => {
                let job_task: JobTask = self.messenger_mut()?.receive_from_master_on_queue()?;
                self.queue.push_from_master(job_task);
                self.dispatch_to_idle()?;
                Ok(true)
            }
            M2Q::Retrieve => {
                let has_tasks = self.queue.has_received_tasks();
                let all_done = self.queue.all_tasks_completed();
                if !has_tasks {
                    self.messenger_mut()?
                        .send_from_queue_to_master(&Q2M::RetrieveRejected)?;
                } else if !all_done {
                    self.messenger_mut()?
                        .send_from_queue_to_master(&Q2M::RetrieveLater)?;
                } else {
                    let bundle = self.queue.drain_results();
                    let messenger = self.messenger_mut()?;
                    messenger.send_from_queue_to_master(&Q2M::RetrieveAccepted)?;
                    messenger.send_from_queue_to_master(&bundle)?;
                }
                Ok(true)
            }
            M2Q::UpdateReal => {
                let update: ParameterUpdate =
                    self.messenger_mut()?.receive_from_master_on_queue()?;
                let n_workers = self.config.n_workers;
                let messenger = self.messenger_mut()?;
                for worker_id in 0..n_workers {
                    messenger.send_from_queue_to_worker(worker_id, &Q2W::UpdateReal)?;
                    messenger.send_from_queue_to_worker(worker_id, &update)?;
                }
                Ok(true)
            }
        }
    }

    /// Handle one worker verb on the queue. Returns false when a dead
    /// worker forces the fleet down.
    fn serve_worker(&mut self, worker_id: usize) -> Result<bool> {
        let verb: W2Q = match self.messenger_mut()?.receive_from_worker_on_queue(worker_id) {
            Err(FleetError::PeerClosed) => {
                // No task re-execution: a lost worker ends the minimization.
                tracing::error!(worker_id, "worker died, escalating to master");
                let _ = self
                    .messenger_mut()?
                    .send_from_queue_to_master(&Q2M::RetrieveRejected);
                return Ok(false);
            }
            other => other?,
        };
        tracing::trace!(worker_id, verb = %verb, "serving worker");
        match verb {
            W2Q::Dequeue => {
                if let Some(job_task) = self.queue.pop_for_worker() {
                    let messenger = self.messenger_mut()?;
                    messenger.send_from_queue_to_worker(worker_id, &Q2W::DequeueAccepted)?;
                    messenger.send_from_queue_to_worker(worker_id, &job_task)?;
                } else {
                    self.messenger_mut()?
                        .send_from_queue_to_worker(worker_id, &Q2W::DequeueRejected)?;
                    self.queue.mark_idle(worker_id);
                }
                Ok(true)
            }
            W2Q::SendResult => {
                let result: TaskResult =
                    self.messenger_mut()?.receive_from_worker_on_queue(worker_id)?;
                self.queue.store_result(result.job_task, result.outcome);
                self.messenger_mut()?
                    .send_from_queue_to_worker(worker_id, &Q2W::ResultReceived)?;
                Ok(true)
            }
        }
    }

    /// Wake idle workers with unsolicited accepts while tasks are waiting.
    fn dispatch_to_idle(&mut self) -> Result<()> {
        while self.queue.size() > 0 {
            let Some(worker_id) = self.queue.take_idle_worker() else {
                break;
            };
            if let Some(job_task) = self.queue.pop_for_worker() {
                let messenger = self.messenger_mut()?;
                messenger.send_from_queue_to_worker(worker_id, &Q2W::DequeueAccepted)?;
                messenger.send_from_queue_to_worker(worker_id, &job_task)?;
            }
        }
        Ok(())
    }

    /// Forward `TERMINATE` to every worker and stay alive just long enough
    /// to drain their in-flight messages, so no worker ever writes into a
    /// closed pipe. Returns once every worker pipe reports EOF.
    fn release_workers(&mut self, n_workers: usize) {
        let Ok(messenger) = self.messenger_mut() else {
            return;
        };
        for worker_id in 0..n_workers {
            let _ = messenger.send_from_queue_to_worker(worker_id, &Q2W::Terminate);
        }
        for worker_id in 0..n_workers {
            loop {
                match messenger.receive_from_worker_on_queue::<W2Q>(worker_id) {
                    Ok(W2Q::SendResult) => {
                        if messenger
                            .receive_from_worker_on_queue::<TaskResult>(worker_id)
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(W2Q::Dequeue) => {}
                    Err(_) => break,
                }
            }
        }
        tracing::debug!("all workers released");
    }

    // ---------------------------------------------------------------- worker

    /// Main routine of a worker process.
    fn worker_loop(&mut self) -> Result<()> {
        debug_assert!(self
            .process_manager
            .as_ref()
            .is_some_and(|pm| pm.is_worker()));
        let poller = self.messenger_ref()?.worker_poller()?;
        self.messenger_mut()?.send_from_worker_to_queue(&W2Q::Dequeue)?;

        loop {
            match poller.poll(None) {
                Err(FleetError::Interrupted) => continue,
                other => {
                    other?;
                }
            }
            let verb: Q2W = match self.messenger_mut()?.receive_from_queue_on_worker() {
                Err(FleetError::PeerClosed) => {
                    tracing::warn!("queue pipe closed, worker exiting");
                    break;
                }
                other => other?,
            };
            tracing::trace!(verb = %verb, "worker received");
            match verb {
                Q2W::Terminate => break,
                Q2W::UpdateReal => {
                    let update: ParameterUpdate =
                        self.messenger_mut()?.receive_from_queue_on_worker()?;
                    if let Some(job) = self.jobs.get_mut(&update.job_id) {
                        job.update_parameter(update.index, update.value, update.is_constant);
                    }
                }
                Q2W::DequeueAccepted => {
                    let job_task: JobTask =
                        self.messenger_mut()?.receive_from_queue_on_worker()?;
                    let outcome = self.execute_local(job_task.job_id, job_task.task_id)?;
                    let messenger = self.messenger_mut()?;
                    messenger.send_from_worker_to_queue(&W2Q::SendResult)?;
                    messenger.send_from_worker_to_queue(&TaskResult { job_task, outcome })?;
                }
                Q2W::DequeueRejected => {
                    // Nothing queued; stay parked in the poller until the
                    // queue pushes work or terminates.
                }
                Q2W::ResultReceived => {
                    self.messenger_mut()?.send_from_worker_to_queue(&W2Q::Dequeue)?;
                }
            }
        }
        Ok(())
    }

    fn execute_local(&mut self, job_id: u64, task_id: Task) -> Result<crate::job::TaskOutcome> {
        self.jobs
            .get_mut(&job_id)
            .ok_or_else(|| FleetError::Protocol(format!("task for unknown job {}", job_id)))?
            .execute_task(task_id)
    }

    // --------------------------------------------------------------- helpers

    fn is_master(&self) -> bool {
        self.process_manager
            .as_ref()
            .map(|pm| pm.is_master())
            .unwrap_or(true)
    }

    fn sigterm_received(&self) -> bool {
        self.process_manager
            .as_ref()
            .map(|pm| pm.sigterm_received())
            .unwrap_or(false)
    }

    fn expect_master(&self, what: &str) -> Result<()> {
        if self.state != State::Activated {
            return Err(FleetError::Config(format!(
                "{} requires an activated fleet",
                what
            )));
        }
        if !self.is_master() {
            return Err(FleetError::Protocol(format!("{} is master-only", what)));
        }
        Ok(())
    }

    fn messenger_mut(&mut self) -> Result<&mut Messenger> {
        self.messenger
            .as_mut()
            .ok_or_else(|| FleetError::Config("fleet is not activated".into()))
    }

    fn messenger_ref(&self) -> Result<&Messenger> {
        self.messenger
            .as_ref()
            .ok_or_else(|| FleetError::Config("fleet is not activated".into()))
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        self.terminate();
    }
}
