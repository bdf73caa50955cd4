//! Fleet lifecycle rules: registration closes at activation, and teardown
//! leaves no child process behind.

mod common;

use std::any::Any;

use fitfleet::{
    EngineConfig, FleetError, Job, JobManager, ParallelLikelihood, PartitionedLikelihood, Result,
    Task, TaskOutcome,
};

use common::{fleet_lock, gaussian_dataset, init_tracing, process_alive, GaussianModel};

/// A job that does nothing but exist.
struct NoopJob;

impl Job for NoopJob {
    fn partition(&self) -> Vec<Task> {
        vec![0]
    }

    fn execute_task(&mut self, _task: Task) -> Result<TaskOutcome> {
        Ok(TaskOutcome::default())
    }

    fn receive_task_result(&mut self, _task: Task, _outcome: TaskOutcome) -> Result<()> {
        Ok(())
    }

    fn update_parameter(&mut self, _index: usize, _value: f64, _is_constant: bool) {}

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[test]
fn registering_after_activation_is_a_configuration_error() {
    let _guard = fleet_lock();
    init_tracing();

    let manager = JobManager::new(EngineConfig::new(1));
    manager.borrow_mut().register(Box::new(NoopJob)).unwrap();
    manager.borrow_mut().activate().unwrap();

    let err = manager
        .borrow_mut()
        .register(Box::new(NoopJob))
        .unwrap_err();
    assert!(matches!(err, FleetError::Config(_)), "got {:?}", err);
}

#[test]
fn activating_twice_is_a_configuration_error() {
    let _guard = fleet_lock();
    init_tracing();

    let manager = JobManager::new(EngineConfig::new(1));
    manager.borrow_mut().register(Box::new(NoopJob)).unwrap();
    manager.borrow_mut().activate().unwrap();

    let err = manager.borrow_mut().activate().unwrap_err();
    assert!(matches!(err, FleetError::Config(_)), "got {:?}", err);
}

#[test]
fn retrieve_without_a_submission_is_rejected() {
    let _guard = fleet_lock();
    init_tracing();

    let manager = JobManager::new(EngineConfig::new(1));
    manager.borrow_mut().register(Box::new(NoopJob)).unwrap();
    manager.borrow_mut().activate().unwrap();

    let err = manager.borrow_mut().retrieve().unwrap_err();
    assert!(matches!(err, FleetError::Protocol(_)), "got {:?}", err);
}

#[test]
fn dropping_the_manager_reaps_every_child() {
    let _guard = fleet_lock();
    init_tracing();

    let manager = JobManager::new(EngineConfig::new(3));
    manager.borrow_mut().register(Box::new(NoopJob)).unwrap();
    manager.borrow_mut().activate().unwrap();

    let pids = manager.borrow().worker_pids();
    assert_eq!(pids.len(), 3);
    assert!(pids.iter().all(|&pid| process_alive(pid)));

    drop(manager);
    assert!(pids.iter().all(|&pid| !process_alive(pid)));
}

#[test]
fn destroying_the_last_job_tears_the_fleet_down() {
    let _guard = fleet_lock();
    init_tracing();

    let manager = JobManager::new(EngineConfig::new(2));
    let config = manager.borrow().config().clone();
    let objective = GaussianModel::new(gaussian_dataset(7, 500), 0.0, 1.0);
    let nll =
        ParallelLikelihood::new(&manager, PartitionedLikelihood::from_config(objective, &config))
            .unwrap();

    let value = nll.evaluate().unwrap();
    assert!(value.is_finite());

    let pids = manager.borrow().worker_pids();
    assert_eq!(pids.len(), 2);
    assert!(pids.iter().all(|&pid| process_alive(pid)));

    // dropping the last job deregisters it and the fleet follows
    drop(nll);
    assert!(pids.iter().all(|&pid| !process_alive(pid)));

    // the manager handle survives, merely terminated
    assert!(!manager.borrow().is_activated());
}
