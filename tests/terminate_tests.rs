//! Cooperative SIGTERM handling: a signal arriving mid-retrieve wakes the
//! master, triggers the TERMINATE broadcast, and every child is gone within
//! the grace period.

mod common;

use std::any::Any;
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use fitfleet::{EngineConfig, FleetError, Job, JobManager, Result, Task, TaskOutcome};

use common::{fleet_lock, init_tracing, process_alive};

/// Tasks that take real wall-clock time, so retrieve has to wait.
struct SlowJob {
    n_tasks: usize,
    delay: Duration,
}

impl Job for SlowJob {
    fn partition(&self) -> Vec<Task> {
        (0..self.n_tasks as Task).collect()
    }

    fn execute_task(&mut self, _task: Task) -> Result<TaskOutcome> {
        thread::sleep(self.delay);
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
fn sigterm_during_retrieve_terminates_the_fleet() {
    let _guard = fleet_lock();
    init_tracing();

    let manager = JobManager::new(EngineConfig::new(2));
    let job_id = manager
        .borrow_mut()
        .register(Box::new(SlowJob {
            n_tasks: 40,
            delay: Duration::from_millis(50),
        }))
        .unwrap();
    manager.borrow_mut().activate().unwrap();
    let pids = manager.borrow().worker_pids();
    assert_eq!(pids.len(), 2);

    manager.borrow_mut().submit(job_id).unwrap();

    // signal the master while it is stuck waiting for results
    let master_pid = std::process::id() as i32;
    let killer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        kill(Pid::from_raw(master_pid), Signal::SIGTERM).expect("deliver SIGTERM");
    });

    let err = manager.borrow_mut().retrieve().unwrap_err();
    assert!(matches!(err, FleetError::Terminated), "got {:?}", err);
    killer.join().unwrap();

    // the grace period bounds how long children may linger
    let deadline = Instant::now() + Duration::from_secs(5);
    while pids.iter().any(|&pid| process_alive(pid)) {
        assert!(Instant::now() < deadline, "workers survived the grace period");
        thread::sleep(Duration::from_millis(10));
    }
}
