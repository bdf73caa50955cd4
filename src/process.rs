use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use crate::error::Result;

/// Which member of the fleet this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Queue,
    Worker(usize),
}

static SIGTERM_RECEIVED: AtomicBool = AtomicBool::new(false);

extern "C" fn note_sigterm(_: nix::libc::c_int) {
    SIGTERM_RECEIVED.store(true, Ordering::Relaxed);
}

/// Forks the fleet and tracks each process's role.
///
/// The master forks the queue process first, then every worker, so the
/// master is the parent of all children and the only process that reaps
/// them. Children inherit the full cloned address space, including every
/// transport endpoint created before the fork.
pub struct ProcessManager {
    role: Role,
    n_workers: usize,
    queue_pid: Option<Pid>,
    worker_pids: Vec<Pid>,
}

impl ProcessManager {
    /// Fork one queue process and `n_workers` worker processes.
    ///
    /// Signal dispositions are installed before the first fork so every
    /// fleet member inherits them: SIGTERM sets a cooperative flag (polls
    /// wake with EINTR), SIGPIPE is ignored so writes to a dead peer
    /// surface as errors instead of killing the process.
    pub fn fork_fleet(n_workers: usize) -> Result<Self> {
        let term_action = SigAction::new(
            SigHandler::Handler(note_sigterm),
            SaFlags::empty(),
            SigSet::empty(),
        );
        let pipe_action = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        // Handler installation is unsafe because it replaces process-global
        // state; both handlers are async-signal-safe.
        unsafe {
            sigaction(Signal::SIGTERM, &term_action)?;
            sigaction(Signal::SIGPIPE, &pipe_action)?;
        }

        let mut role = Role::Master;
        let mut queue_pid = None;
        let mut worker_pids = Vec::with_capacity(n_workers);

        // Forking is unsafe in the presence of other threads; the engine
        // requires activation from a single-threaded context.
        match unsafe { fork() }? {
            ForkResult::Child => role = Role::Queue,
            ForkResult::Parent { child } => queue_pid = Some(child),
        }

        if role == Role::Master {
            for worker_id in 0..n_workers {
                match unsafe { fork() }? {
                    ForkResult::Child => {
                        role = Role::Worker(worker_id);
                        worker_pids.clear();
                        queue_pid = None;
                        break;
                    }
                    ForkResult::Parent { child } => worker_pids.push(child),
                }
            }
        }

        Ok(Self {
            role,
            n_workers,
            queue_pid,
            worker_pids,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_master(&self) -> bool {
        self.role == Role::Master
    }

    pub fn is_queue(&self) -> bool {
        self.role == Role::Queue
    }

    pub fn is_worker(&self) -> bool {
        matches!(self.role, Role::Worker(_))
    }

    pub fn worker_id(&self) -> Option<usize> {
        match self.role {
            Role::Worker(id) => Some(id),
            _ => None,
        }
    }

    /// Worker pids, master side only (empty elsewhere).
    pub fn worker_pids(&self) -> &[Pid] {
        &self.worker_pids
    }

    pub fn queue_pid(&self) -> Option<Pid> {
        self.queue_pid
    }

    /// True once a SIGTERM has been observed by this process.
    pub fn sigterm_received(&self) -> bool {
        SIGTERM_RECEIVED.load(Ordering::Relaxed)
    }

    /// Clear the SIGTERM flag after an orderly termination broadcast, so a
    /// later fleet in the same process starts clean.
    pub fn acknowledge_sigterm() {
        SIGTERM_RECEIVED.store(false, Ordering::Relaxed);
    }

    /// Log who everybody is; workers and the queue call this on startup.
    pub fn identify_process(&self) {
        let pid = nix::unistd::getpid();
        match self.role {
            Role::Master => tracing::debug!(%pid, n_workers = self.n_workers, "master process"),
            Role::Queue => tracing::debug!(%pid, "queue process"),
            Role::Worker(id) => tracing::debug!(%pid, worker_id = id, "worker process"),
        }
    }

    /// Reap every child, escalating to SIGKILL after the grace period.
    ///
    /// Only meaningful on the master. Returns once no child remains.
    pub fn wait_for_children(&mut self, grace: Duration) -> Result<()> {
        debug_assert!(self.is_master());
        let deadline = Instant::now() + grace;
        let mut pending: Vec<Pid> = self
            .queue_pid
            .take()
            .into_iter()
            .chain(self.worker_pids.drain(..))
            .collect();

        while !pending.is_empty() {
            pending.retain(|&pid| {
                !matches!(
                    waitpid(pid, Some(WaitPidFlag::WNOHANG)),
                    Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) | Err(_)
                )
            });
            if pending.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                for &pid in &pending {
                    tracing::warn!(%pid, "child missed the termination grace period, killing");
                    let _ = kill(pid, Signal::SIGKILL);
                }
                for &pid in &pending {
                    let _ = waitpid(pid, None);
                }
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }
}
