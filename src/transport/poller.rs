use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::time::Duration;

use nix::poll::{ppoll, PollFd, PollFlags};
use nix::sys::time::TimeSpec;

use crate::error::{FleetError, Result};

/// Readiness multiplexer over a set of channel endpoints.
///
/// Registration order is the service order: `poll` reports ready endpoints
/// lowest-index first, which gives the queue loop its deterministic
/// master-first, then-ascending-worker servicing.
pub struct Poller {
    fds: Vec<RawFd>,
}

impl Poller {
    pub fn new() -> Self {
        Self { fds: Vec::new() }
    }

    pub fn register(&mut self, endpoint: &impl AsRawFd) -> usize {
        self.fds.push(endpoint.as_raw_fd());
        self.fds.len() - 1
    }

    pub fn unregister(&mut self, endpoint: &impl AsRawFd) {
        let fd = endpoint.as_raw_fd();
        self.fds.retain(|&registered| registered != fd);
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Wait until at least one endpoint is readable (or hung up, so that
    /// peer death is observed as readiness followed by an EOF read).
    ///
    /// `None` waits indefinitely. A signal delivery surfaces as
    /// [`FleetError::Interrupted`] so callers can re-check their termination
    /// flag instead of sleeping through it.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<Vec<usize>> {
        let timeout = timeout.map(TimeSpec::from_duration);
        let mut poll_fds: Vec<PollFd> = self
            .fds
            .iter()
            // Fds are borrowed from channels the caller keeps alive for the
            // duration of the call.
            .map(|&fd| PollFd::new(unsafe { BorrowedFd::borrow_raw(fd) }, PollFlags::POLLIN))
            .collect();

        match ppoll(&mut poll_fds, timeout, None) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => return Err(FleetError::Interrupted),
            Err(e) => return Err(e.into()),
        }

        let ready = poll_fds
            .iter()
            .enumerate()
            .filter(|(_, fd)| {
                fd.revents().is_some_and(|r| {
                    r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
                })
            })
            .map(|(ix, _)| ix)
            .collect();
        Ok(ready)
    }
}

impl Default for Poller {
    fn default() -> Self {
        Self::new()
    }
}
