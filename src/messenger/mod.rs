//! The fixed channel topology of the fleet.
//!
//! Master and queue share one push/pull channel pair per direction; the
//! queue holds another pair per worker. Every pair is created on the master
//! before forking, then each process keeps exactly the endpoints its role
//! owns and drops the rest.

mod messages;

pub use messages::{JobResultSet, ParameterUpdate, ResultBundle, TaskResult, M2Q, Q2M, Q2W, W2Q, X2X};

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{FleetError, Result};
use crate::process::ProcessManager;
use crate::transport::{Channel, Poller};

/// Every socket pair of the fleet, created before forking so all processes
/// inherit both ends.
pub struct FleetLinks {
    m2q: (Channel, Channel),
    q2m: (Channel, Channel),
    q2w: Vec<(Channel, Channel)>,
    w2q: Vec<(Channel, Channel)>,
}

impl FleetLinks {
    pub fn create(n_workers: usize) -> Result<Self> {
        let mut q2w = Vec::with_capacity(n_workers);
        let mut w2q = Vec::with_capacity(n_workers);
        for _ in 0..n_workers {
            q2w.push(Channel::pair()?);
            w2q.push(Channel::pair()?);
        }
        Ok(Self {
            m2q: Channel::pair()?,
            q2m: Channel::pair()?,
            q2w,
            w2q,
        })
    }
}

/// Role-specific view of the fleet topology with typed, route-checked verbs.
pub struct Messenger {
    // master: push → queue, pull ← queue; queue: push → master, pull ← master
    mq_push: Option<Channel>,
    mq_pull: Option<Channel>,
    // queue side, one per worker
    qw_push: Vec<Channel>,
    qw_pull: Vec<Channel>,
    // worker side
    this_worker_push: Option<Channel>,
    this_worker_pull: Option<Channel>,
    handshake_timeout: Duration,
}

impl Messenger {
    /// Keep the endpoints this process's role owns; drop (and thereby close
    /// in this process) everything else.
    pub fn new(
        process_manager: &ProcessManager,
        links: FleetLinks,
        handshake_timeout: Duration,
    ) -> Self {
        let FleetLinks { m2q, q2m, q2w, w2q } = links;
        let mut messenger = Self {
            mq_push: None,
            mq_pull: None,
            qw_push: Vec::new(),
            qw_pull: Vec::new(),
            this_worker_push: None,
            this_worker_pull: None,
            handshake_timeout,
        };

        if process_manager.is_master() {
            messenger.mq_push = Some(m2q.0);
            messenger.mq_pull = Some(q2m.1);
        } else if process_manager.is_queue() {
            messenger.mq_push = Some(q2m.0);
            messenger.mq_pull = Some(m2q.1);
            messenger.qw_push = q2w.into_iter().map(|pair| pair.0).collect();
            messenger.qw_pull = w2q.into_iter().map(|pair| pair.1).collect();
        } else if let Some(worker_id) = process_manager.worker_id() {
            for (ix, pair) in q2w.into_iter().enumerate() {
                if ix == worker_id {
                    messenger.this_worker_pull = Some(pair.1);
                }
            }
            for (ix, pair) in w2q.into_iter().enumerate() {
                if ix == worker_id {
                    messenger.this_worker_push = Some(pair.0);
                }
            }
        }
        messenger
    }

    fn endpoint<'a>(channel: &'a mut Option<Channel>, name: &'static str) -> Result<&'a mut Channel> {
        channel
            .as_mut()
            .ok_or_else(|| FleetError::Protocol(format!("no {} endpoint on this process", name)))
    }

    // -- master <-> queue --

    pub fn send_from_master_to_queue<T: Serialize>(&mut self, value: &T) -> Result<()> {
        Self::endpoint(&mut self.mq_push, "master→queue")?.send(value)
    }

    pub fn receive_from_queue_on_master<T: DeserializeOwned>(&mut self) -> Result<T> {
        Self::endpoint(&mut self.mq_pull, "queue→master")?.receive()
    }

    pub fn send_from_queue_to_master<T: Serialize>(&mut self, value: &T) -> Result<()> {
        Self::endpoint(&mut self.mq_push, "queue→master")?.send(value)
    }

    pub fn receive_from_master_on_queue<T: DeserializeOwned>(&mut self) -> Result<T> {
        Self::endpoint(&mut self.mq_pull, "master→queue")?.receive()
    }

    // -- queue <-> worker --

    pub fn send_from_queue_to_worker<T: Serialize>(
        &mut self,
        worker_id: usize,
        value: &T,
    ) -> Result<()> {
        self.qw_push
            .get_mut(worker_id)
            .ok_or(FleetError::WorkerDied(worker_id))?
            .send(value)
    }

    pub fn receive_from_worker_on_queue<T: DeserializeOwned>(
        &mut self,
        worker_id: usize,
    ) -> Result<T> {
        self.qw_pull
            .get_mut(worker_id)
            .ok_or(FleetError::WorkerDied(worker_id))?
            .receive()
    }

    pub fn send_from_worker_to_queue<T: Serialize>(&mut self, value: &T) -> Result<()> {
        Self::endpoint(&mut self.this_worker_push, "worker→queue")?.send(value)
    }

    pub fn receive_from_queue_on_worker<T: DeserializeOwned>(&mut self) -> Result<T> {
        Self::endpoint(&mut self.this_worker_pull, "queue→worker")?.receive()
    }

    // -- pollers --

    /// Poller over everything the queue process listens to. The master
    /// endpoint is registered first so control outranks data; workers follow
    /// in ascending id.
    pub fn queue_poller(&self) -> Result<(Poller, usize)> {
        let mut poller = Poller::new();
        let master_ix = poller.register(
            self.mq_pull
                .as_ref()
                .ok_or_else(|| FleetError::Protocol("queue poller needs the master pipe".into()))?,
        );
        for pull in &self.qw_pull {
            poller.register(pull);
        }
        Ok((poller, master_ix))
    }

    pub fn worker_poller(&self) -> Result<Poller> {
        let mut poller = Poller::new();
        poller.register(
            self.this_worker_pull
                .as_ref()
                .ok_or_else(|| FleetError::Protocol("worker poller needs the queue pipe".into()))?,
        );
        Ok(poller)
    }

    pub fn master_poller(&self) -> Result<Poller> {
        let mut poller = Poller::new();
        poller.register(
            self.mq_pull
                .as_ref()
                .ok_or_else(|| FleetError::Protocol("master poller needs the queue pipe".into()))?,
        );
        Ok(poller)
    }

    // -- handshake --

    /// Fixed ping/pong exchange proving every pipe readable and writable.
    ///
    /// Any receive that exceeds the handshake timeout fails the activation;
    /// steady-state operation never reuses these bounded receives.
    pub fn test_connections(&mut self, process_manager: &ProcessManager) -> Result<()> {
        let timeout = self.handshake_timeout;
        if process_manager.is_master() {
            self.send_from_master_to_queue(&X2X::Ping)?;
            expect(
                Self::endpoint(&mut self.mq_pull, "queue→master")?,
                X2X::Pong,
                timeout,
                "queue→master",
            )?;
            expect(
                Self::endpoint(&mut self.mq_pull, "queue→master")?,
                X2X::Ping,
                timeout,
                "queue→master",
            )?;
            self.send_from_master_to_queue(&X2X::Pong)?;
            tracing::debug!("master handshake complete");
        } else if process_manager.is_queue() {
            for worker_id in 0..self.qw_push.len() {
                self.send_from_queue_to_worker(worker_id, &X2X::Ping)?;
            }

            let master = Self::endpoint(&mut self.mq_pull, "master→queue")?;
            expect(master, X2X::Ping, timeout, "master→queue")?;
            self.send_from_queue_to_master(&X2X::Pong)?;
            self.send_from_queue_to_master(&X2X::Ping)?;
            let master = Self::endpoint(&mut self.mq_pull, "master→queue")?;
            expect(master, X2X::Pong, timeout, "master→queue")?;

            for worker_id in 0..self.qw_pull.len() {
                expect(&mut self.qw_pull[worker_id], X2X::Pong, timeout, "worker→queue")?;
                expect(&mut self.qw_pull[worker_id], X2X::Ping, timeout, "worker→queue")?;
                self.send_from_queue_to_worker(worker_id, &X2X::Pong)?;
            }
            tracing::debug!(n_workers = self.qw_push.len(), "queue handshake complete");
        } else {
            let pull = Self::endpoint(&mut self.this_worker_pull, "queue→worker")?;
            expect(pull, X2X::Ping, timeout, "queue→worker")?;
            self.send_from_worker_to_queue(&X2X::Pong)?;
            self.send_from_worker_to_queue(&X2X::Ping)?;
            let pull = Self::endpoint(&mut self.this_worker_pull, "queue→worker")?;
            expect(pull, X2X::Pong, timeout, "queue→worker")?;
            tracing::debug!(worker_id = ?process_manager.worker_id(), "worker handshake complete");
        }
        Ok(())
    }

    /// Switch this process's sending endpoints to non-blocking mode; called
    /// on the master once the handshake has passed.
    pub fn set_send_nonblocking(&mut self) -> Result<()> {
        if let Some(push) = self.mq_push.as_mut() {
            push.set_nonblocking()?;
        }
        Ok(())
    }

    /// Shut down every endpoint this process holds. Children call this right
    /// before their immediate process exit.
    pub fn close_all(&mut self) {
        for channel in self
            .mq_push
            .iter_mut()
            .chain(self.mq_pull.iter_mut())
            .chain(self.qw_push.iter_mut())
            .chain(self.qw_pull.iter_mut())
            .chain(self.this_worker_push.iter_mut())
            .chain(self.this_worker_pull.iter_mut())
        {
            channel.shutdown();
        }
    }
}

fn expect(
    channel: &mut Channel,
    expected: X2X,
    timeout: Duration,
    pipe: &'static str,
) -> Result<()> {
    match channel.receive_timeout::<X2X>(timeout)? {
        Some(value) if value == expected => Ok(()),
        Some(_) => Err(FleetError::HandshakeFailed(pipe)),
        None => Err(FleetError::HandshakeTimeout(pipe)),
    }
}
