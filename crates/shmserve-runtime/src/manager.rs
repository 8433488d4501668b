//! The slot pool manager.
//!
//! One thread owns the free list and processes commands one at a time, in
//! the order they arrive on its channel. Control peers reach it through
//! [`ControlServer`]; in-process callers use a [`ManagerHandle`] directly.

use std::collections::VecDeque;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use shmserve_ipc::{
    as_slices, ControlReply, ControlRequest, Deadline, PoolStats, RepChannel, SlotGrant,
};
use shmserve_shm::{Arena, ArenaLayout, ShmError, SlotId, SlotOwner};
use tracing::{debug, error, info, warn};

use crate::{RuntimeConfig, SlotTable};

pub enum ManagerCommand {
    Acquire {
        client_id: String,
        deadline: Deadline,
        reply: Sender<ControlReply>,
    },
    Release {
        grant: SlotGrant,
        reply: Sender<ControlReply>,
    },
    /// The grant never reached its client.
    Abandon(SlotGrant),
    Stats {
        reply: Sender<ControlReply>,
    },
    Shutdown,
}

struct Waiter {
    client_id: String,
    deadline: Deadline,
    reply: Sender<ControlReply>,
}

pub struct SlotManager {
    arena: Arena,
    table: SlotTable,
    waiters: VecDeque<Waiter>,
    rx: Receiver<ManagerCommand>,
    sweep_interval: Duration,
    next_sweep: Instant,
}

#[derive(Clone)]
pub struct ManagerHandle {
    tx: Sender<ManagerCommand>,
}

impl ManagerHandle {
    /// Runs one control request and blocks for its reply.
    pub fn call(&self, request: ControlRequest) -> Result<ControlReply> {
        let (reply, rx) = crossbeam_channel::bounded(1);
        let command = match request {
            ControlRequest::Acquire { client_id, wait } => ManagerCommand::Acquire {
                client_id,
                deadline: Deadline::after(wait),
                reply,
            },
            ControlRequest::Release(grant) => ManagerCommand::Release { grant, reply },
            ControlRequest::Stats => ManagerCommand::Stats { reply },
        };
        self.send(command)?;
        rx.recv().map_err(|_| anyhow!("slot pool manager stopped"))
    }

    pub fn abandon(&self, grant: SlotGrant) -> Result<()> {
        self.send(ManagerCommand::Abandon(grant))
    }

    pub fn stats(&self) -> Result<PoolStats> {
        match self.call(ControlRequest::Stats)? {
            ControlReply::Stats(stats) => Ok(stats),
            other => Err(anyhow!("unexpected stats reply {other:?}")),
        }
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(ManagerCommand::Shutdown)
    }

    fn send(&self, command: ManagerCommand) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| anyhow!("slot pool manager stopped"))
    }
}

impl SlotManager {
    pub fn new(arena: Arena, lease_ttl: Duration, sweep_interval: Duration) -> (Self, ManagerHandle) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let table = SlotTable::new(arena.layout().slots, lease_ttl);
        let manager = Self {
            arena,
            table,
            waiters: VecDeque::new(),
            rx,
            sweep_interval,
            next_sweep: Instant::now() + sweep_interval,
        };
        (manager, ManagerHandle { tx })
    }

    /// Creates the arena, binds the control socket and starts both threads.
    pub fn spawn(config: &RuntimeConfig, layout: ArenaLayout) -> Result<RunningManager> {
        let arena = Arena::create(&config.shm_dir, layout).with_context(|| {
            format!("allocating shared buffer arena in {}", config.shm_dir.display())
        })?;
        let (manager, handle) = Self::new(arena, config.lease_ttl(), config.sweep_interval());
        let server = ControlServer::bind(&config.sockets().control(), handle.clone())?;

        let join = thread::Builder::new()
            .name("slot-manager".into())
            .spawn(move || manager.run())
            .context("spawning slot manager")?;
        thread::Builder::new()
            .name("control-accept".into())
            .spawn(move || {
                if let Err(e) = server.run() {
                    error!(error = ?e, "control server exited");
                }
            })
            .context("spawning control server")?;
        Ok(RunningManager { handle, join })
    }

    pub fn run(mut self) {
        info!(
            slots = self.table.capacity(),
            dir = %self.arena.dir().display(),
            "slot pool manager started"
        );
        loop {
            let wait = self.next_wakeup().saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(wait) {
                Ok(ManagerCommand::Shutdown) => break,
                Ok(command) => self.handle(command),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.expire_waiters();
            let now = Instant::now();
            if now >= self.next_sweep {
                self.sweep(now);
                self.next_sweep = now + self.sweep_interval;
            }
        }
        for waiter in self.waiters.drain(..) {
            let _ = waiter.reply.send(ControlReply::Busy);
        }
        info!("slot pool manager stopped");
    }

    fn next_wakeup(&self) -> Instant {
        self.waiters
            .iter()
            .map(|w| w.deadline.instant())
            .fold(self.next_sweep, Instant::min)
    }

    fn handle(&mut self, command: ManagerCommand) {
        match command {
            ManagerCommand::Acquire {
                client_id,
                deadline,
                reply,
            } => self.acquire(client_id, deadline, reply),
            ManagerCommand::Release { grant, reply } => {
                let _ = reply.send(self.release(grant));
            }
            ManagerCommand::Abandon(grant) => {
                self.abandon(grant);
                self.serve_waiters();
            }
            ManagerCommand::Stats { reply } => {
                let _ = reply.send(ControlReply::Stats(self.stats()));
            }
            ManagerCommand::Shutdown => {}
        }
    }

    fn acquire(&mut self, client_id: String, deadline: Deadline, reply: Sender<ControlReply>) {
        // Queued waiters go first; a newcomer never overtakes them.
        if self.waiters.is_empty() {
            if let Some(grant) = self.try_grant(&client_id) {
                self.deliver(grant, &reply);
                return;
            }
        }
        if deadline.is_expired() {
            let _ = reply.send(ControlReply::Busy);
            return;
        }
        debug!(client_id, waiting = self.waiters.len() + 1, "pool exhausted, acquire queued");
        self.waiters.push_back(Waiter {
            client_id,
            deadline,
            reply,
        });
    }

    fn release(&mut self, grant: SlotGrant) -> ControlReply {
        if let Err(e) = self.table.lease_of(grant) {
            warn!(slot = %grant.slot, generation = grant.generation, error = %e, "release rejected");
            return ControlReply::Nack(e.to_string());
        }
        if let Err(e) = self.arena.meta().release(grant.slot, grant.generation) {
            warn!(slot = %grant.slot, error = %e, "release of a slot its handler does not hold");
            return ControlReply::Nack(e.to_string());
        }
        if let Ok(lease) = self.table.release(grant) {
            debug!(
                slot = %grant.slot,
                client_id = lease.client_id,
                held_us = lease.acquired_at.elapsed().as_micros() as u64,
                "slot released"
            );
        }
        self.serve_waiters();
        ControlReply::Ack
    }

    /// Forces a leased slot back to the free list, whoever holds it.
    fn abandon(&mut self, grant: SlotGrant) {
        if self.table.lease_of(grant).is_err() {
            return;
        }
        if let Err(e) = self.arena.meta().reclaim(grant.slot, grant.generation) {
            error!(slot = %grant.slot, error = %e, "cannot reclaim abandoned slot");
        }
        if let Ok(lease) = self.table.release(grant) {
            warn!(slot = %grant.slot, client_id = lease.client_id, "grant abandoned, slot returned");
        }
    }

    fn sweep(&mut self, now: Instant) {
        let expired = self.table.expire(now);
        if expired.is_empty() {
            return;
        }
        for lease in expired {
            match self.arena.meta().reclaim(lease.grant.slot, lease.grant.generation) {
                Ok(owner) => warn!(
                    slot = %lease.grant.slot,
                    client_id = lease.client_id,
                    owner = ?owner,
                    held_ms = now.duration_since(lease.acquired_at).as_millis() as u64,
                    "reclaimed expired lease"
                ),
                Err(e) => error!(slot = %lease.grant.slot, error = %e, "cannot reclaim expired lease"),
            }
        }
        self.serve_waiters();
    }

    fn expire_waiters(&mut self) {
        self.waiters.retain(|waiter| {
            if waiter.deadline.is_expired() {
                debug!(client_id = waiter.client_id, "acquire budget elapsed");
                let _ = waiter.reply.send(ControlReply::Busy);
                false
            } else {
                true
            }
        });
    }

    /// Hands free slots to the oldest waiters.
    fn serve_waiters(&mut self) {
        while self.table.free_len() > 0 {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            if waiter.deadline.is_expired() {
                let _ = waiter.reply.send(ControlReply::Busy);
                continue;
            }
            match self.try_grant(&waiter.client_id) {
                Some(grant) => self.deliver(grant, &waiter.reply),
                None => {
                    self.waiters.push_front(waiter);
                    break;
                }
            }
        }
    }

    fn try_grant(&mut self, client_id: &str) -> Option<SlotGrant> {
        let slot = self.table.pop_free()?;
        match self.claim(slot) {
            Ok(generation) => {
                let grant = SlotGrant { slot, generation };
                self.table.lease(grant, client_id, Instant::now());
                debug!(%slot, generation, client_id, free = self.table.free_len(), "slot granted");
                Some(grant)
            }
            Err(e) => {
                error!(%slot, error = %e, "cannot claim free slot");
                self.table.unpop(slot);
                None
            }
        }
    }

    fn claim(&self, slot: SlotId) -> std::result::Result<u32, ShmError> {
        let meta = self.arena.meta();
        match meta.claim(slot) {
            Ok(generation) => Ok(generation),
            Err(e) => {
                warn!(%slot, error = %e, "free slot has a stale owner tag, forcing it free");
                meta.reclaim(slot, meta.tag(slot)?.generation)?;
                meta.claim(slot)
            }
        }
    }

    fn deliver(&mut self, grant: SlotGrant, reply: &Sender<ControlReply>) {
        if reply.send(ControlReply::Granted(grant)).is_err() {
            self.abandon(grant);
        }
    }

    fn stats(&self) -> PoolStats {
        let meta = self.arena.meta();
        let (mut acquired, mut in_flight) = (0, 0);
        for lease in self.table.leases() {
            match meta.owner(lease.grant.slot) {
                Ok(SlotOwner::Worker) => in_flight += 1,
                _ => acquired += 1,
            }
        }
        PoolStats {
            free: self.table.free_len() as u32,
            acquired,
            in_flight,
            waiting: self.waiters.len() as u32,
        }
    }
}

/// A manager started by [`SlotManager::spawn`].
pub struct RunningManager {
    handle: ManagerHandle,
    join: JoinHandle<()>,
}

impl RunningManager {
    pub fn handle(&self) -> &ManagerHandle {
        &self.handle
    }

    /// Blocks until the manager loop ends.
    pub fn join(self) -> Result<()> {
        self.join
            .join()
            .map_err(|_| anyhow!("slot manager thread panicked"))
    }

    /// Stops the loop and waits for the arena to be torn down.
    pub fn shutdown(self) -> Result<()> {
        self.handle.shutdown()?;
        self.join()
    }
}

/// Accepts control peers; each peer gets a thread that forwards its
/// requests to the manager and writes back the replies.
pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
    manager: ManagerHandle,
}

impl ControlServer {
    pub fn bind(path: &Path, manager: ManagerHandle) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating socket dir {}", dir.display()))?;
        }
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)
            .with_context(|| format!("binding control socket {}", path.display()))?;
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            manager,
        })
    }

    pub fn run(self) -> Result<()> {
        info!(path = %self.path.display(), "control channel listening");
        for (peer, stream) in self.listener.incoming().enumerate() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "control accept failed");
                    continue;
                }
            };
            let manager = self.manager.clone();
            thread::Builder::new()
                .name(format!("control-peer-{peer}"))
                .spawn(move || {
                    if let Err(e) = serve_peer(stream, &manager) {
                        debug!(peer, error = %e, "control peer dropped");
                    }
                })
                .context("spawning control peer thread")?;
        }
        Ok(())
    }
}

fn serve_peer(stream: UnixStream, manager: &ManagerHandle) -> Result<()> {
    let mut channel = RepChannel::new(stream)?;
    while let Some(parts) = channel.recv()? {
        let reply = match ControlRequest::decode(&parts) {
            Ok(request) => manager.call(request)?,
            Err(e) => {
                warn!(error = %e, "malformed control request");
                ControlReply::Nack(e.to_string())
            }
        };
        if let Err(e) = channel.send(&as_slices(&reply.encode())) {
            if let ControlReply::Granted(grant) = reply {
                manager.abandon(grant)?;
            }
            return Err(e.into());
        }
    }
    Ok(())
}
