//! The inference worker.
//!
//! Intake threads (one per connected handler) check each message against the
//! slot tag table, acknowledge it and queue it. A fixed set of executor
//! threads drains the queue, so completions may go out in any order; each
//! one names its request id and slot, which is all the handler matches on.

use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use crossbeam_channel::{Receiver, Sender};
use shmserve_core::{InferenceExecutor, TensorDesc, TensorDescriptor, TensorView, TensorViewMut};
use shmserve_ipc::{
    as_slices, Completion, CompletionSender, CompletionStatus, Deadline, InferenceMessage,
    InferenceReply, RepChannel, SlotGrant, SocketLayout,
};
use shmserve_shm::{ArenaView, ShmError, SlotBuffers, SlotMetaTable, SlotOwner, SlotTag};
use tracing::{debug, error, info, trace, warn};

use crate::ServingConfig;

const ATTACH_BACKOFF: Duration = Duration::from_millis(20);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    ReceivedRequest,
    Computing,
    Responding,
}

pub struct InferenceWorker {
    index: usize,
    listener: UnixListener,
    path: PathBuf,
    sockets: SocketLayout,
    shm_dir: PathBuf,
    attach_timeout: Duration,
    executor: Arc<dyn InferenceExecutor>,
    input: TensorDesc,
    output: TensorDesc,
    executors: usize,
    queue_depth: usize,
}

impl InferenceWorker {
    /// Binds `inference-<index>.sock`. A bind failure is fatal for the worker.
    pub fn bind(
        config: &ServingConfig,
        index: usize,
        executor: Arc<dyn InferenceExecutor>,
    ) -> Result<Self> {
        let rt = &config.runtime;
        let (input, output) = config.served_descs()?;
        let sockets = rt.sockets();
        let path = sockets.inference(index);
        std::fs::create_dir_all(sockets.dir())
            .with_context(|| format!("creating socket dir {}", sockets.dir().display()))?;
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)
            .with_context(|| format!("binding inference socket {}", path.display()))?;

        let executors = if executor.capabilities().thread_safe {
            rt.executors_per_worker
        } else {
            1
        };
        Ok(Self {
            index,
            listener,
            path,
            sockets,
            shm_dir: rt.shm_dir.clone(),
            attach_timeout: rt.connect_timeout(),
            executor,
            input,
            output,
            executors,
            queue_depth: rt.pool_size as usize,
        })
    }

    pub fn spawn(self) -> Result<JoinHandle<()>> {
        let index = self.index;
        thread::Builder::new()
            .name(format!("worker-{index}"))
            .spawn(move || {
                if let Err(e) = self.run() {
                    error!(worker = index, error = ?e, "inference worker exited");
                }
            })
            .context("spawning inference worker")
    }

    pub fn run(self) -> Result<()> {
        let meta = Arc::new(attach_with_retry(&self.shm_dir, self.attach_timeout, |dir| {
            SlotMetaTable::attach(dir)
        })?);
        let (jobs_tx, jobs_rx) = crossbeam_channel::bounded(self.queue_depth);

        for id in 0..self.executors {
            let arena = attach_with_retry(&self.shm_dir, self.attach_timeout, ArenaView::attach)?;
            let executor = ExecutorThread {
                worker: self.index,
                id,
                arena,
                completions: CompletionSender::new(self.sockets.clone())?,
                executor: self.executor.clone(),
                input: self.input.clone(),
                output: self.output.clone(),
                phase: Phase::Idle,
            };
            let jobs = jobs_rx.clone();
            thread::Builder::new()
                .name(format!("worker-{}-exec-{id}", self.index))
                .spawn(move || executor.run(jobs))
                .context("spawning executor thread")?;
        }

        info!(
            worker = self.index,
            path = %self.path.display(),
            executor = self.executor.name(),
            executors = self.executors,
            "inference worker listening"
        );
        for (peer, stream) in self.listener.incoming().enumerate() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(worker = self.index, error = %e, "inference accept failed");
                    continue;
                }
            };
            let meta = meta.clone();
            let jobs = jobs_tx.clone();
            let worker = self.index;
            thread::Builder::new()
                .name(format!("worker-{worker}-intake-{peer}"))
                .spawn(move || {
                    if let Err(e) = intake(stream, &meta, &jobs) {
                        debug!(worker, peer, error = %e, "handler disconnected");
                    }
                })
                .context("spawning intake thread")?;
        }
        Ok(())
    }
}

/// The worker may come up before the manager has created the arena.
fn attach_with_retry<T>(
    dir: &Path,
    timeout: Duration,
    attach: impl Fn(&Path) -> std::result::Result<T, ShmError>,
) -> Result<T> {
    let deadline = Deadline::after(timeout);
    loop {
        match attach(dir) {
            Ok(value) => return Ok(value),
            Err(ShmError::NotFound(_)) if !deadline.is_expired() => thread::sleep(ATTACH_BACKOFF),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("attaching shared buffer arena in {}", dir.display()))
            }
        }
    }
}

fn intake(stream: UnixStream, meta: &SlotMetaTable, jobs: &Sender<InferenceMessage>) -> Result<()> {
    let mut channel = RepChannel::new(stream)?;
    while let Some(parts) = channel.recv()? {
        let reply = match InferenceMessage::decode(&parts) {
            Err(e) => {
                warn!(error = %e, "malformed inference message");
                InferenceReply::Nack(e.to_string())
            }
            Ok(message) => match check_in_flight(meta, message.grant) {
                Err(reason) => {
                    warn!(client_id = message.client_id, reason, "inference message refused");
                    InferenceReply::Nack(reason)
                }
                Ok(()) => {
                    trace!(client_id = message.client_id, slot = %message.grant.slot, "queued");
                    match jobs.send(message) {
                        Ok(()) => InferenceReply::Ack,
                        Err(_) => InferenceReply::Nack("worker is shutting down".into()),
                    }
                }
            },
        };
        channel.send(&as_slices(&reply.encode()))?;
    }
    Ok(())
}

fn check_in_flight(meta: &SlotMetaTable, grant: SlotGrant) -> std::result::Result<(), String> {
    let expected = SlotTag {
        generation: grant.generation,
        owner: SlotOwner::Worker,
    };
    match meta.tag(grant.slot) {
        Ok(tag) if tag == expected => Ok(()),
        Ok(tag) => Err(format!(
            "slot {} is {:?} at generation {}, expected in flight at generation {}",
            grant.slot, tag.owner, tag.generation, grant.generation
        )),
        Err(e) => Err(e.to_string()),
    }
}

struct ExecutorThread {
    worker: usize,
    id: usize,
    arena: ArenaView,
    completions: CompletionSender,
    executor: Arc<dyn InferenceExecutor>,
    input: TensorDesc,
    output: TensorDesc,
    phase: Phase,
}

impl ExecutorThread {
    fn run(mut self, jobs: Receiver<InferenceMessage>) {
        debug!(worker = self.worker, executor = self.id, "executor started");
        while let Ok(message) = jobs.recv() {
            self.process(message);
            self.enter(Phase::Idle);
        }
        debug!(worker = self.worker, executor = self.id, "executor stopped");
    }

    fn enter(&mut self, phase: Phase) {
        trace!(worker = self.worker, executor = self.id, from = ?self.phase, to = ?phase, "phase");
        self.phase = phase;
    }

    fn process(&mut self, message: InferenceMessage) {
        self.enter(Phase::ReceivedRequest);
        let grant = message.grant;
        let status = match self.execute(grant) {
            Ok(()) => CompletionStatus::Ok,
            Err(e) => {
                warn!(slot = %grant.slot, error = ?e, "inference failed");
                CompletionStatus::Failed(format!("{e:#}"))
            }
        };

        self.enter(Phase::Responding);
        if let Err(e) = self.arena.meta().hand_over(
            grant.slot,
            grant.generation,
            SlotOwner::Worker,
            SlotOwner::Handler,
        ) {
            warn!(slot = %grant.slot, error = %e, "slot reclaimed during inference, result dropped");
            return;
        }
        let completion = Completion {
            request_id: message.request_id,
            grant,
            status,
        };
        // A handler that gave up has closed or re-armed its address; either
        // way the late completion is harmless.
        if let Err(e) = self.completions.send(&message.client_id, &completion) {
            debug!(client_id = message.client_id, error = %e, "completion not delivered");
        }
    }

    fn execute(&mut self, grant: SlotGrant) -> Result<()> {
        let tag = self.arena.meta().tag(grant.slot)?;
        ensure!(
            tag == SlotTag {
                generation: grant.generation,
                owner: SlotOwner::Worker
            },
            "slot {} is no longer in flight",
            grant.slot
        );
        let input = TensorDescriptor::new(self.input.clone(), grant.slot.input_name());
        let output = TensorDescriptor::new(self.output.clone(), grant.slot.output_name());
        let SlotBuffers {
            input: input_region,
            output: output_region,
        } = self.arena.slot(grant.slot)?;
        trace!(
            worker = self.worker,
            executor = self.id,
            input = input.buffer.region,
            output = output.buffer.region,
            from = ?self.phase,
            to = ?Phase::Computing,
            "phase"
        );
        self.phase = Phase::Computing;
        self.executor.execute(
            TensorView {
                desc: &input.desc,
                bytes: &input_region.as_bytes()[input.span()],
            },
            TensorViewMut {
                desc: &output.desc,
                bytes: &mut output_region.as_bytes_mut()[output.span()],
            },
        )
    }
}
