use std::time::Duration;

use anyhow::{Context, Result};
use shmserve_core::ServeError;
use shmserve_ipc::{
    as_slices, Completion, CompletionReceiver, ControlReply, ControlRequest, Deadline,
    InferenceMessage, InferenceReply, IpcError, PoolStats, ReqChannel, SlotGrant,
};
use shmserve_shm::ArenaView;
use tracing::debug;

use crate::RuntimeConfig;

/// Extra time granted to the manager to deliver its `BUSY` once the acquire
/// budget is spent.
const CONTROL_GRACE: Duration = Duration::from_millis(250);

/// Client id of serving thread `index` in this process.
pub fn client_id(index: usize) -> String {
    format!("{}-{index}", std::process::id())
}

/// How a dispatch to a worker went wrong.
#[derive(Debug)]
pub enum DispatchError {
    /// The message never left this process; the slot is still the handler's.
    NotSent(IpcError),
    /// Sent, but not acknowledged in time; the worker may or may not run it.
    Unconfirmed(IpcError),
    /// The worker refused the message.
    Rejected(String),
}

/// Control channel to the slot pool manager.
pub struct ControlClient {
    client_id: String,
    channel: ReqChannel,
    connect_timeout: Duration,
}

impl ControlClient {
    pub fn connect(config: &RuntimeConfig, client_id: String) -> Result<Self> {
        let timeout = config.connect_timeout();
        let channel = ReqChannel::connect(&config.sockets().control(), "control", timeout)
            .context("connecting to slot pool manager")?;
        Ok(Self {
            client_id,
            channel,
            connect_timeout: timeout,
        })
    }

    fn call(
        &mut self,
        request: &ControlRequest,
        deadline: Deadline,
    ) -> std::result::Result<ControlReply, IpcError> {
        self.channel.ensure_ready(self.connect_timeout)?;
        let parts = self.channel.request(&as_slices(&request.encode()), deadline)?;
        ControlReply::decode(&parts)
    }

    /// Asks the manager for a slot, waiting until `deadline` at most.
    pub fn acquire(&mut self, deadline: Deadline) -> Result<SlotGrant, ServeError> {
        let request = ControlRequest::Acquire {
            client_id: self.client_id.clone(),
            wait: deadline.remaining().unwrap_or(Duration::ZERO),
        };
        match self.call(&request, deadline.extended(CONTROL_GRACE)) {
            Ok(ControlReply::Granted(grant)) => Ok(grant),
            Ok(ControlReply::Busy) => Err(ServeError::Unavailable(
                "no free slot within the request budget".into(),
            )),
            Ok(other) => Err(ServeError::Internal(format!(
                "unexpected acquire reply {other:?}"
            ))),
            Err(e) if e.is_timeout() => Err(ServeError::DeadlineExceeded(
                "slot pool manager did not answer".into(),
            )),
            Err(e) => Err(unreachable_manager(e)),
        }
    }

    pub fn release(&mut self, grant: SlotGrant) -> Result<(), ServeError> {
        let deadline = Deadline::after(self.connect_timeout);
        match self.call(&ControlRequest::Release(grant), deadline) {
            Ok(ControlReply::Ack) => Ok(()),
            Ok(ControlReply::Nack(reason)) => Err(ServeError::Internal(format!(
                "release of slot {} refused: {reason}",
                grant.slot
            ))),
            Ok(other) => Err(ServeError::Internal(format!(
                "unexpected release reply {other:?}"
            ))),
            Err(e) => Err(unreachable_manager(e)),
        }
    }

    pub fn stats(&mut self) -> Result<PoolStats, ServeError> {
        let deadline = Deadline::after(self.connect_timeout);
        match self.call(&ControlRequest::Stats, deadline) {
            Ok(ControlReply::Stats(stats)) => Ok(stats),
            Ok(other) => Err(ServeError::Internal(format!(
                "unexpected stats reply {other:?}"
            ))),
            Err(e) => Err(unreachable_manager(e)),
        }
    }
}

fn unreachable_manager(e: IpcError) -> ServeError {
    ServeError::Unavailable(format!("slot pool manager unreachable: {e}"))
}

/// Everything one serving thread needs to talk to the manager and a worker.
///
/// Opened once when the thread starts and reused for every request it
/// serves. Nothing here is shared with another thread.
pub struct ClientConnection {
    client_id: String,
    worker: usize,
    control: ControlClient,
    inference: ReqChannel,
    completions: CompletionReceiver,
    arena: ArenaView,
    connect_timeout: Duration,
    next_request_id: u64,
}

impl ClientConnection {
    pub fn open(config: &RuntimeConfig, client_id: String, worker: usize) -> Result<Self> {
        let sockets = config.sockets();
        let timeout = config.connect_timeout();

        let completions = CompletionReceiver::bind(&sockets, &client_id)
            .with_context(|| format!("binding reply address of {client_id}"))?;
        let control = ControlClient::connect(config, client_id.clone())?;
        // The manager only listens once its arena exists.
        let arena = ArenaView::attach(&config.shm_dir).with_context(|| {
            format!("attaching shared buffer arena in {}", config.shm_dir.display())
        })?;
        let inference = ReqChannel::connect(&sockets.inference(worker), "inference", timeout)
            .with_context(|| format!("connecting to inference worker {worker}"))?;

        debug!(client_id, worker, "client connection ready");
        Ok(Self {
            client_id,
            worker,
            control,
            inference,
            completions,
            arena,
            connect_timeout: timeout,
            next_request_id: 0,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn worker(&self) -> usize {
        self.worker
    }

    pub fn arena(&mut self) -> &mut ArenaView {
        &mut self.arena
    }

    pub fn next_request_id(&mut self) -> u64 {
        self.next_request_id += 1;
        self.next_request_id
    }

    pub fn acquire(&mut self, deadline: Deadline) -> Result<SlotGrant, ServeError> {
        self.control.acquire(deadline)
    }

    pub fn release(&mut self, grant: SlotGrant) -> Result<(), ServeError> {
        self.control.release(grant)
    }

    /// Arms the reply address, then hands the slot to the worker and waits
    /// for its acknowledgement of receipt.
    pub fn dispatch(
        &mut self,
        grant: SlotGrant,
        request_id: u64,
        deadline: Deadline,
    ) -> Result<(), DispatchError> {
        self.completions
            .arm(request_id)
            .map_err(DispatchError::NotSent)?;
        let message = InferenceMessage {
            client_id: self.client_id.clone(),
            grant,
            request_id,
        };
        let sent = self
            .inference
            .ensure_ready(self.connect_timeout)
            .and_then(|()| self.inference.send(&as_slices(&message.encode())));
        if let Err(e) = sent {
            self.completions.disarm();
            return Err(DispatchError::NotSent(e));
        }
        let reply = self
            .inference
            .recv(deadline)
            .and_then(|parts| InferenceReply::decode(&parts));
        match reply {
            Ok(InferenceReply::Ack) => Ok(()),
            Ok(InferenceReply::Nack(reason)) => {
                self.completions.disarm();
                Err(DispatchError::Rejected(reason))
            }
            Err(e) => {
                self.completions.disarm();
                Err(DispatchError::Unconfirmed(e))
            }
        }
    }

    /// Blocks for the completion armed by [`dispatch`](Self::dispatch).
    pub fn wait_completion(&mut self, deadline: Deadline) -> std::result::Result<Completion, IpcError> {
        self.completions.wait(deadline)
    }
}
