use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use shmserve_core::{ModelDirectory, ServeError};
use shmserve_ipc::{Deadline, PoolStats};
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::{
    client_id, ClientConnection, ControlClient, PredictHandler, PredictJob, PredictRequest,
    PredictResponse, ServingConfig,
};

/// Cloneable entry point into the serving threads.
#[derive(Clone)]
pub struct FrontEnd {
    tx: Sender<PredictJob>,
    stats: Arc<Mutex<ControlClient>>,
    request_timeout: Duration,
}

/// Budget of one call: the caller's timeout, capped at the configured one.
///
/// The cap keeps every call shorter than the lease TTL, so a live request
/// never has its slot reclaimed.
pub fn call_budget(requested: Option<Duration>, limit: Duration) -> Duration {
    requested.map_or(limit, |t| t.min(limit))
}

impl FrontEnd {
    fn job(
        &self,
        request: PredictRequest,
    ) -> (PredictJob, oneshot::Receiver<Result<PredictResponse, ServeError>>) {
        let deadline = Deadline::after(call_budget(request.timeout, self.request_timeout));
        let (resp_tx, resp_rx) = oneshot::channel();
        let job = PredictJob {
            request,
            deadline,
            resp_tx,
        };
        (job, resp_rx)
    }

    /// Queues a Predict call and awaits its result.
    pub async fn predict(&self, request: PredictRequest) -> Result<PredictResponse, ServeError> {
        let (job, resp_rx) = self.job(request);
        match self.tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                return Err(ServeError::Unavailable("all serving threads are busy".into()))
            }
            Err(TrySendError::Disconnected(_)) => {
                return Err(ServeError::Unavailable("serving threads stopped".into()))
            }
        }
        resp_rx
            .await
            .map_err(|_| ServeError::Internal("serving thread dropped the request".into()))?
    }

    /// Blocking variant for callers outside an async runtime.
    pub fn predict_blocking(&self, request: PredictRequest) -> Result<PredictResponse, ServeError> {
        let (job, resp_rx) = self.job(request);
        self.tx
            .send(job)
            .map_err(|_| ServeError::Unavailable("serving threads stopped".into()))?;
        resp_rx
            .blocking_recv()
            .map_err(|_| ServeError::Internal("serving thread dropped the request".into()))?
    }

    /// Pool occupancy as reported by the manager.
    pub fn pool_stats(&self) -> Result<PoolStats, ServeError> {
        let mut control = self
            .stats
            .lock()
            .map_err(|_| ServeError::Internal("stats connection poisoned".into()))?;
        control.stats()
    }
}

/// The serving threads of one front-end process.
pub struct HandlerPool;

impl HandlerPool {
    /// Opens one connection per thread up front, then starts the threads.
    ///
    /// Fails if any connection cannot be opened: a front end that cannot
    /// reach the manager or its worker is not usable.
    pub fn start(config: &ServingConfig, directory: Arc<dyn ModelDirectory>) -> Result<FrontEnd> {
        let rt = &config.runtime;
        let (_, output) = config.served_descs()?;
        let (tx, rx) = crossbeam_channel::bounded::<PredictJob>(rt.handler_threads * 4);

        for index in 0..rt.handler_threads {
            let worker = index % rt.workers;
            let conn = ClientConnection::open(rt, client_id(index), worker)
                .with_context(|| format!("opening connection for serving thread {index}"))?;
            let handler = PredictHandler::new(
                conn,
                directory.clone(),
                config.served_model.clone(),
                output.clone(),
            );
            let rx = rx.clone();
            thread::Builder::new()
                .name(format!("predict-{index}"))
                .spawn(move || serve(handler, rx))
                .context("spawning serving thread")?;
        }

        let stats = ControlClient::connect(rt, client_id(rt.handler_threads))?;
        info!(
            threads = rt.handler_threads,
            workers = rt.workers,
            model = config.served_model,
            "front end ready"
        );
        Ok(FrontEnd {
            tx,
            stats: Arc::new(Mutex::new(stats)),
            request_timeout: rt.request_timeout(),
        })
    }
}

fn serve(mut handler: PredictHandler, rx: Receiver<PredictJob>) {
    debug!(client_id = handler.client_id(), "serving thread started");
    while let Ok(job) = rx.recv() {
        let result = handler.predict(job.request, job.deadline);
        if let Err(e) = &result {
            debug!(client_id = handler.client_id(), error = %e, "predict failed");
        }
        let _ = job.resp_tx.send(result);
    }
    debug!(client_id = handler.client_id(), "serving thread stopped");
}
