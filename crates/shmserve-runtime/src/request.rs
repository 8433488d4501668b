use std::time::Duration;

use shmserve_core::{IOName, ServeError, Tensor};
use shmserve_ipc::Deadline;
use tokio::sync::oneshot;

#[derive(Clone, Debug)]
pub struct PredictRequest {
    pub model: String,
    pub version: Option<u64>,
    pub inputs: Vec<(IOName, Tensor)>,
    /// Shortens the configured request timeout; longer values are capped.
    pub timeout: Option<Duration>,
}

#[derive(Clone, Debug)]
pub struct PredictResponse {
    pub model: String,
    pub version: u64,
    pub outputs: Vec<(IOName, Tensor)>,
    pub timings: Timings,
}

/// Wall time of each protocol stage of one Predict call, in microseconds.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub acquire_us: u64,
    pub copy_in_us: u64,
    pub dispatch_us: u64,
    pub inference_us: u64,
    pub copy_out_us: u64,
    pub release_us: u64,
}

impl Timings {
    pub fn total_us(&self) -> u64 {
        self.acquire_us
            + self.copy_in_us
            + self.dispatch_us
            + self.inference_us
            + self.copy_out_us
            + self.release_us
    }
}

/// A Predict call queued for a serving thread.
///
/// The deadline is fixed when the call arrives, so time spent waiting for a
/// serving thread counts against it.
#[derive(Debug)]
pub struct PredictJob {
    pub request: PredictRequest,
    pub deadline: Deadline,
    pub resp_tx: oneshot::Sender<Result<PredictResponse, ServeError>>,
}
