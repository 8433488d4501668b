//! The Predict call, driven through the slot protocol.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use shmserve_core::{IOName, ModelDirectory, ModelHandle, ServeError, Tensor, TensorDesc};
use shmserve_ipc::{CompletionStatus, Deadline, SlotGrant};
use shmserve_shm::{SlotOwner, SlotTag};
use tracing::{debug, warn};

use crate::{ClientConnection, DispatchError, PredictRequest, PredictResponse, Timings};

fn elapsed_us(since: Instant) -> u64 {
    since.elapsed().as_micros() as u64
}

pub struct PredictHandler {
    conn: ClientConnection,
    directory: Arc<dyn ModelDirectory>,
    served_model: String,
    output: TensorDesc,
}

impl PredictHandler {
    pub fn new(
        conn: ClientConnection,
        directory: Arc<dyn ModelDirectory>,
        served_model: String,
        output: TensorDesc,
    ) -> Self {
        Self {
            conn,
            directory,
            served_model,
            output,
        }
    }

    pub fn client_id(&self) -> &str {
        self.conn.client_id()
    }

    /// Runs one call against `deadline`, which was fixed when the call arrived.
    pub fn predict(
        &mut self,
        request: PredictRequest,
        deadline: Deadline,
    ) -> Result<PredictResponse, ServeError> {
        let model = self.directory.resolve(&request.model, request.version)?;
        if model.name != self.served_model {
            return Err(ServeError::NotFound(format!(
                "model '{}' is not served by this slot pool",
                model.name
            )));
        }
        let (input_name, input) = validate(&model, &request.inputs)?;
        if input.bytes.len() > self.conn.arena().layout().input_bytes {
            return Err(ServeError::InvalidArgument(format!(
                "input '{input_name}' of {} bytes does not fit a slot",
                input.bytes.len()
            )));
        }

        if deadline.is_expired() {
            return Err(ServeError::DeadlineExceeded(
                "request budget spent waiting for a serving thread".into(),
            ));
        }

        let mut timings = Timings::default();

        let t = Instant::now();
        let grant = self.conn.acquire(deadline)?;
        timings.acquire_us = elapsed_us(t);

        let t = Instant::now();
        if let Err(e) = self.write_input(grant, &input.bytes) {
            self.release_quietly(grant);
            return Err(e);
        }
        timings.copy_in_us = elapsed_us(t);

        let t = Instant::now();
        let request_id = self.conn.next_request_id();
        self.dispatch(grant, request_id, deadline)?;
        timings.dispatch_us = elapsed_us(t);

        let t = Instant::now();
        let completion = match self.conn.wait_completion(deadline) {
            Ok(completion) => completion,
            Err(e) if e.is_timeout() => {
                warn!(
                    client_id = self.conn.client_id(),
                    slot = %grant.slot,
                    request_id,
                    "no completion before the deadline, slot left in flight (leak candidate until its lease expires)"
                );
                return Err(ServeError::DeadlineExceeded(format!(
                    "worker did not complete request {request_id} in time"
                )));
            }
            Err(e) => {
                warn!(slot = %grant.slot, request_id, error = %e, "completion channel failed");
                return Err(ServeError::Internal(format!("completion channel failed: {e}")));
            }
        };
        timings.inference_us = elapsed_us(t);

        if completion.grant != grant {
            warn!(slot = %grant.slot, got = %completion.grant.slot, "completion names another slot");
            if self.owns(grant) {
                self.release_quietly(grant);
            }
            return Err(ServeError::Internal(
                "completion does not match the dispatched slot".into(),
            ));
        }
        if let CompletionStatus::Failed(detail) = completion.status {
            self.release_quietly(grant);
            return Err(ServeError::Internal(format!("inference failed: {detail}")));
        }

        let t = Instant::now();
        let output = match self.read_output(grant) {
            Ok(output) => output,
            Err(e) => {
                self.release_quietly(grant);
                return Err(e);
            }
        };
        timings.copy_out_us = elapsed_us(t);

        let t = Instant::now();
        self.conn.release(grant)?;
        timings.release_us = elapsed_us(t);

        debug!(
            model = model.name,
            version = model.version,
            slot = %grant.slot,
            acquire_us = timings.acquire_us,
            copy_in_us = timings.copy_in_us,
            dispatch_us = timings.dispatch_us,
            inference_us = timings.inference_us,
            copy_out_us = timings.copy_out_us,
            release_us = timings.release_us,
            total_us = timings.total_us(),
            "predict done"
        );

        let output_name = model
            .spec
            .outputs
            .first()
            .map(|spec| spec.name.clone())
            .unwrap_or_else(|| IOName("output".into()));
        Ok(PredictResponse {
            model: model.name,
            version: model.version,
            outputs: vec![(output_name, output)],
            timings,
        })
    }

    fn write_input(&mut self, grant: SlotGrant, bytes: &[u8]) -> Result<(), ServeError> {
        let buffers = self
            .conn
            .arena()
            .slot(grant.slot)
            .map_err(|e| ServeError::Internal(format!("attaching slot {}: {e}", grant.slot)))?;
        buffers
            .input
            .write(bytes)
            .map_err(|e| ServeError::Internal(format!("writing slot {}: {e}", grant.slot)))
    }

    fn dispatch(
        &mut self,
        grant: SlotGrant,
        request_id: u64,
        deadline: Deadline,
    ) -> Result<(), ServeError> {
        let meta = self.conn.arena().meta();
        if let Err(e) = meta.hand_over(grant.slot, grant.generation, SlotOwner::Handler, SlotOwner::Worker)
        {
            // Our lease was reclaimed underneath us; the slot is no longer ours.
            warn!(slot = %grant.slot, error = %e, "lost slot before dispatch");
            return Err(ServeError::Unavailable(format!(
                "slot {} was reclaimed before dispatch",
                grant.slot
            )));
        }

        match self.conn.dispatch(grant, request_id, deadline) {
            Ok(()) => Ok(()),
            Err(DispatchError::NotSent(e)) => {
                self.take_back(grant);
                Err(ServeError::Unavailable(format!("inference worker unreachable: {e}")))
            }
            Err(DispatchError::Rejected(reason)) => {
                self.take_back(grant);
                Err(ServeError::Internal(format!("inference worker refused slot: {reason}")))
            }
            Err(DispatchError::Unconfirmed(e)) if e.is_timeout() => {
                warn!(
                    slot = %grant.slot,
                    worker = self.conn.worker(),
                    request_id,
                    "worker did not acknowledge, slot left in flight (leak candidate until its lease expires)"
                );
                Err(ServeError::DeadlineExceeded(
                    "inference worker did not acknowledge in time".into(),
                ))
            }
            Err(DispatchError::Unconfirmed(e)) => {
                warn!(
                    slot = %grant.slot,
                    worker = self.conn.worker(),
                    request_id,
                    error = %e,
                    "dispatch unconfirmed, slot left in flight"
                );
                Err(ServeError::Unavailable(format!("inference worker failed: {e}")))
            }
        }
    }

    /// Undoes the hand-over for a message no worker accepted, then releases.
    fn take_back(&mut self, grant: SlotGrant) {
        let meta = self.conn.arena().meta();
        match meta.hand_over(grant.slot, grant.generation, SlotOwner::Worker, SlotOwner::Handler) {
            Ok(()) => self.release_quietly(grant),
            Err(e) => warn!(slot = %grant.slot, error = %e, "cannot take slot back from worker"),
        }
    }

    /// Whether the slot is back with the handler at the granted generation.
    fn owns(&mut self, grant: SlotGrant) -> bool {
        let expected = SlotTag {
            generation: grant.generation,
            owner: SlotOwner::Handler,
        };
        matches!(self.conn.arena().meta().tag(grant.slot), Ok(tag) if tag == expected)
    }

    fn read_output(&mut self, grant: SlotGrant) -> Result<Tensor, ServeError> {
        let expected = SlotTag {
            generation: grant.generation,
            owner: SlotOwner::Handler,
        };
        let arena = self.conn.arena();
        let tag = arena
            .meta()
            .tag(grant.slot)
            .map_err(|e| ServeError::Internal(e.to_string()))?;
        if tag != expected {
            return Err(ServeError::Internal(format!(
                "slot {} completed but is owned by {:?} at generation {}",
                grant.slot, tag.owner, tag.generation
            )));
        }
        let len = self.output.byte_len();
        let buffers = arena
            .slot(grant.slot)
            .map_err(|e| ServeError::Internal(format!("attaching slot {}: {e}", grant.slot)))?;
        let bytes = Bytes::copy_from_slice(&buffers.output.as_bytes()[..len]);
        Ok(Tensor::from_bytes(
            self.output.dtype,
            self.output.shape.clone(),
            bytes,
        ))
    }

    fn release_quietly(&mut self, grant: SlotGrant) {
        if let Err(e) = self.conn.release(grant) {
            warn!(slot = %grant.slot, error = %e, "release failed, slot waits for the reaper");
        }
    }
}

/// Checks the request inputs against the model signature.
fn validate<'a>(
    model: &ModelHandle,
    inputs: &'a [(IOName, Tensor)],
) -> Result<(&'a IOName, &'a Tensor), ServeError> {
    let [(name, tensor)] = inputs else {
        return Err(ServeError::InvalidArgument(format!(
            "model '{}' takes exactly one input, got {}",
            model.name,
            inputs.len()
        )));
    };
    let spec = model.spec.input(&name.0).ok_or_else(|| {
        ServeError::InvalidArgument(format!("model '{}' has no input '{name}'", model.name))
    })?;
    spec.check(&tensor.desc).map_err(ServeError::InvalidArgument)?;
    if tensor.byte_len() != tensor.expected_byte_len() {
        return Err(ServeError::InvalidArgument(format!(
            "input '{name}' carries {} bytes, shape {} of {} needs {}",
            tensor.byte_len(),
            tensor.desc.shape,
            tensor.desc.dtype,
            tensor.expected_byte_len()
        )));
    }
    Ok((name, tensor))
}

#[cfg(test)]
mod tests {
    use shmserve_core::{DType, Shape, StatusCode};

    use super::*;
    use crate::config::single_model;
    use crate::ModelRegistry;

    fn model() -> ModelHandle {
        let config = single_model("echo", DType::F32, &[1, 4], &[1, 4]);
        ModelRegistry::from_config(&config.model_config_list)
            .resolve("echo", None)
            .unwrap()
    }

    fn input(name: &str, dims: &[usize], bytes: usize) -> (IOName, Tensor) {
        (
            IOName(name.into()),
            Tensor::from_bytes(DType::F32, Shape::from_slice(dims), Bytes::from(vec![0u8; bytes])),
        )
    }

    #[test]
    fn accepts_matching_input() {
        let inputs = vec![input("input", &[1, 4], 16)];
        assert!(validate(&model(), &inputs).is_ok());
    }

    #[test]
    fn rejects_wrong_shape() {
        let inputs = vec![input("input", &[1, 5], 20)];
        let err = validate(&model(), &inputs).unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);
        assert!(err.message().contains("[1, 5]"), "{err}");
    }

    #[test]
    fn rejects_unknown_input_name() {
        let inputs = vec![input("x", &[1, 4], 16)];
        assert_eq!(
            validate(&model(), &inputs).unwrap_err().code(),
            StatusCode::InvalidArgument
        );
    }

    #[test]
    fn rejects_short_payload() {
        let inputs = vec![input("input", &[1, 4], 12)];
        assert_eq!(
            validate(&model(), &inputs).unwrap_err().code(),
            StatusCode::InvalidArgument
        );
    }

    #[test]
    fn rejects_missing_or_extra_inputs() {
        assert!(validate(&model(), &[]).is_err());
        let inputs = vec![input("input", &[1, 4], 16), input("input", &[1, 4], 16)];
        assert!(validate(&model(), &inputs).is_err());
    }
}
