use anyhow::Result;

use crate::{TensorView, TensorViewMut};

#[derive(Clone, Copy, Debug)]
pub struct ExecutorCapabilities {
    pub thread_safe: bool,
}

/// Runs the numeric part of inference on tensors that live in shared buffers.
///
/// The worker owns the slot while `execute` runs: `input` is the slot's
/// input buffer and `output` the slot's output buffer, both mapped directly
/// from shared memory. Implementations must fill `output` completely or fail.
pub trait InferenceExecutor: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    fn capabilities(&self) -> ExecutorCapabilities;
    fn execute(&self, input: TensorView<'_>, output: TensorViewMut<'_>) -> Result<()>;
}

impl<T: InferenceExecutor + ?Sized> InferenceExecutor for std::sync::Arc<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn capabilities(&self) -> ExecutorCapabilities {
        (**self).capabilities()
    }

    fn execute(&self, input: TensorView<'_>, output: TensorViewMut<'_>) -> Result<()> {
        (**self).execute(input, output)
    }
}
