//! Reference executor: a deterministic echo transform.
//!
//! Every numeric element is doubled (f16 is copied bit for bit). When the
//! output holds a different number of elements than the input, the doubled
//! input is repeated or cut to fit.

use std::time::Duration;

use anyhow::{ensure, Result};
use shmserve_core::{DType, ExecutorCapabilities, InferenceExecutor, TensorView, TensorViewMut};
use tracing::trace;

#[derive(Clone, Debug, Default)]
pub struct EchoExecutor {
    delay: Option<Duration>,
}

impl EchoExecutor {
    pub fn new() -> Self {
        Self { delay: None }
    }

    /// Sleeps before computing, to stand in for a slow engine.
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay: Some(delay) }
    }
}

impl InferenceExecutor for EchoExecutor {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn capabilities(&self) -> ExecutorCapabilities {
        ExecutorCapabilities {
            thread_safe: true,
        }
    }

    fn execute(&self, input: TensorView<'_>, output: TensorViewMut<'_>) -> Result<()> {
        ensure!(
            input.desc.dtype == output.desc.dtype,
            "echo cannot convert {} to {}",
            input.desc.dtype,
            output.desc.dtype
        );
        let width = input.desc.dtype.byte_size();
        ensure!(
            input.bytes.len() % width == 0 && output.bytes.len() % width == 0,
            "buffer length is not a whole number of {} elements",
            input.desc.dtype
        );
        ensure!(!input.bytes.is_empty(), "empty input tensor");

        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }

        let dtype = input.desc.dtype;
        for (dst, src) in output
            .bytes
            .chunks_exact_mut(width)
            .zip(input.bytes.chunks_exact(width).cycle())
        {
            double_into(dtype, src, dst);
        }
        trace!(
            input = %input.desc.shape,
            output = %output.desc.shape,
            "echo computed"
        );
        Ok(())
    }
}

fn double_into(dtype: DType, src: &[u8], dst: &mut [u8]) {
    match dtype {
        DType::F32 => {
            let v = f32::from_le_bytes([src[0], src[1], src[2], src[3]]);
            dst.copy_from_slice(&(v * 2.0).to_le_bytes());
        }
        DType::I64 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(src);
            dst.copy_from_slice(&i64::from_le_bytes(raw).wrapping_mul(2).to_le_bytes());
        }
        DType::I32 => {
            let v = i32::from_le_bytes([src[0], src[1], src[2], src[3]]);
            dst.copy_from_slice(&v.wrapping_mul(2).to_le_bytes());
        }
        DType::U8 => dst[0] = src[0].wrapping_mul(2),
        DType::F16 => dst.copy_from_slice(src),
    }
}
