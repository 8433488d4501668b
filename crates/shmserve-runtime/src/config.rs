//! Deployment configuration shared by the manager, workers and front ends.
//!
//! Every process of one deployment reads the same JSON document, so they agree
//! on socket paths, shm paths and the arena geometry without talking first.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use shmserve_core::{Device, DType, ModelSpec, TensorDesc, TensorSpec, VersionState};
use shmserve_ipc::SocketLayout;
use shmserve_shm::ArenaLayout;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub socket_dir: PathBuf,
    pub shm_dir: PathBuf,
    pub pool_size: u32,
    pub workers: usize,
    pub executors_per_worker: usize,
    pub handler_threads: usize,
    pub request_timeout_ms: u64,
    pub lease_ttl_ms: u64,
    pub sweep_interval_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            socket_dir: PathBuf::from("/tmp/shmserve"),
            shm_dir: PathBuf::from("/dev/shm/shmserve"),
            pool_size: 32,
            workers: 1,
            executors_per_worker: 8,
            handler_threads: 16,
            request_timeout_ms: 5_000,
            lease_ttl_ms: 30_000,
            sweep_interval_ms: 1_000,
            connect_timeout_ms: 5_000,
        }
    }
}

impl RuntimeConfig {
    pub fn sockets(&self) -> SocketLayout {
        SocketLayout::new(&self.socket_dir)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VersionConfig {
    pub version: u64,
    #[serde(default = "available")]
    pub state: VersionState,
}

fn available() -> VersionState {
    VersionState::Available
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    pub name: String,
    pub input: TensorSpec,
    pub output: TensorSpec,
    pub versions: Vec<VersionConfig>,
}

impl ModelConfig {
    pub fn spec(&self) -> ModelSpec {
        ModelSpec {
            inputs: vec![self.input.clone()],
            outputs: vec![self.output.clone()],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServingConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    pub served_model: String,
    #[serde(default = "cpu")]
    pub target_device: String,
    pub model_config_list: Vec<ModelConfig>,
}

fn cpu() -> String {
    "cpu".to_string()
}

impl ServingConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let rt = &self.runtime;
        ensure!(rt.pool_size > 0, "runtime.pool_size must be at least 1");
        ensure!(rt.workers > 0, "runtime.workers must be at least 1");
        ensure!(
            rt.executors_per_worker > 0,
            "runtime.executors_per_worker must be at least 1"
        );
        ensure!(rt.handler_threads > 0, "runtime.handler_threads must be at least 1");
        ensure!(rt.request_timeout_ms > 0, "runtime.request_timeout_ms must be positive");
        ensure!(
            rt.lease_ttl_ms > rt.request_timeout_ms,
            "runtime.lease_ttl_ms ({}) must exceed runtime.request_timeout_ms ({})",
            rt.lease_ttl_ms,
            rt.request_timeout_ms
        );
        ensure!(rt.sweep_interval_ms > 0, "runtime.sweep_interval_ms must be positive");

        let mut names = std::collections::HashSet::new();
        for model in &self.model_config_list {
            ensure!(names.insert(&model.name), "model '{}' is listed twice", model.name);
            ensure!(!model.versions.is_empty(), "model '{}' has no versions", model.name);
        }

        let served = self.served()?;
        for spec in [&served.input, &served.output] {
            if spec.byte_len().is_none() {
                bail!(
                    "served model '{}' tensor '{}' has dynamic dims; slot buffers need a fixed shape",
                    served.name,
                    spec.name
                );
            }
        }
        self.device()?;
        Ok(())
    }

    /// The model whose signature sizes the slot buffers.
    pub fn served(&self) -> Result<&ModelConfig> {
        self.model_config_list
            .iter()
            .find(|m| m.name == self.served_model)
            .with_context(|| {
                format!("served model '{}' is not in model_config_list", self.served_model)
            })
    }

    pub fn device(&self) -> Result<Device> {
        self.target_device.parse().map_err(anyhow::Error::msg)
    }

    pub fn arena_layout(&self) -> Result<ArenaLayout> {
        let served = self.served()?;
        Ok(ArenaLayout {
            slots: self.runtime.pool_size,
            input_bytes: fixed_byte_len(&served.input)?,
            output_bytes: fixed_byte_len(&served.output)?,
        })
    }

    /// Concrete descriptors of the served input and output tensors.
    pub fn served_descs(&self) -> Result<(TensorDesc, TensorDesc)> {
        let served = self.served()?;
        Ok((fixed_desc(&served.input)?, fixed_desc(&served.output)?))
    }
}

fn fixed_desc(spec: &TensorSpec) -> Result<TensorDesc> {
    let shape = spec
        .fixed_shape()
        .with_context(|| format!("tensor '{}' has dynamic dims", spec.name))?;
    Ok(TensorDesc::new(spec.dtype, shape))
}

fn fixed_byte_len(spec: &TensorSpec) -> Result<usize> {
    Ok(fixed_desc(spec)?.byte_len())
}

/// A one-model config for tests and the standalone demo.
pub fn single_model(name: &str, dtype: DType, input: &[usize], output: &[usize]) -> ServingConfig {
    let spec = |io: &str, dims: &[usize]| TensorSpec {
        name: shmserve_core::IOName(io.to_string()),
        dtype,
        dims: dims.iter().copied().map(Some).collect(),
    };
    ServingConfig {
        runtime: RuntimeConfig::default(),
        served_model: name.to_string(),
        target_device: cpu(),
        model_config_list: vec![ModelConfig {
            name: name.to_string(),
            input: spec("input", input),
            output: spec("output", output),
            versions: vec![VersionConfig {
                version: 1,
                state: VersionState::Available,
            }],
        }],
    }
}
