mod cli;
mod grpc;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use clap::Parser;
use cli::{Cli, Command};
use shmserve_backend_echo::EchoExecutor;
use shmserve_core::{Device, ModelDirectory};
use shmserve_proto::shmserve::v1::model_service_server::ModelServiceServer;
use shmserve_proto::shmserve::v1::prediction_service_server::PredictionServiceServer;
use shmserve_runtime::{
    FrontEnd, HandlerPool, InferenceWorker, ModelRegistry, ServingConfig, SlotManager,
};
use tonic_reflection::server::Builder as ReflectionBuilder;
use tracing_subscriber::EnvFilter;

use grpc::{ModelSvc, PredictionSvc};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ServingConfig::load(&cli.config)?;
    tracing::info!(
        config = %cli.config.display(),
        model = config.served_model,
        pool_size = config.runtime.pool_size,
        "configuration loaded"
    );

    match cli.command {
        Command::Manager => run_manager(config).await,
        Command::Worker { index } => run_worker(config, index).await,
        Command::Serve { grpc_addr } => serve(config, grpc_addr).await,
        Command::Standalone { grpc_addr } => standalone(config, grpc_addr).await,
    }
}

async fn run_manager(config: ServingConfig) -> Result<()> {
    let manager = SlotManager::spawn(&config.runtime, config.arena_layout()?)?;
    tokio::task::spawn_blocking(move || manager.join()).await?
}

async fn run_worker(config: ServingConfig, index: usize) -> Result<()> {
    let worker = bind_worker(&config, index)?;
    tokio::task::spawn_blocking(move || worker.run()).await?
}

async fn serve(config: ServingConfig, grpc_addr: String) -> Result<()> {
    let directory = model_directory(&config);
    let front = start_front_end(config, directory.clone()).await?;
    serve_grpc(&grpc_addr, front, directory).await
}

async fn standalone(config: ServingConfig, grpc_addr: String) -> Result<()> {
    let manager = SlotManager::spawn(&config.runtime, config.arena_layout()?)?;
    for index in 0..config.runtime.workers {
        bind_worker(&config, index)?.spawn()?;
    }
    let directory = model_directory(&config);
    let front = start_front_end(config, directory.clone()).await?;

    let served = serve_grpc(&grpc_addr, front, directory).await;
    if let Err(e) = manager.shutdown() {
        tracing::error!(error = ?e, "slot manager shutdown failed");
    }
    served
}

fn bind_worker(config: &ServingConfig, index: usize) -> Result<InferenceWorker> {
    ensure!(
        index < config.runtime.workers,
        "worker index {index} out of range, the deployment has {} workers",
        config.runtime.workers
    );
    let device = config.device()?;
    if device != Device::Cpu {
        tracing::warn!(%device, "echo executor runs on the host, ignoring target device");
    }
    InferenceWorker::bind(config, index, Arc::new(EchoExecutor::new()))
}

fn model_directory(config: &ServingConfig) -> Arc<dyn ModelDirectory> {
    Arc::new(ModelRegistry::from_config(&config.model_config_list))
}

/// Opening the serving threads blocks on the manager and worker sockets.
async fn start_front_end(
    config: ServingConfig,
    directory: Arc<dyn ModelDirectory>,
) -> Result<FrontEnd> {
    tokio::task::spawn_blocking(move || HandlerPool::start(&config, directory)).await?
}

async fn serve_grpc(
    grpc_addr: &str,
    front: FrontEnd,
    directory: Arc<dyn ModelDirectory>,
) -> Result<()> {
    let addr: SocketAddr = grpc_addr
        .parse()
        .with_context(|| format!("invalid gRPC address {grpc_addr}"))?;
    let prediction = PredictionSvc {
        front: front.clone(),
        directory: directory.clone(),
    };
    let models = ModelSvc { front, directory };

    tracing::info!(%addr, "shmserved gRPC listening");
    let reflection = ReflectionBuilder::configure()
        .register_encoded_file_descriptor_set(shmserve_proto::FILE_DESCRIPTOR_SET)
        .build_v1()
        .map_err(|e| anyhow::anyhow!("reflection build failed: {e}"))?;

    tonic::transport::Server::builder()
        .add_service(PredictionServiceServer::new(prediction))
        .add_service(ModelServiceServer::new(models))
        .add_service(reflection)
        .serve(addr)
        .await?;

    Ok(())
}
