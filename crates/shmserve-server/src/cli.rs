use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "shmserved", version, about = "Shared-memory inference serving daemon")]
pub struct Cli {
    /// JSON serving config
    #[arg(long, global = true, default_value = "config/shmserve.json")]
    pub config: PathBuf,

    /// Log filter, used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    pub log: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Own the shared buffer arena and the slot pool
    Manager,

    /// Run one inference worker with the echo executor
    Worker {
        /// Worker index; binds inference-<index>.sock
        #[arg(long, default_value_t = 0)]
        index: usize,
    },

    /// Start the gRPC front end against a running manager and workers
    Serve {
        /// Bind address for gRPC
        #[arg(long, default_value = "0.0.0.0:9000")]
        grpc_addr: String,
    },

    /// Manager, workers and front end in a single process
    Standalone {
        /// Bind address for gRPC
        #[arg(long, default_value = "0.0.0.0:9000")]
        grpc_addr: String,
    },
}
