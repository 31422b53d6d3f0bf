//! Hive Worker
//!
//! Compute-node agent of a distributed training cluster.
//!
//! Architecture:
//! - Configuration: environment variables, overridable by CLI flags
//! - Repositories: the master's worker API behind traits
//! - Dataset: download deduplication shared by co-located workers
//! - Execution: venv setup, bare-metal or container jobs, supervision
//! - Worker: the enroll → poll → fetch → run → signal → cleanup state machine
//! - Scheduler: the loop driving the worker forever
//!
//! The worker enrolls with the master, polls for tasks, runs each task's
//! entry script, keeps the master informed while it runs and ships the
//! artifacts when it is done.

mod config;
mod container;
mod dataset;
mod execution;
mod repository;
mod scheduler;
mod service;
mod storage;
#[cfg(test)]
mod testing;
mod worker;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hive_core::dto::worker::RegisterWorker;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{Instrument, error, info, info_span};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::dataset::{DatasetCache, SqliteRegistry};
use crate::execution::Executor;
use crate::repository::MasterApi;
use crate::scheduler::WorkerLoop;
use crate::worker::Worker;
use hive_client::MasterClient;

#[derive(Parser)]
#[command(name = "hive-worker")]
#[command(about = "Compute-node agent for the Hive training cluster", long_about = None)]
struct Cli {
    /// Master URL
    #[arg(long, global = true, env = "HIVE_MASTER_URL")]
    master_url: Option<String>,

    /// Per-worker scratch directory
    #[arg(long, global = true, env = "HIVE_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Run jobs inside a container
    #[arg(long, global = true, env = "HIVE_IN_CONTAINER")]
    in_container: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll and process tasks until stopped
    Run,
    /// Obtain a worker identity from the master
    Register {
        /// Human-readable worker name
        #[arg(long)]
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hive_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Register { name } => register(&config, name).await,
        Commands::Run => {
            config.validate_for_run()?;
            let span = info_span!("worker", id = %config.worker_id);
            let result = run(config).instrument(span).await;
            if let Err(e) = &result {
                error!("Worker stopped: {:#}", e);
            }
            result
        }
    }
}

/// Loads configuration from the environment and applies CLI overrides
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::from_env(cli.master_url.clone())?;

    if let Some(dir) = &cli.work_dir {
        config.work_dir = dir.clone();
    }
    if cli.in_container {
        config.in_container = true;
    }

    config.validate()?;
    Ok(config)
}

async fn register(config: &Config, name: String) -> Result<()> {
    let client = MasterClient::new(config.master_url.clone());
    let credentials = client
        .register(&RegisterWorker {
            name,
            worker_type: config.worker_kind,
        })
        .await
        .context("Failed to register worker")?;

    info!("Registered worker {}", credentials.uuid);
    println!("HIVE_WORKER_ID={}", credentials.uuid);
    println!("HIVE_PASSCODE={}", credentials.passcode);
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    info!(
        "Starting Hive Worker: master_url={}, work_dir={}, in_container={}",
        config.master_url,
        config.work_dir.display(),
        config.in_container
    );

    let master: Arc<dyn MasterApi> = Arc::new(MasterClient::new(config.master_url.clone()));

    let registry = SqliteRegistry::open(&config.registry_path)
        .await
        .context("Failed to open dataset registry")?;
    let datasets = DatasetCache::new(Arc::new(registry), config.dataset_root.clone());

    let executor = Executor::from_config(&config);
    executor
        .check_backend()
        .await
        .context("Execution backend unavailable")?;

    let worker = Worker::new(config, master, datasets, executor);
    WorkerLoop::new(worker).run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "hive-worker",
            "register",
            "--name",
            "gpu-01",
            "--master-url",
            "http://master:9000",
            "--in-container",
        ])
        .unwrap();

        assert_eq!(cli.master_url.as_deref(), Some("http://master:9000"));
        assert!(cli.in_container);
        assert!(matches!(cli.command, Commands::Register { ref name } if name == "gpu-01"));

        let config = load_config(&cli).unwrap();
        assert_eq!(config.master_url, "http://master:9000");
        assert!(config.in_container);
    }
}
