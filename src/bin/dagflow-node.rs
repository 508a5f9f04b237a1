//! # Dagflow Node
//!
//! Runs a master and its workers in one process around an in-memory
//! registry, optionally submitting workflow definitions on startup.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dagflow_core::config::{ConfigLoader, DagflowConfig};
use dagflow_core::engine::{InMemoryInstanceDao, WorkflowDefinition};
use dagflow_core::logging::init_structured_logging;
use dagflow_core::master::MasterServer;
use dagflow_core::registry::{InMemoryRegistry, SystemResourceProbe};
use dagflow_core::worker::WorkerServer;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "dagflow-node")]
#[command(about = "Run dagflow master and worker nodes")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// TOML configuration file layered over the defaults
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one master and a set of workers sharing an in-process registry
    Standalone {
        /// Number of worker nodes to start
        #[arg(short, long, default_value_t = 1)]
        workers: u16,

        /// Workflow definition files (JSON) to submit once the cluster is up
        #[arg(short, long)]
        submit: Vec<PathBuf>,
    },

    /// Load and validate the configuration, then print it
    ValidateConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    init_structured_logging(&config.logging);

    match cli.command {
        Commands::Standalone { workers, submit } => run_standalone(config, workers, submit).await,
        Commands::ValidateConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<DagflowConfig> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = path {
        loader = loader.with_file(path);
    }
    loader.load().context("failed to load configuration")
}

async fn run_standalone(config: DagflowConfig, workers: u16, submit: Vec<PathBuf>) -> Result<()> {
    let (shutdown_tx, _) = broadcast::channel(4);
    let registry = Arc::new(InMemoryRegistry::new());
    let reaper = Arc::clone(&registry)
        .spawn_lease_reaper(config.registry.lease_reaper_interval(), shutdown_tx.subscribe());
    let probe = Arc::new(SystemResourceProbe::new());

    let master = MasterServer::start(
        config.clone(),
        registry.clone(),
        Arc::new(InMemoryInstanceDao::new()),
        probe.clone(),
    )
    .await
    .context("failed to start master")?;

    let mut worker_nodes = Vec::with_capacity(usize::from(workers));
    for index in 0..workers {
        let mut worker_config = config.clone();
        if worker_config.worker.listen_port != 0 {
            worker_config.worker.listen_port = worker_config
                .worker
                .listen_port
                .checked_add(index)
                .context("worker port range overflows")?;
        }
        let worker = WorkerServer::start(worker_config, registry.clone(), probe.clone())
            .await
            .with_context(|| format!("failed to start worker {index}"))?;
        worker_nodes.push(worker);
    }

    for path in submit {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let definition: WorkflowDefinition = serde_json::from_str(&raw)
            .with_context(|| format!("invalid workflow definition in {}", path.display()))?;
        match master.engine().submit(definition).await {
            Ok(handle) => info!(
                workflow_instance_id = handle.workflow_instance_id(),
                file = %path.display(),
                "Submitted workflow"
            ),
            Err(e) => error!(file = %path.display(), error = %e, "Workflow submission failed"),
        }
    }

    info!(
        master = %master.host(),
        web = %master.web_address(),
        workers = worker_nodes.len(),
        "Standalone cluster running, press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    for worker in &worker_nodes {
        worker.shutdown().await;
    }
    master.shutdown().await;
    let _ = shutdown_tx.send(());
    let _ = reaper.await;
    Ok(())
}
