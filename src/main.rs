// src/main.rs
//! Agent Orchestrator daemon
//!
//! Loads configuration, opens storage, probes the runner binaries, starts the
//! reconciler and supervises runs until Ctrl-C, then shuts down gracefully.

use agent_orchestrator::model::ProfileSet;
use agent_orchestrator::observability::{init_tracing, MetricsFacade};
use agent_orchestrator::runners::registry::RunnerRegistry;
use agent_orchestrator::runtime::{HostProcessControl, Orchestrator, SimulatedProcesses};
use agent_orchestrator::sandbox::LocalSandboxProvider;
use agent_orchestrator::storage::Repositories;
use agent_orchestrator::utils::config::{AppConfig, StorageBackend};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = AppConfig::load()?;

    // Initialize observability (tracing)
    init_tracing(&config.logging)?;
    info!("Starting Agent Orchestrator v{}", agent_orchestrator::VERSION);
    info!("Configuration loaded: {:?}", config);

    let repos = match config.storage.backend {
        StorageBackend::Memory => {
            warn!("Using in-memory storage; runs will not survive a restart");
            Repositories::in_memory()
        }
        StorageBackend::Sqlite => {
            info!("Opening SQLite storage at {:?}", config.storage.path);
            Repositories::sqlite(&config.storage.path).await?
        }
    };

    if let Some(path) = &config.profiles_file {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading profiles file {}", path.display()))?;
        let set = ProfileSet::from_yaml(&text)?;
        for profile in set.profiles {
            info!("Seeding profile {} ({})", profile.id, profile.runner);
            repos.profiles.put_profile(profile).await?;
        }
    }

    // Runner adapters, probed once at startup
    let processes = Arc::new(SimulatedProcesses::new());
    let mut registry = RunnerRegistry::from_settings(&config.runners, processes.clone());
    registry.probe().await;

    let orchestrator = Orchestrator::builder(repos)
        .config(config.orchestrator_config())
        .terminator(config.terminator_config())
        .registry(registry)
        .processes(processes.clone())
        .process_control(Arc::new(HostProcessControl::new(processes)))
        .sandbox(Arc::new(LocalSandboxProvider::new(&config.sandbox.base_dir)))
        .metrics(Arc::new(MetricsFacade))
        .broadcaster_capacity(config.broadcaster.subscriber_queue)
        .build();

    for runner in orchestrator.registry().availability() {
        info!(
            "Runner {}: {} ({})",
            runner.kind,
            if runner.available { "available" } else { "unavailable" },
            runner.reason
        );
    }

    // Reconciler runs until shutdown
    let shutdown = CancellationToken::new();
    let reconciler = Arc::new(orchestrator.reconciler(config.reconciler_config()));
    let reconciler_task = reconciler.spawn(shutdown.clone());

    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl-C handler")?;
    info!("Received shutdown signal, cleaning up...");

    shutdown.cancel();
    orchestrator.shutdown().await;
    if let Err(e) = reconciler_task.await {
        warn!("Reconciler task ended abnormally: {}", e);
    }

    info!("Agent Orchestrator stopped");
    Ok(())
}
