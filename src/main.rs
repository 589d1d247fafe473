use std::sync::Arc;

use anyhow::Context;
use lattice::dispatch::LoopbackTransport;
use lattice::store::SledStore;
use lattice::{Orchestrator, OrchestratorConfig};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match OrchestratorConfig::from_yaml("config.yaml") {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load config.yaml ({err}), using defaults");
            OrchestratorConfig::defaults()
        }
    };

    let level = config
        .logging
        .level
        .clone()
        .unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .init();

    if config.metrics.enabled {
        lattice::metrics::start_metrics_server(config.metrics.port)
            .context("starting metrics exporter")?;
    }

    // The node-facing transport is provided by the deployment's adapter;
    // standalone, the loopback transport accepts and records dispatches.
    let store: Option<Arc<dyn lattice::store::Store>> = match std::env::var("LATTICE_STORE_PATH") {
        Ok(path) => Some(Arc::new(SledStore::open(&path).context("opening store")?)),
        Err(_) => None,
    };
    let transport = Arc::new(LoopbackTransport::new());
    let orchestrator = Arc::new(Orchestrator::with_parts(
        config,
        transport,
        Arc::new(lattice::clock::SystemClock::new()),
        store.clone(),
    )?);

    if store.is_some() {
        match orchestrator.recover() {
            Ok(report) => info!(
                nodes = report.nodes_restored,
                tasks = report.tasks_resurfaced,
                "recovered persisted state"
            ),
            Err(err) => warn!(error = %err, "recovery failed, starting empty"),
        }
    }

    orchestrator.start();
    info!(
        orchestrator_id = %orchestrator.orchestrator_id(),
        version = lattice::VERSION,
        "lattice orchestrator running"
    );

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown signal received");
    orchestrator.shutdown();
    Ok(())
}
