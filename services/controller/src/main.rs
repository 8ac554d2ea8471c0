//! helion extension controller.
//!
//! Watches ClusterExtension desired state and converges the cluster to it:
//! bundle unpack, CRD upgrade preflight, RBAC pre-authorization and
//! revisioned, probe-gated rollout. Orchestrator client wiring is provided
//! by the platform harness; standalone runs use the in-memory state for
//! local development.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use helion_controller::{
    Config, ControllerRuntime, InMemoryClusterState, Reconciler,
};
use helion_rollout::FakeCluster;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting helion extension controller");

    let config = Config::from_env()?;
    info!(
        cache_dir = %config.cache_dir.display(),
        resync_secs = config.reconcile_interval.as_secs(),
        "Configuration loaded"
    );

    let state = Arc::new(InMemoryClusterState::new());
    let objects = Arc::new(FakeCluster::new());
    let reconciler = Arc::new(Reconciler::new(config.clone(), state.clone(), objects)?);
    let runtime = ControllerRuntime::new(config, reconciler, state);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    runtime.run(shutdown_rx).await;
    Ok(())
}
