//! node-labeler
//!
//! Watches the cluster's nodes and labels those whose OS image matches a
//! pattern.
//!
//! ## Architecture
//!
//! - **Watcher**: lists and watches nodes into a local cache
//! - **Work queue**: deduplicated node names waiting for reconciliation
//! - **Workers**: compare each cached node against the rule and patch labels

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use nodelabel_controller::config::{Config, LogFormat};
use nodelabel_controller::{ClusterConfig, ContainerLinuxPredicate, Controller, KubeClient};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    init_tracing(&config);

    info!("Starting node-labeler");
    info!(
        master = ?config.master,
        kubeconfig = ?config.kubeconfig,
        workers = config.workers,
        label = %config.label,
        os_image_pattern = %config.os_image_pattern,
        "Configuration loaded"
    );

    let cluster = ClusterConfig::from_flags(config.master.as_deref(), config.kubeconfig.as_deref())
        .context("Failed to resolve cluster connection")?;
    info!(server = %cluster.server, "Connecting to API server");

    let client = KubeClient::new(&cluster)?;
    let predicate = ContainerLinuxPredicate::new(
        &config.os_image_pattern,
        config.label.clone(),
        config.label_value.clone(),
    )
    .context("Invalid OS image pattern")?;

    let controller = Controller::new(
        Arc::new(client),
        Arc::new(predicate),
        config.controller_config(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    if let Err(e) = controller.run(shutdown_rx).await {
        error!(error = %e, "Controller failed");
        return Err(e.into());
    }

    info!("node-labeler shutdown complete");
    Ok(())
}

fn init_tracing(config: &Config) {
    // Prefer RUST_LOG, fall back to --log-level
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into());
    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
