//! Serve command implementation.

use crate::server::{start_server, ServerState};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use vload_core::{Config, Pipeline, Services};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Run the HTTP service until SIGINT or SIGTERM.
pub async fn run(
    mut config: Config,
    listen_port: Option<u16>,
    metrics_port: Option<u16>,
) -> Result<()> {
    // Apply CLI overrides
    if let Some(port) = listen_port {
        config.server.listen_port = port;
    }
    if let Some(port) = metrics_port {
        config.server.metrics_port = port;
    }

    info!(
        listen_port = config.server.listen_port,
        metrics_port = config.server.metrics_port,
        store = ?config.store.backend,
        "Starting vload service"
    );

    let services = Services::from_config(&config).await?;

    let state = Arc::new(ServerState::new(Pipeline::new(&services, &config)));
    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);

    // Spawn a task to handle shutdown signals (SIGINT and SIGTERM)
    let shutdown_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_signal.send(());
    });

    start_server(
        state,
        config.server.listen_port,
        config.server.metrics_port,
        shutdown_rx,
    )
    .await?;

    info!("vload service stopped");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler, listening for SIGINT only");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, initiating graceful shutdown");
    }
}
