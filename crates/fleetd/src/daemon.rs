//! `fleetd run`: the long-running server process.
//!
//! This process is the only one that opens the state database. It
//! registers itself, runs the partition sweep and serves the admin API
//! that the other subcommands and peer servers use.

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use fleet_api::{ApiState, build_router};
use fleet_core::FleetConfig;
use fleet_events::{CloudManager, ServerRegistration};
use fleet_health::{PartitionSweeper, StaleServerReaper, SweepSettings};
use fleet_state::StateStore;

pub fn open_store(config: &FleetConfig) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(&config.storage.data_dir).with_context(|| {
        format!("creating data dir {}", config.storage.data_dir.display())
    })?;
    let path = config.database_path();
    let store = StateStore::open(&path)
        .with_context(|| format!("opening state database {}", path.display()))?;
    Ok(store)
}

pub async fn run(config: FleetConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.api.listen)
        .await
        .with_context(|| format!("binding admin API on {}", config.api.listen))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let daemon = tokio::spawn(serve(config, listener, shutdown_rx));

    // ── Graceful shutdown on Ctrl-C ────────────────────────────
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "failed to listen for Ctrl-C, shutting down");
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
        // Startup failures end the daemon before any signal arrives.
        _ = shutdown_tx.closed() => {}
    }

    daemon.await.context("daemon task panicked")??;
    info!("fleet daemon stopped");
    Ok(())
}

/// Open the store, register this server, then sweep and serve the admin
/// API on `listener` until `shutdown` flips.
pub async fn serve(
    config: FleetConfig,
    listener: TcpListener,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    info!(server = %config.server.name, "fleet daemon starting");

    // ── Initialize subsystems ──────────────────────────────────

    let store = open_store(&config)?;
    info!(path = ?config.database_path(), "state store opened");

    let cloud = Arc::new(CloudManager::from_store(store.clone()));
    let me = cloud.register_server(ServerRegistration {
        name: config.server.name.clone(),
        address: config.server.address.clone(),
        port: config.server.port,
        affinity_group: config.server.affinity_group.clone(),
        compute_power: config.server.compute_power,
    })?;
    info!(server = %me.name, id = me.id, mode = %me.mode, "server registered");

    let reaper = StaleServerReaper::new(
        Arc::new(store.clone()),
        cloud.coordinator().clone(),
        config.server.name.clone(),
    )
    .with_stale_interval(config.partition.stale_interval());

    let sweeper = Arc::new(PartitionSweeper::new(
        Arc::clone(&cloud),
        reaper,
        config.server.name.clone(),
        SweepSettings {
            sweep_interval: config.partition.sweep_interval(),
            rebalance_interval: config.partition.rebalance_interval(),
            event_retention: config.partition.event_retention(),
        },
    ));

    // ── Background sweep ───────────────────────────────────────

    let sweep_handle = tokio::spawn(sweeper.run(shutdown.clone()));

    // ── Admin API ──────────────────────────────────────────────

    let router = build_router(ApiState::new(cloud, store));
    let addr = listener.local_addr()?;
    info!(%addr, "admin API listening");

    let mut api_shutdown = shutdown;
    let served = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = api_shutdown.changed().await;
        })
        .await;
    if let Err(e) = &served {
        error!(error = %e, "admin API server failed");
    }

    let _ = sweep_handle.await;
    served.context("admin API server")?;
    Ok(())
}
