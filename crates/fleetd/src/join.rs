//! `fleetd join`: run a peer server against the daemon that owns the
//! state database.
//!
//! The peer registers itself through the admin API, then beats its
//! heartbeat every sweep interval so the owner's reaper never marks it
//! DOWN. If the owner no longer knows it (deleted while the peer was
//! running), it registers again.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use fleet_api::{ApiClient, ClientError};
use fleet_core::FleetConfig;
use fleet_events::ServerRegistration;
use fleet_state::ServerInfo;

pub async fn run(config: FleetConfig) -> anyhow::Result<()> {
    let client = ApiClient::new(config.api.client_endpoint());
    info!(server = %config.server.name, endpoint = %client.endpoint(), "joining fleet");

    let me = join(&client, &config).await?;
    info!(server = %me.name, id = me.id, mode = %me.mode, "joined fleet");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let interval = config.partition.sweep_interval();
    let heartbeat_handle = tokio::spawn(async move {
        run_heartbeat(&client, &config, interval, shutdown_rx).await;
    });

    // ── Wait for shutdown ──────────────────────────────────────
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl-C, shutting down");
    }
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    let _ = heartbeat_handle.await;

    info!("peer stopped");
    Ok(())
}

/// Register this server with the owning daemon.
pub async fn join(client: &ApiClient, config: &FleetConfig) -> anyhow::Result<ServerInfo> {
    let server = client
        .register_server(&ServerRegistration {
            name: config.server.name.clone(),
            address: config.server.address.clone(),
            port: config.server.port,
            affinity_group: config.server.affinity_group.clone(),
            compute_power: config.server.compute_power,
        })
        .await?;
    Ok(server)
}

/// Beat until `shutdown` flips. Failures are logged and retried on the
/// next tick.
pub async fn run_heartbeat(
    client: &ApiClient,
    config: &FleetConfig,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let name = &config.server.name;
    info!(server = %name, ?interval, "heartbeat loop started");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                match client.heartbeat(name).await {
                    Ok(_) => debug!(server = %name, "heartbeat sent"),
                    Err(ClientError::Api { status: 404, .. }) => {
                        warn!(server = %name, "owner lost this server, registering again");
                        if let Err(e) = join(client, config).await {
                            warn!(server = %name, error = %e, "re-registration failed");
                        }
                    }
                    Err(e) => warn!(server = %name, error = %e, "heartbeat failed"),
                }
            }
            _ = shutdown.changed() => {
                info!(server = %name, "heartbeat loop shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use fleet_api::{ApiState, build_router};
    use fleet_events::CloudManager;
    use fleet_state::*;

    async fn owner() -> (ApiClient, StateStore) {
        let store = StateStore::open_in_memory().unwrap();
        let cloud = Arc::new(CloudManager::from_store(store.clone()));
        let router = build_router(ApiState::new(cloud, store.clone()));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (ApiClient::new(addr.to_string()), store)
    }

    fn peer_config() -> FleetConfig {
        let mut config = FleetConfig::default();
        config.server.name = "jon-2".to_string();
        config.server.address = "10.0.0.6".to_string();
        config
    }

    #[tokio::test]
    async fn peer_joins_and_keeps_its_heartbeat_fresh() {
        let (client, store) = owner().await;
        let config = peer_config();

        join(&client, &config).await.unwrap();
        // Push the recorded heartbeat into the past.
        let mut stale = store.find_server_by_name("jon-2").unwrap().unwrap();
        stale.last_heartbeat = 1;
        store.update_server(&stale).unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = {
            let client = client.clone();
            let config = config.clone();
            tokio::spawn(async move {
                run_heartbeat(&client, &config, Duration::from_millis(20), shutdown_rx).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        let server = store.find_server_by_name("jon-2").unwrap().unwrap();
        assert!(server.last_heartbeat > 1);
        assert_eq!(server.mode, OperationMode::Normal);
    }

    #[tokio::test]
    async fn deleted_peer_registers_again() {
        let (client, store) = owner().await;
        let config = peer_config();
        let first = join(&client, &config).await.unwrap();
        client
            .set_operation_mode(&["jon-2".to_string()], OperationMode::Maintenance)
            .await
            .unwrap();
        client.delete_server("jon-2").await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = {
            let client = client.clone();
            let config = config.clone();
            tokio::spawn(async move {
                run_heartbeat(&client, &config, Duration::from_millis(20), shutdown_rx).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        let again = store.find_server_by_name("jon-2").unwrap().unwrap();
        assert_ne!(again.id, first.id);
        assert_eq!(again.mode, OperationMode::Normal);
    }

    #[tokio::test]
    async fn join_fails_without_an_owner() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = ApiClient::new(addr.to_string()).with_timeout(Duration::from_secs(2));
        assert!(join(&client, &peer_config()).await.is_err());
    }
}
