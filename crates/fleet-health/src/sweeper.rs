//! Periodic partition sweep: the background loop a running server owns.
//!
//! Every sweep tick the loop beats this server's own heartbeat, runs the
//! stale-server reaper (which drains pending repartition requests) and
//! purges partition events past their retention. When a rebalance
//! interval is set, a PERIODIC request is enqueued on its own tick and
//! picked up by the next sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, Interval};
use tracing::{debug, error, info};

use fleet_events::CloudManager;
use fleet_state::*;

use crate::reaper::StaleServerReaper;

/// Timing knobs for the sweep loop.
#[derive(Debug, Clone, Copy)]
pub struct SweepSettings {
    pub sweep_interval: Duration,
    /// `None` disables periodic rebalancing.
    pub rebalance_interval: Option<Duration>,
    pub event_retention: Duration,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            rebalance_interval: None,
            event_retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Drives the reaper, heartbeat and event purge on a timer.
pub struct PartitionSweeper {
    cloud: Arc<CloudManager>,
    reaper: StaleServerReaper,
    self_name: String,
    settings: SweepSettings,
}

impl PartitionSweeper {
    pub fn new(
        cloud: Arc<CloudManager>,
        reaper: StaleServerReaper,
        self_name: impl Into<String>,
        settings: SweepSettings,
    ) -> Self {
        Self {
            cloud,
            reaper,
            self_name: self_name.into(),
            settings,
        }
    }

    /// One sweep: heartbeat, reap, purge. Failures are logged, never raised.
    pub fn sweep_once(&self) {
        if let Err(e) = self.cloud.heartbeat(&self.self_name) {
            error!(server = %self.self_name, error = %e, "own heartbeat failed");
        }

        match self.reaper.mark_stale_servers_down() {
            Ok(report) if !report.demoted.is_empty() || report.sweep.processed > 0 => {
                info!(
                    demoted = report.demoted.len(),
                    processed = report.sweep.processed,
                    recomputed = report.sweep.recomputed,
                    "partition sweep"
                );
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "stale server sweep failed"),
        }

        let cutoff = epoch_secs().saturating_sub(self.settings.event_retention.as_secs());
        match self.cloud.coordinator().purge_events_before(cutoff) {
            Ok(0) => {}
            Ok(purged) => debug!(purged, cutoff, "old partition events purged"),
            Err(e) => error!(error = %e, "partition event purge failed"),
        }
    }

    /// Enqueue a PERIODIC repartition request.
    pub fn request_rebalance(&self) {
        if let Err(e) = self
            .cloud
            .coordinator()
            .request_deferred_event(PartitionEventType::Periodic, &self.self_name)
        {
            error!(error = %e, "periodic rebalance request failed");
        }
    }

    /// Run until `shutdown` flips.
    ///
    /// Sweeps and rebalance requests hit the state store synchronously, so
    /// each runs on the blocking pool rather than on a runtime worker.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            server = %self.self_name,
            sweep_secs = self.settings.sweep_interval.as_secs(),
            stale_secs = self.reaper.stale_interval().as_secs(),
            rebalance_secs = self.settings.rebalance_interval.map(|d| d.as_secs()),
            "partition sweeper started"
        );

        let mut sweep = tokio::time::interval(self.settings.sweep_interval);
        let mut rebalance = self
            .settings
            .rebalance_interval
            .map(|period| tokio::time::interval_at(Instant::now() + period, period));

        loop {
            tokio::select! {
                _ = sweep.tick() => {
                    let sweeper = Arc::clone(&self);
                    if let Err(e) = tokio::task::spawn_blocking(move || sweeper.sweep_once()).await {
                        error!(error = %e, "partition sweep task failed");
                    }
                }
                _ = next_tick(&mut rebalance) => {
                    let sweeper = Arc::clone(&self);
                    if let Err(e) = tokio::task::spawn_blocking(move || sweeper.request_rebalance()).await {
                        error!(error = %e, "rebalance request task failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("partition sweeper shutting down");
                    break;
                }
            }
        }
    }
}

/// Resolves on the timer's next tick; never resolves without a timer.
async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_events::{AgentRegistration, ServerRegistration};

    fn setup(settings: SweepSettings) -> (StateStore, Arc<PartitionSweeper>) {
        let store = StateStore::open_in_memory().unwrap();
        let cloud = Arc::new(CloudManager::from_store(store.clone()));
        for name in ["self", "peer"] {
            cloud
                .register_server(ServerRegistration {
                    name: name.to_string(),
                    address: "10.0.0.1".to_string(),
                    port: 7080,
                    affinity_group: None,
                    compute_power: 1,
                })
                .unwrap();
        }
        for i in 0..3 {
            cloud
                .register_agent(AgentRegistration {
                    name: format!("agent-{i}"),
                    address: "10.0.1.1".to_string(),
                    port: 16163,
                    affinity_group: None,
                    registering_server: None,
                })
                .unwrap();
        }
        let reaper = StaleServerReaper::new(
            Arc::new(store.clone()),
            cloud.coordinator().clone(),
            "self",
        );
        let sweeper = Arc::new(PartitionSweeper::new(cloud, reaper, "self", settings));
        (store, sweeper)
    }

    #[test]
    fn sweep_once_drains_registration_requests() {
        let (store, sweeper) = setup(SweepSettings::default());
        assert_eq!(store.list_by_status(ExecutionStatus::Requested).unwrap().len(), 2);

        sweeper.sweep_once();

        assert!(store.list_by_status(ExecutionStatus::Requested).unwrap().is_empty());
        assert_eq!(store.list_by_status(ExecutionStatus::Completed).unwrap().len(), 2);
        assert_eq!(store.list_failover_lists().unwrap().len(), 3);
    }

    #[test]
    fn sweep_once_keeps_events_inside_retention() {
        let (store, sweeper) = setup(SweepSettings::default());
        let before = store.list_events().unwrap().len();

        sweeper.sweep_once();

        assert_eq!(store.list_events().unwrap().len(), before);
    }

    #[test]
    fn request_rebalance_enqueues_periodic() {
        let (store, sweeper) = setup(SweepSettings::default());
        sweeper.sweep_once();

        sweeper.request_rebalance();

        let pending = store.list_by_status(ExecutionStatus::Requested).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event_type, PartitionEventType::Periodic);
    }

    #[tokio::test]
    async fn run_sweeps_until_shutdown() {
        let (store, sweeper) = setup(SweepSettings {
            sweep_interval: Duration::from_millis(20),
            rebalance_interval: Some(Duration::from_millis(30)),
            event_retention: Duration::from_secs(3600),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(Arc::clone(&sweeper).run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(150)).await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        let periodic = store
            .list_events()
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == PartitionEventType::Periodic)
            .count();
        assert!(periodic >= 1, "rebalance tick fired");
        assert_eq!(store.list_failover_lists().unwrap().len(), 3);
        let own = store.find_server_by_name("self").unwrap().unwrap();
        assert_eq!(own.mode, OperationMode::Normal);
    }
}
