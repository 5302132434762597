//! Stale-server reaper: demotes NORMAL servers that stopped heartbeating.
//!
//! A server whose last heartbeat is older than the stale interval is moved
//! to DOWN in one bulk update. The instance running the sweep is skipped;
//! it is alive by definition. One pending-request sweep follows, so a
//! burst of demotions costs a single fleet-wide recompute.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use fleet_events::{PartitionCoordinator, PartitionResult, RequestedSweep};
use fleet_state::*;

/// Default time without a heartbeat before a server is considered down.
pub const STALE_INTERVAL: Duration = Duration::from_secs(120);

/// Result of one reaper pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Names of servers moved from NORMAL to DOWN.
    pub demoted: Vec<String>,
    /// What the follow-up pending-request sweep did.
    pub sweep: RequestedSweep,
}

/// Marks stale servers DOWN and drains pending repartition requests.
pub struct StaleServerReaper {
    servers: Arc<dyn ServerDirectory>,
    coordinator: Arc<PartitionCoordinator>,
    /// Name of the server running this reaper.
    self_name: String,
    stale_interval: Duration,
}

impl StaleServerReaper {
    pub fn new(
        servers: Arc<dyn ServerDirectory>,
        coordinator: Arc<PartitionCoordinator>,
        self_name: impl Into<String>,
    ) -> Self {
        Self {
            servers,
            coordinator,
            self_name: self_name.into(),
            stale_interval: STALE_INTERVAL,
        }
    }

    /// Override the stale interval.
    pub fn with_stale_interval(mut self, interval: Duration) -> Self {
        self.stale_interval = interval;
        self
    }

    pub fn stale_interval(&self) -> Duration {
        self.stale_interval
    }

    /// Run one pass against the current clock.
    pub fn mark_stale_servers_down(&self) -> PartitionResult<ReapReport> {
        self.sweep_at(epoch_secs())
    }

    /// Run one pass as if the clock read `now` (unix seconds).
    pub fn sweep_at(&self, now: u64) -> PartitionResult<ReapReport> {
        let cutoff = now.saturating_sub(self.stale_interval.as_secs());
        let demoted = self.servers.mark_stale_servers_down(cutoff, &self.self_name)?;

        for server in &demoted {
            warn!(
                server = %server.name,
                last_heartbeat = server.last_heartbeat,
                cutoff,
                "server missed heartbeats, marked DOWN"
            );
            self.coordinator
                .audit_event(PartitionEventType::ServerDown, &server.name)?;
        }

        let names: Vec<String> = demoted.into_iter().map(|s| s.name).collect();
        if !names.is_empty() {
            self.coordinator.request_deferred_event(
                PartitionEventType::OperationModeChange,
                &format!("{} -> DOWN", names.join(",")),
            )?;
        }

        let sweep = self.coordinator.process_requested_events()?;
        debug!(
            demoted = names.len(),
            processed = sweep.processed,
            recomputed = sweep.recomputed,
            "stale server sweep finished"
        );
        Ok(ReapReport {
            demoted: names,
            sweep,
        })
    }
}
