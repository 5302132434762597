//! Partition event coordinator: the entry point for every repartition.
//!
//! The `PartitionCoordinator`:
//! - Serves an agent's existing failover list, or generates one for it
//!   against the current load picture (single-agent path)
//! - Regenerates every agent's list from scratch (fleet-wide path)
//! - Records deferred requests and later coalesces them into one run
//! - Appends audit-only events
//!
//! Generation runs fully in memory first; only then is the store touched,
//! in one short transaction. Fleet-wide persists are serialized by a lock
//! so two runs cannot interleave their delete and insert.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use fleet_partition::{FailoverListGenerator, LoadSnapshot};
use fleet_state::*;
use tracing::{debug, error, info};

use crate::error::{PartitionError, PartitionResult};

/// Failover lists keyed by agent name.
pub type FailoverAssignments = BTreeMap<String, Vec<ServerEntry>>;

/// Outcome of one sweep over deferred (REQUESTED) events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestedSweep {
    /// Events marked COMPLETED by this sweep.
    pub processed: usize,
    /// Whether the fleet-wide recompute ran and committed.
    pub recomputed: bool,
}

/// Coordinates partition events against the injected directories and stores.
pub struct PartitionCoordinator {
    servers: Arc<dyn ServerDirectory>,
    agents: Arc<dyn AgentDirectory>,
    lists: Arc<dyn FailoverListStore>,
    events: Arc<dyn EventLog>,
    generator: FailoverListGenerator,
    /// Held while failover lists are written.
    persist_lock: Mutex<()>,
    /// Held while a sweep drains REQUESTED events.
    requested_lock: Mutex<()>,
}

impl PartitionCoordinator {
    /// Create a coordinator over explicit collaborators.
    pub fn new(
        servers: Arc<dyn ServerDirectory>,
        agents: Arc<dyn AgentDirectory>,
        lists: Arc<dyn FailoverListStore>,
        events: Arc<dyn EventLog>,
    ) -> Self {
        Self {
            servers,
            agents,
            lists,
            events,
            generator: FailoverListGenerator::default(),
            persist_lock: Mutex::new(()),
            requested_lock: Mutex::new(()),
        }
    }

    /// Create a coordinator whose collaborators are all the same store.
    pub fn from_store(store: StateStore) -> Self {
        let store = Arc::new(store);
        Self::new(store.clone(), store.clone(), store.clone(), store)
    }

    /// Replace the generator (e.g. to plug in a different load function).
    pub fn with_generator(mut self, generator: FailoverListGenerator) -> Self {
        self.generator = generator;
        self
    }

    /// An agent's stored failover list. Never computes.
    pub fn existing_for_agent(&self, agent_name: &str) -> PartitionResult<Option<Vec<ServerEntry>>> {
        let agent = self.require_agent(agent_name)?;
        Ok(self.lists.get_existing(agent.id)?)
    }

    /// Return the agent's failover list, generating it if it has none.
    ///
    /// An existing list is returned untouched. Otherwise a list is built
    /// for this one agent on top of the currently persisted load and
    /// written for this agent only.
    pub fn single_agent_event(
        &self,
        agent_name: &str,
        event_type: PartitionEventType,
        detail: &str,
    ) -> PartitionResult<Vec<ServerEntry>> {
        let agent = self.require_agent(agent_name)?;

        if let Some(existing) = self.lists.get_existing(agent.id)? {
            if !existing.is_empty() {
                debug!(agent = %agent.name, "failover list already exists");
                return Ok(existing);
            }
        }

        let servers = self.servers.list_cloud_servers()?;
        let snapshot = LoadSnapshot::from_assigned(&self.lists.assigned_load_snapshot()?);
        let generation =
            self.generator
                .generate(&servers, std::slice::from_ref(&agent), Some(&snapshot));
        let list = generation.lists.get(&agent.id).cloned().unwrap_or_default();

        let event_id = self
            .events
            .append(PartitionEvent::new(event_type, detail, ExecutionStatus::Immediate))?;

        if list.is_empty() {
            info!(agent = %agent.name, "no cloud servers, agent left without failover list");
            return Ok(list);
        }

        {
            let _guard = self
                .persist_lock
                .lock()
                .map_err(|_| PartitionError::LockPoisoned("persist"))?;
            self.lists.persist(agent.id, &list)?;
        }
        self.events.append_details(&[PartitionEventDetail {
            event_id,
            agent_name: agent.name.clone(),
            server_name: list[0].server_name.clone(),
        }])?;

        info!(
            agent = %agent.name,
            primary = %list[0].server_name,
            servers = list.len(),
            %event_type,
            "failover list generated for agent"
        );
        Ok(list)
    }

    /// Regenerate every agent's failover list now.
    pub fn fleet_wide_event(
        &self,
        event_type: PartitionEventType,
        detail: &str,
    ) -> PartitionResult<FailoverAssignments> {
        let event_id = self
            .events
            .append(PartitionEvent::new(event_type, detail, ExecutionStatus::Immediate))?;
        self.execute_fleet_wide(event_id)
    }

    /// Record a repartition request to be coalesced by the next sweep.
    pub fn request_deferred_event(
        &self,
        event_type: PartitionEventType,
        detail: &str,
    ) -> PartitionResult<EventId> {
        let event_id = self
            .events
            .append(PartitionEvent::new(event_type, detail, ExecutionStatus::Requested))?;
        info!(event_id, %event_type, %detail, "repartition requested");
        Ok(event_id)
    }

    /// Drain pending REQUESTED events with at most one fleet-wide run.
    ///
    /// Every event read by this sweep is marked COMPLETED, even if the run
    /// failed; the failure is logged. Events appended while the sweep is
    /// running are left for the next sweep.
    pub fn process_requested_events(&self) -> PartitionResult<RequestedSweep> {
        let _guard = self
            .requested_lock
            .lock()
            .map_err(|_| PartitionError::LockPoisoned("requested events"))?;

        let pending = self.events.list_by_status(ExecutionStatus::Requested)?;
        let Some(first) = pending.first() else {
            return Ok(RequestedSweep::default());
        };

        let recomputed = match self.execute_fleet_wide(first.id) {
            Ok(assignments) => {
                info!(
                    pending = pending.len(),
                    agents = assignments.len(),
                    "requested repartition executed"
                );
                true
            }
            Err(e) => {
                error!(
                    event_id = first.id,
                    error = %e,
                    "requested repartition failed, completing events anyway"
                );
                false
            }
        };

        for event in &pending {
            self.events.update_status(event.id, ExecutionStatus::Completed)?;
        }

        Ok(RequestedSweep {
            processed: pending.len(),
            recomputed,
        })
    }

    /// Record an audit-only event.
    pub fn audit_event(&self, event_type: PartitionEventType, detail: &str) -> PartitionResult<EventId> {
        let event_id = self
            .events
            .append(PartitionEvent::new(event_type, detail, ExecutionStatus::Audit))?;
        debug!(event_id, %event_type, %detail, "partition event audited");
        Ok(event_id)
    }

    /// Remove events created before `cutoff` (unix seconds).
    pub fn purge_events_before(&self, cutoff: u64) -> PartitionResult<usize> {
        Ok(self.events.purge_events_before(cutoff)?)
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn require_agent(&self, agent_name: &str) -> PartitionResult<AgentInfo> {
        self.agents
            .find_agent_by_name(agent_name)?
            .ok_or_else(|| PartitionError::Configuration(format!("unknown agent: {agent_name}")))
    }

    /// Generate for every agent, then delete and insert in one transaction.
    fn execute_fleet_wide(&self, event_id: EventId) -> PartitionResult<FailoverAssignments> {
        let servers = self.servers.list_cloud_servers()?;
        let agents = self.agents.list_all_agents()?;
        let generation = self.generator.generate(&servers, &agents, None);

        let rows: Vec<(AgentId, Vec<ServerEntry>)> = generation
            .lists
            .iter()
            .filter(|(_, list)| !list.is_empty())
            .map(|(id, list)| (*id, list.clone()))
            .collect();

        {
            let _guard = self
                .persist_lock
                .lock()
                .map_err(|_| PartitionError::LockPoisoned("persist"))?;
            self.lists.replace_all(&rows)?;
        }

        let names: HashMap<AgentId, &str> = agents.iter().map(|a| (a.id, a.name.as_str())).collect();
        let mut assignments = FailoverAssignments::new();
        let mut details = Vec::with_capacity(rows.len());
        for (agent_id, list) in rows {
            let Some(name) = names.get(&agent_id) else {
                continue;
            };
            details.push(PartitionEventDetail {
                event_id,
                agent_name: name.to_string(),
                server_name: list[0].server_name.clone(),
            });
            assignments.insert(name.to_string(), list);
        }
        self.events.append_details(&details)?;

        info!(
            event_id,
            agents = assignments.len(),
            servers = servers.len(),
            "fleet-wide failover lists committed"
        );
        Ok(assignments)
    }
}
