//! Cloud manager: server and agent administration.
//!
//! Every change that alters the shape of the cloud (a server joining,
//! leaving, changing mode or affinity group) is recorded as a deferred
//! repartition request; the next sweep coalesces them. Agent registration
//! is the exception: a new agent needs a failover list right away, so it
//! goes through the single-agent path.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use fleet_state::*;

use crate::coordinator::PartitionCoordinator;
use crate::error::{PartitionError, PartitionResult};

/// What a server reports about itself when it registers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRegistration {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub affinity_group: Option<String>,
    pub compute_power: u32,
}

/// What an agent reports about itself when it registers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub affinity_group: Option<String>,
    /// Server the agent first reached. A new agent records it as its
    /// current server so list generation keeps it as the primary.
    #[serde(default)]
    pub registering_server: Option<String>,
}

/// One row of the cloud status summary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerStatus {
    pub name: String,
    pub mode: OperationMode,
    pub affinity_group: Option<String>,
    pub last_heartbeat: u64,
    /// Agents whose rank-0 server this is.
    pub primary_agents: u32,
}

/// Administers servers and agents and raises the partition events their
/// changes imply.
pub struct CloudManager {
    servers: Arc<dyn ServerDirectory>,
    agents: Arc<dyn AgentDirectory>,
    lists: Arc<dyn FailoverListStore>,
    coordinator: Arc<PartitionCoordinator>,
}

impl CloudManager {
    pub fn new(
        servers: Arc<dyn ServerDirectory>,
        agents: Arc<dyn AgentDirectory>,
        lists: Arc<dyn FailoverListStore>,
        coordinator: Arc<PartitionCoordinator>,
    ) -> Self {
        Self {
            servers,
            agents,
            lists,
            coordinator,
        }
    }

    /// Build a manager and its coordinator over one store.
    pub fn from_store(store: StateStore) -> Self {
        let coordinator = Arc::new(PartitionCoordinator::from_store(store.clone()));
        let store = Arc::new(store);
        Self::new(store.clone(), store.clone(), store, coordinator)
    }

    /// The coordinator partition events are raised on.
    pub fn coordinator(&self) -> &Arc<PartitionCoordinator> {
        &self.coordinator
    }

    // ── Servers ─────────────────────────────────────────────────────

    /// Register a server, or refresh it if the name is already known.
    ///
    /// A new server starts in NORMAL mode. A known server gets a fresh
    /// heartbeat and is brought to NORMAL from INSTALLED or DOWN; one held in
    /// MAINTENANCE stays there. Joining the cloud raises a SERVER_ADDED
    /// request; a known server re-entering it raises OPERATION_MODE_CHANGE.
    pub fn register_server(&self, registration: ServerRegistration) -> PartitionResult<ServerInfo> {
        let now = epoch_secs();

        if let Some(mut server) = self.servers.find_server_by_name(&registration.name)? {
            let was_cloud = server.is_cloud_member();
            server.address = registration.address;
            server.port = registration.port;
            server.affinity_group = registration.affinity_group;
            server.compute_power = registration.compute_power;
            if matches!(server.mode, OperationMode::Installed | OperationMode::Down) {
                server.mode = OperationMode::Normal;
            }
            server.last_heartbeat = now;
            self.servers.update_server(&server)?;
            debug!(server = %server.name, mode = %server.mode, "server re-registered");
            if !was_cloud && server.is_cloud_member() {
                self.coordinator
                    .request_deferred_event(PartitionEventType::OperationModeChange, &server.name)?;
            }
            return Ok(server);
        }

        let server = self.servers.create_server(ServerInfo {
            id: 0,
            name: registration.name,
            address: registration.address,
            port: registration.port,
            affinity_group: registration.affinity_group,
            mode: OperationMode::Normal,
            compute_power: registration.compute_power,
            last_heartbeat: now,
        })?;
        info!(server = %server.name, id = server.id, "server joined the cloud");
        self.coordinator
            .request_deferred_event(PartitionEventType::ServerAdded, &server.name)?;
        Ok(server)
    }

    /// Record a heartbeat. A DOWN server that beats again is brought back
    /// to NORMAL. Returns `false` for unknown servers.
    pub fn heartbeat(&self, server_name: &str) -> PartitionResult<bool> {
        let Some(mut server) = self.servers.find_server_by_name(server_name)? else {
            warn!(server = %server_name, "heartbeat from unknown server");
            return Ok(false);
        };

        server.last_heartbeat = epoch_secs();
        let revived = server.mode == OperationMode::Down;
        if revived {
            server.mode = OperationMode::Normal;
        }
        self.servers.update_server(&server)?;

        if revived {
            info!(server = %server.name, "server back up");
            self.coordinator.request_deferred_event(
                PartitionEventType::OperationModeChange,
                &format!("{} DOWN -> NORMAL", server.name),
            )?;
        }
        Ok(true)
    }

    /// Remove a server that is out of the cloud.
    ///
    /// NORMAL servers are rejected without any change. Otherwise the
    /// server is removed from the directory and stripped from every
    /// failover list in a single store write, then a SERVER_REMOVED request
    /// is raised.
    pub fn delete_server(&self, server_name: &str) -> PartitionResult<()> {
        let server = self.require_server(server_name)?;
        if server.mode == OperationMode::Normal {
            return Err(PartitionError::Configuration(format!(
                "server {server_name} is in NORMAL mode; change its mode before deleting it"
            )));
        }

        let touched = match self.servers.delete_server(server.id) {
            Ok(touched) => touched,
            Err(StateError::ServerActive(name)) => {
                return Err(PartitionError::Configuration(format!(
                    "server {name} is in NORMAL mode; change its mode before deleting it"
                )));
            }
            Err(e) => return Err(e.into()),
        };
        info!(server = %server.name, lists = touched, "server deleted");

        self.coordinator
            .request_deferred_event(PartitionEventType::ServerRemoved, &server.name)?;
        Ok(())
    }

    /// Change the operation mode of the named servers.
    ///
    /// All names are resolved before anything is written. A request is
    /// raised only if some server enters or leaves NORMAL.
    pub fn set_operation_mode(&self, names: &[String], mode: OperationMode) -> PartitionResult<usize> {
        let mut targets = Vec::with_capacity(names.len());
        for name in names {
            targets.push(self.require_server(name)?);
        }

        let crosses_cloud = targets
            .iter()
            .any(|s| s.is_cloud_member() != (mode == OperationMode::Normal));
        let ids: Vec<ServerId> = targets.iter().map(|s| s.id).collect();
        let changed = self.servers.set_operation_mode(&ids, mode)?;

        if crosses_cloud {
            self.coordinator.request_deferred_event(
                PartitionEventType::OperationModeChange,
                &format!("{} -> {mode}", names.join(",")),
            )?;
        }
        Ok(changed)
    }

    /// Move a server into (or out of, with `None`) an affinity group.
    pub fn set_server_affinity_group(
        &self,
        server_name: &str,
        group: Option<String>,
    ) -> PartitionResult<()> {
        let mut server = self.require_server(server_name)?;
        if server.affinity_group == group {
            return Ok(());
        }
        server.affinity_group = group;
        self.servers.update_server(&server)?;
        self.coordinator
            .request_deferred_event(PartitionEventType::AffinityGroupChange, &server.name)?;
        Ok(())
    }

    /// Move an agent into (or out of, with `None`) an affinity group.
    pub fn set_agent_affinity_group(
        &self,
        agent_name: &str,
        group: Option<String>,
    ) -> PartitionResult<()> {
        let mut agent = self.require_agent(agent_name)?;
        if agent.affinity_group == group {
            return Ok(());
        }
        agent.affinity_group = group;
        self.agents.update_agent(&agent)?;
        self.coordinator
            .request_deferred_event(PartitionEventType::AffinityGroupChange, &agent.name)?;
        Ok(())
    }

    // ── Agents ──────────────────────────────────────────────────────

    /// Register an agent (or refresh a known one) and return its failover
    /// list, generating one if it has none yet.
    ///
    /// A new agent takes the registering server, if any, as its current
    /// server; the single-agent path then keeps that server at rank 0 unless
    /// an affinity group rules it out.
    pub fn register_agent(
        &self,
        registration: AgentRegistration,
    ) -> PartitionResult<(AgentInfo, Vec<ServerEntry>)> {
        let via = registration
            .registering_server
            .as_deref()
            .map(|name| self.require_server(name))
            .transpose()?;

        let agent = match self.agents.find_agent_by_name(&registration.name)? {
            Some(mut agent) => {
                agent.address = registration.address;
                agent.port = registration.port;
                agent.affinity_group = registration.affinity_group;
                self.agents.update_agent(&agent)?;
                agent
            }
            None => {
                let agent = self.agents.create_agent(AgentInfo {
                    id: 0,
                    name: registration.name,
                    address: registration.address,
                    port: registration.port,
                    affinity_group: registration.affinity_group,
                    server_id: via.as_ref().map(|s| s.id),
                    status: 0,
                })?;
                info!(agent = %agent.name, id = agent.id, "agent registered");
                agent
            }
        };

        let detail = match &via {
            Some(server) => format!("{} - {}", agent.name, server.name),
            None => agent.name.clone(),
        };
        let list = self.coordinator.single_agent_event(
            &agent.name,
            PartitionEventType::AgentRegistration,
            &detail,
        )?;
        Ok((agent, list))
    }

    /// Record that an agent connected to a server. The server becomes the
    /// agent's current primary and an AGENT_CONNECT audit record is written.
    pub fn agent_connected(&self, agent_name: &str, server_name: &str) -> PartitionResult<()> {
        let mut agent = self.require_agent(agent_name)?;
        let server = self.require_server(server_name)?;

        agent.server_id = Some(server.id);
        self.agents.update_agent(&agent)?;
        self.coordinator.audit_event(
            PartitionEventType::AgentConnect,
            &format!("{} - {}", agent.name, server.name),
        )?;
        Ok(())
    }

    /// Record that an agent shut down cleanly.
    pub fn agent_shutdown(&self, agent_name: &str) -> PartitionResult<()> {
        let mut agent = self.require_agent(agent_name)?;
        agent.server_id = None;
        self.agents.update_agent(&agent)?;
        self.coordinator
            .audit_event(PartitionEventType::AgentShutdown, &agent.name)?;
        Ok(())
    }

    // ── Status ──────────────────────────────────────────────────────

    /// Every server with its mode and how many agents it is primary for.
    pub fn cloud_status(&self) -> PartitionResult<Vec<ServerStatus>> {
        let primaries: HashMap<ServerId, u32> = self
            .lists
            .assigned_load_snapshot()?
            .into_iter()
            .filter(|load| load.rank == 0)
            .map(|load| (load.server_id, load.assigned))
            .collect();

        let status = self
            .servers
            .list_all_servers()?
            .into_iter()
            .map(|s| ServerStatus {
                primary_agents: primaries.get(&s.id).copied().unwrap_or(0),
                name: s.name,
                mode: s.mode,
                affinity_group: s.affinity_group,
                last_heartbeat: s.last_heartbeat,
            })
            .collect();
        Ok(status)
    }

    fn require_server(&self, name: &str) -> PartitionResult<ServerInfo> {
        self.servers
            .find_server_by_name(name)?
            .ok_or_else(|| PartitionError::Configuration(format!("unknown server: {name}")))
    }

    fn require_agent(&self, name: &str) -> PartitionResult<AgentInfo> {
        self.agents
            .find_agent_by_name(name)?
            .ok_or_else(|| PartitionError::Configuration(format!("unknown agent: {name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (StateStore, CloudManager) {
        let store = StateStore::open_in_memory().unwrap();
        (store.clone(), CloudManager::from_store(store))
    }

    fn server_reg(name: &str) -> ServerRegistration {
        ServerRegistration {
            name: name.to_string(),
            address: "10.0.0.1".to_string(),
            port: 7080,
            affinity_group: None,
            compute_power: 1,
        }
    }

    fn agent_reg(name: &str) -> AgentRegistration {
        AgentRegistration {
            name: name.to_string(),
            address: "10.0.1.1".to_string(),
            port: 16163,
            affinity_group: None,
            registering_server: None,
        }
    }

    fn requested(store: &StateStore) -> Vec<PartitionEventType> {
        store
            .list_by_status(ExecutionStatus::Requested)
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }

    #[test]
    fn register_server_requests_repartition() {
        let (store, cloud) = manager();

        let server = cloud.register_server(server_reg("a")).unwrap();

        assert_eq!(server.mode, OperationMode::Normal);
        assert_eq!(requested(&store), vec![PartitionEventType::ServerAdded]);
    }

    #[test]
    fn reregistering_normal_server_raises_nothing() {
        let (store, cloud) = manager();
        let first = cloud.register_server(server_reg("a")).unwrap();

        let mut again = server_reg("a");
        again.port = 7443;
        let second = cloud.register_server(again).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.port, 7443);
        assert_eq!(requested(&store).len(), 1);
    }

    #[test]
    fn register_agent_gets_a_list() {
        let (store, cloud) = manager();
        cloud.register_server(server_reg("a")).unwrap();
        cloud.register_server(server_reg("b")).unwrap();

        let (agent, list) = cloud.register_agent(agent_reg("agent-00")).unwrap();

        assert_eq!(list.len(), 2);
        assert_eq!(agent.server_id, None);
        assert_eq!(store.get_existing(agent.id).unwrap(), Some(list));
        let immediate = store.list_by_status(ExecutionStatus::Immediate).unwrap();
        assert_eq!(immediate[0].event_type, PartitionEventType::AgentRegistration);
    }

    #[test]
    fn register_agent_keeps_registering_server_as_primary() {
        let (store, cloud) = manager();
        cloud.register_server(server_reg("a")).unwrap();
        cloud.register_server(server_reg("b")).unwrap();
        let (_, first) = cloud.register_agent(agent_reg("agent-00")).unwrap();
        let busy = first[0].server_name.clone();

        let mut reg = agent_reg("agent-01");
        reg.registering_server = Some(busy.clone());
        let (agent, list) = cloud.register_agent(reg).unwrap();

        let via = store.find_server_by_name(&busy).unwrap().unwrap();
        assert_eq!(agent.server_id, Some(via.id));
        assert_eq!(list[0].server_name, busy, "kept although already loaded");
        let immediate = store.list_by_status(ExecutionStatus::Immediate).unwrap();
        assert_eq!(
            immediate.last().map(|e| e.detail.clone()),
            Some(format!("agent-01 - {busy}"))
        );
    }

    #[test]
    fn register_agent_via_unknown_server_is_rejected() {
        let (store, cloud) = manager();
        cloud.register_server(server_reg("a")).unwrap();

        let mut reg = agent_reg("agent-00");
        reg.registering_server = Some("ghost".to_string());
        let err = cloud.register_agent(reg).unwrap_err();

        assert!(matches!(err, PartitionError::Configuration(_)));
        assert!(store.find_agent_by_name("agent-00").unwrap().is_none());
    }

    #[test]
    fn reregistering_keeps_maintenance_mode() {
        let (store, cloud) = manager();
        cloud.register_server(server_reg("s1")).unwrap();
        cloud
            .set_operation_mode(&["s1".to_string()], OperationMode::Maintenance)
            .unwrap();
        let before = requested(&store).len();

        let again = cloud.register_server(server_reg("s1")).unwrap();

        assert_eq!(again.mode, OperationMode::Maintenance);
        let stored = store.find_server_by_name("s1").unwrap().unwrap();
        assert_eq!(stored.mode, OperationMode::Maintenance);
        assert_eq!(requested(&store).len(), before);
    }

    #[test]
    fn reregistering_down_server_rejoins() {
        let (store, cloud) = manager();
        cloud.register_server(server_reg("s1")).unwrap();
        cloud
            .set_operation_mode(&["s1".to_string()], OperationMode::Down)
            .unwrap();
        let before = requested(&store).len();

        let again = cloud.register_server(server_reg("s1")).unwrap();

        assert_eq!(again.mode, OperationMode::Normal);
        let after = requested(&store);
        assert_eq!(after.len(), before + 1);
        assert_eq!(after.last(), Some(&PartitionEventType::OperationModeChange));
    }

    #[test]
    fn heartbeat_revives_down_server() {
        let (store, cloud) = manager();
        cloud.register_server(server_reg("a")).unwrap();
        cloud
            .set_operation_mode(&["a".to_string()], OperationMode::Down)
            .unwrap();

        assert!(cloud.heartbeat("a").unwrap());

        let server = store.find_server_by_name("a").unwrap().unwrap();
        assert_eq!(server.mode, OperationMode::Normal);
        assert_eq!(
            requested(&store),
            vec![
                PartitionEventType::ServerAdded,
                PartitionEventType::OperationModeChange,
                PartitionEventType::OperationModeChange,
            ]
        );
        assert!(!cloud.heartbeat("ghost").unwrap());
    }

    #[test]
    fn delete_normal_server_is_rejected() {
        let (store, cloud) = manager();
        cloud.register_server(server_reg("a")).unwrap();
        cloud.register_agent(agent_reg("agent-00")).unwrap();
        let lists_before = store.list_failover_lists().unwrap();

        let err = cloud.delete_server("a").unwrap_err();

        assert!(matches!(err, PartitionError::Configuration(_)));
        assert!(store.find_server_by_name("a").unwrap().is_some());
        assert_eq!(store.list_failover_lists().unwrap(), lists_before);
    }

    #[test]
    fn delete_server_strips_lists() {
        let (store, cloud) = manager();
        cloud.register_server(server_reg("a")).unwrap();
        cloud.register_server(server_reg("b")).unwrap();
        let (agent, _) = cloud.register_agent(agent_reg("agent-00")).unwrap();
        cloud
            .set_operation_mode(&["b".to_string()], OperationMode::Maintenance)
            .unwrap();

        cloud.delete_server("b").unwrap();

        assert!(store.find_server_by_name("b").unwrap().is_none());
        let list = store.get_existing(agent.id).unwrap().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].server_name, "a");
        assert_eq!(requested(&store).last(), Some(&PartitionEventType::ServerRemoved));
    }

    #[test]
    fn delete_unknown_server_is_configuration_error() {
        let (_, cloud) = manager();
        assert!(matches!(
            cloud.delete_server("ghost"),
            Err(PartitionError::Configuration(_))
        ));
    }

    #[test]
    fn mode_change_within_non_cloud_modes_raises_nothing() {
        let (store, cloud) = manager();
        cloud.register_server(server_reg("a")).unwrap();
        let names = vec!["a".to_string()];
        cloud.set_operation_mode(&names, OperationMode::Maintenance).unwrap();
        let before = requested(&store).len();

        cloud.set_operation_mode(&names, OperationMode::Down).unwrap();

        assert_eq!(requested(&store).len(), before);
    }

    #[test]
    fn mode_change_with_unknown_name_changes_nothing() {
        let (store, cloud) = manager();
        cloud.register_server(server_reg("a")).unwrap();

        let err = cloud
            .set_operation_mode(&["a".to_string(), "ghost".to_string()], OperationMode::Down)
            .unwrap_err();

        assert!(matches!(err, PartitionError::Configuration(_)));
        let a = store.find_server_by_name("a").unwrap().unwrap();
        assert_eq!(a.mode, OperationMode::Normal);
    }

    #[test]
    fn affinity_changes_raise_requests_once() {
        let (store, cloud) = manager();
        cloud.register_server(server_reg("a")).unwrap();
        cloud.register_agent(agent_reg("agent-00")).unwrap();

        cloud.set_server_affinity_group("a", Some("g1".to_string())).unwrap();
        cloud.set_server_affinity_group("a", Some("g1".to_string())).unwrap();
        cloud.set_agent_affinity_group("agent-00", Some("g1".to_string())).unwrap();

        let changes = requested(&store)
            .into_iter()
            .filter(|t| *t == PartitionEventType::AffinityGroupChange)
            .count();
        assert_eq!(changes, 2);
    }

    #[test]
    fn agent_connect_and_shutdown_are_audited() {
        let (store, cloud) = manager();
        let server = cloud.register_server(server_reg("a")).unwrap();
        cloud.register_agent(agent_reg("agent-00")).unwrap();

        cloud.agent_connected("agent-00", "a").unwrap();
        let agent = store.find_agent_by_name("agent-00").unwrap().unwrap();
        assert_eq!(agent.server_id, Some(server.id));

        cloud.agent_shutdown("agent-00").unwrap();
        let agent = store.find_agent_by_name("agent-00").unwrap().unwrap();
        assert_eq!(agent.server_id, None);

        let audits: Vec<_> = store
            .list_by_status(ExecutionStatus::Audit)
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(
            audits,
            vec![PartitionEventType::AgentConnect, PartitionEventType::AgentShutdown]
        );
    }

    #[test]
    fn cloud_status_counts_primaries() {
        let (_, cloud) = manager();
        cloud.register_server(server_reg("a")).unwrap();
        cloud.register_server(server_reg("b")).unwrap();
        for i in 0..4 {
            cloud.register_agent(agent_reg(&format!("agent-{i:02}"))).unwrap();
        }

        let status = cloud.cloud_status().unwrap();

        assert_eq!(status.len(), 2);
        let total: u32 = status.iter().map(|s| s.primary_agents).sum();
        assert_eq!(total, 4);
        assert!(status.iter().all(|s| s.primary_agents == 2));
    }
}
