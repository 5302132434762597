//! Collaborator contracts consumed by the partitioning core.
//!
//! The coordinator only ever talks to these traits, so it can run against
//! the redb-backed [`StateStore`](crate::StateStore) or any other store.
//! All implementations must be shareable across threads.

use crate::error::StateResult;
use crate::types::*;

/// Registered server instances.
pub trait ServerDirectory: Send + Sync {
    /// Servers in `NORMAL` mode, ordered by name.
    fn list_cloud_servers(&self) -> StateResult<Vec<ServerInfo>>;

    /// Every registered server, ordered by name.
    fn list_all_servers(&self) -> StateResult<Vec<ServerInfo>>;

    fn find_server_by_name(&self, name: &str) -> StateResult<Option<ServerInfo>>;

    /// Register a new server, assigning its id. Fails if the name is taken.
    fn create_server(&self, server: ServerInfo) -> StateResult<ServerInfo>;

    /// Overwrite an existing server record.
    fn update_server(&self, server: &ServerInfo) -> StateResult<()>;

    /// Delete a server and strip it from every failover list in one write.
    /// Fails with `ServerActive` if it is in `NORMAL` mode. Returns the
    /// number of lists touched.
    fn delete_server(&self, id: ServerId) -> StateResult<usize>;

    /// Set the mode of the given servers. Returns how many existed.
    fn set_operation_mode(&self, ids: &[ServerId], mode: OperationMode) -> StateResult<usize>;

    /// Move every `NORMAL` server whose last heartbeat is older than
    /// `cutoff` to `DOWN`, skipping `except_name`. Runs as one bulk update
    /// and returns the demoted servers.
    fn mark_stale_servers_down(&self, cutoff: u64, except_name: &str)
        -> StateResult<Vec<ServerInfo>>;
}

/// Registered agents.
pub trait AgentDirectory: Send + Sync {
    /// Every agent, in a stable order.
    fn list_all_agents(&self) -> StateResult<Vec<AgentInfo>>;

    fn find_agent_by_name(&self, name: &str) -> StateResult<Option<AgentInfo>>;

    /// Register a new agent, assigning its id. Fails if the name is taken.
    fn create_agent(&self, agent: AgentInfo) -> StateResult<AgentInfo>;

    /// Overwrite an existing agent record.
    fn update_agent(&self, agent: &AgentInfo) -> StateResult<()>;
}

/// Persisted failover lists.
pub trait FailoverListStore: Send + Sync {
    fn get_existing(&self, agent_id: AgentId) -> StateResult<Option<Vec<ServerEntry>>>;

    /// Replace one agent's list and detail rows in a single transaction.
    fn persist(&self, agent_id: AgentId, servers: &[ServerEntry]) -> StateResult<()>;

    /// Delete every list and detail row, then insert `lists`, all in a
    /// single transaction.
    fn replace_all(&self, lists: &[(AgentId, Vec<ServerEntry>)]) -> StateResult<()>;

    /// Returns true if the agent had a list.
    fn delete_for_agent(&self, agent_id: AgentId) -> StateResult<bool>;

    /// Strip a server out of every list, renumbering the ranks behind it.
    /// Returns the number of lists touched.
    fn delete_for_server(&self, server_id: ServerId) -> StateResult<usize>;

    /// Count of agents per (server, rank) across all persisted lists.
    fn assigned_load_snapshot(&self) -> StateResult<Vec<AssignedLoad>>;
}

/// Partition event audit trail.
pub trait EventLog: Send + Sync {
    /// Append an event, returning the id it was stored under.
    fn append(&self, event: PartitionEvent) -> StateResult<EventId>;

    fn list_by_status(&self, status: ExecutionStatus) -> StateResult<Vec<PartitionEvent>>;

    /// Every event, oldest first.
    fn list_events(&self) -> StateResult<Vec<PartitionEvent>>;

    fn update_status(&self, event_id: EventId, status: ExecutionStatus) -> StateResult<()>;

    fn append_details(&self, details: &[PartitionEventDetail]) -> StateResult<()>;

    fn details(&self, event_id: EventId) -> StateResult<Vec<PartitionEventDetail>>;

    /// Delete events created before `cutoff` along with their details.
    /// Returns the number of events removed.
    fn purge_events_before(&self, cutoff: u64) -> StateResult<usize>;
}
