//! Domain types for the fleet state store.
//!
//! These types represent the persisted state of server instances, agents,
//! failover lists, and the partition event audit trail. All types are
//! serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};

/// Unique numeric identifier for a server instance.
pub type ServerId = u32;

/// Unique numeric identifier for an agent.
pub type AgentId = u32;

/// Unique identifier for a partition event.
pub type EventId = u64;

// ── Server ────────────────────────────────────────────────────────

/// Operation mode of a server instance.
///
/// Only `Normal` servers are members of the cloud and receive agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationMode {
    Installed,
    Normal,
    Maintenance,
    Down,
}

impl std::fmt::Display for OperationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Installed => "INSTALLED",
            Self::Normal => "NORMAL",
            Self::Maintenance => "MAINTENANCE",
            Self::Down => "DOWN",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for OperationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INSTALLED" => Ok(Self::Installed),
            "NORMAL" => Ok(Self::Normal),
            "MAINTENANCE" => Ok(Self::Maintenance),
            "DOWN" => Ok(Self::Down),
            other => Err(format!("unknown operation mode: {other}")),
        }
    }
}

/// A registered server instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerInfo {
    pub id: ServerId,
    pub name: String,
    /// Address agents connect to.
    pub address: String,
    pub port: u16,
    /// Affinity group tag, if any.
    pub affinity_group: Option<String>,
    pub mode: OperationMode,
    /// Relative capacity weight used to normalize assigned load.
    pub compute_power: u32,
    /// Unix timestamp (seconds) of the last heartbeat.
    pub last_heartbeat: u64,
}

impl ServerInfo {
    /// Whether this server currently takes part in the cloud.
    pub fn is_cloud_member(&self) -> bool {
        self.mode == OperationMode::Normal
    }

    /// The connect entry agents receive for this server.
    pub fn entry(&self) -> ServerEntry {
        ServerEntry {
            server_id: self.id,
            server_name: self.name.clone(),
            address: self.address.clone(),
            port: self.port,
        }
    }
}

// ── Agent ─────────────────────────────────────────────────────────

/// A registered monitoring agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentInfo {
    pub id: AgentId,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub affinity_group: Option<String>,
    /// The server the agent is currently connected to, if any.
    pub server_id: Option<ServerId>,
    /// Cache-invalidation bitmask, opaque to partitioning.
    #[serde(default)]
    pub status: u32,
}

// ── Failover lists ────────────────────────────────────────────────

/// One entry of an agent's failover list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ServerEntry {
    pub server_id: ServerId,
    pub server_name: String,
    pub address: String,
    pub port: u16,
}

/// The persisted, ranked server list of one agent. Index 0 is the primary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailoverList {
    pub agent_id: AgentId,
    pub servers: Vec<ServerEntry>,
    /// Unix timestamp (seconds) when the list was generated.
    pub created_at: u64,
}

/// One (agent, server, rank) row, the unit the load snapshot is built from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailoverDetail {
    pub agent_id: AgentId,
    pub server_id: ServerId,
    pub rank: u32,
}

/// Number of agents assigned to a server at a given rank level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssignedLoad {
    pub server_id: ServerId,
    pub rank: u32,
    pub assigned: u32,
}

// ── Partition events ──────────────────────────────────────────────

/// What triggered a partition event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartitionEventType {
    AgentRegistration,
    AgentConnect,
    AgentShutdown,
    ServerAdded,
    ServerRemoved,
    ServerDown,
    OperationModeChange,
    AffinityGroupChange,
    ManualRequest,
    Periodic,
}

impl PartitionEventType {
    /// Whether events of this type cause failover lists to be recomputed.
    /// Connect/shutdown/down notices are audit-only.
    pub fn causes_repartition(&self) -> bool {
        !matches!(self, Self::AgentConnect | Self::AgentShutdown | Self::ServerDown)
    }
}

impl std::fmt::Display for PartitionEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::AgentRegistration => "AGENT_REGISTRATION",
            Self::AgentConnect => "AGENT_CONNECT",
            Self::AgentShutdown => "AGENT_SHUTDOWN",
            Self::ServerAdded => "SERVER_ADDED",
            Self::ServerRemoved => "SERVER_REMOVED",
            Self::ServerDown => "SERVER_DOWN",
            Self::OperationModeChange => "OPERATION_MODE_CHANGE",
            Self::AffinityGroupChange => "AFFINITY_GROUP_CHANGE",
            Self::ManualRequest => "MANUAL_REQUEST",
            Self::Periodic => "PERIODIC",
        };
        f.write_str(s)
    }
}

/// Execution status of a partition event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Executed synchronously when recorded.
    Immediate,
    /// Deferred until the next sweep coalesces pending requests.
    Requested,
    /// Recorded for the audit trail only.
    Audit,
    /// A requested event that has been processed.
    Completed,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Immediate => "IMMEDIATE",
            Self::Requested => "REQUESTED",
            Self::Audit => "AUDIT",
            Self::Completed => "COMPLETED",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "IMMEDIATE" => Ok(Self::Immediate),
            "REQUESTED" => Ok(Self::Requested),
            "AUDIT" => Ok(Self::Audit),
            "COMPLETED" => Ok(Self::Completed),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// An audit record of something that may repartition the fleet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PartitionEvent {
    /// Assigned by the event log on append; 0 before that.
    pub id: EventId,
    pub event_type: PartitionEventType,
    pub detail: String,
    pub status: ExecutionStatus,
    /// Unix timestamp (seconds).
    pub created_at: u64,
}

impl PartitionEvent {
    /// A not-yet-appended event stamped with the current time.
    pub fn new(event_type: PartitionEventType, detail: &str, status: ExecutionStatus) -> Self {
        Self {
            id: 0,
            event_type,
            detail: detail.to_string(),
            status,
            created_at: epoch_secs(),
        }
    }
}

/// Per-agent outcome of an executed partition event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartitionEventDetail {
    pub event_id: EventId,
    pub agent_name: String,
    /// The agent's new primary server.
    pub server_name: String,
}

// ── Keys ──────────────────────────────────────────────────────────

/// Key of an agent's failover list row.
pub fn failover_list_key(agent_id: AgentId) -> String {
    format!("{agent_id:010}")
}

/// Key of one failover detail row.
pub fn failover_detail_key(agent_id: AgentId, rank: u32) -> String {
    format!("{agent_id:010}:{rank:04}")
}

/// Key of a partition event row.
pub fn event_key(event_id: EventId) -> String {
    format!("{event_id:020}")
}

/// Key of a partition event detail row.
pub fn event_detail_key(event_id: EventId, agent_name: &str) -> String {
    format!("{event_id:020}:{agent_name}")
}

/// Current Unix time in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
