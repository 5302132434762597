//! redb table definitions for the fleet state store.
//!
//! Entity tables use `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Numeric ids inside keys are zero-padded so lexical order matches
//! numeric order.

use redb::TableDefinition;

/// Servers keyed by `{name}`.
pub const SERVERS: TableDefinition<&str, &[u8]> = TableDefinition::new("servers");

/// Agents keyed by `{name}`.
pub const AGENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("agents");

/// Failover lists keyed by `{agent_id:010}`.
pub const FAILOVER_LISTS: TableDefinition<&str, &[u8]> = TableDefinition::new("failover_lists");

/// Failover detail rows keyed by `{agent_id:010}:{rank:04}`.
pub const FAILOVER_DETAILS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("failover_details");

/// Partition events keyed by `{event_id:020}`.
pub const PARTITION_EVENTS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("partition_events");

/// Partition event details keyed by `{event_id:020}:{agent_name}`.
pub const PARTITION_EVENT_DETAILS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("partition_event_details");

/// Id sequences.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

pub const NEXT_SERVER_ID: &str = "next_server_id";
pub const NEXT_AGENT_ID: &str = "next_agent_id";
pub const NEXT_EVENT_ID: &str = "next_event_id";
