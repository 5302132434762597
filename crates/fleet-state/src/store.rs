//! StateStore: redb-backed persistence for fleet partitioning.
//!
//! Implements all four collaborator contracts ([`ServerDirectory`],
//! [`AgentDirectory`], [`FailoverListStore`], [`EventLog`]) over one redb
//! database. Values are JSON-serialized into `&[u8]` columns. Every
//! multi-row mutation runs inside a single write transaction, and redb
//! admits one writer at a time, so a fleet-wide replace can never
//! interleave with another writer's rows.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::directory::{AgentDirectory, EventLog, FailoverListStore, ServerDirectory};
use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    ///
    /// Fails with `Locked` while another process holds the file.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(|e| match e {
            redb::DatabaseError::DatabaseAlreadyOpen => StateError::Locked(path.display().to_string()),
            other => StateError::Open(other.to_string()),
        })?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(SERVERS).map_err(map_err!(Table))?;
        txn.open_table(AGENTS).map_err(map_err!(Table))?;
        txn.open_table(FAILOVER_LISTS).map_err(map_err!(Table))?;
        txn.open_table(FAILOVER_DETAILS).map_err(map_err!(Table))?;
        txn.open_table(PARTITION_EVENTS).map_err(map_err!(Table))?;
        txn.open_table(PARTITION_EVENT_DETAILS).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic row access ─────────────────────────────────────────

    fn get_row<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    fn list_rows<T: DeserializeOwned>(&self, def: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                results.push(decode(value.value())?);
            }
        }
        Ok(results)
    }

    // ── Lookups by id ──────────────────────────────────────────────

    /// Get a server by numeric id.
    pub fn get_server(&self, id: ServerId) -> StateResult<Option<ServerInfo>> {
        Ok(self.list_all_servers()?.into_iter().find(|s| s.id == id))
    }

    /// Get an agent by numeric id.
    pub fn get_agent(&self, id: AgentId) -> StateResult<Option<AgentInfo>> {
        Ok(self.list_all_agents()?.into_iter().find(|a| a.id == id))
    }

    /// Get the full failover list record of an agent.
    pub fn get_failover_list(&self, agent_id: AgentId) -> StateResult<Option<FailoverList>> {
        self.get_row(FAILOVER_LISTS, &failover_list_key(agent_id))
    }

    /// List every persisted failover list, ordered by agent id.
    pub fn list_failover_lists(&self) -> StateResult<Vec<FailoverList>> {
        self.list_rows(FAILOVER_LISTS, "")
    }

    /// List every failover detail row, ordered by agent then rank.
    pub fn list_failover_details(&self) -> StateResult<Vec<FailoverDetail>> {
        self.list_rows(FAILOVER_DETAILS, "")
    }
}

// ── Servers ───────────────────────────────────────────────────────

impl ServerDirectory for StateStore {
    fn list_cloud_servers(&self) -> StateResult<Vec<ServerInfo>> {
        let servers = self.list_all_servers()?;
        Ok(servers.into_iter().filter(ServerInfo::is_cloud_member).collect())
    }

    fn list_all_servers(&self) -> StateResult<Vec<ServerInfo>> {
        self.list_rows(SERVERS, "")
    }

    fn find_server_by_name(&self, name: &str) -> StateResult<Option<ServerInfo>> {
        self.get_row(SERVERS, name)
    }

    fn create_server(&self, mut server: ServerInfo) -> StateResult<ServerInfo> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SERVERS).map_err(map_err!(Table))?;
            if table.get(server.name.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists(format!("server {}", server.name)));
            }
            server.id = next_id(&txn, NEXT_SERVER_ID)? as ServerId;
            let value = encode(&server)?;
            table
                .insert(server.name.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        info!(server = %server.name, id = server.id, "server created");
        Ok(server)
    }

    fn update_server(&self, server: &ServerInfo) -> StateResult<()> {
        let value = encode(server)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SERVERS).map_err(map_err!(Table))?;
            if table.get(server.name.as_str()).map_err(map_err!(Read))?.is_none() {
                return Err(StateError::NotFound(format!("server {}", server.name)));
            }
            table
                .insert(server.name.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn delete_server(&self, id: ServerId) -> StateResult<usize> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SERVERS).map_err(map_err!(Table))?;
            let mut found: Option<ServerInfo> = None;
            for entry in table.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let server: ServerInfo = decode(value.value())?;
                if server.id == id {
                    found = Some(server);
                    break;
                }
            }
            let server = found.ok_or_else(|| StateError::NotFound(format!("server id {id}")))?;
            if server.mode == OperationMode::Normal {
                return Err(StateError::ServerActive(server.name));
            }
            table.remove(server.name.as_str()).map_err(map_err!(Write))?;
        }
        let touched = strip_server_rows(&txn, id)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(id, lists = touched, "server deleted");
        Ok(touched)
    }

    fn set_operation_mode(&self, ids: &[ServerId], mode: OperationMode) -> StateResult<usize> {
        let wanted: HashSet<ServerId> = ids.iter().copied().collect();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count;
        {
            let mut table = txn.open_table(SERVERS).map_err(map_err!(Table))?;
            let matched: Vec<ServerInfo> = decode_all::<ServerInfo, _>(&table)?
                .into_iter()
                .filter(|s| wanted.contains(&s.id))
                .collect();
            count = matched.len();
            for mut server in matched {
                server.mode = mode;
                let value = encode(&server)?;
                table
                    .insert(server.name.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(count, %mode, "operation mode updated");
        Ok(count)
    }

    fn mark_stale_servers_down(
        &self,
        cutoff: u64,
        except_name: &str,
    ) -> StateResult<Vec<ServerInfo>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut demoted = Vec::new();
        {
            let mut table = txn.open_table(SERVERS).map_err(map_err!(Table))?;
            let stale: Vec<ServerInfo> = decode_all::<ServerInfo, _>(&table)?
                .into_iter()
                .filter(|s| {
                    s.mode == OperationMode::Normal
                        && s.last_heartbeat < cutoff
                        && s.name != except_name
                })
                .collect();
            for mut server in stale {
                server.mode = OperationMode::Down;
                let value = encode(&server)?;
                table
                    .insert(server.name.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
                demoted.push(server);
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(demoted)
    }
}

// ── Agents ────────────────────────────────────────────────────────

impl AgentDirectory for StateStore {
    fn list_all_agents(&self) -> StateResult<Vec<AgentInfo>> {
        self.list_rows(AGENTS, "")
    }

    fn find_agent_by_name(&self, name: &str) -> StateResult<Option<AgentInfo>> {
        self.get_row(AGENTS, name)
    }

    fn create_agent(&self, mut agent: AgentInfo) -> StateResult<AgentInfo> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(AGENTS).map_err(map_err!(Table))?;
            if table.get(agent.name.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists(format!("agent {}", agent.name)));
            }
            agent.id = next_id(&txn, NEXT_AGENT_ID)? as AgentId;
            let value = encode(&agent)?;
            table
                .insert(agent.name.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        info!(agent = %agent.name, id = agent.id, "agent created");
        Ok(agent)
    }

    fn update_agent(&self, agent: &AgentInfo) -> StateResult<()> {
        let value = encode(agent)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(AGENTS).map_err(map_err!(Table))?;
            if table.get(agent.name.as_str()).map_err(map_err!(Read))?.is_none() {
                return Err(StateError::NotFound(format!("agent {}", agent.name)));
            }
            table
                .insert(agent.name.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }
}

// ── Failover lists ────────────────────────────────────────────────

impl FailoverListStore for StateStore {
    fn get_existing(&self, agent_id: AgentId) -> StateResult<Option<Vec<ServerEntry>>> {
        Ok(self.get_failover_list(agent_id)?.map(|list| list.servers))
    }

    fn persist(&self, agent_id: AgentId, servers: &[ServerEntry]) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        remove_agent_rows(&txn, agent_id)?;
        insert_agent_rows(&txn, agent_id, servers, epoch_secs())?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(agent_id, servers = servers.len(), "failover list persisted");
        Ok(())
    }

    fn replace_all(&self, lists: &[(AgentId, Vec<ServerEntry>)]) -> StateResult<()> {
        let now = epoch_secs();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed;
        {
            let mut table = txn.open_table(FAILOVER_LISTS).map_err(map_err!(Table))?;
            let keys = collect_keys(&table, "")?;
            removed = keys.len();
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        {
            let mut table = txn.open_table(FAILOVER_DETAILS).map_err(map_err!(Table))?;
            for key in collect_keys(&table, "")? {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        for (agent_id, servers) in lists {
            insert_agent_rows(&txn, *agent_id, servers, now)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        info!(removed, inserted = lists.len(), "failover lists replaced");
        Ok(())
    }

    fn delete_for_agent(&self, agent_id: AgentId) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed = remove_agent_rows(&txn, agent_id)?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    fn delete_for_server(&self, server_id: ServerId) -> StateResult<usize> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let touched = strip_server_rows(&txn, server_id)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(server_id, lists = touched, "server stripped from failover lists");
        Ok(touched)
    }

    fn assigned_load_snapshot(&self) -> StateResult<Vec<AssignedLoad>> {
        let mut counts: BTreeMap<(ServerId, u32), u32> = BTreeMap::new();
        for detail in self.list_failover_details()? {
            *counts.entry((detail.server_id, detail.rank)).or_insert(0) += 1;
        }
        Ok(counts
            .into_iter()
            .map(|((server_id, rank), assigned)| AssignedLoad {
                server_id,
                rank,
                assigned,
            })
            .collect())
    }
}

// ── Partition events ──────────────────────────────────────────────

impl EventLog for StateStore {
    fn append(&self, mut event: PartitionEvent) -> StateResult<EventId> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        event.id = next_id(&txn, NEXT_EVENT_ID)?;
        {
            let mut table = txn.open_table(PARTITION_EVENTS).map_err(map_err!(Table))?;
            let value = encode(&event)?;
            table
                .insert(event_key(event.id).as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            event_id = event.id,
            event_type = %event.event_type,
            status = ?event.status,
            "partition event recorded"
        );
        Ok(event.id)
    }

    fn list_by_status(&self, status: ExecutionStatus) -> StateResult<Vec<PartitionEvent>> {
        Ok(self
            .list_events()?
            .into_iter()
            .filter(|e| e.status == status)
            .collect())
    }

    fn list_events(&self) -> StateResult<Vec<PartitionEvent>> {
        self.list_rows(PARTITION_EVENTS, "")
    }

    fn update_status(&self, event_id: EventId, status: ExecutionStatus) -> StateResult<()> {
        let key = event_key(event_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(PARTITION_EVENTS).map_err(map_err!(Table))?;
            let existing: Option<PartitionEvent> = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            let mut event =
                existing.ok_or_else(|| StateError::NotFound(format!("partition event {event_id}")))?;
            event.status = status;
            let value = encode(&event)?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn append_details(&self, details: &[PartitionEventDetail]) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn
                .open_table(PARTITION_EVENT_DETAILS)
                .map_err(map_err!(Table))?;
            for detail in details {
                let key = event_detail_key(detail.event_id, &detail.agent_name);
                let value = encode(detail)?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn details(&self, event_id: EventId) -> StateResult<Vec<PartitionEventDetail>> {
        let prefix = format!("{}:", event_key(event_id));
        self.list_rows(PARTITION_EVENT_DETAILS, &prefix)
    }

    fn purge_events_before(&self, cutoff: u64) -> StateResult<usize> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let expired: Vec<EventId>;
        {
            let mut table = txn.open_table(PARTITION_EVENTS).map_err(map_err!(Table))?;
            expired = decode_all::<PartitionEvent, _>(&table)?
                .into_iter()
                .filter(|e| e.created_at < cutoff)
                .map(|e| e.id)
                .collect();
            for id in &expired {
                table.remove(event_key(*id).as_str()).map_err(map_err!(Write))?;
            }
        }
        {
            let mut table = txn
                .open_table(PARTITION_EVENT_DETAILS)
                .map_err(map_err!(Table))?;
            for id in &expired {
                let prefix = format!("{}:", event_key(*id));
                for key in collect_keys(&table, &prefix)? {
                    table.remove(key.as_str()).map_err(map_err!(Write))?;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if !expired.is_empty() {
            info!(purged = expired.len(), cutoff, "old partition events purged");
        }
        Ok(expired.len())
    }
}

// ── Transaction helpers ───────────────────────────────────────────

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

/// Decode every row of an open table.
fn decode_all<T, R>(table: &R) -> StateResult<Vec<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        results.push(decode(value.value())?);
    }
    Ok(results)
}

/// Keys of an open table starting with `prefix`.
fn collect_keys<R>(table: &R, prefix: &str) -> StateResult<Vec<String>>
where
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut keys = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, _) = entry.map_err(map_err!(Read))?;
        let k = key.value();
        if k.starts_with(prefix) {
            keys.push(k.to_string());
        }
    }
    Ok(keys)
}

/// Bump and return the named id sequence. Ids start at 1.
fn next_id(txn: &WriteTransaction, counter: &str) -> StateResult<u64> {
    let mut table = txn.open_table(META).map_err(map_err!(Table))?;
    let next = table
        .get(counter)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(1);
    table.insert(counter, next + 1).map_err(map_err!(Write))?;
    Ok(next)
}

/// Remove an agent's list and detail rows. Returns true if a list existed.
fn remove_agent_rows(txn: &WriteTransaction, agent_id: AgentId) -> StateResult<bool> {
    let existed = {
        let mut table = txn.open_table(FAILOVER_LISTS).map_err(map_err!(Table))?;
        table
            .remove(failover_list_key(agent_id).as_str())
            .map_err(map_err!(Write))?
            .is_some()
    };
    let mut table = txn.open_table(FAILOVER_DETAILS).map_err(map_err!(Table))?;
    let prefix = format!("{}:", failover_list_key(agent_id));
    for key in collect_keys(&table, &prefix)? {
        table.remove(key.as_str()).map_err(map_err!(Write))?;
    }
    Ok(existed)
}

/// Drop a server from every list that names it, renumbering the ranks
/// behind it. Returns the number of lists touched.
fn strip_server_rows(txn: &WriteTransaction, server_id: ServerId) -> StateResult<usize> {
    let affected: Vec<FailoverList> = {
        let table = txn.open_table(FAILOVER_LISTS).map_err(map_err!(Table))?;
        decode_all::<FailoverList, _>(&table)?
            .into_iter()
            .filter(|list| list.servers.iter().any(|s| s.server_id == server_id))
            .collect()
    };
    for list in &affected {
        let remaining: Vec<ServerEntry> = list
            .servers
            .iter()
            .filter(|s| s.server_id != server_id)
            .cloned()
            .collect();
        remove_agent_rows(txn, list.agent_id)?;
        insert_agent_rows(txn, list.agent_id, &remaining, list.created_at)?;
    }
    Ok(affected.len())
}

/// Insert an agent's list and one detail row per rank.
fn insert_agent_rows(
    txn: &WriteTransaction,
    agent_id: AgentId,
    servers: &[ServerEntry],
    created_at: u64,
) -> StateResult<()> {
    let list = FailoverList {
        agent_id,
        servers: servers.to_vec(),
        created_at,
    };
    {
        let mut table = txn.open_table(FAILOVER_LISTS).map_err(map_err!(Table))?;
        let value = encode(&list)?;
        table
            .insert(failover_list_key(agent_id).as_str(), value.as_slice())
            .map_err(map_err!(Write))?;
    }
    let mut table = txn.open_table(FAILOVER_DETAILS).map_err(map_err!(Table))?;
    for (rank, entry) in servers.iter().enumerate() {
        let detail = FailoverDetail {
            agent_id,
            server_id: entry.server_id,
            rank: rank as u32,
        };
        let value = encode(&detail)?;
        table
            .insert(failover_detail_key(agent_id, rank as u32).as_str(), value.as_slice())
            .map_err(map_err!(Write))?;
    }
    Ok(())
}
