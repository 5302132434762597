//! End-to-end partitioning scenarios against an in-memory state store.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use fleet_events::{CloudManager, PartitionCoordinator, PartitionError};
use fleet_partition::{
    ACCEPTABLE_DISPARITY, AgentAssignment, FailoverListGenerator, Generation, ServerBucket,
    rebalancer::is_movable,
};
use fleet_state::*;

// ── Fixtures ──────────────────────────────────────────────────────

fn server(name: &str, group: Option<&str>) -> ServerInfo {
    ServerInfo {
        id: 0,
        name: name.to_string(),
        address: "10.0.0.1".to_string(),
        port: 7080,
        affinity_group: group.map(str::to_string),
        mode: OperationMode::Normal,
        compute_power: 1,
        last_heartbeat: epoch_secs(),
    }
}

fn agent(name: &str, group: Option<&str>, primary: Option<ServerId>) -> AgentInfo {
    AgentInfo {
        id: 0,
        name: name.to_string(),
        address: "10.0.1.1".to_string(),
        port: 16163,
        affinity_group: group.map(str::to_string),
        server_id: primary,
        status: 0,
    }
}

fn store() -> StateStore {
    StateStore::open_in_memory().unwrap()
}

fn primary_counts(store: &StateStore) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for list in store.list_failover_lists().unwrap() {
        *counts.entry(list.servers[0].server_name.clone()).or_insert(0) += 1;
    }
    counts
}

/// Failover list store that counts fleet-wide replacements.
struct CountingLists {
    inner: StateStore,
    replaces: AtomicUsize,
}

impl FailoverListStore for CountingLists {
    fn get_existing(&self, agent_id: AgentId) -> StateResult<Option<Vec<ServerEntry>>> {
        self.inner.get_existing(agent_id)
    }
    fn persist(&self, agent_id: AgentId, servers: &[ServerEntry]) -> StateResult<()> {
        self.inner.persist(agent_id, servers)
    }
    fn replace_all(&self, lists: &[(AgentId, Vec<ServerEntry>)]) -> StateResult<()> {
        self.replaces.fetch_add(1, Ordering::SeqCst);
        self.inner.replace_all(lists)
    }
    fn delete_for_agent(&self, agent_id: AgentId) -> StateResult<bool> {
        self.inner.delete_for_agent(agent_id)
    }
    fn delete_for_server(&self, server_id: ServerId) -> StateResult<usize> {
        self.inner.delete_for_server(server_id)
    }
    fn assigned_load_snapshot(&self) -> StateResult<Vec<AssignedLoad>> {
        self.inner.assigned_load_snapshot()
    }
}

/// Checks every property a generation must hold for a fleet-wide run.
fn assert_generation_invariants(
    servers: &[ServerInfo],
    agents: &[AgentInfo],
    generation: &Generation,
) {
    let by_id: HashMap<ServerId, &ServerInfo> = servers.iter().map(|s| (s.id, s)).collect();

    for list in generation.lists.values() {
        let unique: HashSet<ServerId> = list.iter().map(|e| e.server_id).collect();
        assert_eq!(unique.len(), list.len(), "duplicate server in list");
        assert!(list.len() <= servers.len());
    }

    for level in &generation.levels {
        let placed: usize = level.buckets.iter().map(|b| b.assigned_agents.len()).sum();
        assert_eq!(placed, agents.len(), "rank {} lost or duplicated agents", level.rank);

        if level.disparity < ACCEPTABLE_DISPARITY {
            continue;
        }
        // Unbalanced levels must have had no legal move left.
        let rank = level.rank as usize;
        let buckets: Vec<ServerBucket> = level
            .buckets
            .iter()
            .map(|b| {
                let mut bucket = ServerBucket::seeded(by_id[&b.server_id], b.assigned_load);
                bucket.assigned_agents = b.assigned_agents.clone();
                bucket
            })
            .collect();
        let (target, sources) = buckets.split_last().unwrap();
        for source in sources {
            for agent_id in &source.assigned_agents {
                let info = agents.iter().find(|a| a.id == *agent_id).unwrap();
                let mut assignment = AgentAssignment::new(info, 1.0);
                for entry in &generation.lists[agent_id][..=rank] {
                    assignment.push(entry.server_id);
                }
                assert!(
                    !is_movable(&assignment, source, target),
                    "rank {rank} left a legal move for agent {agent_id}"
                );
            }
        }
    }
}

// ── Scenarios ─────────────────────────────────────────────────────

#[test]
fn three_servers_nine_agents_split_evenly() {
    let store = store();
    for name in ["A", "B", "C"] {
        store.create_server(server(name, None)).unwrap();
    }
    for i in 0..9 {
        store.create_agent(agent(&format!("agent-{i}"), None, None)).unwrap();
    }
    let coordinator = PartitionCoordinator::from_store(store.clone());

    let assignments = coordinator
        .fleet_wide_event(PartitionEventType::ManualRequest, "")
        .unwrap();

    assert_eq!(assignments.len(), 9);
    let counts = primary_counts(&store);
    assert_eq!(counts.len(), 3);
    assert!(counts.values().all(|&n| n == 3), "{counts:?}");

    let servers = store.list_cloud_servers().unwrap();
    let agents = store.list_all_agents().unwrap();
    let generation = FailoverListGenerator::default().generate(&servers, &agents, None);
    assert!(generation.levels[0].buckets.iter().all(|b| b.assigned_agents.len() == 3));
    assert_generation_invariants(&servers, &agents, &generation);
}

#[test]
fn affinity_groups_pick_their_own_server() {
    let store = store();
    let a = store.create_server(server("A", Some("G1"))).unwrap();
    let b = store.create_server(server("B", Some("G2"))).unwrap();
    for (name, group) in [("g1-a", "G1"), ("g1-b", "G1"), ("g2-a", "G2"), ("g2-b", "G2")] {
        store.create_agent(agent(name, Some(group), None)).unwrap();
    }
    let coordinator = PartitionCoordinator::from_store(store.clone());

    let assignments = coordinator
        .fleet_wide_event(PartitionEventType::AffinityGroupChange, "")
        .unwrap();

    for (name, list) in &assignments {
        let expected = if name.starts_with("g1") { a.id } else { b.id };
        assert_eq!(list[0].server_id, expected, "{name}");
        assert_eq!(list.len(), 2);
    }
}

#[test]
fn current_primary_survives_regeneration() {
    let store = store();
    let a = store.create_server(server("A", None)).unwrap();
    let b = store.create_server(server("B", None)).unwrap();
    let c = store.create_server(server("C", None)).unwrap();
    store.create_agent(agent("X", None, Some(a.id))).unwrap();
    store.create_agent(agent("Y1", None, Some(b.id))).unwrap();
    store.create_agent(agent("Y2", None, Some(b.id))).unwrap();
    store.create_agent(agent("Z1", None, Some(c.id))).unwrap();
    store.create_agent(agent("Z2", None, Some(c.id))).unwrap();
    let coordinator = PartitionCoordinator::from_store(store.clone());

    let assignments = coordinator
        .fleet_wide_event(PartitionEventType::ManualRequest, "")
        .unwrap();

    assert_eq!(assignments["X"][0].server_id, a.id);
    assert_eq!(assignments["Y1"][0].server_id, b.id);
    assert_eq!(assignments["Z2"][0].server_id, c.id);
}

#[test]
fn new_agent_lands_on_least_loaded_server() {
    let store = store();
    let a = store.create_server(server("A", None)).unwrap();
    let b = store.create_server(server("B", None)).unwrap();
    for i in 0..7 {
        let existing = store.create_agent(agent(&format!("old-{i}"), None, None)).unwrap();
        let list = if i < 5 {
            vec![a.entry(), b.entry()]
        } else {
            vec![b.entry(), a.entry()]
        };
        store.persist(existing.id, &list).unwrap();
    }
    let before = store.list_failover_lists().unwrap();
    store.create_agent(agent("Y", None, None)).unwrap();
    let coordinator = PartitionCoordinator::from_store(store.clone());

    let list = coordinator
        .single_agent_event("Y", PartitionEventType::AgentRegistration, "Y")
        .unwrap();

    assert_eq!(list, vec![b.entry(), a.entry()]);
    // Nobody else was touched.
    let after: Vec<FailoverList> = store
        .list_failover_lists()
        .unwrap()
        .into_iter()
        .filter(|l| before.iter().any(|b| b.agent_id == l.agent_id))
        .collect();
    assert_eq!(after, before);
}

#[test]
fn deleting_a_normal_server_changes_nothing() {
    let store = store();
    let cloud = CloudManager::from_store(store.clone());
    store.create_server(server("A", None)).unwrap();
    store.create_server(server("B", None)).unwrap();
    store.create_agent(agent("agent-0", None, None)).unwrap();
    cloud
        .coordinator()
        .fleet_wide_event(PartitionEventType::ManualRequest, "")
        .unwrap();
    let servers_before = store.list_all_servers().unwrap();
    let details_before = store.list_failover_details().unwrap();

    let err = cloud.delete_server("A").unwrap_err();

    assert!(matches!(err, PartitionError::Configuration(_)));
    assert_eq!(store.list_all_servers().unwrap(), servers_before);
    assert_eq!(store.list_failover_details().unwrap(), details_before);
}

#[test]
fn two_requests_one_recompute() {
    let store = store();
    store.create_server(server("A", None)).unwrap();
    store.create_server(server("B", None)).unwrap();
    for i in 0..4 {
        store.create_agent(agent(&format!("agent-{i}"), None, None)).unwrap();
    }
    let lists = Arc::new(CountingLists {
        inner: store.clone(),
        replaces: AtomicUsize::new(0),
    });
    let shared = Arc::new(store.clone());
    let coordinator =
        PartitionCoordinator::new(shared.clone(), shared.clone(), lists.clone(), shared);

    let first = coordinator
        .request_deferred_event(PartitionEventType::ServerAdded, "A")
        .unwrap();
    let second = coordinator
        .request_deferred_event(PartitionEventType::ServerAdded, "B")
        .unwrap();
    let sweep = coordinator.process_requested_events().unwrap();

    assert_eq!(lists.replaces.load(Ordering::SeqCst), 1);
    assert_eq!(sweep.processed, 2);
    let completed: HashSet<EventId> = store
        .list_by_status(ExecutionStatus::Completed)
        .unwrap()
        .into_iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(completed, [first, second].into_iter().collect());
    assert_eq!(store.details(first).unwrap().len(), 4);
    assert!(store.details(second).unwrap().is_empty());
}

// ── Properties ────────────────────────────────────────────────────

#[test]
fn generation_invariants_hold_across_fleet_shapes() {
    let groups = [None, Some("east"), Some("west")];
    for server_count in 1..=5usize {
        for agent_count in [1usize, 4, 7, 13] {
            let store = store();
            for s in 0..server_count {
                let mut info = server(&format!("s{s}"), groups[s % 3]);
                info.compute_power = 1 + (s as u32 % 2);
                store.create_server(info).unwrap();
            }
            let servers = store.list_cloud_servers().unwrap();
            for a in 0..agent_count {
                let primary = (a % 4 == 0).then(|| servers[a % server_count].id);
                store
                    .create_agent(agent(&format!("agent-{a}"), groups[(a + 1) % 3], primary))
                    .unwrap();
            }
            let agents = store.list_all_agents().unwrap();

            let generation = FailoverListGenerator::default().generate(&servers, &agents, None);

            assert_eq!(generation.lists.len(), agent_count);
            assert_eq!(generation.levels.len(), server_count);
            for list in generation.lists.values() {
                assert_eq!(list.len(), server_count);
            }
            assert_generation_invariants(&servers, &agents, &generation);
        }
    }
}

#[test]
fn persisted_list_reads_back_identically() {
    let store = store();
    for name in ["A", "B", "C", "D"] {
        store.create_server(server(name, None)).unwrap();
    }
    let created = store.create_agent(agent("agent-0", None, None)).unwrap();
    let generation = FailoverListGenerator::default().generate(
        &store.list_cloud_servers().unwrap(),
        &[created.clone()],
        None,
    );
    let list = generation.lists[&created.id].clone();

    store.persist(created.id, &list).unwrap();

    assert_eq!(store.get_existing(created.id).unwrap(), Some(list));
}

#[test]
fn single_agent_event_twice_leaves_store_alone() {
    let store = store();
    store.create_server(server("A", None)).unwrap();
    store.create_server(server("B", None)).unwrap();
    store.create_agent(agent("agent-0", None, None)).unwrap();
    let coordinator = PartitionCoordinator::from_store(store.clone());

    let first = coordinator
        .single_agent_event("agent-0", PartitionEventType::AgentRegistration, "")
        .unwrap();
    let details = store.list_failover_details().unwrap();
    let events = store.list_events().unwrap();

    let second = coordinator
        .single_agent_event("agent-0", PartitionEventType::AgentRegistration, "")
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(store.list_failover_details().unwrap(), details);
    assert_eq!(store.list_events().unwrap(), events);
}

#[test]
fn no_servers_or_no_agents_yield_empty_results() {
    let store = store();
    let coordinator = PartitionCoordinator::from_store(store.clone());
    assert!(coordinator
        .fleet_wide_event(PartitionEventType::ManualRequest, "")
        .unwrap()
        .is_empty());

    store.create_agent(agent("agent-0", None, None)).unwrap();
    assert!(coordinator
        .fleet_wide_event(PartitionEventType::ManualRequest, "")
        .unwrap()
        .is_empty());
    assert!(store.list_failover_lists().unwrap().is_empty());
}

#[test]
fn mixed_concurrent_events_keep_one_list_per_agent() {
    let store = store();
    for name in ["A", "B", "C"] {
        store.create_server(server(name, None)).unwrap();
    }
    for i in 0..10 {
        store.create_agent(agent(&format!("agent-{i}"), None, None)).unwrap();
    }
    let coordinator = PartitionCoordinator::from_store(store.clone());

    std::thread::scope(|scope| {
        for i in 0..10 {
            let coordinator = &coordinator;
            scope.spawn(move || {
                coordinator
                    .single_agent_event(&format!("agent-{i}"), PartitionEventType::AgentRegistration, "")
                    .unwrap();
            });
        }
        scope.spawn(|| {
            coordinator
                .fleet_wide_event(PartitionEventType::ManualRequest, "")
                .unwrap();
        });
    });

    let lists = store.list_failover_lists().unwrap();
    assert_eq!(lists.len(), 10);
    for list in &lists {
        assert_eq!(list.servers.len(), 3);
    }
    assert_eq!(store.list_failover_details().unwrap().len(), 30);
}
