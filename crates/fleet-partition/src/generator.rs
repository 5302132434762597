//! Failover list generation.
//!
//! One pass per rank level (as many levels as there are cloud servers).
//! Each pass allocates fresh buckets, rotates the server order by one so no
//! server is always scanned first, places every agent with the bucket
//! selector, then hands the level to the rebalancer.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use fleet_state::{AgentId, AgentInfo, ServerEntry, ServerId, ServerInfo};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::bucket::{AgentAssignment, LoadSnapshot, ServerBucket};
use crate::load::{AgentLoad, UniformLoad};
use crate::rebalancer::{load_disparity, rebalance};
use crate::selector::select_best_bucket;

/// Final state of one bucket after its rank level was rebalanced.
#[derive(Debug, Clone, Serialize)]
pub struct BucketSummary {
    pub server_id: ServerId,
    pub server_name: String,
    pub assigned_load: f64,
    pub assigned_agents: Vec<AgentId>,
}

/// Outcome of one rank level.
#[derive(Debug, Clone, Serialize)]
pub struct LevelOutcome {
    pub rank: u32,
    pub buckets: Vec<BucketSummary>,
    /// Whether the rebalancer moved any agent at this level.
    pub rebalanced: bool,
    /// Load disparity left after rebalancing.
    pub disparity: f64,
}

/// Result of a generation run.
#[derive(Debug, Clone, Default)]
pub struct Generation {
    /// Ranked server list per agent, primary first.
    pub lists: BTreeMap<AgentId, Vec<ServerEntry>>,
    pub levels: Vec<LevelOutcome>,
}

/// Builds a ranked failover list for every agent it is given.
#[derive(Clone)]
pub struct FailoverListGenerator {
    load: Arc<dyn AgentLoad>,
}

impl Default for FailoverListGenerator {
    fn default() -> Self {
        Self::new(Arc::new(UniformLoad))
    }
}

impl FailoverListGenerator {
    pub fn new(load: Arc<dyn AgentLoad>) -> Self {
        Self { load }
    }

    /// Generate failover lists for `agents` across `servers`.
    ///
    /// `servers` must be the cloud (NORMAL) servers. `snapshot`, when
    /// given, seeds every bucket with the load already persisted for its
    /// (server, rank) so a few agents can be added to an existing picture.
    /// Empty inputs yield an empty generation.
    pub fn generate(
        &self,
        servers: &[ServerInfo],
        agents: &[AgentInfo],
        snapshot: Option<&LoadSnapshot>,
    ) -> Generation {
        if servers.is_empty() || agents.is_empty() {
            debug!(
                servers = servers.len(),
                agents = agents.len(),
                "nothing to partition"
            );
            return Generation::default();
        }

        let by_id: HashMap<ServerId, &ServerInfo> = servers.iter().map(|s| (s.id, s)).collect();
        let mut assignments: HashMap<AgentId, AgentAssignment> = agents
            .iter()
            .map(|a| (a.id, AgentAssignment::new(a, self.load.load(a))))
            .collect();

        let mut order: Vec<&ServerInfo> = servers.iter().collect();
        let mut levels = Vec::with_capacity(servers.len());

        for level in 0..servers.len() {
            let rank = level as u32;
            order.rotate_right(1);

            let mut buckets: Vec<ServerBucket> = order
                .iter()
                .map(|s| {
                    let seed = snapshot.and_then(|snap| snap.load_for(s.id, rank));
                    ServerBucket::seeded(s, seed.map_or(0.0, |l| l / f64::from(s.compute_power.max(1))))
                })
                .collect();

            for agent in agents {
                let Some(assignment) = assignments.get_mut(&agent.id) else {
                    continue;
                };
                let preferred = if level == 0 {
                    agent
                        .server_id
                        .and_then(|id| by_id.get(&id))
                        .map(|s| s.name.as_str())
                } else {
                    None
                };

                match select_best_bucket(
                    &buckets,
                    assignment.used(),
                    agent.affinity_group.as_deref(),
                    preferred,
                ) {
                    Some(idx) => {
                        buckets[idx].assign(agent.id, assignment.load);
                        assignment.push(buckets[idx].id());
                    }
                    None => {
                        error!(
                            agent = %agent.name,
                            rank,
                            "no server bucket available, skipping rank for agent"
                        );
                    }
                }
            }

            let rebalanced = rebalance(&mut buckets, &mut assignments);
            let disparity = load_disparity(&buckets);
            debug!(rank, rebalanced, disparity, "rank level assigned");

            levels.push(LevelOutcome {
                rank,
                buckets: buckets
                    .into_iter()
                    .map(|b| BucketSummary {
                        server_id: b.id(),
                        server_name: b.server.name,
                        assigned_load: b.assigned_load,
                        assigned_agents: b.assigned_agents,
                    })
                    .collect(),
                rebalanced,
                disparity,
            });
        }

        let lists: BTreeMap<AgentId, Vec<ServerEntry>> = agents
            .iter()
            .filter_map(|agent| {
                let assignment = assignments.get(&agent.id)?;
                let entries = assignment
                    .ranks
                    .iter()
                    .filter_map(|id| by_id.get(id).map(|s| s.entry()))
                    .collect();
                Some((agent.id, entries))
            })
            .collect();

        info!(
            agents = lists.len(),
            servers = servers.len(),
            "failover lists generated"
        );
        Generation { lists, levels }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use fleet_state::{AssignedLoad, OperationMode};

    fn server(id: ServerId, name: &str, group: Option<&str>) -> ServerInfo {
        ServerInfo {
            id,
            name: name.to_string(),
            address: format!("10.0.0.{id}"),
            port: 7080,
            affinity_group: group.map(str::to_string),
            mode: OperationMode::Normal,
            compute_power: 1,
            last_heartbeat: 0,
        }
    }

    fn agent(id: AgentId, group: Option<&str>, primary: Option<ServerId>) -> AgentInfo {
        AgentInfo {
            id,
            name: format!("agent-{id}"),
            address: "10.0.1.1".to_string(),
            port: 16163,
            affinity_group: group.map(str::to_string),
            server_id: primary,
            status: 0,
        }
    }

    fn primaries(generation: &Generation) -> HashMap<AgentId, ServerId> {
        generation
            .lists
            .iter()
            .map(|(agent, list)| (*agent, list[0].server_id))
            .collect()
    }

    #[test]
    fn empty_inputs_yield_empty_generation() {
        let generator = FailoverListGenerator::default();
        let servers = vec![server(1, "a", None)];
        let agents = vec![agent(1, None, None)];

        assert!(generator.generate(&[], &agents, None).lists.is_empty());
        assert!(generator.generate(&servers, &[], None).lists.is_empty());
    }

    #[test]
    fn lists_cover_every_server_once() {
        let generator = FailoverListGenerator::default();
        let servers = vec![server(1, "a", None), server(2, "b", None), server(3, "c", None)];
        let agents: Vec<AgentInfo> = (1..=7).map(|i| agent(i, None, None)).collect();

        let generation = generator.generate(&servers, &agents, None);

        assert_eq!(generation.lists.len(), 7);
        for list in generation.lists.values() {
            assert_eq!(list.len(), 3);
            let unique: HashSet<ServerId> = list.iter().map(|e| e.server_id).collect();
            assert_eq!(unique.len(), 3);
        }
        assert_eq!(generation.levels.len(), 3);
        for level in &generation.levels {
            let placed: usize = level.buckets.iter().map(|b| b.assigned_agents.len()).sum();
            assert_eq!(placed, 7);
        }
    }

    #[test]
    fn even_split_at_every_level() {
        let generator = FailoverListGenerator::default();
        let servers = vec![server(1, "a", None), server(2, "b", None), server(3, "c", None)];
        let agents: Vec<AgentInfo> = (1..=9).map(|i| agent(i, None, None)).collect();

        let generation = generator.generate(&servers, &agents, None);

        for level in &generation.levels {
            for bucket in &level.buckets {
                assert_eq!(bucket.assigned_agents.len(), 3, "rank {}", level.rank);
            }
        }
    }

    #[test]
    fn current_primary_is_kept() {
        let generator = FailoverListGenerator::default();
        let servers = vec![server(1, "a", None), server(2, "b", None)];
        let agents = vec![
            agent(1, None, Some(1)),
            agent(2, None, Some(2)),
            agent(3, None, Some(2)),
        ];

        let generation = generator.generate(&servers, &agents, None);
        let primary = primaries(&generation);

        assert_eq!(primary[&1], 1);
        assert_eq!(primary[&2], 2);
        assert_eq!(primary[&3], 2);
    }

    #[test]
    fn primaries_piled_on_one_server_get_spread() {
        let generator = FailoverListGenerator::default();
        let servers = vec![server(1, "a", None), server(2, "b", None)];
        let agents: Vec<AgentInfo> = (1..=6).map(|i| agent(i, None, Some(1))).collect();

        let generation = generator.generate(&servers, &agents, None);

        assert!(generation.levels[0].rebalanced);
        let on_a = primaries(&generation).values().filter(|&&s| s == 1).count();
        assert_eq!(on_a, 3);
    }

    #[test]
    fn primary_on_non_cloud_server_is_ignored() {
        let generator = FailoverListGenerator::default();
        let servers = vec![server(1, "a", None), server(2, "b", None)];
        let agents = vec![agent(1, None, Some(99))];

        let generation = generator.generate(&servers, &agents, None);
        assert_eq!(generation.lists[&1].len(), 2);
    }

    #[test]
    fn affinity_groups_are_honored() {
        let generator = FailoverListGenerator::default();
        let servers = vec![server(1, "a", Some("g1")), server(2, "b", Some("g2"))];
        let agents = vec![
            agent(1, Some("g1"), None),
            agent(2, Some("g2"), None),
            agent(3, Some("g1"), None),
            agent(4, Some("g2"), None),
        ];

        let generation = generator.generate(&servers, &agents, None);
        let primary = primaries(&generation);

        assert_eq!(primary[&1], 1);
        assert_eq!(primary[&3], 1);
        assert_eq!(primary[&2], 2);
        assert_eq!(primary[&4], 2);
    }

    #[test]
    fn snapshot_steers_new_agent_to_lighter_server() {
        let generator = FailoverListGenerator::default();
        let servers = vec![server(1, "a", None), server(2, "b", None)];
        let snapshot = LoadSnapshot::from_assigned(&[
            AssignedLoad { server_id: 1, rank: 0, assigned: 5 },
            AssignedLoad { server_id: 2, rank: 0, assigned: 2 },
            AssignedLoad { server_id: 1, rank: 1, assigned: 2 },
            AssignedLoad { server_id: 2, rank: 1, assigned: 5 },
        ]);

        let generation = generator.generate(&servers, &[agent(9, None, None)], Some(&snapshot));

        let list: Vec<ServerId> = generation.lists[&9].iter().map(|e| e.server_id).collect();
        assert_eq!(list, vec![2, 1]);
    }

    #[test]
    fn custom_load_function_is_used() {
        let heavy = |a: &AgentInfo| if a.id == 1 { 4.0 } else { 1.0 };
        let generator = FailoverListGenerator::new(Arc::new(heavy));
        let servers = vec![server(1, "a", None), server(2, "b", None)];
        let agents: Vec<AgentInfo> = (1..=5).map(|i| agent(i, None, None)).collect();

        let generation = generator.generate(&servers, &agents, None);

        let level0 = &generation.levels[0];
        let total: f64 = level0.buckets.iter().map(|b| b.assigned_load).sum();
        assert_eq!(total, 8.0);
        // The heavy agent sits alone with at most one light agent.
        let heavy_bucket = level0
            .buckets
            .iter()
            .find(|b| b.assigned_agents.contains(&1))
            .unwrap();
        assert!(heavy_bucket.assigned_agents.len() <= 2);
    }

    #[test]
    fn entries_carry_connect_addresses() {
        let generator = FailoverListGenerator::default();
        let servers = vec![server(1, "a", None)];

        let generation = generator.generate(&servers, &[agent(1, None, None)], None);
        assert_eq!(
            generation.lists[&1],
            vec![ServerEntry {
                server_id: 1,
                server_name: "a".to_string(),
                address: "10.0.0.1".to_string(),
                port: 7080,
            }]
        );
    }
}
