//! Per-run accumulators: one [`ServerBucket`] per server per rank level,
//! one [`AgentAssignment`] per agent per run.

use std::collections::{HashMap, HashSet};

use fleet_state::{AgentId, AgentInfo, AssignedLoad, ServerId, ServerInfo};

/// Load and agents assigned to one server at the rank level being built.
///
/// A fresh set of buckets is allocated for every rank level; buckets are
/// never carried across levels.
#[derive(Debug, Clone)]
pub struct ServerBucket {
    pub server: ServerInfo,
    /// Sum of assigned agent loads, each divided by compute power.
    pub assigned_load: f64,
    /// Agents placed on this server at this level, in assignment order.
    pub assigned_agents: Vec<AgentId>,
}

impl ServerBucket {
    pub fn new(server: &ServerInfo) -> Self {
        Self::seeded(server, 0.0)
    }

    /// A bucket starting from an existing load picture.
    pub fn seeded(server: &ServerInfo, assigned_load: f64) -> Self {
        Self {
            server: server.clone(),
            assigned_load,
            assigned_agents: Vec::new(),
        }
    }

    pub fn id(&self) -> ServerId {
        self.server.id
    }

    pub fn name(&self) -> &str {
        &self.server.name
    }

    pub fn affinity_group(&self) -> Option<&str> {
        self.server.affinity_group.as_deref()
    }

    /// Compute power as a divisor; zero is treated as one.
    pub fn compute_power(&self) -> f64 {
        f64::from(self.server.compute_power.max(1))
    }

    /// The load an agent of weight `agent_load` adds to this bucket.
    pub fn normalized(&self, agent_load: f64) -> f64 {
        agent_load / self.compute_power()
    }

    pub fn assign(&mut self, agent_id: AgentId, agent_load: f64) {
        self.assigned_load += self.normalized(agent_load);
        self.assigned_agents.push(agent_id);
    }

    /// Take an agent back out. Returns false if it was not assigned here.
    pub fn release(&mut self, agent_id: AgentId, agent_load: f64) -> bool {
        match self.assigned_agents.iter().position(|&a| a == agent_id) {
            Some(pos) => {
                self.assigned_agents.remove(pos);
                self.assigned_load -= self.normalized(agent_load);
                true
            }
            None => false,
        }
    }
}

/// The ranked servers chosen so far for one agent in one run.
#[derive(Debug, Clone)]
pub struct AgentAssignment {
    pub agent_id: AgentId,
    pub affinity_group: Option<String>,
    pub load: f64,
    /// Chosen server per rank level, primary first.
    pub ranks: Vec<ServerId>,
    used: HashSet<ServerId>,
}

impl AgentAssignment {
    pub fn new(agent: &AgentInfo, load: f64) -> Self {
        Self {
            agent_id: agent.id,
            affinity_group: agent.affinity_group.clone(),
            load,
            ranks: Vec::new(),
            used: HashSet::new(),
        }
    }

    /// Servers already holding a rank in this agent's list.
    pub fn used(&self) -> &HashSet<ServerId> {
        &self.used
    }

    pub fn push(&mut self, server_id: ServerId) {
        self.ranks.push(server_id);
        self.used.insert(server_id);
    }

    /// Swap the server at the most recent rank for another one.
    pub fn reassign_last(&mut self, from: ServerId, to: ServerId) {
        if let Some(last) = self.ranks.last_mut() {
            if *last == from {
                *last = to;
                self.used.remove(&from);
                self.used.insert(to);
            }
        }
    }
}

/// Existing load per (server, rank level), taken from persisted lists.
///
/// Used only on the single-agent path so a new agent slots into the
/// current picture without recomputing everyone else.
#[derive(Debug, Clone, Default)]
pub struct LoadSnapshot {
    loads: HashMap<(ServerId, u32), f64>,
}

impl LoadSnapshot {
    /// Build from per-(server, rank) agent counts, one load unit per agent.
    pub fn from_assigned(assigned: &[AssignedLoad]) -> Self {
        let loads = assigned
            .iter()
            .map(|a| ((a.server_id, a.rank), f64::from(a.assigned)))
            .collect();
        Self { loads }
    }

    pub fn load_for(&self, server_id: ServerId, rank: u32) -> Option<f64> {
        self.loads.get(&(server_id, rank)).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.loads.is_empty()
    }
}
