//! Post-pass load correction for one rank level.
//!
//! After every agent has been placed at a level, the spread between the
//! most- and least-loaded bucket is checked. While it is at least
//! [`ACCEPTABLE_DISPARITY`], one agent is moved onto the least-loaded
//! bucket and the buckets are re-sorted. A move is only legal if it keeps
//! the agent's list duplicate-free, does not pull the agent out of its own
//! affinity group into another group, and does not overshoot (leave the
//! target heavier than the source). Every legal move strictly narrows the
//! gap, so the loop terminates; it stops early when no legal move exists.

use std::cmp::Ordering;
use std::collections::HashMap;

use fleet_state::AgentId;
use tracing::{debug, warn};

use crate::bucket::{AgentAssignment, ServerBucket};

/// Relative spread between the busiest and idlest bucket that counts as
/// balanced.
pub const ACCEPTABLE_DISPARITY: f64 = 0.10;

/// A single agent move chosen by the rebalancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentMove {
    pub agent_id: AgentId,
    /// Index of the source bucket in the sorted slice.
    pub from: usize,
    /// Index of the target (least-loaded) bucket in the sorted slice.
    pub to: usize,
}

/// `(high - low) / high` over the given buckets, 0.0 when nothing is loaded.
pub fn load_disparity(buckets: &[ServerBucket]) -> f64 {
    let high = buckets
        .iter()
        .map(|b| b.assigned_load)
        .fold(f64::NEG_INFINITY, f64::max);
    let low = buckets
        .iter()
        .map(|b| b.assigned_load)
        .fold(f64::INFINITY, f64::min);
    if buckets.is_empty() || high <= 0.0 {
        return 0.0;
    }
    (high - low) / high
}

/// Sort buckets by assigned load, heaviest first. Stable for ties.
pub fn sort_by_load(buckets: &mut [ServerBucket]) {
    buckets.sort_by(|a, b| {
        b.assigned_load
            .partial_cmp(&a.assigned_load)
            .unwrap_or(Ordering::Equal)
    });
}

/// Whether `assignment` may move from `source` onto `target`.
pub fn is_movable(assignment: &AgentAssignment, source: &ServerBucket, target: &ServerBucket) -> bool {
    if assignment.load <= 0.0 {
        return false;
    }
    if assignment.used().contains(&target.id()) {
        return false;
    }
    if let Some(group) = assignment.affinity_group.as_deref() {
        let satisfied = source.affinity_group() == Some(group);
        let foreign_target = target.affinity_group().is_some_and(|g| g != group);
        if satisfied && foreign_target {
            return false;
        }
    }
    let target_after = target.assigned_load + target.normalized(assignment.load);
    let source_after = source.assigned_load - source.normalized(assignment.load);
    target_after <= source_after
}

/// Find the next move for buckets already sorted heaviest first.
///
/// Scans from the heaviest bucket down to (but excluding) the lightest and
/// returns the first bucket's heaviest movable agent.
pub fn next_move(
    buckets: &[ServerBucket],
    assignments: &HashMap<AgentId, AgentAssignment>,
) -> Option<AgentMove> {
    if buckets.len() < 2 {
        return None;
    }
    let to = buckets.len() - 1;
    let target = &buckets[to];

    for (from, source) in buckets[..to].iter().enumerate() {
        let mut best: Option<&AgentAssignment> = None;
        for agent_id in &source.assigned_agents {
            let Some(assignment) = assignments.get(agent_id) else {
                continue;
            };
            if !is_movable(assignment, source, target) {
                continue;
            }
            if best.is_none_or(|b| assignment.load > b.load) {
                best = Some(assignment);
            }
        }
        if let Some(assignment) = best {
            return Some(AgentMove {
                agent_id: assignment.agent_id,
                from,
                to,
            });
        }
    }
    None
}

/// Rebalance one rank level in place. Returns true if any agent moved.
pub fn rebalance(
    buckets: &mut [ServerBucket],
    assignments: &mut HashMap<AgentId, AgentAssignment>,
) -> bool {
    let max_moves = assignments.len().max(1) * buckets.len().max(1);
    let mut moves = 0usize;

    loop {
        sort_by_load(buckets);
        if buckets.len() < 2 {
            break;
        }

        let disparity = load_disparity(buckets);
        if disparity < ACCEPTABLE_DISPARITY {
            debug!(disparity, moves, "rank level balanced");
            break;
        }

        let Some(mv) = next_move(buckets, assignments) else {
            debug!(disparity, moves, "no legal move left, leaving level as is");
            break;
        };
        let Some(assignment) = assignments.get_mut(&mv.agent_id) else {
            break;
        };

        let from_id = buckets[mv.from].id();
        let to_id = buckets[mv.to].id();
        buckets[mv.from].release(mv.agent_id, assignment.load);
        buckets[mv.to].assign(mv.agent_id, assignment.load);
        assignment.reassign_last(from_id, to_id);
        moves += 1;

        debug!(
            agent_id = mv.agent_id,
            from = %buckets[mv.from].name(),
            to = %buckets[mv.to].name(),
            "agent rebalanced"
        );

        if moves >= max_moves {
            warn!(moves, "rebalance move limit reached");
            break;
        }
    }

    moves > 0
}
