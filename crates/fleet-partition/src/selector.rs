//! Bucket selection for one agent at one rank level.
//!
//! Greedy: keep the agent on its current primary when that is legal,
//! otherwise prefer servers in the agent's affinity group, and break the
//! rest on assigned load. Affinity is a soft preference; load balance is
//! restored afterwards by the rebalancer.

use std::collections::HashSet;

use fleet_state::ServerId;

use crate::bucket::ServerBucket;

/// Whether placing an agent of `agent_group` in `bucket` would pair it with
/// a server that belongs to some other affinity group.
pub fn affinity_conflict(agent_group: Option<&str>, bucket: &ServerBucket) -> bool {
    match bucket.affinity_group() {
        Some(group) => agent_group != Some(group),
        None => false,
    }
}

/// Pick the best bucket for an agent.
///
/// `used` holds the servers already in this agent's list. `preferred` is
/// the agent's current primary server name and is only passed at rank 0.
/// Returns an index into `buckets`, or `None` if every bucket is used.
pub fn select_best_bucket(
    buckets: &[ServerBucket],
    used: &HashSet<ServerId>,
    affinity_group: Option<&str>,
    preferred: Option<&str>,
) -> Option<usize> {
    if let Some(name) = preferred {
        let keep = buckets.iter().position(|b| {
            b.name() == name && !used.contains(&b.id()) && !affinity_conflict(affinity_group, b)
        });
        if keep.is_some() {
            return keep;
        }
    }

    let mut best: Option<usize> = None;
    for (idx, candidate) in buckets.iter().enumerate() {
        if used.contains(&candidate.id()) {
            continue;
        }
        let Some(best_idx) = best else {
            best = Some(idx);
            continue;
        };
        let current = &buckets[best_idx];
        let lighter = candidate.assigned_load < current.assigned_load;

        let wins = match affinity_group {
            None => lighter,
            Some(group) => {
                let current_matches = current.affinity_group() == Some(group);
                let candidate_matches = candidate.affinity_group() == Some(group);
                if current_matches {
                    candidate_matches && lighter
                } else {
                    candidate_matches || lighter
                }
            }
        };
        if wins {
            best = Some(idx);
        }
    }
    best
}
