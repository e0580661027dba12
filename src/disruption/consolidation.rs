use k8s_openapi::api::core::v1::Pod;
use tracing::debug;

use crate::apis::NodePool;
use crate::disruption::{Candidate, DisruptionEngine, Proposal};
use crate::errors::Result;
use crate::providers::provider::ProviderId;
use crate::scheduling::simulate;

/// Replace one node with one cheaper node (or with nothing at all) that
/// still schedules every reschedulable pod.
pub(crate) async fn single_node(
    engine: &DisruptionEngine,
    candidates: &[Candidate],
    pools: &[NodePool],
) -> Result<Option<Proposal>> {
    for candidate in candidates {
        let Some(price) = candidate.price else { continue };
        let sim = engine
            .simulation_without(&[candidate.provider_id()], pools)
            .await?;
        let results = simulate(&sim, &candidate.reschedulable);
        if !results.all_placed() || results.new_node_claims.len() > 1 {
            continue;
        }
        if let Some(plan) = results.new_node_claims.first() {
            // A replacement must strictly undercut the node it removes.
            let Some(replacement_price) = plan.cheapest_price() else {
                continue;
            };
            if replacement_price >= price {
                debug!(
                    node = %candidate.state_node.node_name(),
                    replacement_price,
                    current_price = price,
                    "replacement not cheaper, skipping"
                );
                continue;
            }
        }
        return Ok(Some(Proposal {
            candidates: vec![candidate.clone()],
            plans: results.new_node_claims,
        }));
    }
    Ok(None)
}

/// Delete several nodes whose pods fit on the remaining fleet, with at
/// most one replacement, when the swap strictly reduces total cost.
/// Binary-searches the largest workable prefix of the candidate walk.
pub(crate) async fn multi_node(
    engine: &DisruptionEngine,
    candidates: &[Candidate],
    pools: &[NodePool],
) -> Result<Option<Proposal>> {
    let priced: Vec<&Candidate> = candidates.iter().filter(|c| c.price.is_some()).collect();
    if priced.len() < 2 {
        return Ok(None);
    }

    let mut lo = 2usize;
    let mut hi = priced.len();
    let mut best: Option<Proposal> = None;
    while lo <= hi {
        let mid = lo + (hi - lo) / 2;
        match attempt(engine, &priced[..mid], pools).await? {
            Some(proposal) => {
                best = Some(proposal);
                lo = mid + 1;
            }
            None => {
                hi = mid - 1;
            }
        }
    }
    Ok(best)
}

async fn attempt(
    engine: &DisruptionEngine,
    prefix: &[&Candidate],
    pools: &[NodePool],
) -> Result<Option<Proposal>> {
    let removed: Vec<ProviderId> = prefix.iter().map(|c| c.provider_id()).collect();
    let pods: Vec<Pod> = prefix
        .iter()
        .flat_map(|c| c.reschedulable.iter().cloned())
        .collect();
    let sim = engine.simulation_without(&removed, pools).await?;
    let results = simulate(&sim, &pods);
    if !results.all_placed() || results.new_node_claims.len() > 1 {
        return Ok(None);
    }
    let current_cost: f64 = prefix.iter().filter_map(|c| c.price).sum();
    let replacement_cost: f64 = results
        .new_node_claims
        .iter()
        .filter_map(|p| p.cheapest_price())
        .sum();
    if replacement_cost >= current_cost {
        return Ok(None);
    }
    debug!(
        nodes = prefix.len(),
        current_cost, replacement_cost, "multi-node consolidation viable"
    );
    Ok(Some(Proposal {
        candidates: prefix.iter().map(|c| (*c).clone()).collect(),
        plans: results.new_node_claims,
    }))
}

/// Consolidation never touches nodes whose instance type has left the
/// catalog (no price to reason about) or whose pools disabled it via the
/// Consolidatable condition flow. The engine applies this before budget
/// accounting so ineligible nodes never consume a slot.
pub(crate) fn consolidatable(candidate: &Candidate) -> bool {
    candidate.instance_type_in_catalog
        && candidate.price.is_some()
        && candidate
            .claim
            .is_true(crate::apis::COND_CONSOLIDATABLE)
}
