use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Pod, PodTemplateSpec, Taint};
use tracing::{debug, info};

use crate::apis::NodePool;
use crate::catalog::{InstanceType, OverheadSettings};
use crate::requirements::{LABEL_CAPACITY_TYPE, LABEL_INSTANCE_TYPE, LABEL_ZONE, Requirements};
use crate::resources::ResourceList;
use crate::scheduling::topology::Topology;
use crate::scheduling::{
    ExistingNode, NodeClaimPlan, PodSchedulingInfo, Results, SchedulingError, daemonset_overhead,
    tolerates,
};
use crate::state::PodId;

/// One nodepool as the simulator sees it: the pool object, the catalog
/// slice it may draw from, and its current consumption for limit checks.
#[derive(Debug, Clone)]
pub struct PoolContext {
    pub pool: NodePool,
    pub instance_types: Vec<InstanceType>,
    pub current_usage: ResourceList,
}

/// Inputs to one simulation pass. The simulator never mutates these;
/// identical inputs produce identical results.
#[derive(Debug, Clone, Default)]
pub struct Simulation {
    pub pools: Vec<PoolContext>,
    pub existing: Vec<ExistingNode>,
    pub daemonsets: Vec<PodTemplateSpec>,
    /// Already-bound pods and their node names, seeding topology state.
    pub bound: Vec<(Pod, String)>,
    /// Reservation model applied to instance-type capacity. Explicit so
    /// simulations are reproducible under test.
    pub overhead: OverheadSettings,
}

struct ExpandedPool {
    name: String,
    requirements: Requirements,
    taints: Vec<Taint>,
    instance_types: Vec<InstanceType>,
    usage: ResourceList,
    limits: Option<ResourceList>,
}

/// Place every pod, cheapest-feasible first into existing capacity, then
/// into already-hypothesized nodes, then onto a new node from the
/// highest-weighted admitting pool. Pure and deterministic.
pub fn simulate(sim: &Simulation, pods: &[Pod]) -> Results {
    let mut results = Results::default();
    if pods.is_empty() {
        return results;
    }

    let mut pools = expand_pools(sim);
    pools.sort_by(|a, b| a.0.cmp(&b.0));
    let pools: Vec<ExpandedPool> = pools.into_iter().map(|(_, p)| p).collect();

    let mut topology = Topology::new();
    for (pod, node_name) in &sim.bound {
        let labels = pod.metadata.labels.clone().unwrap_or_default();
        let node_labels = sim
            .existing
            .iter()
            .find(|n| &n.name == node_name)
            .map(|n| n.labels.clone())
            .unwrap_or_default();
        topology.record(&labels, &node_labels, node_name);
    }
    let mut existing: Vec<ExistingNode> = sim.existing.clone();
    existing.sort_by(|a, b| a.name.cmp(&b.name));
    for node in &existing {
        topology.register_domains(&node.labels, &node.name);
    }
    for pool in &pools {
        for zone in pool_zones(pool) {
            topology.register_domains(
                &BTreeMap::from([(LABEL_ZONE.to_string(), zone)]),
                "",
            );
        }
    }

    let mut infos: Vec<PodSchedulingInfo> = pods.iter().map(PodSchedulingInfo::from_pod).collect();
    infos.sort_by_key(|i| i.order_key());

    let mut plans: Vec<NodeClaimPlan> = Vec::new();
    let mut plan_counter = 0usize;

    for pod in &infos {
        let mut last_error: Option<SchedulingError> = None;

        if try_existing(pod, &mut existing, &mut topology) {
            continue;
        }
        if try_plans(pod, &mut plans, &mut topology, &sim.overhead, &mut last_error) {
            continue;
        }
        match open_plan(pod, &pools, &plans, sim, &mut topology, &mut plan_counter) {
            Ok(plan) => {
                debug!(pod = %pod.id, pool = %plan.pool, types = plan.instance_types.len(), "opened hypothetical node");
                plans.push(plan);
            }
            Err(e) => {
                let narrowest = SchedulingError::narrow(last_error, e);
                debug!(pod = %pod.id, error = %narrowest, "pod unschedulable");
                results.pod_errors.insert(pod.id.clone(), narrowest);
            }
        }
    }

    merge_plans(&mut plans, &sim.overhead);
    enforce_min_values(&mut plans, &mut results.pod_errors);

    results.existing_nodes = existing
        .into_iter()
        .filter(|n| !n.assigned.is_empty())
        .collect();
    results.new_node_claims = plans;

    info!(
        new_nodes = results.new_node_claims.len(),
        reused_nodes = results.existing_nodes.len(),
        unplaced = results.pod_errors.len(),
        "simulation complete"
    );
    results
}

fn expand_pools(sim: &Simulation) -> Vec<((i64, String), ExpandedPool)> {
    let mut out = Vec::new();
    for ctx in &sim.pools {
        let Ok(requirements) = ctx.pool.scheduling_requirements() else {
            // A self-contradictory pool admits nothing this tick.
            continue;
        };
        let name = ctx.pool.name();
        let compatible: Vec<InstanceType> = ctx
            .instance_types
            .iter()
            .filter(|it| requirements.compatible(&it.requirements()))
            .cloned()
            .collect();
        out.push((
            // Higher weight first, then name.
            (-(ctx.pool.weight() as i64), name.clone()),
            ExpandedPool {
                name,
                requirements,
                taints: ctx.pool.spec.template.spec.taints.clone(),
                instance_types: compatible,
                usage: ctx.current_usage.clone(),
                limits: ctx.pool.limits(),
            },
        ));
    }
    out
}

fn pool_zones(pool: &ExpandedPool) -> Vec<String> {
    let mut zones: Vec<String> = pool
        .instance_types
        .iter()
        .flat_map(|it| it.zones())
        .filter(|z| {
            pool.requirements
                .get(LABEL_ZONE)
                .is_none_or(|kr| kr.admits(z))
        })
        .collect();
    zones.sort();
    zones.dedup();
    zones
}

fn try_existing(
    pod: &PodSchedulingInfo,
    existing: &mut [ExistingNode],
    topology: &mut Topology,
) -> bool {
    for node in existing.iter_mut() {
        if node.marked_for_deletion || node.terminating {
            continue;
        }
        if !tolerates(&pod.tolerations, &node.taints) {
            continue;
        }
        if !pod.labels_compatible(&node.labels) {
            continue;
        }
        if !node.available.fits(&pod.requests) {
            continue;
        }
        if topology.admits(pod, &node.labels, &node.name).is_err() {
            continue;
        }
        node.available = node.available.saturating_sub(&pod.requests);
        node.assigned.push(pod.id.clone());
        topology.record(&pod.labels, &node.labels, &node.name);
        return true;
    }
    false
}

fn try_plans(
    pod: &PodSchedulingInfo,
    plans: &mut [NodeClaimPlan],
    topology: &mut Topology,
    overhead: &OverheadSettings,
    last_error: &mut Option<SchedulingError>,
) -> bool {
    for plan in plans.iter_mut() {
        if !tolerates(&pod.tolerations, &plan.taints) {
            continue;
        }
        let Some(alternative) = pod.compatible_alternative(&plan.requirements) else {
            continue;
        };
        let Ok(candidate_reqs) = plan.requirements.intersect(alternative) else {
            continue;
        };
        let mut combined = plan.requests.clone();
        combined.add(&pod.requests);
        combined.add(&plan.daemonset_overhead);
        let surviving: Vec<InstanceType> = plan
            .instance_types
            .iter()
            .filter(|it| candidate_reqs.compatible(&it.requirements()))
            .filter(|it| it.allocatable(overhead).fits(&combined))
            .cloned()
            .collect();
        if surviving.is_empty() {
            *last_error =
                Some(SchedulingError::narrow(last_error.take(), SchedulingError::InsufficientResources));
            continue;
        }
        let mut candidate_reqs = candidate_reqs;
        let mut labels = plan_labels(&candidate_reqs, &plan.name);
        if let Err(e) = admit_pinning_zone(
            pod,
            &mut candidate_reqs,
            &mut labels,
            &plan.name,
            &surviving,
            topology,
        ) {
            *last_error = Some(SchedulingError::narrow(last_error.take(), e));
            continue;
        }
        plan.requirements = candidate_reqs;
        plan.instance_types = surviving;
        plan.requests.add(&pod.requests);
        plan.pods.push(pod.id.clone());
        topology.record(&pod.labels, &labels, &plan.name);
        return true;
    }
    false
}

fn open_plan(
    pod: &PodSchedulingInfo,
    pools: &[ExpandedPool],
    plans: &[NodeClaimPlan],
    sim: &Simulation,
    topology: &mut Topology,
    counter: &mut usize,
) -> Result<NodeClaimPlan, SchedulingError> {
    let mut last_error: Option<SchedulingError> = None;

    for pool in pools {
        if !tolerates(&pod.tolerations, &pool.taints) {
            last_error = Some(SchedulingError::narrow(
                last_error.take(),
                SchedulingError::UntoleratedTaints,
            ));
            continue;
        }
        let Some(alternative) = pod.compatible_alternative(&pool.requirements) else {
            last_error = Some(SchedulingError::narrow(
                last_error.take(),
                SchedulingError::IncompatibleRequirements(pod.id.to_string()),
            ));
            continue;
        };
        let Ok(requirements) = pool.requirements.intersect(alternative) else {
            last_error = Some(SchedulingError::narrow(
                last_error.take(),
                SchedulingError::IncompatibleRequirements(pod.id.to_string()),
            ));
            continue;
        };

        // Limits count the pool's live consumption plus what this pass
        // has already planned onto it.
        if let Some(limits) = &pool.limits {
            let mut projected = pool.usage.clone();
            for plan in plans.iter().filter(|p| p.pool == pool.name) {
                projected.add(&plan.requests);
            }
            projected.add(&pod.requests);
            if projected.exceeds(limits) {
                last_error = Some(SchedulingError::narrow(
                    last_error.take(),
                    SchedulingError::LimitsExceeded(pool.name.clone()),
                ));
                continue;
            }
        }

        let overhead = daemonset_overhead(&sim.daemonsets, &requirements, &pool.taints);
        let mut needed = pod.requests.clone();
        needed.add(&overhead);
        let mut surviving: Vec<InstanceType> = pool
            .instance_types
            .iter()
            .filter(|it| requirements.compatible(&it.requirements()))
            .filter(|it| it.allocatable(&sim.overhead).fits(&needed))
            .cloned()
            .collect();
        if surviving.is_empty() {
            last_error = Some(SchedulingError::narrow(
                last_error.take(),
                SchedulingError::InsufficientResources,
            ));
            continue;
        }
        surviving.sort_by(|a, b| {
            let pa = a
                .cheapest_offering(&requirements)
                .map(|o| o.price)
                .unwrap_or(f64::MAX);
            let pb = b
                .cheapest_offering(&requirements)
                .map(|o| o.price)
                .unwrap_or(f64::MAX);
            pa.partial_cmp(&pb)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.name.cmp(&b.name))
        });

        *counter += 1;
        let name = format!("{}-sim-{}", pool.name, counter);
        let mut requirements = requirements;
        let mut labels = plan_labels(&requirements, &name);
        if let Err(e) = admit_pinning_zone(
            pod,
            &mut requirements,
            &mut labels,
            &name,
            &surviving,
            topology,
        ) {
            last_error = Some(SchedulingError::narrow(last_error.take(), e));
            continue;
        }
        topology.record(&pod.labels, &labels, &name);

        return Ok(NodeClaimPlan {
            pool: pool.name.clone(),
            name,
            requirements,
            instance_types: surviving,
            pods: vec![pod.id.clone()],
            requests: pod.requests.clone(),
            daemonset_overhead: overhead,
            taints: pool.taints.clone(),
        });
    }

    Err(last_error.unwrap_or(SchedulingError::NoNodePoolMatched))
}

/// Does this pod participate in any hard zone-scoped topology
/// constraint? Such pods force hypothetical nodes to commit to a zone.
fn needs_zone_pin(pod: &PodSchedulingInfo) -> bool {
    pod.spread
        .iter()
        .any(|c| c.hard && c.topology_key == LABEL_ZONE)
        || pod.anti_affinity.iter().any(|t| t.topology_key == LABEL_ZONE)
        || pod.affinity.iter().any(|t| t.topology_key == LABEL_ZONE)
}

/// Admit a pod onto a hypothetical node, pinning the node to a concrete
/// zone first when the pod's topology constraints demand one. Zones are
/// tried in sorted order; the first admissible one wins, so placement
/// stays deterministic.
fn admit_pinning_zone(
    pod: &PodSchedulingInfo,
    requirements: &mut Requirements,
    labels: &mut BTreeMap<String, String>,
    name: &str,
    instance_types: &[InstanceType],
    topology: &Topology,
) -> Result<(), SchedulingError> {
    if labels.contains_key(LABEL_ZONE) || !needs_zone_pin(pod) {
        return topology.admits(pod, labels, name);
    }
    let candidate_zones: Vec<String> = match requirements
        .get(LABEL_ZONE)
        .and_then(|kr| kr.allowed_values())
    {
        Some(values) => values,
        None => {
            let mut zones: Vec<String> =
                instance_types.iter().flat_map(|it| it.zones()).collect();
            zones.sort();
            zones.dedup();
            zones
        }
    };
    let mut last = SchedulingError::TopologyConflict("no zone admits the pod".into());
    for zone in candidate_zones {
        labels.insert(LABEL_ZONE.to_string(), zone.clone());
        match topology.admits(pod, labels, name) {
            Ok(()) => {
                requirements.insert_label(LABEL_ZONE, &zone);
                return Ok(());
            }
            Err(e) => last = e,
        }
    }
    labels.remove(LABEL_ZONE);
    Err(last)
}

/// Labels a hypothetical node is certain to carry: any requirement pinned
/// to exactly one value. Used for topology checks before the node exists.
fn plan_labels(reqs: &Requirements, name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    for key in [LABEL_ZONE, LABEL_CAPACITY_TYPE, LABEL_INSTANCE_TYPE] {
        if let Some(kr) = reqs.get(key)
            && let Some(values) = kr.allowed_values()
            && values.len() == 1
        {
            labels.insert(key.to_string(), values[0].clone());
        }
    }
    labels.insert(
        crate::requirements::LABEL_HOSTNAME.to_string(),
        name.to_string(),
    );
    labels
}

/// Collapse hypothetical nodes pairwise when one instance type from the
/// intersection of their sets holds both pod sets for less than the two
/// nodes separately.
fn merge_plans(plans: &mut Vec<NodeClaimPlan>, overhead: &OverheadSettings) {
    let mut i = 0;
    while i < plans.len() {
        let mut j = i + 1;
        while j < plans.len() {
            if let Some(merged) = try_merge(&plans[i], &plans[j], overhead) {
                debug!(into = %plans[i].name, from = %plans[j].name, "collapsed hypothetical nodes");
                plans[i] = merged;
                plans.remove(j);
            } else {
                j += 1;
            }
        }
        i += 1;
    }
}

fn try_merge(a: &NodeClaimPlan, b: &NodeClaimPlan, overhead: &OverheadSettings) -> Option<NodeClaimPlan> {
    if a.pool != b.pool {
        return None;
    }
    let requirements = a.requirements.intersect(&b.requirements).ok()?;
    let mut requests = a.requests.clone();
    requests.add(&b.requests);
    let mut needed = requests.clone();
    let daemonset_overhead = a.daemonset_overhead.clone();
    needed.add(&daemonset_overhead);

    let b_names: std::collections::BTreeSet<&str> =
        b.instance_types.iter().map(|it| it.name.as_str()).collect();
    let surviving: Vec<InstanceType> = a
        .instance_types
        .iter()
        .filter(|it| b_names.contains(it.name.as_str()))
        .filter(|it| requirements.compatible(&it.requirements()))
        .filter(|it| it.allocatable(overhead).fits(&needed))
        .cloned()
        .collect();
    if surviving.is_empty() {
        return None;
    }

    let merged = NodeClaimPlan {
        pool: a.pool.clone(),
        name: a.name.clone(),
        requirements,
        instance_types: surviving,
        pods: a.pods.iter().chain(b.pods.iter()).cloned().collect(),
        requests,
        daemonset_overhead,
        taints: a.taints.clone(),
    };
    // A merge must strictly dominate on price.
    let (ma, mb, mm) = (a.cheapest_price()?, b.cheapest_price()?, merged.cheapest_price()?);
    if mm < ma + mb { Some(merged) } else { None }
}

/// Reject plans whose surviving instance types no longer span the
/// user-declared minValues diversity floors. Their pods become errors.
fn enforce_min_values(
    plans: &mut Vec<NodeClaimPlan>,
    errors: &mut BTreeMap<PodId, SchedulingError>,
) {
    plans.retain(|plan| {
        for (key, min) in plan.requirements.min_values_demands() {
            let distinct = distinct_values(plan, key);
            if distinct < min as usize {
                for pod in &plan.pods {
                    errors.insert(pod.clone(), SchedulingError::MinValuesViolated(key.to_string()));
                }
                return false;
            }
        }
        true
    });
}

fn distinct_values(plan: &NodeClaimPlan, key: &str) -> usize {
    let mut values = std::collections::BTreeSet::new();
    for it in &plan.instance_types {
        match key {
            LABEL_INSTANCE_TYPE => {
                values.insert(it.name.clone());
            }
            LABEL_ZONE => {
                values.extend(it.zones());
            }
            _ => {
                if let Some(kr) = it.requirements().get(key)
                    && let Some(vs) = kr.allowed_values()
                {
                    values.extend(vs);
                }
            }
        }
    }
    values.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::nodepool::tests_support::minimal_pool;
    use crate::catalog::{CapacityType, Offering};
    use crate::requirements::{Operator, Requirement};
    use crate::resources::{CPU, MEMORY, PODS};
    use k8s_openapi::api::core::v1::{Container, PodSpec, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use kube::api::ObjectMeta;

    fn instance_type(name: &str, cpu: i64, memory_mib: i64, price: f64) -> InstanceType {
        InstanceType {
            name: name.into(),
            arch: "amd64".into(),
            capacity: ResourceList::new()
                .with(CPU, cpu * 1000)
                .with(MEMORY, memory_mib * 1024 * 1024 * 1000)
                .with(PODS, 110_000),
            offerings: vec![Offering {
                zone: "a".into(),
                capacity_type: CapacityType::OnDemand,
                price,
                available: true,
            }],
        }
    }

    fn pod(name: &str, cpu: &str, memory: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "worker".into(),
                    resources: Some(ResourceRequirements {
                        requests: Some(
                            [
                                ("cpu".to_string(), Quantity(cpu.into())),
                                ("memory".to_string(), Quantity(memory.into())),
                            ]
                            .into(),
                        ),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: None,
            ..Default::default()
        }
    }

    fn sim_with(types: Vec<InstanceType>) -> Simulation {
        Simulation {
            pools: vec![PoolContext {
                pool: minimal_pool("p1"),
                instance_types: types,
                current_usage: ResourceList::new(),
            }],
            existing: vec![],
            daemonsets: vec![],
            bound: vec![],
            overhead: OverheadSettings::default(),
        }
    }

    #[test]
    fn zero_pods_is_a_noop() {
        let results = simulate(&sim_with(vec![instance_type("t-small", 2, 4096, 0.05)]), &[]);
        assert!(results.new_node_claims.is_empty());
        assert!(results.existing_nodes.is_empty());
        assert!(results.pod_errors.is_empty());
    }

    #[test]
    fn single_pod_picks_the_only_fitting_type() {
        // t-small (2 cpu) cannot fit a 3 cpu pod; t-med (4 cpu) must win.
        let sim = sim_with(vec![
            instance_type("t-small", 2, 4096, 0.05),
            instance_type("t-med", 4, 8192, 0.09),
        ]);
        let results = simulate(&sim, &[pod("p1", "3", "1Gi")]);
        assert!(results.all_placed());
        assert_eq!(results.new_node_claims.len(), 1);
        let plan = &results.new_node_claims[0];
        assert_eq!(plan.pool, "p1");
        let names: Vec<&str> = plan.instance_types.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["t-med"]);
    }

    #[test]
    fn pods_pack_onto_one_hypothetical_node() {
        let sim = sim_with(vec![instance_type("t-med", 4, 8192, 0.09)]);
        let results = simulate(
            &sim,
            &[pod("p1", "1", "1Gi"), pod("p2", "1", "1Gi"), pod("p3", "1", "1Gi")],
        );
        assert!(results.all_placed());
        assert_eq!(results.new_node_claims.len(), 1);
        assert_eq!(results.new_node_claims[0].pods.len(), 3);
    }

    #[test]
    fn existing_capacity_absorbs_before_new_nodes() {
        let mut sim = sim_with(vec![instance_type("t-med", 4, 8192, 0.09)]);
        sim.existing = vec![ExistingNode {
            name: "n1".into(),
            provider_id: crate::providers::provider::ProviderId("kwok://n1".into()),
            labels: BTreeMap::new(),
            taints: vec![],
            available: ResourceList::new()
                .with(CPU, 4000)
                .with(MEMORY, 8 * 1024 * 1024 * 1024 * 1000)
                .with(PODS, 100_000),
            marked_for_deletion: false,
            terminating: false,
            assigned: vec![],
        }];
        let results = simulate(&sim, &[pod("p1", "2", "1Gi")]);
        assert!(results.all_placed());
        assert!(results.new_node_claims.is_empty());
        assert_eq!(results.existing_nodes.len(), 1);
        assert_eq!(results.existing_nodes[0].assigned.len(), 1);
        assert_eq!(results.existing_nodes[0].available.get(CPU), 2000);
    }

    #[test]
    fn marked_for_deletion_nodes_absorb_nothing() {
        let mut sim = sim_with(vec![instance_type("t-med", 4, 8192, 0.09)]);
        sim.existing = vec![ExistingNode {
            name: "n1".into(),
            provider_id: crate::providers::provider::ProviderId("kwok://n1".into()),
            labels: BTreeMap::new(),
            taints: vec![],
            available: ResourceList::new().with(CPU, 4000).with(PODS, 100_000),
            marked_for_deletion: true,
            terminating: false,
            assigned: vec![],
        }];
        let results = simulate(&sim, &[pod("p1", "1", "1Mi")]);
        assert!(results.existing_nodes.is_empty());
        assert_eq!(results.new_node_claims.len(), 1);
    }

    #[test]
    fn unplaceable_pod_reports_narrowest_error() {
        let sim = sim_with(vec![instance_type("t-small", 2, 4096, 0.05)]);
        let results = simulate(&sim, &[pod("huge", "64", "1Gi")]);
        assert_eq!(
            results.pod_errors.values().next(),
            Some(&SchedulingError::InsufficientResources)
        );
    }

    #[test]
    fn node_selector_filters_pools() {
        let mut sim = sim_with(vec![instance_type("t-med", 4, 8192, 0.09)]);
        sim.pools[0].pool.spec.template.spec.requirements =
            vec![Requirement::new_in(crate::requirements::LABEL_ZONE, &["a"])];
        let mut p = pod("p1", "1", "1Gi");
        p.spec.as_mut().unwrap().node_selector = Some(
            [(crate::requirements::LABEL_ZONE.to_string(), "z".to_string())].into(),
        );
        let results = simulate(&sim, &[p]);
        assert!(matches!(
            results.pod_errors.values().next(),
            Some(SchedulingError::IncompatibleRequirements(_))
        ));
    }

    #[test]
    fn limits_at_consumption_reject_launch() {
        let mut sim = sim_with(vec![instance_type("t-med", 4, 8192, 0.09)]);
        sim.pools[0].pool.spec.limits = Some(
            [("cpu".to_string(), Quantity("4".into()))].into(),
        );
        sim.pools[0].current_usage = ResourceList::new().with(CPU, 4000);
        let results = simulate(&sim, &[pod("p1", "1", "1Gi")]);
        assert!(matches!(
            results.pod_errors.values().next(),
            Some(SchedulingError::LimitsExceeded(_))
        ));
    }

    #[test]
    fn weight_orders_pools() {
        let mut high = minimal_pool("high");
        high.spec.weight = Some(50);
        let low = minimal_pool("low");
        let sim = Simulation {
            pools: vec![
                PoolContext {
                    pool: low,
                    instance_types: vec![instance_type("t-med", 4, 8192, 0.09)],
                    current_usage: ResourceList::new(),
                },
                PoolContext {
                    pool: high,
                    instance_types: vec![instance_type("t-med", 4, 8192, 0.09)],
                    current_usage: ResourceList::new(),
                },
            ],
            ..Default::default()
        };
        let results = simulate(&sim, &[pod("p1", "1", "1Gi")]);
        assert_eq!(results.new_node_claims[0].pool, "high");
    }

    #[test]
    fn untolerated_pool_taints_block() {
        let mut sim = sim_with(vec![instance_type("t-med", 4, 8192, 0.09)]);
        sim.pools[0].pool.spec.template.spec.taints = vec![Taint {
            key: "dedicated".into(),
            value: Some("gpu".into()),
            effect: "NoSchedule".into(),
            ..Default::default()
        }];
        let results = simulate(&sim, &[pod("p1", "1", "1Gi")]);
        assert_eq!(
            results.pod_errors.values().next(),
            Some(&SchedulingError::UntoleratedTaints)
        );
    }

    #[test]
    fn min_values_rejects_thin_instance_diversity() {
        let mut sim = sim_with(vec![instance_type("t-med", 4, 8192, 0.09)]);
        sim.pools[0].pool.spec.template.spec.requirements = vec![Requirement {
            key: LABEL_INSTANCE_TYPE.into(),
            operator: Operator::Exists,
            values: vec![],
            min_values: Some(2),
        }];
        let results = simulate(&sim, &[pod("p1", "1", "1Gi")]);
        assert!(results.new_node_claims.is_empty());
        assert!(matches!(
            results.pod_errors.values().next(),
            Some(SchedulingError::MinValuesViolated(_))
        ));
    }

    #[test]
    fn deterministic_across_runs() {
        let sim = sim_with(vec![
            instance_type("t-a", 4, 8192, 0.09),
            instance_type("t-b", 4, 8192, 0.09),
            instance_type("t-c", 8, 16384, 0.17),
        ]);
        let pods: Vec<Pod> = (0..7).map(|i| pod(&format!("p{i}"), "1", "1Gi")).collect();
        let first = simulate(&sim, &pods);
        let second = simulate(&sim, &pods);
        assert_eq!(first.new_node_claims.len(), second.new_node_claims.len());
        for (a, b) in first.new_node_claims.iter().zip(&second.new_node_claims) {
            assert_eq!(a.pods, b.pods);
            let an: Vec<&str> = a.instance_types.iter().map(|t| t.name.as_str()).collect();
            let bn: Vec<&str> = b.instance_types.iter().map(|t| t.name.as_str()).collect();
            assert_eq!(an, bn);
        }
    }
}
