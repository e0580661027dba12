pub mod simulator;
pub mod topology;

pub use simulator::{Simulation, simulate};

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Pod, PodTemplateSpec, Taint, Toleration};
use thiserror::Error;

use crate::catalog::InstanceType;
use crate::providers::provider::ProviderId;
use crate::requirements::Requirements;
use crate::resources::{ResourceList, pod_requests};
use crate::state::PodId;

/// Why a pod could not be placed. Variants are ordered from narrowest to
/// broadest; when several nodes reject a pod for different reasons the
/// narrowest survives into the result.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchedulingError {
    #[error("no nodepool admits the pod's node selectors: {0}")]
    IncompatibleRequirements(String),
    #[error("pod does not tolerate required taints")]
    UntoleratedTaints,
    #[error("topology constraints cannot be satisfied: {0}")]
    TopologyConflict(String),
    #[error("nodepool {0} limits exhausted")]
    LimitsExceeded(String),
    #[error("minValues for {0} cannot be satisfied by remaining instance types")]
    MinValuesViolated(String),
    #[error("no instance type has sufficient resources")]
    InsufficientResources,
    #[error("no nodepool matched")]
    NoNodePoolMatched,
}

impl SchedulingError {
    /// Lower rank = narrower explanation.
    fn rank(&self) -> u8 {
        match self {
            Self::MinValuesViolated(_) => 0,
            Self::TopologyConflict(_) => 1,
            Self::UntoleratedTaints => 2,
            Self::IncompatibleRequirements(_) => 3,
            Self::LimitsExceeded(_) => 4,
            Self::InsufficientResources => 5,
            Self::NoNodePoolMatched => 6,
        }
    }

    /// Keep the narrower of two rejection reasons.
    pub fn narrow(a: Option<SchedulingError>, b: SchedulingError) -> SchedulingError {
        match a {
            Some(a) if a.rank() <= b.rank() => a,
            _ => b,
        }
    }
}

/// Pod anti-/affinity term reduced to what the simulator evaluates.
#[derive(Debug, Clone)]
pub struct AffinityTerm {
    pub topology_key: String,
    pub match_labels: BTreeMap<String, String>,
}

/// Topology spread constraint reduced likewise.
#[derive(Debug, Clone)]
pub struct SpreadConstraint {
    pub topology_key: String,
    pub max_skew: i32,
    pub match_labels: BTreeMap<String, String>,
    /// true for DoNotSchedule; ScheduleAnyway constraints are ignored.
    pub hard: bool,
}

/// Everything the simulator needs to know about one pod, precomputed so
/// the per-node inner loop stays cheap.
#[derive(Debug, Clone)]
pub struct PodSchedulingInfo {
    pub id: PodId,
    pub labels: BTreeMap<String, String>,
    pub requests: ResourceList,
    /// Alternatives: node selector terms are ORed in the API, so each
    /// term yields one requirement set. Unconstrained pods carry a single
    /// empty set.
    pub requirement_alternatives: Vec<Requirements>,
    pub tolerations: Vec<Toleration>,
    pub anti_affinity: Vec<AffinityTerm>,
    pub affinity: Vec<AffinityTerm>,
    pub spread: Vec<SpreadConstraint>,
    pub priority: i32,
}

impl PodSchedulingInfo {
    pub fn from_pod(pod: &Pod) -> Self {
        let spec = pod.spec.clone().unwrap_or_default();
        Self {
            id: PodId::from_pod(pod),
            labels: pod.metadata.labels.clone().unwrap_or_default(),
            requests: pod_requests(pod),
            requirement_alternatives: requirement_alternatives(pod),
            tolerations: spec.tolerations.unwrap_or_default(),
            anti_affinity: affinity_terms(pod, false),
            affinity: affinity_terms(pod, true),
            spread: spread_constraints(pod),
            priority: spec.priority.unwrap_or(0),
        }
    }

    /// Sort key: heavier pods first so hard placements happen while the
    /// packing is still open, then higher priority, then identity for
    /// determinism.
    pub fn order_key(&self) -> (i64, i32, PodId) {
        let footprint = self.requests.get(crate::resources::CPU)
            + self.requests.get(crate::resources::MEMORY) / (1024 * 1024);
        (-footprint, -self.priority, self.id.clone())
    }

    /// Does any requirement alternative admit these node labels?
    pub fn labels_compatible(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirement_alternatives
            .iter()
            .any(|alt| labels_satisfy(alt, labels))
    }

    /// First alternative compatible with the given requirement set.
    pub fn compatible_alternative(&self, reqs: &Requirements) -> Option<&Requirements> {
        self.requirement_alternatives
            .iter()
            .find(|alt| reqs.compatible(alt))
    }
}

fn labels_satisfy(reqs: &Requirements, labels: &BTreeMap<String, String>) -> bool {
    reqs.matches_labels(labels)
}

/// Node selector + required node affinity, one requirement set per
/// (ORed) selector term.
fn requirement_alternatives(pod: &Pod) -> Vec<Requirements> {
    use crate::requirements::{Operator, Requirement};
    let spec = pod.spec.clone().unwrap_or_default();
    let selector_reqs: Vec<Requirement> = spec
        .node_selector
        .as_ref()
        .map(|sel| {
            sel.iter()
                .map(|(k, v)| Requirement::new_in(k, &[v.as_str()]))
                .collect()
        })
        .unwrap_or_default();

    let terms = spec
        .affinity
        .as_ref()
        .and_then(|a| a.node_affinity.as_ref())
        .and_then(|na| na.required_during_scheduling_ignored_during_execution.as_ref())
        .map(|sel| sel.node_selector_terms.clone())
        .unwrap_or_default();

    let mut alternatives = Vec::new();
    if terms.is_empty() {
        if let Ok(reqs) = Requirements::parse(&selector_reqs) {
            alternatives.push(reqs);
        }
    } else {
        for term in terms {
            let mut reqs = selector_reqs.clone();
            for expr in term.match_expressions.unwrap_or_default() {
                let operator = match expr.operator.as_str() {
                    "In" => Operator::In,
                    "NotIn" => Operator::NotIn,
                    "Exists" => Operator::Exists,
                    "DoesNotExist" => Operator::DoesNotExist,
                    "Gt" => Operator::Gt,
                    "Lt" => Operator::Lt,
                    _ => continue,
                };
                reqs.push(Requirement {
                    key: expr.key,
                    operator,
                    values: expr.values.unwrap_or_default(),
                    min_values: None,
                });
            }
            if let Ok(parsed) = Requirements::parse(&reqs) {
                alternatives.push(parsed);
            }
        }
    }
    if alternatives.is_empty() {
        // Every alternative self-contradicted; keep one so the pod is
        // reported incompatible rather than silently unconstrained.
        alternatives.push(
            Requirements::parse(&[Requirement::new_in("canopy/unsatisfiable", &["true"])])
                .expect("literal requirement parses"),
        );
    }
    alternatives
}

fn affinity_terms(pod: &Pod, positive: bool) -> Vec<AffinityTerm> {
    let affinity = pod.spec.as_ref().and_then(|s| s.affinity.as_ref());
    let terms = if positive {
        affinity
            .and_then(|a| a.pod_affinity.as_ref())
            .and_then(|pa| pa.required_during_scheduling_ignored_during_execution.clone())
    } else {
        affinity
            .and_then(|a| a.pod_anti_affinity.as_ref())
            .and_then(|pa| pa.required_during_scheduling_ignored_during_execution.clone())
    };
    terms
        .unwrap_or_default()
        .into_iter()
        .map(|t| AffinityTerm {
            topology_key: t.topology_key,
            match_labels: t
                .label_selector
                .and_then(|s| s.match_labels)
                .unwrap_or_default(),
        })
        .collect()
}

fn spread_constraints(pod: &Pod) -> Vec<SpreadConstraint> {
    pod.spec
        .as_ref()
        .and_then(|s| s.topology_spread_constraints.clone())
        .unwrap_or_default()
        .into_iter()
        .map(|c| SpreadConstraint {
            topology_key: c.topology_key,
            max_skew: c.max_skew,
            match_labels: c
                .label_selector
                .and_then(|s| s.match_labels)
                .unwrap_or_default(),
            hard: c.when_unsatisfiable == "DoNotSchedule",
        })
        .collect()
}

/// NoSchedule/NoExecute taints must each be tolerated. PreferNoSchedule
/// never blocks.
pub fn tolerates(tolerations: &[Toleration], taints: &[Taint]) -> bool {
    taints
        .iter()
        .filter(|t| t.effect == "NoSchedule" || t.effect == "NoExecute")
        .all(|taint| {
            tolerations.iter().any(|tol| {
                let key_match = match tol.key.as_deref() {
                    None | Some("") => true,
                    Some(k) => k == taint.key,
                };
                let effect_match = match tol.effect.as_deref() {
                    None | Some("") => true,
                    Some(e) => e == taint.effect,
                };
                let value_match = match tol.operator.as_deref() {
                    Some("Exists") => true,
                    _ => tol.value.as_deref().unwrap_or("") == taint.value.as_deref().unwrap_or(""),
                };
                key_match && effect_match && value_match
            })
        })
}

/// A pre-existing node (or in-flight claim) as the simulator sees it.
#[derive(Debug, Clone)]
pub struct ExistingNode {
    pub name: String,
    pub provider_id: ProviderId,
    pub labels: BTreeMap<String, String>,
    pub taints: Vec<Taint>,
    /// Allocatable minus the requests of pods already bound here.
    pub available: ResourceList,
    pub marked_for_deletion: bool,
    pub terminating: bool,
    /// Pods assigned during this simulation.
    pub assigned: Vec<PodId>,
}

impl ExistingNode {
    pub fn from_state(sn: &crate::state::StateNode, bound_pods: &[Pod]) -> Self {
        let mut available = sn.allocatable();
        for pod in bound_pods {
            available = available.saturating_sub(&pod_requests(pod));
        }
        // An in-flight claim will shed its startup taints by the time
        // pods could land, so simulations see only the durable taints.
        // Without this, every pass re-provisions capacity that is
        // already on its way.
        let taints = match sn.claim() {
            Some(claim) if sn.node().is_none() => claim.spec.taints.clone(),
            _ => sn.taints(),
        };
        Self {
            name: sn.node_name(),
            provider_id: sn.provider_id.clone(),
            labels: sn.labels(),
            taints,
            available,
            marked_for_deletion: sn.marked_for_deletion,
            terminating: sn.terminating(),
            assigned: Vec::new(),
        }
    }
}

/// A hypothetical node the simulator decided to create: a nodepool, a
/// downward-closed set of instance types that could back it, and the pods
/// it absorbs.
#[derive(Debug, Clone)]
pub struct NodeClaimPlan {
    pub pool: String,
    /// Synthetic identity for topology bookkeeping.
    pub name: String,
    pub requirements: Requirements,
    pub instance_types: Vec<InstanceType>,
    pub pods: Vec<PodId>,
    pub requests: ResourceList,
    pub daemonset_overhead: ResourceList,
    pub taints: Vec<Taint>,
}

impl NodeClaimPlan {
    /// Cheapest price across the surviving instance types, for
    /// consolidation comparisons and merge decisions.
    pub fn cheapest_price(&self) -> Option<f64> {
        self.instance_types
            .iter()
            .filter_map(|it| it.cheapest_offering(&self.requirements).map(|o| o.price))
            .min_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
    }
}

/// The outcome of one simulation pass.
#[derive(Debug, Clone, Default)]
pub struct Results {
    pub new_node_claims: Vec<NodeClaimPlan>,
    pub existing_nodes: Vec<ExistingNode>,
    pub pod_errors: BTreeMap<PodId, SchedulingError>,
}

impl Results {
    pub fn all_placed(&self) -> bool {
        self.pod_errors.is_empty()
    }
}

/// Requests of every daemonset template that would schedule onto a node
/// with the given requirements and taints.
pub fn daemonset_overhead(
    templates: &[PodTemplateSpec],
    node_requirements: &Requirements,
    node_taints: &[Taint],
) -> ResourceList {
    let mut total = ResourceList::new();
    for template in templates {
        let pod = Pod {
            metadata: template.metadata.clone().unwrap_or_default(),
            spec: template.spec.clone(),
            ..Default::default()
        };
        let info = PodSchedulingInfo::from_pod(&pod);
        if !tolerates(&info.tolerations, node_taints) {
            continue;
        }
        if info.compatible_alternative(node_requirements).is_none() {
            continue;
        }
        total.add(&info.requests);
    }
    total
}
