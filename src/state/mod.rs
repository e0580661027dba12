pub mod node;
pub mod watch;

pub use node::{NodeSources, StateNode, node_is_ready};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{Node, Pod, PodTemplateSpec};
use tracing::debug;

use crate::apis::NodeClaim;
use crate::providers::provider::ProviderId;
use crate::resources::ResourceList;

/// Namespaced pod identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PodId {
    pub namespace: String,
    pub name: String,
}

impl PodId {
    pub fn from_pod(pod: &Pod) -> Self {
        Self {
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            name: pod.metadata.name.clone().unwrap_or_default(),
        }
    }
}

impl std::fmt::Display for PodId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// How the cache sees a pod right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodClass {
    Scheduled,
    Unschedulable,
    Terminating,
    Terminal,
    /// Pending but not (yet) marked unschedulable; the scheduler may
    /// still place it.
    Pending,
}

pub fn classify_pod(pod: &Pod) -> PodClass {
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("");
    if phase == "Succeeded" || phase == "Failed" {
        return PodClass::Terminal;
    }
    if pod.metadata.deletion_timestamp.is_some() {
        return PodClass::Terminating;
    }
    if pod
        .spec
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .is_some()
    {
        return PodClass::Scheduled;
    }
    if is_unschedulable(pod) {
        return PodClass::Unschedulable;
    }
    PodClass::Pending
}

/// Pending by virtue of unmet resources, as reported by the scheduler.
pub fn is_unschedulable(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions.iter().any(|c| {
                c.type_ == "PodScheduled"
                    && c.status == "False"
                    && c.reason.as_deref() == Some("Unschedulable")
            })
        })
        .unwrap_or(false)
}

/// DaemonSet pods target every node, including nodes that cannot run
/// them. We never need to scale anything to satisfy them, but their
/// footprint is subtracted from every hypothetical node.
pub fn is_daemonset_pod(pod: &Pod) -> bool {
    pod.metadata
        .owner_references
        .as_ref()
        .map(|refs| refs.iter().any(|r| r.kind == "DaemonSet"))
        .unwrap_or(false)
}

/// A pod survives eviction when a controller will recreate it.
pub fn is_reschedulable(pod: &Pod) -> bool {
    pod.metadata
        .owner_references
        .as_ref()
        .map(|refs| {
            refs.iter().any(|r| {
                matches!(
                    r.kind.as_str(),
                    "ReplicaSet" | "ReplicationController" | "StatefulSet" | "Job"
                )
            })
        })
        .unwrap_or(false)
}

const WATCHED_KINDS: [&str; 5] = ["nodes", "pods", "nodeclaims", "nodepools", "daemonsets"];

struct ClusterInner {
    nodes: BTreeMap<ProviderId, StateNode>,
    node_names: BTreeMap<String, ProviderId>,
    claim_names: BTreeMap<String, ProviderId>,
    /// Claims created but not yet launched: no providerID to join on.
    unlaunched: BTreeMap<String, NodeClaim>,
    pods: BTreeMap<PodId, Pod>,
    bindings: BTreeMap<PodId, String>,
    pods_by_node: BTreeMap<String, BTreeSet<PodId>>,
    daemonsets: BTreeMap<String, PodTemplateSpec>,
    synced_kinds: BTreeSet<&'static str>,
    sequence: u64,
}

/// Eventually-consistent in-process snapshot of the cluster, fed by
/// watches. One reader-writer lock guards the interior; readers
/// accumulate and release, they never block under the lock.
pub struct Cluster {
    inner: RwLock<ClusterInner>,
}

impl Default for Cluster {
    fn default() -> Self {
        Self::new()
    }
}

impl Cluster {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(ClusterInner {
                nodes: BTreeMap::new(),
                node_names: BTreeMap::new(),
                claim_names: BTreeMap::new(),
                unlaunched: BTreeMap::new(),
                pods: BTreeMap::new(),
                bindings: BTreeMap::new(),
                pods_by_node: BTreeMap::new(),
                daemonsets: BTreeMap::new(),
                synced_kinds: BTreeSet::new(),
                sequence: 0,
            }),
        }
    }

    // ── Sync tracking ────────────────────────────────────────────────

    /// True once the initial list of every watched kind has landed.
    pub fn synced(&self) -> bool {
        let inner = self.inner.read().unwrap();
        WATCHED_KINDS.iter().all(|k| inner.synced_kinds.contains(k))
    }

    pub fn mark_synced(&self, kind: &'static str) {
        self.inner.write().unwrap().synced_kinds.insert(kind);
    }

    /// Monotone counter bumped on every mutation that could change a
    /// scheduling or consolidation decision.
    pub fn sequence(&self) -> u64 {
        self.inner.read().unwrap().sequence
    }

    /// Pools are not mirrored here, but changing one invalidates standing
    /// conclusions just like any node or pod event.
    pub fn note_node_pool_change(&self) {
        self.inner.write().unwrap().sequence += 1;
    }

    // ── Nodes and claims ─────────────────────────────────────────────

    pub fn update_node(&self, node: Node) {
        let name = node.metadata.name.clone().unwrap_or_default();
        let provider_id = node
            .spec
            .as_ref()
            .and_then(|s| s.provider_id.clone())
            .filter(|p| !p.is_empty())
            .map(ProviderId)
            // Nodes that never report a providerID still need an identity.
            .unwrap_or_else(|| ProviderId(format!("node://{name}")));

        let mut inner = self.inner.write().unwrap();
        inner.sequence += 1;
        if let Some(old_id) = inner.node_names.get(&name).cloned()
            && old_id != provider_id
        {
            remove_node_half(&mut inner, &old_id);
        }
        inner.node_names.insert(name, provider_id.clone());
        match inner.nodes.get_mut(&provider_id) {
            Some(sn) => sn.with_node(node),
            None => {
                inner
                    .nodes
                    .insert(provider_id.clone(), StateNode::from_node(provider_id, node));
            }
        }
    }

    pub fn delete_node(&self, name: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.sequence += 1;
        if let Some(id) = inner.node_names.remove(name) {
            remove_node_half(&mut inner, &id);
        }
    }

    pub fn update_node_claim(&self, claim: NodeClaim) {
        let name = claim.name();
        let mut inner = self.inner.write().unwrap();
        inner.sequence += 1;
        let Some(provider_id) = claim.provider_id().map(|p| ProviderId(p.to_string())) else {
            inner.unlaunched.insert(name, claim);
            return;
        };
        inner.unlaunched.remove(&name);
        inner.claim_names.insert(name, provider_id.clone());
        match inner.nodes.get_mut(&provider_id) {
            Some(sn) => sn.with_claim(claim),
            None => {
                inner.nodes.insert(
                    provider_id.clone(),
                    StateNode::from_claim(provider_id, claim),
                );
            }
        }
    }

    pub fn delete_node_claim(&self, name: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.sequence += 1;
        inner.unlaunched.remove(name);
        if let Some(id) = inner.claim_names.remove(name) {
            if let Some(sn) = inner.nodes.get_mut(&id) {
                // Bookkeeping (marked-for-deletion, nominations) dies
                // with the claim.
                if !sn.without_claim() {
                    inner.nodes.remove(&id);
                }
            }
        }
    }

    // ── Pods and bindings ────────────────────────────────────────────

    pub fn update_pod(&self, pod: Pod) {
        let id = PodId::from_pod(&pod);
        let class = classify_pod(&pod);
        let node_name = pod.spec.as_ref().and_then(|s| s.node_name.clone());

        let mut inner = self.inner.write().unwrap();
        inner.sequence += 1;
        match (class, node_name) {
            (PodClass::Terminal, _) | (_, None) => unbind(&mut inner, &id),
            (_, Some(node)) => bind(&mut inner, id.clone(), node),
        }
        inner.pods.insert(id, pod);
    }

    pub fn delete_pod(&self, id: &PodId) {
        let mut inner = self.inner.write().unwrap();
        inner.sequence += 1;
        unbind(&mut inner, id);
        inner.pods.remove(id);
    }

    // ── DaemonSets ───────────────────────────────────────────────────

    pub fn update_daemon_set(&self, ds: DaemonSet) {
        let key = format!(
            "{}/{}",
            ds.metadata.namespace.clone().unwrap_or_default(),
            ds.metadata.name.clone().unwrap_or_default()
        );
        let Some(template) = ds.spec.map(|s| s.template) else {
            return;
        };
        let mut inner = self.inner.write().unwrap();
        inner.sequence += 1;
        inner.daemonsets.insert(key, template);
    }

    pub fn delete_daemon_set(&self, namespace: &str, name: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.sequence += 1;
        inner.daemonsets.remove(&format!("{namespace}/{name}"));
    }

    pub fn daemonset_templates(&self) -> Vec<PodTemplateSpec> {
        self.inner
            .read()
            .unwrap()
            .daemonsets
            .values()
            .cloned()
            .collect()
    }

    // ── Bookkeeping: deletion marks, nominations ─────────────────────

    pub fn mark_for_deletion(&self, ids: &[ProviderId]) {
        let mut inner = self.inner.write().unwrap();
        inner.sequence += 1;
        for id in ids {
            if let Some(sn) = inner.nodes.get_mut(id) {
                sn.marked_for_deletion = true;
            }
        }
    }

    pub fn unmark_for_deletion(&self, ids: &[ProviderId]) {
        let mut inner = self.inner.write().unwrap();
        inner.sequence += 1;
        for id in ids {
            if let Some(sn) = inner.nodes.get_mut(id) {
                sn.marked_for_deletion = false;
            }
        }
    }

    pub fn mark_for_eviction(&self, id: &ProviderId) {
        let mut inner = self.inner.write().unwrap();
        if let Some(sn) = inner.nodes.get_mut(id) {
            sn.marked_for_eviction = true;
        }
    }

    /// Reserve this node for pods the scheduler has chosen but not yet
    /// bound. Extends, never shortens, an existing nomination.
    pub fn nominate(&self, id: &ProviderId, ttl: Duration) {
        let until = Instant::now() + ttl;
        let mut inner = self.inner.write().unwrap();
        if let Some(sn) = inner.nodes.get_mut(id) {
            sn.nominated_until = Some(match sn.nominated_until {
                Some(existing) => existing.max(until),
                None => until,
            });
            debug!(provider_id = %id, "nominated node");
        }
    }

    // ── Reads ────────────────────────────────────────────────────────

    /// Visit every state node under the read lock. The callback must not
    /// block; accumulate and return.
    pub fn for_each_node(&self, mut f: impl FnMut(&StateNode)) {
        let inner = self.inner.read().unwrap();
        for sn in inner.nodes.values() {
            f(sn);
        }
    }

    pub fn node_by_provider_id(&self, id: &ProviderId) -> Option<StateNode> {
        self.inner.read().unwrap().nodes.get(id).cloned()
    }

    pub fn node_by_name(&self, name: &str) -> Option<StateNode> {
        let inner = self.inner.read().unwrap();
        let id = inner.node_names.get(name)?;
        inner.nodes.get(id).cloned()
    }

    pub fn claim_by_name(&self, name: &str) -> Option<StateNode> {
        let inner = self.inner.read().unwrap();
        let id = inner.claim_names.get(name)?;
        inner.nodes.get(id).cloned()
    }

    pub fn unlaunched_claims(&self) -> Vec<NodeClaim> {
        self.inner
            .read()
            .unwrap()
            .unlaunched
            .values()
            .cloned()
            .collect()
    }

    pub fn unschedulable_pods(&self) -> Vec<Pod> {
        let inner = self.inner.read().unwrap();
        inner
            .pods
            .values()
            .filter(|p| classify_pod(p) == PodClass::Unschedulable && !is_daemonset_pod(p))
            .cloned()
            .collect()
    }

    /// Every (pod, node name) binding, for topology seeding.
    pub fn bound_pods(&self) -> Vec<(Pod, String)> {
        let inner = self.inner.read().unwrap();
        inner
            .bindings
            .iter()
            .filter_map(|(id, node)| inner.pods.get(id).map(|p| (p.clone(), node.clone())))
            .collect()
    }

    pub fn pods_bound_to(&self, node_name: &str) -> Vec<Pod> {
        let inner = self.inner.read().unwrap();
        inner
            .pods_by_node
            .get(node_name)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.pods.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Capacity totals over a pool's members, excluding nodes on their
    /// way out. Feeds NodePool status and limit checks.
    pub fn pool_resources(&self, pool: &str) -> ResourceList {
        let mut total = ResourceList::new();
        self.for_each_node(|sn| {
            if sn.marked_for_deletion {
                return;
            }
            if sn.node_pool().as_deref() == Some(pool) {
                total.add(&sn.capacity());
            }
        });
        // Claims awaiting launch still count against limits.
        for claim in self.unlaunched_claims() {
            if claim.node_pool_name() == Some(pool) {
                total.add(
                    &ResourceList::from_quantities(&claim.spec.resources).unwrap_or_default(),
                );
            }
        }
        total
    }

    pub fn disrupting_count(&self, pool: &str) -> usize {
        let mut count = 0;
        self.for_each_node(|sn| {
            if sn.marked_for_deletion && sn.node_pool().as_deref() == Some(pool) {
                count += 1;
            }
        });
        count
    }

    pub fn pool_node_count(&self, pool: &str) -> usize {
        let mut count = 0;
        self.for_each_node(|sn| {
            if sn.node_pool().as_deref() == Some(pool) {
                count += 1;
            }
        });
        count
    }
}

fn remove_node_half(inner: &mut ClusterInner, id: &ProviderId) {
    if let Some(sn) = inner.nodes.get_mut(id)
        && !sn.without_node()
    {
        inner.nodes.remove(id);
    }
}

fn bind(inner: &mut ClusterInner, id: PodId, node: String) {
    let previous = inner.bindings.insert(id.clone(), node.clone());
    if previous.as_deref() == Some(node.as_str()) {
        return;
    }
    if let Some(prev) = previous {
        if let Some(set) = inner.pods_by_node.get_mut(&prev) {
            set.remove(&id);
        }
        touch_node(inner, &prev);
    }
    inner.pods_by_node.entry(node.clone()).or_default().insert(id);
    touch_node(inner, &node);
}

fn unbind(inner: &mut ClusterInner, id: &PodId) {
    if let Some(node) = inner.bindings.remove(id) {
        if let Some(set) = inner.pods_by_node.get_mut(&node) {
            set.remove(id);
        }
        touch_node(inner, &node);
    }
}

fn touch_node(inner: &mut ClusterInner, node_name: &str) {
    if let Some(id) = inner.node_names.get(node_name)
        && let Some(sn) = inner.nodes.get_mut(id)
    {
        sn.last_pod_event = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::{NodeClaimSpec, nodepool::NodeClassRef};
    use k8s_openapi::api::core::v1::{NodeSpec, PodCondition, PodSpec, PodStatus};
    use kube::api::ObjectMeta;

    fn node(name: &str, provider_id: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                provider_id: Some(provider_id.into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn claim(name: &str, provider_id: Option<&str>) -> NodeClaim {
        let mut nc = NodeClaim::new(
            name,
            NodeClaimSpec {
                node_class_ref: NodeClassRef::default(),
                ..Default::default()
            },
        );
        if let Some(p) = provider_id {
            nc.status_mut().provider_id = Some(p.into());
        }
        nc
    }

    fn bound_pod(name: &str, node: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(node.into()),
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn unschedulable_pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            spec: Some(PodSpec::default()),
            status: Some(PodStatus {
                phase: Some("Pending".into()),
                conditions: Some(vec![PodCondition {
                    type_: "PodScheduled".into(),
                    status: "False".into(),
                    reason: Some("Unschedulable".into()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn node_and_claim_join_on_provider_id() {
        let cluster = Cluster::new();
        cluster.update_node_claim(claim("nc1", Some("kwok://n1")));
        cluster.update_node(node("n1", "kwok://n1"));
        let sn = cluster.node_by_name("n1").unwrap();
        assert!(matches!(sn.sources, NodeSources::Paired { .. }));
        assert_eq!(cluster.claim_by_name("nc1").unwrap().node_name(), "n1");
    }

    #[test]
    fn unlaunched_claims_tracked_separately() {
        let cluster = Cluster::new();
        cluster.update_node_claim(claim("nc1", None));
        assert_eq!(cluster.unlaunched_claims().len(), 1);
        // Launch promotes it into the node map.
        cluster.update_node_claim(claim("nc1", Some("kwok://n1")));
        assert!(cluster.unlaunched_claims().is_empty());
        assert!(cluster.claim_by_name("nc1").is_some());
    }

    #[test]
    fn bindings_and_reverse_index() {
        let cluster = Cluster::new();
        cluster.update_node(node("n1", "kwok://n1"));
        cluster.update_pod(bound_pod("p1", "n1"));
        cluster.update_pod(bound_pod("p2", "n1"));
        assert_eq!(cluster.pods_bound_to("n1").len(), 2);

        cluster.delete_pod(&PodId {
            namespace: "default".into(),
            name: "p1".into(),
        });
        assert_eq!(cluster.pods_bound_to("n1").len(), 1);
    }

    #[test]
    fn terminal_pods_release_bindings() {
        let cluster = Cluster::new();
        cluster.update_node(node("n1", "kwok://n1"));
        let mut pod = bound_pod("p1", "n1");
        cluster.update_pod(pod.clone());
        assert_eq!(cluster.pods_bound_to("n1").len(), 1);
        pod.status.as_mut().unwrap().phase = Some("Succeeded".into());
        cluster.update_pod(pod);
        assert!(cluster.pods_bound_to("n1").is_empty());
    }

    #[test]
    fn unschedulable_pod_selection_skips_daemonsets() {
        let cluster = Cluster::new();
        cluster.update_pod(unschedulable_pod("p1"));
        let mut ds_pod = unschedulable_pod("p2");
        ds_pod.metadata.owner_references =
            Some(vec![k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
                kind: "DaemonSet".into(),
                name: "ds".into(),
                ..Default::default()
            }]);
        cluster.update_pod(ds_pod);
        let pending = cluster.unschedulable_pods();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].metadata.name.as_deref(), Some("p1"));
    }

    #[test]
    fn marked_for_deletion_sticky_until_claim_gone() {
        let cluster = Cluster::new();
        cluster.update_node_claim(claim("nc1", Some("kwok://n1")));
        let id = ProviderId("kwok://n1".into());
        cluster.mark_for_deletion(std::slice::from_ref(&id));
        // Claim updates keep the mark.
        cluster.update_node_claim(claim("nc1", Some("kwok://n1")));
        assert!(cluster.node_by_provider_id(&id).unwrap().marked_for_deletion);
        // Claim deletion drops the whole entry.
        cluster.delete_node_claim("nc1");
        assert!(cluster.node_by_provider_id(&id).is_none());
    }

    #[test]
    fn nominate_extends_never_shortens() {
        let cluster = Cluster::new();
        cluster.update_node(node("n1", "kwok://n1"));
        let id = ProviderId("kwok://n1".into());
        cluster.nominate(&id, Duration::from_secs(60));
        let first = cluster.node_by_provider_id(&id).unwrap().nominated_until.unwrap();
        cluster.nominate(&id, Duration::from_secs(1));
        let second = cluster.node_by_provider_id(&id).unwrap().nominated_until.unwrap();
        assert!(second >= first);
    }

    #[test]
    fn synced_requires_all_kinds() {
        let cluster = Cluster::new();
        assert!(!cluster.synced());
        for kind in WATCHED_KINDS {
            cluster.mark_synced(kind);
        }
        assert!(cluster.synced());
    }

    #[test]
    fn sequence_bumps_on_mutation() {
        let cluster = Cluster::new();
        let s0 = cluster.sequence();
        cluster.update_pod(unschedulable_pod("p1"));
        assert!(cluster.sequence() > s0);
    }

    #[test]
    fn pool_resources_exclude_marked_nodes() {
        let cluster = Cluster::new();
        let mut n1 = node("n1", "kwok://n1");
        n1.metadata.labels = Some(BTreeMap::from([(
            crate::requirements::LABEL_NODEPOOL.to_string(),
            "default".to_string(),
        )]));
        n1.status = Some(k8s_openapi::api::core::v1::NodeStatus {
            capacity: Some(BTreeMap::from([(
                "cpu".to_string(),
                k8s_openapi::apimachinery::pkg::api::resource::Quantity("4".into()),
            )])),
            ..Default::default()
        });
        cluster.update_node(n1.clone());
        assert_eq!(cluster.pool_resources("default").get(crate::resources::CPU), 4000);

        cluster.mark_for_deletion(&[ProviderId("kwok://n1".into())]);
        assert_eq!(cluster.pool_resources("default").get(crate::resources::CPU), 0);
        assert_eq!(cluster.disrupting_count("default"), 1);
    }
}
