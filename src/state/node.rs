use std::collections::BTreeMap;
use std::time::Instant;

use k8s_openapi::api::core::v1::{Node, Taint};

use crate::apis::{COND_INITIALIZED, NodeClaim};
use crate::providers::provider::ProviderId;
use crate::requirements::LABEL_NODEPOOL;
use crate::resources::ResourceList;

/// The two halves of a state node. Either may be observed before the
/// other: a NodeClaim exists alone between launch and kubelet
/// registration, a Node exists alone for capacity this autoscaler does
/// not manage.
#[derive(Debug, Clone)]
pub enum NodeSources {
    NodeOnly(Box<Node>),
    ClaimOnly(Box<NodeClaim>),
    Paired {
        node: Box<Node>,
        claim: Box<NodeClaim>,
    },
}

/// In-cache unification of a Node and/or its NodeClaim, joined on
/// providerID, plus the scheduler-facing bookkeeping that belongs to the
/// cache rather than to either API object.
#[derive(Debug, Clone)]
pub struct StateNode {
    pub provider_id: ProviderId,
    pub sources: NodeSources,
    /// Sticky once set; cleared only when the claim leaves the cluster
    /// or a failed command explicitly unmarks it.
    pub marked_for_deletion: bool,
    pub marked_for_eviction: bool,
    pub nominated_until: Option<Instant>,
    /// Last time a pod was bound to or removed from this node.
    pub last_pod_event: Option<Instant>,
}

impl StateNode {
    pub fn from_node(provider_id: ProviderId, node: Node) -> Self {
        Self {
            provider_id,
            sources: NodeSources::NodeOnly(Box::new(node)),
            marked_for_deletion: false,
            marked_for_eviction: false,
            nominated_until: None,
            last_pod_event: None,
        }
    }

    pub fn from_claim(provider_id: ProviderId, claim: NodeClaim) -> Self {
        Self {
            provider_id,
            sources: NodeSources::ClaimOnly(Box::new(claim)),
            marked_for_deletion: false,
            marked_for_eviction: false,
            nominated_until: None,
            last_pod_event: None,
        }
    }

    /// Merge a newly observed Node into this state node, preserving
    /// bookkeeping.
    pub fn with_node(&mut self, node: Node) {
        self.sources = match std::mem::replace(
            &mut self.sources,
            NodeSources::NodeOnly(Box::new(Node::default())),
        ) {
            NodeSources::NodeOnly(_) => NodeSources::NodeOnly(Box::new(node)),
            NodeSources::ClaimOnly(claim) | NodeSources::Paired { claim, .. } => {
                NodeSources::Paired {
                    node: Box::new(node),
                    claim,
                }
            }
        };
    }

    pub fn with_claim(&mut self, claim: NodeClaim) {
        self.sources = match std::mem::replace(
            &mut self.sources,
            NodeSources::NodeOnly(Box::new(Node::default())),
        ) {
            NodeSources::ClaimOnly(_) => NodeSources::ClaimOnly(Box::new(claim)),
            NodeSources::NodeOnly(node) | NodeSources::Paired { node, .. } => {
                NodeSources::Paired {
                    node,
                    claim: Box::new(claim),
                }
            }
        };
    }

    /// Drop the node half. Returns false when nothing remains and the
    /// whole entry should be removed.
    pub fn without_node(&mut self) -> bool {
        match std::mem::replace(
            &mut self.sources,
            NodeSources::NodeOnly(Box::new(Node::default())),
        ) {
            NodeSources::NodeOnly(_) => false,
            NodeSources::ClaimOnly(claim) | NodeSources::Paired { claim, .. } => {
                self.sources = NodeSources::ClaimOnly(claim);
                true
            }
        }
    }

    pub fn without_claim(&mut self) -> bool {
        match std::mem::replace(
            &mut self.sources,
            NodeSources::NodeOnly(Box::new(Node::default())),
        ) {
            NodeSources::ClaimOnly(_) => false,
            NodeSources::NodeOnly(node) | NodeSources::Paired { node, .. } => {
                self.sources = NodeSources::NodeOnly(node);
                true
            }
        }
    }

    pub fn node(&self) -> Option<&Node> {
        match &self.sources {
            NodeSources::NodeOnly(n) => Some(n),
            NodeSources::Paired { node, .. } => Some(node),
            NodeSources::ClaimOnly(_) => None,
        }
    }

    pub fn claim(&self) -> Option<&NodeClaim> {
        match &self.sources {
            NodeSources::ClaimOnly(c) => Some(c),
            NodeSources::Paired { claim, .. } => Some(claim),
            NodeSources::NodeOnly(_) => None,
        }
    }

    /// The Node name when a Node exists, otherwise the claim name. Pods
    /// bind against this.
    pub fn node_name(&self) -> String {
        match &self.sources {
            NodeSources::NodeOnly(n) => n.metadata.name.clone().unwrap_or_default(),
            NodeSources::Paired { node, .. } => node.metadata.name.clone().unwrap_or_default(),
            NodeSources::ClaimOnly(c) => c.name(),
        }
    }

    /// Node labels when registered, claim labels while in flight.
    pub fn labels(&self) -> BTreeMap<String, String> {
        match &self.sources {
            NodeSources::NodeOnly(n) | NodeSources::Paired { node: n, .. } => {
                n.metadata.labels.clone().unwrap_or_default()
            }
            NodeSources::ClaimOnly(c) => c.metadata.labels.clone().unwrap_or_default(),
        }
    }

    pub fn taints(&self) -> Vec<Taint> {
        match &self.sources {
            NodeSources::NodeOnly(n) | NodeSources::Paired { node: n, .. } => n
                .spec
                .as_ref()
                .and_then(|s| s.taints.clone())
                .unwrap_or_default(),
            NodeSources::ClaimOnly(c) => {
                let mut taints = c.spec.taints.clone();
                taints.extend(c.spec.startup_taints.clone());
                taints
            }
        }
    }

    pub fn allocatable(&self) -> ResourceList {
        match &self.sources {
            NodeSources::NodeOnly(n) | NodeSources::Paired { node: n, .. } => n
                .status
                .as_ref()
                .and_then(|s| s.allocatable.as_ref())
                .and_then(|a| ResourceList::from_quantities(a).ok())
                .unwrap_or_default(),
            NodeSources::ClaimOnly(c) => c.allocatable(),
        }
    }

    pub fn capacity(&self) -> ResourceList {
        match &self.sources {
            NodeSources::NodeOnly(n) | NodeSources::Paired { node: n, .. } => n
                .status
                .as_ref()
                .and_then(|s| s.capacity.as_ref())
                .and_then(|c| ResourceList::from_quantities(c).ok())
                .unwrap_or_default(),
            NodeSources::ClaimOnly(c) => c.capacity(),
        }
    }

    /// The owning NodePool. None for capacity this autoscaler does not
    /// manage; such nodes still absorb pods in simulations but are never
    /// disruption candidates.
    pub fn node_pool(&self) -> Option<String> {
        self.labels().get(LABEL_NODEPOOL).cloned()
    }

    pub fn managed(&self) -> bool {
        self.claim().is_some() || self.node_pool().is_some()
    }

    /// Initialized means the kubelet is fully up: claim condition when a
    /// claim exists, otherwise node readiness stands in.
    pub fn initialized(&self) -> bool {
        match self.claim() {
            Some(claim) => claim.is_true(COND_INITIALIZED),
            None => self
                .node()
                .map(|n| node_is_ready(n))
                .unwrap_or(false),
        }
    }

    /// Startup taints the kubelet has not yet cleared block scheduling
    /// simulations from treating the node as generally available.
    pub fn startup_taints_cleared(&self) -> bool {
        let Some(claim) = self.claim() else {
            return true;
        };
        let Some(node) = self.node() else {
            return false;
        };
        let node_taints = node
            .spec
            .as_ref()
            .and_then(|s| s.taints.as_ref())
            .cloned()
            .unwrap_or_default();
        claim.spec.startup_taints.iter().all(|st| {
            !node_taints
                .iter()
                .any(|t| t.key == st.key && t.effect == st.effect)
        })
    }

    pub fn nominated(&self, now: Instant) -> bool {
        self.nominated_until.is_some_and(|until| until > now)
    }

    pub fn terminating(&self) -> bool {
        let node_deleting = self
            .node()
            .is_some_and(|n| n.metadata.deletion_timestamp.is_some());
        let claim_deleting = self.claim().is_some_and(|c| c.is_terminating());
        node_deleting || claim_deleting
    }
}

pub fn node_is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}
