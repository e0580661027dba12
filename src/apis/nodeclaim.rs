use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Taint;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::apis::nodepool::NodeClassRef;
use crate::apis::{Condition, condition_is_true, get_condition};
use crate::requirements::{LABEL_NODEPOOL, Requirement};
use crate::resources::ResourceList;

pub const COND_LAUNCHED: &str = "Launched";
pub const COND_REGISTERED: &str = "Registered";
pub const COND_INITIALIZED: &str = "Initialized";
pub const COND_NODECLAIM_READY: &str = "Ready";
pub const COND_DRIFTED: &str = "Drifted";
pub const COND_EMPTY: &str = "Empty";
pub const COND_CONSOLIDATABLE: &str = "Consolidatable";
pub const COND_EXPIRED: &str = "Expired";
pub const COND_DISRUPTION_REASON: &str = "DisruptionReason";
pub const COND_INSTANCE_TERMINATING: &str = "InstanceTerminating";

/// Drift sub-reasons surfaced on the Drifted condition.
pub const DRIFT_STATIC: &str = "NodePoolStaticDrift";
pub const DRIFT_REQUIREMENTS: &str = "RequirementsDrift";
pub const DRIFT_INSTANCE_TYPE_NOT_FOUND: &str = "InstanceTypeNotFound";

/// A NodeClaim is the autoscaler's request for exactly one cloud instance,
/// and its handle on that instance for the rest of its life. Spec fields
/// are immutable after creation.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(group = "canopy", version = "v1alpha1", kind = "NodeClaim")]
#[kube(status = "NodeClaimStatus", shortname = "nc")]
#[serde(rename_all = "camelCase")]
pub struct NodeClaimSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<Requirement>,
    /// Minimum resources the launched instance must provide.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<String, Quantity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub startup_taints: Vec<Taint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_after: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_grace_period_seconds: Option<i64>,
    pub node_class_ref: NodeClassRef,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeClaimStatus {
    /// Cloud provider instance identity; the join key to the Node object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub capacity: BTreeMap<String, Quantity>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub allocatable: BTreeMap<String, Quantity>,
    /// Last time a pod was bound to or removed from this node. Drives
    /// consolidate-after idle timing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_pod_event_time: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl NodeClaim {
    pub fn name(&self) -> String {
        self.metadata.name.clone().unwrap_or_default()
    }

    pub fn provider_id(&self) -> Option<&str> {
        self.status.as_ref()?.provider_id.as_deref()
    }

    /// The owning pool, recorded as a label at creation.
    pub fn node_pool_name(&self) -> Option<&str> {
        self.metadata.labels.as_ref()?.get(LABEL_NODEPOOL).map(String::as_str)
    }

    pub fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or(&[])
    }

    pub fn is_true(&self, condition: &str) -> bool {
        condition_is_true(self.conditions(), condition)
    }

    pub fn condition(&self, condition: &str) -> Option<&Condition> {
        get_condition(self.conditions(), condition)
    }

    pub fn is_launched(&self) -> bool {
        self.is_true(COND_LAUNCHED)
    }

    pub fn is_registered(&self) -> bool {
        self.is_true(COND_REGISTERED)
    }

    pub fn is_initialized(&self) -> bool {
        self.is_true(COND_INITIALIZED)
    }

    pub fn is_terminating(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn allocatable(&self) -> ResourceList {
        self.status
            .as_ref()
            .and_then(|s| ResourceList::from_quantities(&s.allocatable).ok())
            .unwrap_or_default()
    }

    pub fn capacity(&self) -> ResourceList {
        self.status
            .as_ref()
            .and_then(|s| ResourceList::from_quantities(&s.capacity).ok())
            .unwrap_or_default()
    }

    /// Mutable status, initialized on first touch.
    pub fn status_mut(&mut self) -> &mut NodeClaimStatus {
        self.status.get_or_insert_with(NodeClaimStatus::default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::set_condition;
    use kube::CustomResourceExt;

    fn claim() -> NodeClaim {
        let mut nc = NodeClaim::new(
            "default-abc",
            NodeClaimSpec {
                node_class_ref: NodeClassRef {
                    group: "canopy".into(),
                    kind: "KwokNodeClass".into(),
                    name: "default".into(),
                },
                ..Default::default()
            },
        );
        nc.metadata.labels = Some(BTreeMap::from([(
            LABEL_NODEPOOL.to_string(),
            "default".to_string(),
        )]));
        nc
    }

    #[test]
    fn crd_generates_valid_schema() {
        let crd = NodeClaim::crd();
        assert_eq!(crd.metadata.name.as_deref(), Some("nodeclaims.canopy"));
        assert_eq!(crd.spec.names.kind, "NodeClaim");
        assert_eq!(crd.spec.names.plural, "nodeclaims");
    }

    #[test]
    fn condition_helpers() {
        let mut nc = claim();
        assert!(!nc.is_launched());
        set_condition(
            &mut nc.status_mut().conditions,
            COND_LAUNCHED,
            "True",
            "Launched",
            "",
        );
        assert!(nc.is_launched());
        assert!(!nc.is_registered());
    }

    #[test]
    fn node_pool_label_resolves_owner() {
        let nc = claim();
        assert_eq!(nc.node_pool_name(), Some("default"));
    }

    #[test]
    fn status_roundtrips_through_json() {
        let mut nc = claim();
        nc.status_mut().provider_id = Some("kwok://node-1".into());
        nc.status_mut().allocatable =
            BTreeMap::from([("cpu".to_string(), Quantity("3500m".into()))]);
        set_condition(
            &mut nc.status_mut().conditions,
            COND_REGISTERED,
            "True",
            "NodeJoined",
            "",
        );
        let json = serde_json::to_string(&nc.status).unwrap();
        let back: NodeClaimStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back.provider_id.as_deref(), Some("kwok://node-1"));
        assert!(condition_is_true(&back.conditions, COND_REGISTERED));
        assert_eq!(
            ResourceList::from_quantities(&back.allocatable)
                .unwrap()
                .get(crate::resources::CPU),
            3500
        );
    }
}
