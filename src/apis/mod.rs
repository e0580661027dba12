pub mod nodeclaim;
pub mod nodepool;

pub use nodeclaim::*;
pub use nodepool::*;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group for canopy custom resources.
pub const GROUP: &str = "canopy";
pub const VERSION: &str = "v1alpha1";

/// Finalizer guarding NodeClaim deletion until drain and instance
/// termination complete.
pub const TERMINATION_FINALIZER: &str = "canopy/termination";

/// Annotations stamped on NodePools and NodeClaims for drift detection.
pub const ANNOTATION_HASH: &str = "canopy/nodepool-hash";
pub const ANNOTATION_HASH_VERSION: &str = "canopy/nodepool-hash-version";
/// Bumped when the hashing scheme itself changes. On mismatch drift is
/// suppressed and the hash is re-stamped.
pub const HASH_VERSION: &str = "v1";

/// Pods carrying this annotation opt out of voluntary disruption.
pub const ANNOTATION_DO_NOT_DISRUPT: &str = "canopy/do-not-disrupt";

/// Pods the provisioner assigned to a NodeClaim; once launched, they are
/// nominated against its providerID.
pub const ANNOTATION_NOMINATED_PODS: &str = "canopy/nominated-pods";

/// Taint applied to a node whose NodeClaim is terminating.
pub const TAINT_DISRUPTED: &str = "canopy/disrupted";

pub fn now_rfc3339() -> String {
    k8s_openapi::jiff::Timestamp::now().to_string()
}

/// Seconds elapsed since an RFC 3339 timestamp. None when unparseable.
pub fn rfc3339_age_secs(ts: &str) -> Option<i64> {
    let then: k8s_openapi::jiff::Timestamp = ts.parse().ok()?;
    Some(k8s_openapi::jiff::Timestamp::now().as_second() - then.as_second())
}

/// Age of a condition's last transition, for liveness timeouts and
/// stability windows.
pub fn condition_age_secs(conditions: &[Condition], type_: &str) -> Option<i64> {
    get_condition(conditions, type_)
        .and_then(|c| c.last_transition_time.as_deref())
        .and_then(rfc3339_age_secs)
}

/// Condition in the Kubernetes style. Transition times are RFC 3339
/// strings so the CRD schema stays plain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

pub fn get_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn condition_is_true(conditions: &[Condition], type_: &str) -> bool {
    get_condition(conditions, type_).is_some_and(|c| c.status == "True")
}

/// Upsert a condition. The transition time moves only when the status
/// actually changes, so age-based checks (liveness timeouts, stability
/// windows) see the original transition.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            let changed = existing.status != status;
            if changed {
                existing.last_transition_time = Some(now_rfc3339());
            }
            existing.status = status.to_string();
            existing.reason = Some(reason.to_string());
            existing.message = Some(message.to_string());
            changed
        }
        None => {
            conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: Some(reason.to_string()),
                message: Some(message.to_string()),
                last_transition_time: Some(now_rfc3339()),
            });
            true
        }
    }
}

pub fn clear_condition(conditions: &mut Vec<Condition>, type_: &str) -> bool {
    let before = conditions.len();
    conditions.retain(|c| c.type_ != type_);
    conditions.len() != before
}

/// Content hash of a serializable spec. Serialization goes through
/// serde_json with maps held in BTreeMaps, so semantically equal specs
/// hash equal regardless of construction order.
pub fn hash_object<T: serde::Serialize>(spec: &T) -> String {
    use sha2::{Digest, Sha256};
    let bytes = serde_json::to_vec(spec).expect("spec serializes");
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_condition_preserves_transition_time_on_same_status() {
        let mut conds = vec![];
        assert!(set_condition(&mut conds, "Ready", "True", "Up", ""));
        let t1 = conds[0].last_transition_time.clone();
        assert!(!set_condition(&mut conds, "Ready", "True", "StillUp", ""));
        assert_eq!(conds[0].last_transition_time, t1);
        assert_eq!(conds[0].reason.as_deref(), Some("StillUp"));
    }

    #[test]
    fn set_condition_flips_status() {
        let mut conds = vec![];
        set_condition(&mut conds, "Ready", "True", "Up", "");
        assert!(set_condition(&mut conds, "Ready", "False", "Down", "lost"));
        assert!(!condition_is_true(&conds, "Ready"));
        assert_eq!(conds.len(), 1);
    }

    #[test]
    fn hash_is_order_independent_for_maps() {
        use std::collections::BTreeMap;
        let a: BTreeMap<_, _> = [("x", "1"), ("y", "2")].into_iter().collect();
        let b: BTreeMap<_, _> = [("y", "2"), ("x", "1")].into_iter().collect();
        assert_eq!(hash_object(&a), hash_object(&b));
    }
}
