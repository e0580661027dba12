use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::Taint;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::apis::{Condition, hash_object};
use crate::requirements::{LABEL_NODEPOOL, Requirement, RequirementError, Requirements};
use crate::resources::ResourceList;

pub const COND_VALIDATION_SUCCEEDED: &str = "ValidationSucceeded";
pub const COND_NODECLASS_READY: &str = "NodeClassReady";
pub const COND_READY: &str = "Ready";

/// A NodePool is a user-declared class of capacity: a NodeClaim template,
/// aggregate resource limits, a disruption policy, and a weight used to
/// order pools during scheduling.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(group = "canopy", version = "v1alpha1", kind = "NodePool")]
#[kube(status = "NodePoolStatus", shortname = "np")]
#[serde(rename_all = "camelCase")]
pub struct NodePoolSpec {
    pub template: NodeClaimTemplate,
    /// Aggregate caps over all member nodes, checked before every launch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<BTreeMap<String, Quantity>>,
    #[serde(default)]
    pub disruption: DisruptionPolicy,
    /// Higher weight pools are tried first; ties break by name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i32>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeClaimTemplate {
    #[serde(default)]
    pub metadata: TemplateMeta,
    pub spec: NodeClaimTemplateSpec,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMeta {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeClaimTemplateSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<Requirement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,
    /// Taints the kubelet clears once node setup completes. Present on the
    /// node at registration, gone by initialization.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub startup_taints: Vec<Taint>,
    /// Duration string ("720h") after which member claims expire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_after: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_grace_period_seconds: Option<i64>,
    pub node_class_ref: NodeClassRef,
}

/// Reference to the provider-specific NodeClass. Opaque here.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeClassRef {
    pub group: String,
    pub kind: String,
    pub name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConsolidationPolicy {
    Disabled,
    WhenEmpty,
    #[default]
    WhenEmptyOrUnderutilized,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DisruptionPolicy {
    #[serde(default)]
    pub consolidation_policy: ConsolidationPolicy,
    /// Idle time (since the node's last pod event) before a node is
    /// considered consolidatable. "Never" disables the timer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consolidate_after: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub budgets: Vec<Budget>,
}

/// Why a node is being disrupted. Budget reasons and NodeClaim
/// DisruptionReason conditions share this vocabulary.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum DisruptionReason {
    Expired,
    Drifted,
    Empty,
    Underutilized,
}

impl std::fmt::Display for DisruptionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Expired => write!(f, "Expired"),
            Self::Drifted => write!(f, "Drifted"),
            Self::Empty => write!(f, "Empty"),
            Self::Underutilized => write!(f, "Underutilized"),
        }
    }
}

/// An upper bound on concurrent disruptions, optionally gated to a
/// recurring schedule window.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Budget {
    /// "10" or "25%". Percent is of the pool's current node count,
    /// rounded down.
    pub nodes: String,
    /// Reasons this budget applies to. Empty means all reasons.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<DisruptionReason>,
    /// Five-field cron expression opening the window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    /// How long the window stays open after each schedule match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolStatus {
    /// Observed resource totals over member nodes not marked for deletion.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<String, Quantity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl NodePool {
    /// Content hash over the template. Requirements are sorted first so
    /// two pools differing only in list order hash identically.
    pub fn static_hash(&self) -> String {
        let mut template = self.spec.template.clone();
        template
            .spec
            .requirements
            .sort_by(|a, b| (&a.key, format!("{:?}", a.operator)).cmp(&(&b.key, format!("{:?}", b.operator))));
        for r in &mut template.spec.requirements {
            r.values.sort();
        }
        hash_object(&template)
    }

    pub fn weight(&self) -> i32 {
        self.spec.weight.unwrap_or(0)
    }

    pub fn limits(&self) -> Option<ResourceList> {
        let limits = self.spec.limits.as_ref()?;
        ResourceList::from_quantities(limits).ok()
    }

    pub fn expire_after(&self) -> Option<Duration> {
        parse_optional_duration(self.spec.template.spec.expire_after.as_deref())
    }

    pub fn consolidate_after(&self) -> Option<Duration> {
        parse_optional_duration(self.spec.disruption.consolidate_after.as_deref())
    }

    /// Requirements a member node must satisfy: the template's declared
    /// requirements, its fixed labels, and the pool membership label.
    pub fn scheduling_requirements(&self) -> Result<Requirements, RequirementError> {
        let mut reqs = Requirements::parse(&self.spec.template.spec.requirements)?;
        let labels = Requirements::from_labels(&self.spec.template.metadata.labels);
        reqs = reqs.intersect(&labels)?;
        reqs.insert_label(LABEL_NODEPOOL, &self.name());
        Ok(reqs)
    }

    pub fn name(&self) -> String {
        self.metadata.name.clone().unwrap_or_default()
    }

    /// How many additional nodes may be disrupted for `reason` right now.
    ///
    /// `total` is the pool's current node count, `disrupting` the count
    /// already marked for deletion. No matching active budget means
    /// unbounded (total).
    pub fn allowed_disruptions(
        &self,
        reason: DisruptionReason,
        total: usize,
        disrupting: usize,
        now_epoch_secs: i64,
    ) -> usize {
        let mut allowed = total;
        for budget in &self.spec.disruption.budgets {
            if !budget.reasons.is_empty() && !budget.reasons.contains(&reason) {
                continue;
            }
            if !budget_window_active(budget, now_epoch_secs) {
                continue;
            }
            let cap = match budget.nodes.strip_suffix('%') {
                Some(pct) => pct
                    .trim()
                    .parse::<u64>()
                    .map(|p| (total as u64 * p / 100) as usize)
                    .unwrap_or(total),
                None => budget.nodes.trim().parse::<usize>().unwrap_or(total),
            };
            allowed = allowed.min(cap);
        }
        allowed.saturating_sub(disrupting)
    }
}

fn parse_optional_duration(s: Option<&str>) -> Option<Duration> {
    match s {
        None | Some("Never") => None,
        Some(v) => parse_duration::parse(v).ok(),
    }
}

/// A budget with no schedule is always open. With a schedule, the window
/// is open when some cron occurrence fell within the trailing `duration`.
fn budget_window_active(budget: &Budget, now_epoch_secs: i64) -> bool {
    let Some(schedule) = budget.schedule.as_deref() else {
        return true;
    };
    let duration = budget
        .duration
        .as_deref()
        .and_then(|d| parse_duration::parse(d).ok())
        .unwrap_or(Duration::from_secs(0));
    // Scan minute marks back through the window. Durations are bounded to
    // a week to keep the scan bounded.
    let window_minutes = (duration.as_secs() / 60).min(7 * 24 * 60) as i64;
    let now_minute = now_epoch_secs / 60;
    (0..=window_minutes).any(|back| cron_matches(schedule, (now_minute - back) * 60))
}

/// Minimal five-field cron matcher: minute hour day-of-month month
/// day-of-week, each field "*", "*/step", value, range, or comma list.
fn cron_matches(expr: &str, epoch_secs: i64) -> bool {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return false;
    }
    let (minute, hour, dom, month, dow) = civil_from_epoch(epoch_secs);
    cron_field_matches(fields[0], minute)
        && cron_field_matches(fields[1], hour)
        && cron_field_matches(fields[2], dom)
        && cron_field_matches(fields[3], month)
        && cron_field_matches(fields[4], dow)
}

fn cron_field_matches(field: &str, value: u32) -> bool {
    field.split(',').any(|part| {
        if part == "*" {
            return true;
        }
        if let Some(step) = part.strip_prefix("*/") {
            return step.parse::<u32>().map(|s| s > 0 && value % s == 0).unwrap_or(false);
        }
        if let Some((lo, hi)) = part.split_once('-') {
            if let (Ok(lo), Ok(hi)) = (lo.parse::<u32>(), hi.parse::<u32>()) {
                return lo <= value && value <= hi;
            }
            return false;
        }
        part.parse::<u32>().map(|v| v == value).unwrap_or(false)
    })
}

/// (minute, hour, day-of-month, month, day-of-week) in UTC.
fn civil_from_epoch(epoch_secs: i64) -> (u32, u32, u32, u32, u32) {
    let secs_of_day = epoch_secs.rem_euclid(86_400);
    let minute = (secs_of_day / 60 % 60) as u32;
    let hour = (secs_of_day / 3_600) as u32;
    let days = epoch_secs.div_euclid(86_400);
    // 1970-01-01 was a Thursday.
    let dow = ((days + 4).rem_euclid(7)) as u32;
    // Howard Hinnant's civil-from-days.
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    (minute, hour, day, month, dow)
}

#[cfg(test)]
pub mod tests_support {
    use super::*;

    pub fn minimal_pool(name: &str) -> NodePool {
        let mut np = NodePool::new(
            name,
            NodePoolSpec {
                template: NodeClaimTemplate {
                    metadata: TemplateMeta::default(),
                    spec: NodeClaimTemplateSpec {
                        node_class_ref: NodeClassRef {
                            group: "canopy".into(),
                            kind: "KwokNodeClass".into(),
                            name: "default".into(),
                        },
                        ..Default::default()
                    },
                },
                limits: None,
                disruption: DisruptionPolicy::default(),
                weight: None,
            },
        );
        np.metadata.name = Some(name.into());
        np
    }
}
