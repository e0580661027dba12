use std::collections::{BTreeMap, BTreeSet};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Well-known label keys. Pods select on these; the catalog and the
/// simulator populate them on hypothetical nodes.
pub const LABEL_NODEPOOL: &str = "canopy/nodepool";
pub const LABEL_CAPACITY_TYPE: &str = "canopy/capacity-type";
pub const LABEL_INSTANCE_TYPE: &str = "node.kubernetes.io/instance-type";
pub const LABEL_ZONE: &str = "topology.kubernetes.io/zone";
pub const LABEL_HOSTNAME: &str = "kubernetes.io/hostname";
pub const LABEL_ARCH: &str = "kubernetes.io/arch";
pub const LABEL_OS: &str = "kubernetes.io/os";

/// Label selector operators accepted in NodePool/NodeClaim requirements.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
    Gt,
    Lt,
}

/// One requirement as it appears in a CRD: key, operator, values, and an
/// optional minValues floor on how many distinct values must survive
/// scheduling (spot diversification).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Requirement {
    pub key: String,
    pub operator: Operator,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_values: Option<u32>,
}

impl Requirement {
    pub fn new_in(key: &str, values: &[&str]) -> Self {
        Self {
            key: key.into(),
            operator: Operator::In,
            values: values.iter().map(|s| s.to_string()).collect(),
            min_values: None,
        }
    }

    pub fn exists(key: &str) -> Self {
        Self {
            key: key.into(),
            operator: Operator::Exists,
            values: vec![],
            min_values: None,
        }
    }
}

#[derive(Debug, PartialEq, Error)]
pub enum RequirementError {
    #[error("no values remain for key {0:?}")]
    EmptyIntersection(String),
    #[error("key {key:?}: operator {operator:?} requires {expected}")]
    MalformedOperator {
        key: String,
        operator: String,
        expected: &'static str,
    },
}

/// Normalized allowed-value set for one key.
#[derive(Clone, Debug, PartialEq, Eq)]
enum ValueSet {
    /// Only the listed values match. Empty means contradiction.
    Only(BTreeSet<String>),
    /// Anything except the listed values matches, including an absent label.
    AnyExcept(BTreeSet<String>),
    /// The label must be absent.
    Absent,
}

/// The normalized requirement for one key: a value set plus optional
/// exclusive numeric bounds (Gt/Lt) and a minValues floor.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyRequirement {
    key: String,
    values: ValueSet,
    greater_than: Option<i64>,
    less_than: Option<i64>,
    pub min_values: Option<u32>,
}

impl KeyRequirement {
    fn any(key: &str) -> Self {
        Self {
            key: key.into(),
            values: ValueSet::AnyExcept(BTreeSet::new()),
            greater_than: None,
            less_than: None,
            min_values: None,
        }
    }

    fn bounds_admit(&self, value: &str) -> bool {
        if self.greater_than.is_none() && self.less_than.is_none() {
            return true;
        }
        let Ok(n) = value.parse::<i64>() else {
            return false;
        };
        self.greater_than.is_none_or(|g| n > g) && self.less_than.is_none_or(|l| n < l)
    }

    /// Does a concrete label value satisfy this key's requirement?
    pub fn admits(&self, value: &str) -> bool {
        let set_ok = match &self.values {
            ValueSet::Only(vs) => vs.contains(value),
            ValueSet::AnyExcept(vs) => !vs.contains(value),
            ValueSet::Absent => false,
        };
        set_ok && self.bounds_admit(value)
    }

    /// Does an absent label satisfy this key's requirement?
    pub fn admits_absent(&self) -> bool {
        match &self.values {
            ValueSet::Only(_) => false,
            ValueSet::AnyExcept(_) => self.greater_than.is_none() && self.less_than.is_none(),
            ValueSet::Absent => true,
        }
    }

    /// The explicit allow-list, when one exists.
    pub fn allowed_values(&self) -> Option<Vec<String>> {
        match &self.values {
            ValueSet::Only(vs) => Some(
                vs.iter()
                    .filter(|v| self.bounds_admit(v))
                    .cloned()
                    .collect(),
            ),
            _ => None,
        }
    }

    fn is_contradiction(&self) -> bool {
        matches!(&self.values, ValueSet::Only(vs) if vs.iter().all(|v| !self.bounds_admit(v)))
    }

    fn intersect(&self, other: &KeyRequirement) -> KeyRequirement {
        use ValueSet::*;
        let values = match (&self.values, &other.values) {
            (Absent, Only(_)) | (Only(_), Absent) => Only(BTreeSet::new()),
            (Absent, _) | (_, Absent) => Absent,
            (Only(a), Only(b)) => Only(a.intersection(b).cloned().collect()),
            (Only(a), AnyExcept(b)) | (AnyExcept(b), Only(a)) => {
                Only(a.difference(b).cloned().collect())
            }
            (AnyExcept(a), AnyExcept(b)) => AnyExcept(a.union(b).cloned().collect()),
        };
        KeyRequirement {
            key: self.key.clone(),
            values,
            greater_than: match (self.greater_than, other.greater_than) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            },
            less_than: match (self.less_than, other.less_than) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            },
            min_values: match (self.min_values, other.min_values) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            },
        }
    }
}

/// A conjunction of per-key requirements. Keys not present are
/// unconstrained.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Requirements(BTreeMap<String, KeyRequirement>);

impl Requirements {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize CRD requirements. Malformed combinations (In without
    /// values, Gt with a non-numeric value) are rejected here so the
    /// engine never sees them.
    pub fn parse(reqs: &[Requirement]) -> Result<Self, RequirementError> {
        let mut out = Self::new();
        for r in reqs {
            let parsed = Self::parse_one(r)?;
            out = out.merge_key(parsed)?;
        }
        Ok(out)
    }

    fn parse_one(r: &Requirement) -> Result<KeyRequirement, RequirementError> {
        let malformed = |expected| RequirementError::MalformedOperator {
            key: r.key.clone(),
            operator: format!("{:?}", r.operator),
            expected,
        };
        let mut kr = KeyRequirement::any(&r.key);
        kr.min_values = r.min_values;
        match r.operator {
            Operator::In => {
                if r.values.is_empty() {
                    return Err(malformed("at least one value"));
                }
                kr.values = ValueSet::Only(r.values.iter().cloned().collect());
            }
            Operator::NotIn => {
                kr.values = ValueSet::AnyExcept(r.values.iter().cloned().collect());
            }
            Operator::Exists => {
                if !r.values.is_empty() {
                    return Err(malformed("no values"));
                }
            }
            Operator::DoesNotExist => {
                if !r.values.is_empty() {
                    return Err(malformed("no values"));
                }
                kr.values = ValueSet::Absent;
            }
            Operator::Gt => {
                let v = Self::single_numeric(r).ok_or_else(|| malformed("one integer value"))?;
                kr.greater_than = Some(v);
            }
            Operator::Lt => {
                let v = Self::single_numeric(r).ok_or_else(|| malformed("one integer value"))?;
                kr.less_than = Some(v);
            }
        }
        Ok(kr)
    }

    fn single_numeric(r: &Requirement) -> Option<i64> {
        match r.values.as_slice() {
            [v] => v.parse().ok(),
            _ => None,
        }
    }

    /// Exact labels as In-singletons, e.g. a node's observed labels.
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Self {
        let mut out = Self::new();
        for (k, v) in labels {
            out.0.insert(
                k.clone(),
                KeyRequirement {
                    key: k.clone(),
                    values: ValueSet::Only(BTreeSet::from([v.clone()])),
                    greater_than: None,
                    less_than: None,
                    min_values: None,
                },
            );
        }
        out
    }

    fn merge_key(mut self, kr: KeyRequirement) -> Result<Self, RequirementError> {
        let merged = match self.0.get(&kr.key) {
            Some(existing) => existing.intersect(&kr),
            None => kr,
        };
        if matches!(&merged.values, ValueSet::Only(vs) if vs.is_empty()) || merged.is_contradiction()
        {
            return Err(RequirementError::EmptyIntersection(merged.key));
        }
        self.0.insert(merged.key.clone(), merged);
        Ok(self)
    }

    /// Conjunction of two requirement sets. Errors name the first key whose
    /// intersection is empty.
    pub fn intersect(&self, other: &Requirements) -> Result<Requirements, RequirementError> {
        let mut out = self.clone();
        for kr in other.0.values() {
            out = out.merge_key(kr.clone())?;
        }
        Ok(out)
    }

    pub fn compatible(&self, other: &Requirements) -> bool {
        self.intersect(other).is_ok()
    }

    pub fn get(&self, key: &str) -> Option<&KeyRequirement> {
        self.0.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(|k| k.as_str())
    }

    /// Do concrete labels (a live node) satisfy every requirement here?
    pub fn matches_labels(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.values().all(|kr| match labels.get(&kr.key) {
            Some(v) => kr.admits(v),
            None => kr.admits_absent(),
        })
    }

    /// Keys constrained to an explicit allow-list, with surviving values.
    /// minValues is checked against these after instance-type filtering.
    pub fn min_values_demands(&self) -> Vec<(&str, u32)> {
        self.0
            .values()
            .filter_map(|kr| kr.min_values.map(|m| (kr.key.as_str(), m)))
            .collect()
    }

    /// Render back into CRD requirement form, e.g. when stamping the
    /// simulator's chosen constraints onto a NodeClaim.
    pub fn to_spec(&self) -> Vec<Requirement> {
        let mut out = Vec::new();
        for kr in self.0.values() {
            let (operator, values) = match &kr.values {
                ValueSet::Only(vs) => (
                    Operator::In,
                    vs.iter().filter(|v| kr.bounds_admit(v)).cloned().collect(),
                ),
                ValueSet::AnyExcept(vs) if vs.is_empty() => (Operator::Exists, vec![]),
                ValueSet::AnyExcept(vs) => (Operator::NotIn, vs.iter().cloned().collect()),
                ValueSet::Absent => (Operator::DoesNotExist, vec![]),
            };
            out.push(Requirement {
                key: kr.key.clone(),
                operator,
                values,
                min_values: kr.min_values,
            });
            if let Some(g) = kr.greater_than {
                out.push(Requirement {
                    key: kr.key.clone(),
                    operator: Operator::Gt,
                    values: vec![g.to_string()],
                    min_values: None,
                });
            }
            if let Some(l) = kr.less_than {
                out.push(Requirement {
                    key: kr.key.clone(),
                    operator: Operator::Lt,
                    values: vec![l.to_string()],
                    min_values: None,
                });
            }
        }
        out
    }

    pub fn insert_label(&mut self, key: &str, value: &str) {
        self.insert_in(key, std::slice::from_ref(&value.to_string()));
    }

    /// Overwrite a key with an explicit allow-list.
    pub fn insert_in(&mut self, key: &str, values: &[String]) {
        self.0.insert(
            key.to_string(),
            KeyRequirement {
                key: key.to_string(),
                values: ValueSet::Only(values.iter().cloned().collect()),
                greater_than: None,
                less_than: None,
                min_values: None,
            },
        );
    }
}
