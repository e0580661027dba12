use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use thiserror::Error;

/// Well-known resource names. Extended resources (GPUs etc.) pass through
/// under their vendor names.
pub const CPU: &str = "cpu";
pub const MEMORY: &str = "memory";
pub const PODS: &str = "pods";
pub const EPHEMERAL_STORAGE: &str = "ephemeral-storage";
pub const NVIDIA_GPU: &str = "nvidia.com/gpu";

#[derive(Debug, PartialEq, Error)]
pub enum QuantityError {
    #[error("unparseable quantity {0:?}")]
    Unparseable(String),
    #[error("quantity {0:?} overflows internal representation")]
    Overflow(String),
}

/// Parse a Kubernetes quantity string into milli-units.
///
/// Everything is held in millis internally. "2" cpu -> 2000, "100m" -> 100,
/// "1Mi" memory -> 1_048_576_000. Millis not base units so that cpu keeps
/// sub-core precision without a separate code path per resource name.
pub fn parse_quantity(s: &str) -> Result<i64, QuantityError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(QuantityError::Unparseable(s.into()));
    }
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
        .unwrap_or(s.len());
    let (num, suffix) = s.split_at(split);
    let value: f64 = num
        .parse()
        .map_err(|_| QuantityError::Unparseable(s.into()))?;
    let scale: f64 = match suffix {
        "" => 1.0,
        "m" => 0.001,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "Ki" => 1024.0,
        "Mi" => 1024.0 * 1024.0,
        "Gi" => 1024.0 * 1024.0 * 1024.0,
        "Ti" => 1024.0f64.powi(4),
        "Pi" => 1024.0f64.powi(5),
        _ => return Err(QuantityError::Unparseable(s.into())),
    };
    let millis = value * scale * 1000.0;
    if !millis.is_finite() || millis.abs() > i64::MAX as f64 / 2.0 {
        return Err(QuantityError::Overflow(s.into()));
    }
    Ok(millis.round() as i64)
}

/// Render milli-units back into a quantity string.
///
/// Whole values render bare ("2"), fractional values render in millis
/// ("1500m"). Callers that want pretty binary suffixes don't exist; the
/// apiserver normalizes anyway.
pub fn format_quantity(millis: i64) -> String {
    if millis % 1000 == 0 {
        format!("{}", millis / 1000)
    } else {
        format!("{millis}m")
    }
}

/// A set of named resources in milli-units.
///
/// The zero value is "no resources": absent keys are zero everywhere, so
/// subtraction and fits-checks never need to special-case missing entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceList(BTreeMap<String, i64>);

impl ResourceList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> i64 {
        self.0.get(name).copied().unwrap_or(0)
    }

    pub fn insert(&mut self, name: impl Into<String>, millis: i64) {
        self.0.insert(name.into(), millis);
    }

    pub fn with(mut self, name: impl Into<String>, millis: i64) -> Self {
        self.insert(name, millis);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|v| *v == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// cpu in fractional cores, for price-per-core style comparisons.
    pub fn cpu_cores(&self) -> f64 {
        self.get(CPU) as f64 / 1000.0
    }

    pub fn add(&mut self, other: &ResourceList) {
        for (k, v) in &other.0 {
            *self.0.entry(k.clone()).or_insert(0) += v;
        }
    }

    /// Subtract, clamping at zero. Residual capacity never goes negative
    /// even when bookkeeping sees a pod the node cannot actually hold.
    pub fn saturating_sub(&self, other: &ResourceList) -> ResourceList {
        let mut out = self.clone();
        for (k, v) in &other.0 {
            let e = out.0.entry(k.clone()).or_insert(0);
            *e = (*e - v).max(0);
        }
        out
    }

    /// True when every requested resource is covered by `self`.
    pub fn fits(&self, requested: &ResourceList) -> bool {
        requested.iter().all(|(k, v)| v <= self.get(k))
    }

    /// Keywise maximum, used for init-container request folding.
    pub fn max(&self, other: &ResourceList) -> ResourceList {
        let mut out = self.clone();
        for (k, v) in &other.0 {
            let e = out.0.entry(k.clone()).or_insert(0);
            *e = (*e).max(*v);
        }
        out
    }

    /// True when any entry in `other` exceeds the same entry here.
    /// Used for NodePool limit checks: limits only constrain named resources.
    pub fn exceeds(&self, limits: &ResourceList) -> bool {
        limits.iter().any(|(k, cap)| self.get(k) > cap)
    }

    pub fn from_quantities(map: &BTreeMap<String, Quantity>) -> Result<Self, QuantityError> {
        let mut out = Self::new();
        for (k, q) in map {
            out.insert(k.clone(), parse_quantity(&q.0)?);
        }
        Ok(out)
    }

    pub fn to_quantities(&self) -> BTreeMap<String, Quantity> {
        self.0
            .iter()
            .filter(|(_, v)| **v != 0)
            .map(|(k, v)| (k.clone(), Quantity(format_quantity(*v))))
            .collect()
    }
}

impl fmt::Display for ResourceList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .filter(|(_, v)| **v != 0)
            .map(|(k, v)| format!("{k}={}", format_quantity(*v)))
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

impl FromIterator<(String, i64)> for ResourceList {
    fn from_iter<T: IntoIterator<Item = (String, i64)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Effective resource requests for a pod: the sum of container requests,
/// folded with the keywise max of init-container requests, plus one `pods`
/// slot. Missing requests count as zero, same as the scheduler.
pub fn pod_requests(pod: &Pod) -> ResourceList {
    let mut total = ResourceList::new();
    let Some(spec) = pod.spec.as_ref() else {
        total.insert(PODS, 1000);
        return total;
    };
    for container in &spec.containers {
        if let Some(requests) = container.resources.as_ref().and_then(|r| r.requests.as_ref()) {
            for (k, q) in requests {
                if let Ok(v) = parse_quantity(&q.0) {
                    total.insert(k.clone(), total.get(k) + v);
                }
            }
        }
    }
    let mut init_max = ResourceList::new();
    for container in spec.init_containers.iter().flatten() {
        if let Some(requests) = container.resources.as_ref().and_then(|r| r.requests.as_ref()) {
            let mut one = ResourceList::new();
            for (k, q) in requests {
                if let Ok(v) = parse_quantity(&q.0) {
                    one.insert(k.clone(), v);
                }
            }
            init_max = init_max.max(&one);
        }
    }
    let mut effective = total.max(&init_max);
    effective.insert(PODS, 1000);
    effective
}
