use std::collections::{BTreeMap, BTreeSet};

use crate::requirements::LABEL_HOSTNAME;
use crate::scheduling::{PodSchedulingInfo, SchedulingError};

/// One pod the tracker knows about: its labels plus the topology domains
/// of the node it sits on.
#[derive(Debug, Clone)]
struct Placement {
    labels: BTreeMap<String, String>,
    domains: BTreeMap<String, String>,
}

/// Tracks topology participation across one simulation: which domains
/// exist, and which pods occupy them. Existing bound pods are seeded
/// first so new placements see the true picture.
#[derive(Debug, Default)]
pub struct Topology {
    placements: Vec<Placement>,
    /// Every domain value observed per topology key, including empty
    /// domains contributed by candidate nodes. Spread skew is measured
    /// against these.
    known_domains: BTreeMap<String, BTreeSet<String>>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a domain visible to spread calculations even before any pod
    /// lands in it.
    pub fn register_domains(&mut self, node_labels: &BTreeMap<String, String>, node_name: &str) {
        for (k, v) in node_domains(node_labels, node_name) {
            self.known_domains.entry(k).or_default().insert(v);
        }
    }

    pub fn record(
        &mut self,
        pod_labels: &BTreeMap<String, String>,
        node_labels: &BTreeMap<String, String>,
        node_name: &str,
    ) {
        self.register_domains(node_labels, node_name);
        self.placements.push(Placement {
            labels: pod_labels.clone(),
            domains: node_domains(node_labels, node_name),
        });
    }

    /// Would placing this pod on a node with these labels violate any of
    /// its hard topology constraints?
    pub fn admits(
        &self,
        info: &PodSchedulingInfo,
        node_labels: &BTreeMap<String, String>,
        node_name: &str,
    ) -> Result<(), SchedulingError> {
        let domains = node_domains(node_labels, node_name);

        for term in &info.anti_affinity {
            if term.match_labels.is_empty() {
                continue;
            }
            let Some(candidate_domain) = domains.get(&term.topology_key) else {
                continue;
            };
            let occupied = self.placements.iter().any(|p| {
                selector_matches(&term.match_labels, &p.labels)
                    && p.domains.get(&term.topology_key) == Some(candidate_domain)
            });
            if occupied {
                return Err(SchedulingError::TopologyConflict(format!(
                    "anti-affinity on {} in domain {}",
                    term.topology_key, candidate_domain
                )));
            }
        }

        for term in &info.affinity {
            if term.match_labels.is_empty() {
                continue;
            }
            let any_match = self
                .placements
                .iter()
                .any(|p| selector_matches(&term.match_labels, &p.labels));
            // No matching pod anywhere yet: the first of a co-located
            // group may land anywhere.
            if !any_match {
                continue;
            }
            let Some(candidate_domain) = domains.get(&term.topology_key) else {
                return Err(SchedulingError::TopologyConflict(format!(
                    "affinity topology key {} absent on node",
                    term.topology_key
                )));
            };
            let colocated = self.placements.iter().any(|p| {
                selector_matches(&term.match_labels, &p.labels)
                    && p.domains.get(&term.topology_key) == Some(candidate_domain)
            });
            if !colocated {
                return Err(SchedulingError::TopologyConflict(format!(
                    "affinity on {} unmatched in domain {}",
                    term.topology_key, candidate_domain
                )));
            }
        }

        for constraint in info.spread.iter().filter(|c| c.hard) {
            let Some(candidate_domain) = domains.get(&constraint.topology_key) else {
                continue;
            };
            let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
            for v in self
                .known_domains
                .get(&constraint.topology_key)
                .into_iter()
                .flatten()
            {
                counts.insert(v, 0);
            }
            counts.entry(candidate_domain).or_insert(0);
            for p in &self.placements {
                if selector_matches(&constraint.match_labels, &p.labels)
                    && let Some(v) = p.domains.get(&constraint.topology_key)
                    && let Some(c) = counts.get_mut(v.as_str())
                {
                    *c += 1;
                }
            }
            let min = counts.values().copied().min().unwrap_or(0);
            let candidate = counts.get(candidate_domain.as_str()).copied().unwrap_or(0) + 1;
            if (candidate as i64 - min as i64) > constraint.max_skew as i64 {
                return Err(SchedulingError::TopologyConflict(format!(
                    "spread skew on {} would reach {}",
                    constraint.topology_key,
                    candidate - min
                )));
            }
        }

        Ok(())
    }
}

fn node_domains(
    node_labels: &BTreeMap<String, String>,
    node_name: &str,
) -> BTreeMap<String, String> {
    let mut domains = node_labels.clone();
    if !node_name.is_empty() {
        domains
            .entry(LABEL_HOSTNAME.to_string())
            .or_insert_with(|| node_name.to_string());
    }
    domains
}

fn selector_matches(selector: &BTreeMap<String, String>, labels: &BTreeMap<String, String>) -> bool {
    !selector.is_empty() && selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requirements::LABEL_ZONE;
    use crate::scheduling::{AffinityTerm, SpreadConstraint};
    use crate::resources::ResourceList;
    use crate::state::PodId;

    fn info(labels: &[(&str, &str)]) -> PodSchedulingInfo {
        PodSchedulingInfo {
            id: PodId {
                namespace: "default".into(),
                name: "p".into(),
            },
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            requests: ResourceList::new(),
            requirement_alternatives: vec![crate::requirements::Requirements::new()],
            tolerations: vec![],
            anti_affinity: vec![],
            affinity: vec![],
            spread: vec![],
            priority: 0,
        }
    }

    fn zone_labels(zone: &str) -> BTreeMap<String, String> {
        BTreeMap::from([(LABEL_ZONE.to_string(), zone.to_string())])
    }

    #[test]
    fn anti_affinity_blocks_same_domain() {
        let mut topo = Topology::new();
        topo.record(
            &BTreeMap::from([("app".to_string(), "db".to_string())]),
            &zone_labels("a"),
            "n1",
        );
        let mut pod = info(&[("app", "db")]);
        pod.anti_affinity = vec![AffinityTerm {
            topology_key: LABEL_ZONE.into(),
            match_labels: BTreeMap::from([("app".to_string(), "db".to_string())]),
        }];
        assert!(topo.admits(&pod, &zone_labels("a"), "n2").is_err());
        assert!(topo.admits(&pod, &zone_labels("b"), "n3").is_ok());
    }

    #[test]
    fn hostname_anti_affinity_uses_node_name() {
        let mut topo = Topology::new();
        topo.record(
            &BTreeMap::from([("app".to_string(), "web".to_string())]),
            &BTreeMap::new(),
            "n1",
        );
        let mut pod = info(&[("app", "web")]);
        pod.anti_affinity = vec![AffinityTerm {
            topology_key: LABEL_HOSTNAME.into(),
            match_labels: BTreeMap::from([("app".to_string(), "web".to_string())]),
        }];
        assert!(topo.admits(&pod, &BTreeMap::new(), "n1").is_err());
        assert!(topo.admits(&pod, &BTreeMap::new(), "n2").is_ok());
    }

    #[test]
    fn affinity_requires_colocation_once_group_exists() {
        let mut topo = Topology::new();
        let mut pod = info(&[("app", "cache")]);
        pod.affinity = vec![AffinityTerm {
            topology_key: LABEL_ZONE.into(),
            match_labels: BTreeMap::from([("app".to_string(), "cache".to_string())]),
        }];
        // First pod of the group: anywhere.
        assert!(topo.admits(&pod, &zone_labels("a"), "n1").is_ok());
        topo.record(&pod.labels, &zone_labels("a"), "n1");
        // Second pod must co-locate.
        assert!(topo.admits(&pod, &zone_labels("b"), "n2").is_err());
        assert!(topo.admits(&pod, &zone_labels("a"), "n3").is_ok());
    }

    #[test]
    fn spread_enforces_max_skew_across_known_domains() {
        let mut topo = Topology::new();
        topo.register_domains(&zone_labels("a"), "n1");
        topo.register_domains(&zone_labels("b"), "n2");
        let mut pod = info(&[("app", "web")]);
        pod.spread = vec![SpreadConstraint {
            topology_key: LABEL_ZONE.into(),
            max_skew: 1,
            match_labels: BTreeMap::from([("app".to_string(), "web".to_string())]),
            hard: true,
        }];
        // a: 1, b: 0.
        topo.record(&pod.labels, &zone_labels("a"), "n1");
        // Another in a would make skew 2.
        assert!(topo.admits(&pod, &zone_labels("a"), "n1").is_err());
        assert!(topo.admits(&pod, &zone_labels("b"), "n2").is_ok());
    }

    #[test]
    fn soft_spread_never_blocks() {
        let mut topo = Topology::new();
        topo.register_domains(&zone_labels("a"), "n1");
        topo.register_domains(&zone_labels("b"), "n2");
        let mut pod = info(&[("app", "web")]);
        pod.spread = vec![SpreadConstraint {
            topology_key: LABEL_ZONE.into(),
            max_skew: 1,
            match_labels: BTreeMap::from([("app".to_string(), "web".to_string())]),
            hard: false,
        }];
        for _ in 0..3 {
            assert!(topo.admits(&pod, &zone_labels("a"), "n1").is_ok());
            topo.record(&pod.labels, &zone_labels("a"), "n1");
        }
    }
}
