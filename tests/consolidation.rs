mod common;

use common::{pending_pod, simulation, test_instance_type, test_pool};

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Taint;

use canopy::providers::provider::ProviderId;
use canopy::resources::{CPU, MEMORY, PODS, ResourceList};
use canopy::scheduling::{ExistingNode, SchedulingError, simulate};

fn existing_node(name: &str, cpu_millis: i64) -> ExistingNode {
    ExistingNode {
        name: name.into(),
        provider_id: ProviderId(format!("kwok://{name}")),
        labels: BTreeMap::new(),
        taints: vec![],
        available: ResourceList::new()
            .with(CPU, cpu_millis)
            .with(MEMORY, 8 * 1024 * 1024 * 1024 * 1000)
            .with(PODS, 100_000),
        marked_for_deletion: false,
        terminating: false,
        assigned: vec![],
    }
}

#[test]
fn consolidation_wins_by_price() {
    // Two t-med nodes ($0.09) each hold one 1 cpu pod. Replaying both
    // pods with the nodes gone must yield a single replacement whose
    // cheapest instance type is t-small ($0.05): the replacement
    // undercuts the $0.18 it removes.
    let sim = simulation(
        test_pool("p1"),
        vec![
            test_instance_type("t-small", 2, 4096, 0.05),
            test_instance_type("t-med", 4, 8192, 0.09),
        ],
    );
    let pods = vec![
        pending_pod("a", "800m", "512Mi"),
        pending_pod("b", "800m", "512Mi"),
    ];
    let results = simulate(&sim, &pods);

    assert!(results.all_placed());
    assert_eq!(results.new_node_claims.len(), 1);
    let plan = &results.new_node_claims[0];
    assert_eq!(plan.instance_types[0].name, "t-small");
    let replacement_price = plan.cheapest_price().unwrap();
    assert!(replacement_price < 2.0 * 0.09);
    assert_eq!(plan.pods.len(), 2);
}

#[test]
fn consolidation_into_remaining_capacity_needs_no_replacement() {
    // With a half-empty surviving node, the displaced pods fold into it
    // and the command carries no replacement at all.
    let mut sim = simulation(
        test_pool("p1"),
        vec![test_instance_type("t-med", 4, 8192, 0.09)],
    );
    sim.existing = vec![existing_node("survivor", 3900)];
    let pods = vec![pending_pod("a", "1", "512Mi"), pending_pod("b", "1", "512Mi")];
    let results = simulate(&sim, &pods);

    assert!(results.all_placed());
    assert!(results.new_node_claims.is_empty());
    assert_eq!(results.existing_nodes.len(), 1);
    assert_eq!(results.existing_nodes[0].assigned.len(), 2);
}

#[test]
fn candidate_pods_tolerating_no_pool_cannot_consolidate() {
    // The displaced pods require a taint no pool tolerates them onto;
    // validation must fail, which the engine reads as "skip candidate".
    let mut pool = test_pool("p1");
    pool.spec.template.spec.taints = vec![Taint {
        key: "dedicated".into(),
        value: Some("batch".into()),
        effect: "NoSchedule".into(),
        ..Default::default()
    }];
    let sim = simulation(pool, vec![test_instance_type("t-med", 4, 8192, 0.09)]);
    let results = simulate(&sim, &[pending_pod("a", "1", "512Mi")]);

    assert!(!results.all_placed());
    assert_eq!(
        results.pod_errors.values().next(),
        Some(&SchedulingError::UntoleratedTaints)
    );
}

#[test]
fn replacement_larger_than_any_removed_node_is_expressible() {
    // Three small nodes' pods collapse onto one t-large. The single
    // replacement costs more than any one removed node but less than
    // the three together; the engine's strict total-cost rule decides.
    let sim = simulation(
        test_pool("p1"),
        vec![
            test_instance_type("t-small", 2, 4096, 0.05),
            test_instance_type("t-large", 8, 16384, 0.12),
        ],
    );
    let pods = vec![
        pending_pod("a", "1500m", "512Mi"),
        pending_pod("b", "1500m", "512Mi"),
        pending_pod("c", "1500m", "512Mi"),
    ];
    let results = simulate(&sim, &pods);
    assert!(results.all_placed());
    assert_eq!(results.new_node_claims.len(), 1);
    let plan = &results.new_node_claims[0];
    assert_eq!(plan.instance_types[0].name, "t-large");
    let price = plan.cheapest_price().unwrap();
    assert!(price > 0.05);
    assert!(price < 3.0 * 0.05);
}
