mod common;

use common::{pending_pod, simulation, test_instance_type, test_pool};

use k8s_openapi::api::core::v1::{PodTemplateSpec, TopologySpreadConstraint};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use canopy::catalog::{CapacityType, Offering};
use canopy::requirements::{LABEL_INSTANCE_TYPE, LABEL_ZONE};
use canopy::resources::CPU;
use canopy::scheduling::simulate;

#[test]
fn first_pod_launch_selects_the_only_fitting_type() {
    // One NodePool admitting t-small (2 cpu, $0.05) and t-med
    // (4 cpu, $0.09). A single 3 cpu pod must produce exactly one new
    // node constrained to t-med.
    let sim = simulation(
        test_pool("p1"),
        vec![
            test_instance_type("t-small", 2, 4096, 0.05),
            test_instance_type("t-med", 4, 8192, 0.09),
        ],
    );
    let results = simulate(&sim, &[pending_pod("workload", "3", "1Gi")]);

    assert!(results.all_placed());
    assert_eq!(results.new_node_claims.len(), 1);
    let plan = &results.new_node_claims[0];
    assert_eq!(plan.pool, "p1");
    let types: Vec<&str> = plan.instance_types.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(types, vec!["t-med"]);
    assert_eq!(plan.pods.len(), 1);
    assert_eq!(plan.requests.get(CPU), 3000);
}

#[test]
fn instance_type_requirement_narrows_as_pods_accumulate() {
    let sim = simulation(
        test_pool("p1"),
        vec![
            test_instance_type("t-small", 2, 4096, 0.05),
            test_instance_type("t-med", 4, 8192, 0.09),
            test_instance_type("t-large", 8, 16384, 0.17),
        ],
    );
    // Two 1-cpu pods fit every type; adding a third narrows out t-small
    // (2 cpu capacity minus reservations holds fewer than 3 cpu of
    // requests).
    let pods = vec![
        pending_pod("a", "1", "512Mi"),
        pending_pod("b", "1", "512Mi"),
        pending_pod("c", "1", "512Mi"),
    ];
    let results = simulate(&sim, &pods);
    assert!(results.all_placed());
    assert_eq!(results.new_node_claims.len(), 1);
    let names: Vec<&str> = results.new_node_claims[0]
        .instance_types
        .iter()
        .map(|t| t.name.as_str())
        .collect();
    assert!(!names.contains(&"t-small"));
    assert!(names.contains(&"t-med"));
}

#[test]
fn daemonset_overhead_reserves_room_on_new_nodes() {
    let mut sim = simulation(
        test_pool("p1"),
        vec![test_instance_type("t-small", 2, 4096, 0.05)],
    );
    // A daemonset eating 1 cpu on every node leaves t-small (1.9 cpu
    // allocatable) unable to hold a 1.5 cpu pod.
    let ds_pod = pending_pod("ds", "1", "128Mi");
    sim.daemonsets = vec![PodTemplateSpec {
        metadata: ds_pod.metadata.clone().into(),
        spec: ds_pod.spec.clone(),
    }];
    let results = simulate(&sim, &[pending_pod("workload", "1500m", "128Mi")]);
    assert!(!results.all_placed());

    // Without the daemonset the same pod fits.
    sim.daemonsets.clear();
    let results = simulate(&sim, &[pending_pod("workload", "1500m", "128Mi")]);
    assert!(results.all_placed());
}

#[test]
fn zone_spread_forces_multiple_nodes() {
    let mut pool = test_pool("p1");
    pool.spec.template.metadata.labels.insert("app".into(), "web".into());
    let mut it = test_instance_type("t-med", 4, 8192, 0.09);
    it.offerings = vec![
        Offering {
            zone: "a".into(),
            capacity_type: CapacityType::OnDemand,
            price: 0.09,
            available: true,
        },
        Offering {
            zone: "b".into(),
            capacity_type: CapacityType::OnDemand,
            price: 0.09,
            available: true,
        },
    ];
    let sim = simulation(pool, vec![it]);

    let spread = TopologySpreadConstraint {
        topology_key: LABEL_ZONE.into(),
        max_skew: 1,
        when_unsatisfiable: "DoNotSchedule".into(),
        label_selector: Some(LabelSelector {
            match_labels: Some([("app".to_string(), "web".to_string())].into()),
            ..Default::default()
        }),
        ..Default::default()
    };
    let mut pods = Vec::new();
    for i in 0..4 {
        let mut pod = pending_pod(&format!("web-{i}"), "100m", "64Mi");
        pod.metadata.labels = Some([("app".to_string(), "web".to_string())].into());
        pod.spec.as_mut().unwrap().topology_spread_constraints = Some(vec![spread.clone()]);
        pods.push(pod);
    }
    let results = simulate(&sim, &pods);
    assert!(results.all_placed(), "errors: {:?}", results.pod_errors);
    // A single zone-pinned node cannot hold all four with maxSkew 1.
    assert!(results.new_node_claims.len() >= 2);
}

#[test]
fn instance_type_set_is_price_ordered() {
    let sim = simulation(
        test_pool("p1"),
        vec![
            test_instance_type("zz-cheap", 4, 8192, 0.01),
            test_instance_type("aa-pricey", 4, 8192, 0.50),
        ],
    );
    let results = simulate(&sim, &[pending_pod("workload", "1", "512Mi")]);
    let names: Vec<&str> = results.new_node_claims[0]
        .instance_types
        .iter()
        .map(|t| t.name.as_str())
        .collect();
    // Cheapest first regardless of name order.
    assert_eq!(names, vec!["zz-cheap", "aa-pricey"]);
    assert_eq!(
        results.new_node_claims[0]
            .requirements
            .get(LABEL_INSTANCE_TYPE),
        None,
        "the set is carried on the plan, not yet pinned as a requirement"
    );
}
