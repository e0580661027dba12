#![allow(dead_code)]

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, Pod, PodCondition, PodSpec, PodStatus, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;

use canopy::apis::nodepool::{
    DisruptionPolicy, NodeClaimTemplate, NodeClaimTemplateSpec, NodeClassRef, TemplateMeta,
};
use canopy::apis::{NodePool, NodePoolSpec};
use canopy::catalog::{CapacityType, InstanceType, Offering, OverheadSettings};
use canopy::resources::{CPU, MEMORY, PODS, ResourceList};
use canopy::scheduling::simulator::{PoolContext, Simulation};

pub fn pending_pod(name: &str, cpu: &str, memory: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some("default".into()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "worker".into(),
                image: Some("busybox".into()),
                resources: Some(ResourceRequirements {
                    requests: Some(BTreeMap::from([
                        ("cpu".into(), Quantity(cpu.into())),
                        ("memory".into(), Quantity(memory.into())),
                    ])),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Pending".into()),
            conditions: Some(vec![PodCondition {
                type_: "PodScheduled".into(),
                status: "False".into(),
                reason: Some("Unschedulable".into()),
                message: Some("insufficient resources".into()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn test_instance_type(name: &str, cpu: i64, memory_mib: i64, cost: f64) -> InstanceType {
    InstanceType {
        name: name.into(),
        arch: "amd64".into(),
        capacity: ResourceList::new()
            .with(CPU, cpu * 1000)
            .with(MEMORY, memory_mib * 1024 * 1024 * 1000)
            .with(PODS, 110_000),
        offerings: vec![Offering {
            zone: "a".into(),
            capacity_type: CapacityType::OnDemand,
            price: cost,
            available: true,
        }],
    }
}

pub fn test_pool(name: &str) -> NodePool {
    let mut pool = NodePool::new(
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
    pool.metadata.name = Some(name.into());
    pool
}

pub fn simulation(pool: NodePool, types: Vec<InstanceType>) -> Simulation {
    Simulation {
        pools: vec![PoolContext {
            pool,
            instance_types: types,
            current_usage: ResourceList::new(),
        }],
        existing: vec![],
        daemonsets: vec![],
        bound: vec![],
        overhead: OverheadSettings::default(),
    }
}
