use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use k8s_openapi::api::core::v1::{Node, NodeSpec, NodeStatus};
use kube::api::{DeleteParams, ObjectMeta, PostParams};
use kube::{Api, Client};
use tracing::info;

use crate::apis::{NodeClaim, NodePool};
use crate::catalog::{CapacityType, InstanceType, Offering, OverheadSettings};
use crate::providers::provider::{ProviderError, ProviderId};
use crate::requirements::{
    LABEL_ARCH, LABEL_CAPACITY_TYPE, LABEL_HOSTNAME, LABEL_INSTANCE_TYPE, LABEL_NODEPOOL, LABEL_OS,
    LABEL_ZONE, Requirements,
};
use crate::resources::{CPU, MEMORY, PODS, ResourceList};

const KWOK_ZONES: [&str; 3] = ["a", "b", "c"];
/// Spot trades interruptibility for roughly a third of the price.
const SPOT_DISCOUNT: f64 = 0.3;

fn instance_type(name: &str, cpu: i64, memory_mib: i64, cost_per_hour: f64) -> InstanceType {
    let arch = if name.starts_with("cax") { "arm64" } else { "amd64" };
    let mut offerings = Vec::new();
    for zone in KWOK_ZONES {
        offerings.push(Offering {
            zone: zone.into(),
            capacity_type: CapacityType::OnDemand,
            price: cost_per_hour,
            available: true,
        });
        offerings.push(Offering {
            zone: zone.into(),
            capacity_type: CapacityType::Spot,
            price: cost_per_hour * SPOT_DISCOUNT,
            available: true,
        });
    }
    InstanceType {
        name: name.into(),
        arch: arch.into(),
        capacity: ResourceList::new()
            .with(CPU, cpu * 1000)
            .with(MEMORY, memory_mib * 1024 * 1024 * 1000)
            .with(PODS, 110_000),
        offerings,
    }
}

/// Kubernetes WithOut Kubelet provider.
///
/// There is no cloud behind kwok: "launching an instance" creates the Node
/// object directly, stamped with the kwok annotation so the kwok controller
/// animates its lifecycle.
pub struct KwokProvider {
    client: Client,
    overhead: OverheadSettings,
    instances: Arc<Mutex<BTreeMap<String, NodeClaim>>>,
}

impl KwokProvider {
    pub fn new(client: Client, overhead: OverheadSettings) -> Self {
        Self {
            client,
            overhead,
            instances: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub async fn instance_types(&self, _pool: &NodePool) -> Result<Vec<InstanceType>, ProviderError> {
        Ok(vec![
            // CX - Shared x86                                $/hr
            instance_type("cx22", 2, 4_096, 0.0066),
            instance_type("cx32", 4, 8_192, 0.0106),
            instance_type("cx42", 8, 16_384, 0.0170),
            instance_type("cx52", 16, 32_768, 0.0314),
            // CPX - Shared AMD
            instance_type("cpx12", 2, 2_048, 0.0122),
            instance_type("cpx22", 3, 4_096, 0.0226),
            instance_type("cpx32", 4, 8_192, 0.0299),
            instance_type("cpx42", 8, 16_384, 0.0362),
            instance_type("cpx52", 16, 32_768, 0.0515),
            // CAX - ARM (Ampere)
            instance_type("cax11", 2, 4_096, 0.0074),
            instance_type("cax21", 4, 8_192, 0.0122),
            instance_type("cax31", 8, 16_384, 0.0226),
            instance_type("cax41", 16, 32_768, 0.0443),
            // CCX - Dedicated x86
            instance_type("ccx13", 2, 8_192, 0.0386),
            instance_type("ccx23", 4, 16_384, 0.0475),
            instance_type("ccx33", 8, 32_768, 0.0900),
            instance_type("ccx43", 16, 65_536, 0.1789),
            instance_type("ccx53", 32, 131_072, 0.3568),
            instance_type("ccx63", 48, 196_608, 0.5347),
        ])
    }

    pub async fn create(&self, claim: &NodeClaim) -> Result<NodeClaim, ProviderError> {
        fail::fail_point!("kwok-create", |_| Err(ProviderError::CreationFailed {
            message: "failpoint".into()
        }));
        let name = claim.name();
        // Idempotent by name: a retry after a lost response must not
        // launch a second instance.
        if let Some(existing) = self.instances.lock().unwrap().get(&name) {
            return Ok(existing.clone());
        }

        let reqs = Requirements::parse(&claim.spec.requirements)
            .map_err(|e| ProviderError::CreationFailed { message: e.to_string() })?;
        let types = self
            .instance_types(&NodePool::new("", crate::apis::NodePoolSpec::default()))
            .await?;
        let (instance_type, offering) = crate::catalog::resolve_cheapest(&types, &reqs)
            .ok_or_else(|| ProviderError::InsufficientCapacity {
                instance_type: "*".into(),
                zone: "*".into(),
                capacity_type: "*".into(),
            })?;
        let (instance_type, offering) = (instance_type.clone(), offering.clone());

        let provider_id = format!("kwok://{name}");
        let allocatable = instance_type.allocatable(&self.overhead);
        let mut labels = BTreeMap::from([
            (LABEL_INSTANCE_TYPE.to_string(), instance_type.name.clone()),
            (LABEL_ZONE.to_string(), offering.zone.clone()),
            (
                LABEL_CAPACITY_TYPE.to_string(),
                offering.capacity_type.as_str().to_string(),
            ),
            (LABEL_ARCH.to_string(), instance_type.arch.clone()),
            (LABEL_OS.to_string(), "linux".to_string()),
            (LABEL_HOSTNAME.to_string(), name.clone()),
            ("app.kubernetes.io/managed-by".to_string(), "canopy".to_string()),
        ]);
        if let Some(pool) = claim.node_pool_name() {
            labels.insert(LABEL_NODEPOOL.to_string(), pool.to_string());
        }
        let mut taints = claim.spec.taints.clone();
        taints.extend(claim.spec.startup_taints.clone());

        let node = Node {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                labels: Some(labels),
                annotations: Some(BTreeMap::from([(
                    "kwok.x-k8s.io/node".to_string(),
                    "fake".to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                provider_id: Some(provider_id.clone()),
                taints: if taints.is_empty() { None } else { Some(taints) },
                ..Default::default()
            }),
            status: Some(NodeStatus {
                capacity: Some(instance_type.capacity.to_quantities()),
                allocatable: Some(allocatable.to_quantities()),
                ..Default::default()
            }),
        };
        let nodes: Api<Node> = Api::all(self.client.clone());
        nodes
            .create(&PostParams::default(), &node)
            .await
            .map_err(|e| ProviderError::CreationFailed { message: e.to_string() })?;

        let mut launched = claim.clone();
        let status = launched.status_mut();
        status.provider_id = Some(provider_id.clone());
        status.image_id = Some(format!("kwok-{}", instance_type.arch));
        status.capacity = instance_type.capacity.to_quantities();
        status.allocatable = allocatable.to_quantities();
        info!(
            node_claim = %name,
            instance_type = %instance_type.name,
            zone = %offering.zone,
            capacity_type = %offering.capacity_type,
            price = offering.price,
            "launched kwok instance"
        );
        self.instances.lock().unwrap().insert(name, launched.clone());
        Ok(launched)
    }

    pub async fn delete(&self, claim: &NodeClaim) -> Result<(), ProviderError> {
        fail::fail_point!("kwok-delete", |_| Err(ProviderError::CreationFailed {
            message: "failpoint".into()
        }));
        let name = claim.name();
        let existed = self.instances.lock().unwrap().remove(&name).is_some();
        let nodes: Api<Node> = Api::all(self.client.clone());
        match nodes.delete(&name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                if existed {
                    Ok(())
                } else {
                    Err(ProviderError::NotFound(name))
                }
            }
            Err(e) => Err(ProviderError::Internal(e.into())),
        }
    }

    pub async fn get(&self, provider_id: &ProviderId) -> Result<NodeClaim, ProviderError> {
        self.instances
            .lock()
            .unwrap()
            .values()
            .find(|c| c.provider_id() == Some(provider_id.0.as_str()))
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(provider_id.0.clone()))
    }

    pub async fn list(&self) -> Result<Vec<NodeClaim>, ProviderError> {
        Ok(self.instances.lock().unwrap().values().cloned().collect())
    }

    pub async fn is_drifted(&self, _claim: &NodeClaim) -> Result<Option<String>, ProviderError> {
        // kwok instances have no mutable backing state to drift.
        Ok(None)
    }
}
