use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{ListParams, PostParams};
use kube::{Api, Client};
use tokio::sync::watch as signal;
use tracing::{debug, info, warn};

use crate::apis::{
    ANNOTATION_NOMINATED_PODS, NodeClaim, NodeClaimSpec, NodePool, TERMINATION_FINALIZER,
};
use crate::catalog::{Catalog, OverheadSettings};
use crate::errors::Result;
use crate::events::{EventPublisher, object_ref};
use crate::providers::provider::CloudProvider;
use crate::requirements::{LABEL_INSTANCE_TYPE, LABEL_NODEPOOL};
use crate::scheduling::{ExistingNode, NodeClaimPlan, Results, Simulation, simulate};
use crate::scheduling::simulator::PoolContext;
use crate::state::Cluster;

/// Reacts to unschedulable pods: snapshots the cluster, runs the
/// scheduling simulation, and turns every hypothetical node into a
/// NodeClaim. Effectively a singleton; one pass must observe one
/// consistent snapshot.
pub struct Provisioner {
    client: Client,
    cluster: Arc<Cluster>,
    catalog: Arc<Catalog>,
    provider: Arc<CloudProvider>,
    events: EventPublisher,
    overhead: OverheadSettings,
    nomination_ttl: Duration,
}

impl Provisioner {
    pub fn new(
        client: Client,
        cluster: Arc<Cluster>,
        catalog: Arc<Catalog>,
        provider: Arc<CloudProvider>,
        overhead: OverheadSettings,
        nomination_ttl: Duration,
    ) -> Self {
        Self {
            events: EventPublisher::new(client.clone()),
            client,
            cluster,
            catalog,
            provider,
            overhead,
            nomination_ttl,
        }
    }

    /// One provisioning pass. Returns how many NodeClaims were created.
    pub async fn provision_once(&self) -> Result<usize> {
        if !self.cluster.synced() {
            debug!("state cache not yet synced, skipping provisioning pass");
            return Ok(0);
        }
        let pending = self.cluster.unschedulable_pods();
        crate::metrics::PENDING_PODS.set(pending.len() as i64);
        if pending.is_empty() {
            return Ok(0);
        }
        info!(count = pending.len(), "found unschedulable pods");

        let pools = self.list_pools().await?;
        let sim = self.build_simulation(&pools).await?;
        let results = simulate(&sim, &pending);

        for (pod, error) in &results.pod_errors {
            debug!(pod = %pod, error = %error, "pod remains unschedulable");
        }

        self.nominate_existing(&results, &pending).await;

        let mut created = 0;
        for plan in &results.new_node_claims {
            let Some(pool) = pools.iter().find(|p| p.name() == plan.pool) else {
                continue;
            };
            let claim = claim_from_plan(plan, pool);
            let api: Api<NodeClaim> = Api::all(self.client.clone());
            match api.create(&PostParams::default(), &claim).await {
                Ok(_) => {
                    created += 1;
                    crate::metrics::NODECLAIMS_CREATED
                        .with_label_values(&[&plan.pool, "provisioning"])
                        .inc();
                    info!(
                        node_claim = %claim.name(),
                        pool = %plan.pool,
                        pods = plan.pods.len(),
                        instance_types = plan.instance_types.len(),
                        "created NodeClaim"
                    );
                }
                Err(e) => warn!(node_claim = %claim.name(), error = %e, "failed to create NodeClaim"),
            }
        }
        Ok(created)
    }

    async fn list_pools(&self) -> Result<Vec<NodePool>> {
        let api: Api<NodePool> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn build_simulation(&self, pools: &[NodePool]) -> Result<Simulation> {
        let mut contexts = Vec::new();
        for pool in pools {
            let types = match self.catalog.instance_types(&self.provider, pool).await {
                Ok(types) => (*types).clone(),
                Err(e) => {
                    warn!(pool = %pool.name(), error = %e, "catalog fetch failed, excluding pool");
                    continue;
                }
            };
            contexts.push(PoolContext {
                current_usage: self.cluster.pool_resources(&pool.name()),
                pool: pool.clone(),
                instance_types: types,
            });
        }

        let mut existing = Vec::new();
        self.cluster.for_each_node(|sn| {
            existing.push((sn.clone(), sn.node_name()));
        });
        let existing: Vec<ExistingNode> = existing
            .into_iter()
            .map(|(sn, name)| ExistingNode::from_state(&sn, &self.cluster.pods_bound_to(&name)))
            .collect();

        Ok(Simulation {
            pools: contexts,
            existing,
            daemonsets: self.cluster.daemonset_templates(),
            bound: self.cluster.bound_pods(),
            overhead: self.overhead,
        })
    }

    /// Reserve existing nodes that absorbed pods in the plan, so the next
    /// pass does not provision duplicate capacity while bindings land.
    async fn nominate_existing(&self, results: &Results, pending: &[Pod]) {
        for node in &results.existing_nodes {
            self.cluster.nominate(&node.provider_id, self.nomination_ttl);
            for pod_id in &node.assigned {
                if let Some(pod) = pending
                    .iter()
                    .find(|p| &crate::state::PodId::from_pod(p) == pod_id)
                {
                    self.events
                        .normal(
                            &object_ref(pod),
                            "Nominated",
                            &format!("Pod should schedule on node {}", node.name),
                        )
                        .await;
                }
            }
        }
    }

    /// Provision on a fixed cadence. The interval doubles as the
    /// de-duplication window for unschedulable pod events.
    pub async fn run(&self, interval: Duration, mut shutdown: signal::Receiver<bool>) {
        let mut tick = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tick.tick() => {
                    if let Err(e) = self.provision_once().await {
                        warn!(error = %e, "provisioning pass failed");
                    }
                }
            }
        }
    }
}

/// Materialize a hypothetical node as a NodeClaim object. The simulator's
/// surviving instance types become an In-set requirement; orchestration
/// and drift detection key off the pool label; the termination finalizer
/// is present from birth.
pub fn claim_from_plan(plan: &NodeClaimPlan, pool: &NodePool) -> NodeClaim {
    let mut requirements = plan.requirements.clone();
    let type_names: Vec<String> = plan.instance_types.iter().map(|it| it.name.clone()).collect();
    if !type_names.is_empty() {
        requirements.insert_in(LABEL_INSTANCE_TYPE, &type_names);
    }

    let template = &pool.spec.template;
    let mut claim = NodeClaim::new(
        &format!("{}-{}", pool.name(), uuid::Uuid::new_v4()),
        NodeClaimSpec {
            requirements: requirements.to_spec(),
            resources: plan.requests.to_quantities(),
            taints: template.spec.taints.clone(),
            startup_taints: template.spec.startup_taints.clone(),
            expire_after: template.spec.expire_after.clone(),
            termination_grace_period_seconds: template.spec.termination_grace_period_seconds,
            node_class_ref: template.spec.node_class_ref.clone(),
        },
    );

    let mut labels = template.metadata.labels.clone();
    labels.insert(LABEL_NODEPOOL.to_string(), pool.name());
    claim.metadata.labels = Some(labels);

    let mut annotations = template.metadata.annotations.clone();
    annotations.insert(crate::apis::ANNOTATION_HASH.to_string(), pool.static_hash());
    annotations.insert(
        crate::apis::ANNOTATION_HASH_VERSION.to_string(),
        crate::apis::HASH_VERSION.to_string(),
    );
    annotations.insert(
        ANNOTATION_NOMINATED_PODS.to_string(),
        plan.pods
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(","),
    );
    claim.metadata.annotations = Some(annotations);
    claim.metadata.finalizers = Some(vec![TERMINATION_FINALIZER.to_string()]);
    claim.metadata.owner_references = Some(vec![OwnerReference {
        api_version: "canopy/v1alpha1".into(),
        kind: "NodePool".into(),
        name: pool.name(),
        uid: pool.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }]);
    claim
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::nodepool::tests_support::minimal_pool;
    use crate::catalog::{CapacityType, InstanceType, Offering};
    use crate::requirements::Requirements;
    use crate::resources::{CPU, ResourceList};
    use crate::state::PodId;

    fn plan() -> NodeClaimPlan {
        let mut requirements = Requirements::new();
        requirements.insert_label(LABEL_NODEPOOL, "p1");
        NodeClaimPlan {
            pool: "p1".into(),
            name: "p1-sim-1".into(),
            requirements,
            instance_types: vec![InstanceType {
                name: "t-med".into(),
                arch: "amd64".into(),
                capacity: ResourceList::new().with(CPU, 4000),
                offerings: vec![Offering {
                    zone: "a".into(),
                    capacity_type: CapacityType::OnDemand,
                    price: 0.09,
                    available: true,
                }],
            }],
            pods: vec![PodId {
                namespace: "default".into(),
                name: "p1".into(),
            }],
            requests: ResourceList::new().with(CPU, 3000),
            daemonset_overhead: ResourceList::new(),
            taints: vec![],
        }
    }

    #[test]
    fn claim_carries_instance_type_set_and_finalizer() {
        let pool = minimal_pool("p1");
        let claim = claim_from_plan(&plan(), &pool);
        assert!(claim.name().starts_with("p1-"));
        let req = claim
            .spec
            .requirements
            .iter()
            .find(|r| r.key == LABEL_INSTANCE_TYPE)
            .expect("instance type requirement present");
        assert_eq!(req.values, vec!["t-med".to_string()]);
        assert_eq!(
            claim.metadata.finalizers.as_ref().unwrap()[0],
            TERMINATION_FINALIZER
        );
        assert_eq!(claim.node_pool_name(), Some("p1"));
    }

    #[test]
    fn claim_records_nominated_pods() {
        let pool = minimal_pool("p1");
        let claim = claim_from_plan(&plan(), &pool);
        let noms = claim
            .metadata
            .annotations
            .as_ref()
            .unwrap()
            .get(ANNOTATION_NOMINATED_PODS)
            .unwrap();
        assert_eq!(noms, "default/p1");
    }

    #[test]
    fn claim_resources_match_plan() {
        let pool = minimal_pool("p1");
        let claim = claim_from_plan(&plan(), &pool);
        let parsed = ResourceList::from_quantities(&claim.spec.resources).unwrap();
        assert_eq!(parsed.get(CPU), 3000);
    }
}
