pub mod consolidation;
pub mod queue;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, Client};
use tokio::sync::watch as signal;
use tracing::{debug, info, warn};

use crate::apis::{
    ANNOTATION_DO_NOT_DISRUPT, COND_CONSOLIDATABLE, COND_DRIFTED, COND_EMPTY, COND_EXPIRED,
    NodeClaim, NodePool,
};
use crate::apis::nodepool::DisruptionReason;
use crate::catalog::{Catalog, OverheadSettings, offering_compatible};
use crate::errors::{Error, Result};
use crate::events::EventPublisher;
use crate::providers::provider::{CloudProvider, ProviderId};
use crate::provisioning::claim_from_plan;
use crate::requirements::{
    LABEL_CAPACITY_TYPE, LABEL_INSTANCE_TYPE, LABEL_ZONE, Requirements,
};
use crate::scheduling::{ExistingNode, Simulation, simulate};
use crate::scheduling::simulator::PoolContext;
use crate::state::{Cluster, StateNode, is_daemonset_pod, is_reschedulable};

/// A node the engine may disrupt this tick, with everything the methods
/// need precomputed.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub state_node: StateNode,
    pub claim: NodeClaim,
    pub pool_name: String,
    pub reschedulable: Vec<Pod>,
    /// Hourly price of the offering currently backing this node.
    pub price: Option<f64>,
    /// False when the backing instance type left the catalog; such nodes
    /// drift but are never consolidated.
    pub instance_type_in_catalog: bool,
}

impl Candidate {
    pub fn provider_id(&self) -> ProviderId {
        self.state_node.provider_id.clone()
    }
}

/// How a consolidation command reshapes the fleet, for metrics and
/// events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsolidationType {
    Empty,
    SingleNode,
    MultiNode,
}

impl std::fmt::Display for ConsolidationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "empty"),
            Self::SingleNode => write!(f, "single-node"),
            Self::MultiNode => write!(f, "multi-node"),
        }
    }
}

/// One disruption decision on its way through validation and
/// orchestration.
#[derive(Debug, Clone)]
pub struct Command {
    pub id: uuid::Uuid,
    pub reason: DisruptionReason,
    pub consolidation_type: Option<ConsolidationType>,
    /// (providerID, claim name) per candidate.
    pub candidates: Vec<(ProviderId, String)>,
    /// Replacement NodeClaim names, launched before submission.
    pub replacements: Vec<String>,
    pub created_at: Instant,
    pub last_error: Option<String>,
}

/// Walks the disruption methods in fixed order and submits at most one
/// command per tick. Runs as a singleton; mutation decisions serialize
/// here.
pub struct DisruptionEngine {
    client: Client,
    cluster: Arc<Cluster>,
    catalog: Arc<Catalog>,
    provider: Arc<CloudProvider>,
    events: EventPublisher,
    queue: Arc<queue::OrchestrationQueue>,
    overhead: OverheadSettings,
    consolidation_ttl: Duration,
    /// Sequence number at which the last pass concluded there was nothing
    /// to consolidate. Any cluster mutation invalidates it.
    consolidated_at: Mutex<Option<u64>>,
}

impl DisruptionEngine {
    pub fn new(
        client: Client,
        cluster: Arc<Cluster>,
        catalog: Arc<Catalog>,
        provider: Arc<CloudProvider>,
        queue: Arc<queue::OrchestrationQueue>,
        overhead: OverheadSettings,
        consolidation_ttl: Duration,
    ) -> Self {
        Self {
            events: EventPublisher::new(client.clone()),
            client,
            cluster,
            catalog,
            provider,
            queue,
            overhead,
            consolidation_ttl,
            consolidated_at: Mutex::new(None),
        }
    }

    /// True when the last pass found nothing to consolidate and nothing
    /// relevant has changed since.
    pub fn consolidated(&self) -> bool {
        let held = *self.consolidated_at.lock().unwrap();
        let current = held == Some(self.cluster.sequence());
        crate::metrics::CLUSTER_CONSOLIDATED.set(if current { 1.0 } else { 0.0 });
        current
    }

    pub async fn run(&self, interval: Duration, mut shutdown: signal::Receiver<bool>) {
        let mut tick = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tick.tick() => {}
            }
            let mut pass_shutdown = shutdown.clone();
            if let Err(e) = self.reconcile_once(&mut pass_shutdown).await {
                if matches!(e, Error::Interrupted) {
                    return;
                }
                warn!(error = %e, "disruption pass failed");
            }
        }
    }

    pub async fn reconcile_once(&self, shutdown: &mut signal::Receiver<bool>) -> Result<()> {
        if !self.cluster.synced() {
            return Ok(());
        }
        let sequence_at_start = self.cluster.sequence();
        let pools = self.list_pools().await?;
        let pool_map: BTreeMap<String, NodePool> =
            pools.iter().map(|p| (p.name(), p.clone())).collect();
        let candidates = self.build_candidates(&pool_map).await?;
        if candidates.is_empty() && self.queue.depth() == 0 {
            self.note_consolidated(sequence_at_start, false);
            return Ok(());
        }

        let mut budget_blocked = false;
        let methods: [(DisruptionReason, Option<ConsolidationType>); 5] = [
            (DisruptionReason::Expired, None),
            (DisruptionReason::Drifted, None),
            (DisruptionReason::Empty, Some(ConsolidationType::Empty)),
            (DisruptionReason::Underutilized, Some(ConsolidationType::SingleNode)),
            (DisruptionReason::Underutilized, Some(ConsolidationType::MultiNode)),
        ];

        for (reason, ctype) in methods {
            let budgeted =
                self.budgeted_candidates(&candidates, &pool_map, reason, &mut budget_blocked);
            if budgeted.is_empty() {
                continue;
            }
            let proposal = match ctype {
                None => self.replace_method(&budgeted, reason, &pools).await?,
                Some(ConsolidationType::Empty) => emptiness(&budgeted),
                Some(ConsolidationType::SingleNode) => {
                    consolidation::single_node(self, &budgeted, &pools).await?
                }
                Some(ConsolidationType::MultiNode) => {
                    consolidation::multi_node(self, &budgeted, &pools).await?
                }
            };
            let Some(proposal) = proposal else { continue };

            if self.validate_and_submit(proposal, reason, ctype, &pools, shutdown).await? {
                return Ok(());
            }
        }

        if !budget_blocked {
            self.note_consolidated(sequence_at_start, true);
        }
        Ok(())
    }

    fn note_consolidated(&self, sequence: u64, log: bool) {
        // Only conclude "consolidated" if nothing moved underneath the
        // pass; a fully blocking budget never reaches here.
        if self.cluster.sequence() == sequence {
            *self.consolidated_at.lock().unwrap() = Some(sequence);
            crate::metrics::CLUSTER_CONSOLIDATED.set(1.0);
            if log {
                debug!("cluster is consolidated");
            }
        }
    }

    async fn list_pools(&self) -> Result<Vec<NodePool>> {
        let api: Api<NodePool> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    /// Disruptable nodes: owned by a managed pool, Initialized, not
    /// in-flight, not nominated, not already being deleted, and free of
    /// do-not-disrupt pods.
    async fn build_candidates(
        &self,
        pools: &BTreeMap<String, NodePool>,
    ) -> Result<Vec<Candidate>> {
        let mut nodes = Vec::new();
        self.cluster.for_each_node(|sn| nodes.push(sn.clone()));

        let now = Instant::now();
        let mut candidates = Vec::new();
        for sn in nodes {
            let Some(claim) = sn.claim().cloned() else { continue };
            let Some(pool_name) = sn.node_pool() else { continue };
            let Some(pool) = pools.get(&pool_name) else { continue };
            if !claim.is_initialized()
                || sn.marked_for_deletion
                || sn.terminating()
                || sn.nominated(now)
                || self.queue.contains(&sn.provider_id)
            {
                continue;
            }
            let pods = self.cluster.pods_bound_to(&sn.node_name());
            let blocked = pods.iter().any(|p| {
                p.metadata
                    .annotations
                    .as_ref()
                    .and_then(|a| a.get(ANNOTATION_DO_NOT_DISRUPT))
                    .is_some_and(|v| v == "true")
            });
            if blocked {
                continue;
            }
            let reschedulable: Vec<Pod> = pods
                .into_iter()
                .filter(|p| !is_daemonset_pod(p) && is_reschedulable(p))
                .collect();
            let (price, in_catalog) = self.current_offering(pool, &sn).await;
            candidates.push(Candidate {
                state_node: sn,
                claim,
                pool_name,
                reschedulable,
                price,
                instance_type_in_catalog: in_catalog,
            });
        }
        // Deterministic walk order: cheapest-value nodes first, i.e. the
        // ones whose pods are cheapest to move.
        candidates.sort_by(|a, b| {
            (a.reschedulable.len(), a.state_node.node_name())
                .cmp(&(b.reschedulable.len(), b.state_node.node_name()))
        });
        Ok(candidates)
    }

    async fn current_offering(&self, pool: &NodePool, sn: &StateNode) -> (Option<f64>, bool) {
        let labels = sn.labels();
        let Some(type_name) = labels.get(LABEL_INSTANCE_TYPE) else {
            return (None, false);
        };
        let Ok(types) = self.catalog.instance_types(&self.provider, pool).await else {
            return (None, false);
        };
        let Some(it) = types.iter().find(|it| &it.name == type_name) else {
            return (None, false);
        };
        let mut reqs = Requirements::new();
        if let Some(zone) = labels.get(LABEL_ZONE) {
            reqs.insert_label(LABEL_ZONE, zone);
        }
        if let Some(ct) = labels.get(LABEL_CAPACITY_TYPE) {
            reqs.insert_label(LABEL_CAPACITY_TYPE, ct);
        }
        let price = it
            .offerings
            .iter()
            .filter(|o| offering_compatible(o, &reqs))
            .map(|o| o.price)
            .next();
        (price, true)
    }

    /// Reason-eligible candidates that also fit within their pools'
    /// budgets right now. Eligibility runs first: a candidate that does
    /// not carry the method's condition must never occupy a budget slot
    /// and starve one that does.
    pub fn budgeted_candidates(
        &self,
        candidates: &[Candidate],
        pools: &BTreeMap<String, NodePool>,
        reason: DisruptionReason,
        budget_blocked: &mut bool,
    ) -> Vec<Candidate> {
        let eligible: Vec<Candidate> = candidates
            .iter()
            .filter(|c| eligible_for(c, reason))
            .cloned()
            .collect();
        self.apply_budgets(&eligible, pools, reason, budget_blocked)
    }

    /// Per-(pool, reason) budgets: keep the first `allowed` candidates of
    /// each pool; note when a budget blocked at least one.
    fn apply_budgets(
        &self,
        candidates: &[Candidate],
        pools: &BTreeMap<String, NodePool>,
        reason: DisruptionReason,
        budget_blocked: &mut bool,
    ) -> Vec<Candidate> {
        let now_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let mut taken: BTreeMap<&str, usize> = BTreeMap::new();
        let mut out = Vec::new();
        for candidate in candidates {
            let Some(pool) = pools.get(&candidate.pool_name) else { continue };
            let allowed = pool.allowed_disruptions(
                reason,
                self.cluster.pool_node_count(&candidate.pool_name),
                self.cluster.disrupting_count(&candidate.pool_name),
                now_epoch,
            );
            let used = taken.entry(candidate.pool_name.as_str()).or_insert(0);
            if *used >= allowed {
                *budget_blocked = true;
                debug!(
                    pool = %candidate.pool_name,
                    reason = %reason,
                    "budget exhausted, skipping candidate"
                );
                continue;
            }
            *used += 1;
            out.push(candidate.clone());
        }
        out
    }

    /// Expiration and Drift: take the first budgeted candidate whose
    /// reschedulable pods have somewhere to go and plan its replacement.
    async fn replace_method(
        &self,
        candidates: &[Candidate],
        reason: DisruptionReason,
        pools: &[NodePool],
    ) -> Result<Option<Proposal>> {
        for candidate in candidates {
            let sim = self
                .simulation_without(&[candidate.provider_id()], pools)
                .await?;
            let results = simulate(&sim, &candidate.reschedulable);
            if !results.all_placed() {
                debug!(
                    node = %candidate.state_node.node_name(),
                    reason = %reason,
                    "candidate pods cannot reschedule, skipping"
                );
                continue;
            }
            return Ok(Some(Proposal {
                candidates: vec![candidate.clone()],
                plans: results.new_node_claims,
            }));
        }
        Ok(None)
    }

    /// The cluster as it would look with these nodes gone.
    pub(crate) async fn simulation_without(
        &self,
        removed: &[ProviderId],
        pools: &[NodePool],
    ) -> Result<Simulation> {
        let mut contexts = Vec::new();
        for pool in pools {
            match self.catalog.instance_types(&self.provider, pool).await {
                Ok(types) => contexts.push(PoolContext {
                    current_usage: self.cluster.pool_resources(&pool.name()),
                    pool: pool.clone(),
                    instance_types: (*types).clone(),
                }),
                Err(e) => warn!(pool = %pool.name(), error = %e, "catalog fetch failed"),
            }
        }
        let mut existing = Vec::new();
        self.cluster.for_each_node(|sn| {
            if removed.contains(&sn.provider_id) {
                return;
            }
            existing.push(sn.clone());
        });
        let existing: Vec<ExistingNode> = existing
            .into_iter()
            .map(|sn| {
                let pods = self.cluster.pods_bound_to(&sn.node_name());
                ExistingNode::from_state(&sn, &pods)
            })
            .collect();
        Ok(Simulation {
            pools: contexts,
            existing,
            daemonsets: self.cluster.daemonset_templates(),
            overhead: self.overhead,
            bound: self
                .cluster
                .bound_pods()
                .into_iter()
                .filter(|(_, node)| {
                    !removed
                        .iter()
                        .any(|id| self.cluster.node_by_provider_id(id)
                            .map(|sn| sn.node_name() == *node)
                            .unwrap_or(false))
                })
                .collect(),
        })
    }

    /// Re-validate after the stability wait, launch replacements, and
    /// hand the command to the orchestration queue. True when submitted.
    async fn validate_and_submit(
        &self,
        proposal: Proposal,
        reason: DisruptionReason,
        ctype: Option<ConsolidationType>,
        pools: &[NodePool],
        shutdown: &mut signal::Receiver<bool>,
    ) -> Result<bool> {
        // Consolidation decisions must hold still for the TTL; churn
        // invalidates them.
        if ctype.is_some() {
            tokio::select! {
                _ = tokio::time::sleep(self.consolidation_ttl) => {}
                _ = shutdown.changed() => return Err(Error::Interrupted),
            }
        }

        let removed: Vec<ProviderId> =
            proposal.candidates.iter().map(|c| c.provider_id()).collect();
        let pods: Vec<Pod> = proposal
            .candidates
            .iter()
            .flat_map(|c| c.reschedulable.iter().cloned())
            .collect();
        let sim = self.simulation_without(&removed, pools).await?;
        let results = simulate(&sim, &pods);
        if !results.all_placed() || results.new_node_claims.len() > proposal.plans.len() {
            info!(reason = %reason, "validation failed, abandoning command");
            crate::metrics::DISRUPTION_DECISIONS
                .with_label_values(&[
                    &reason.to_string(),
                    "abandoned",
                    &ctype.map(|c| c.to_string()).unwrap_or_default(),
                ])
                .inc();
            return Ok(false);
        }

        // Launch replacements before any candidate is touched.
        let mut replacements = Vec::new();
        let api: Api<NodeClaim> = Api::all(self.client.clone());
        for plan in &proposal.plans {
            let Some(pool) = pools.iter().find(|p| p.name() == plan.pool) else { continue };
            let claim = claim_from_plan(plan, pool);
            api.create(&kube::api::PostParams::default(), &claim).await?;
            crate::metrics::NODECLAIMS_CREATED
                .with_label_values(&[&plan.pool, "disruption"])
                .inc();
            replacements.push(claim.name());
        }

        let command = Command {
            id: uuid::Uuid::new_v4(),
            reason,
            consolidation_type: ctype,
            candidates: proposal
                .candidates
                .iter()
                .map(|c| (c.provider_id(), c.claim.name()))
                .collect(),
            replacements,
            created_at: Instant::now(),
            last_error: None,
        };

        for candidate in &proposal.candidates {
            self.events
                .normal(
                    &crate::events::object_ref(&candidate.claim),
                    "DisruptionLaunched",
                    &format!("Disrupting node via {reason}"),
                )
                .await;
        }
        info!(
            command = %command.id,
            reason = %reason,
            candidates = command.candidates.len(),
            replacements = command.replacements.len(),
            "submitting disruption command"
        );
        crate::metrics::DISRUPTION_DECISIONS
            .with_label_values(&[
                &reason.to_string(),
                "launched",
                &ctype.map(|c| c.to_string()).unwrap_or_default(),
            ])
            .inc();
        self.cluster.mark_for_deletion(&removed);
        self.queue
            .submit(command)
            .map_err(|e| Error::Provider {
                source: crate::providers::provider::ProviderError::CreationFailed {
                    message: e.to_string(),
                },
            })?;
        Ok(true)
    }
}

/// A method's raw output: candidates to remove, replacement plans to
/// launch.
#[derive(Debug, Clone)]
pub(crate) struct Proposal {
    pub candidates: Vec<Candidate>,
    pub plans: Vec<crate::scheduling::NodeClaimPlan>,
}

/// Does this candidate already satisfy the method's own condition? Only
/// such candidates count against the method's budget.
fn eligible_for(candidate: &Candidate, reason: DisruptionReason) -> bool {
    match reason {
        DisruptionReason::Expired => candidate.claim.is_true(COND_EXPIRED),
        DisruptionReason::Drifted => candidate.claim.is_true(COND_DRIFTED),
        DisruptionReason::Empty => {
            candidate.claim.is_true(COND_EMPTY)
                && candidate.claim.is_true(COND_CONSOLIDATABLE)
                && candidate.reschedulable.is_empty()
        }
        DisruptionReason::Underutilized => consolidation::consolidatable(candidate),
    }
}

/// Emptiness: every budgeted empty candidate goes in one command, no
/// replacements.
fn emptiness(candidates: &[Candidate]) -> Option<Proposal> {
    if candidates.is_empty() {
        return None;
    }
    Some(Proposal {
        candidates: candidates.to_vec(),
        plans: vec![],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::nodepool::{Budget, tests_support::minimal_pool};
    use crate::apis::{NodeClaimSpec, nodepool::NodeClassRef, set_condition};
    use crate::requirements::LABEL_NODEPOOL;
    use crate::state::StateNode;
    use k8s_openapi::api::core::v1::{Node, NodeSpec};
    use kube::api::ObjectMeta;

    fn offline_client() -> Client {
        Client::try_from(kube::Config::new(
            "http://localhost:8080".parse().expect("static url"),
        ))
        .expect("local config")
    }

    fn engine(cluster: Arc<Cluster>) -> DisruptionEngine {
        let client = offline_client();
        let queue = Arc::new(queue::OrchestrationQueue::new(
            client.clone(),
            cluster.clone(),
            Duration::from_secs(600),
            Duration::from_secs(5),
        ));
        DisruptionEngine::new(
            client.clone(),
            cluster,
            Arc::new(Catalog::new(Duration::from_secs(300), Duration::from_secs(180))),
            Arc::new(CloudProvider::Fake(crate::providers::fake::FakeProvider::new())),
            queue,
            OverheadSettings::default(),
            Duration::from_secs(15),
        )
    }

    fn candidate(name: &str, pool: &str, conditions: &[&str]) -> Candidate {
        let mut claim = NodeClaim::new(
            name,
            NodeClaimSpec {
                node_class_ref: NodeClassRef::default(),
                ..Default::default()
            },
        );
        claim.metadata.labels = Some(
            [(LABEL_NODEPOOL.to_string(), pool.to_string())].into(),
        );
        claim.status_mut().provider_id = Some(format!("kwok://{name}"));
        for condition in conditions {
            set_condition(&mut claim.status_mut().conditions, condition, "True", condition, "");
        }
        let node = Node {
            metadata: ObjectMeta {
                name: Some(name.into()),
                labels: claim.metadata.labels.clone(),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                provider_id: Some(format!("kwok://{name}")),
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut sn = StateNode::from_claim(ProviderId(format!("kwok://{name}")), claim.clone());
        sn.with_node(node);
        Candidate {
            state_node: sn,
            claim,
            pool_name: pool.to_string(),
            reschedulable: vec![],
            price: Some(0.09),
            instance_type_in_catalog: true,
        }
    }

    /// Budgets measure against the pool's live node count, so the cache
    /// has to know about the candidates' claims.
    fn seeded_engine(candidates: &[Candidate]) -> DisruptionEngine {
        let cluster = Arc::new(Cluster::new());
        for c in candidates {
            cluster.update_node_claim(c.claim.clone());
        }
        engine(cluster)
    }

    #[tokio::test]
    async fn zero_budget_blocks_and_flags() {
        let mut pool = minimal_pool("p1");
        pool.spec.disruption.budgets = vec![Budget {
            nodes: "0".into(),
            reasons: vec![DisruptionReason::Drifted],
            schedule: None,
            duration: None,
        }];
        let pools: BTreeMap<String, NodePool> = [("p1".to_string(), pool)].into();
        let candidates = vec![candidate("n1", "p1", &[COND_DRIFTED])];
        let eng = seeded_engine(&candidates);

        let mut blocked = false;
        let budgeted =
            eng.budgeted_candidates(&candidates, &pools, DisruptionReason::Drifted, &mut blocked);
        assert!(budgeted.is_empty());
        assert!(blocked);

        // A different reason is unaffected by that budget.
        let mut blocked = false;
        let budgeted = eng.apply_budgets(&candidates, &pools, DisruptionReason::Expired, &mut blocked);
        assert_eq!(budgeted.len(), 1);
        assert!(!blocked);
    }

    #[tokio::test]
    async fn ineligible_candidates_never_consume_budget_slots() {
        // One budget slot for Drifted; the walk order puts a non-drifted
        // node first. The drifted node must still get the slot.
        let mut pool = minimal_pool("p1");
        pool.spec.disruption.budgets = vec![Budget {
            nodes: "1".into(),
            reasons: vec![DisruptionReason::Drifted],
            schedule: None,
            duration: None,
        }];
        let pools: BTreeMap<String, NodePool> = [("p1".to_string(), pool)].into();
        let candidates = vec![
            candidate("node-a", "p1", &[]),
            candidate("node-b", "p1", &[COND_DRIFTED]),
        ];
        let eng = seeded_engine(&candidates);

        let mut blocked = false;
        let budgeted =
            eng.budgeted_candidates(&candidates, &pools, DisruptionReason::Drifted, &mut blocked);
        assert_eq!(budgeted.len(), 1);
        assert_eq!(budgeted[0].claim.name(), "node-b");
        // The single slot went to the one real drifted candidate.
        assert!(!blocked);
    }

    #[test]
    fn eligibility_per_reason() {
        let drifted = candidate("n1", "p1", &[COND_DRIFTED]);
        let expired = candidate("n2", "p1", &[COND_EXPIRED]);
        let empty = candidate("n3", "p1", &[COND_EMPTY, COND_CONSOLIDATABLE]);
        let plain = candidate("n4", "p1", &[]);

        assert!(eligible_for(&drifted, DisruptionReason::Drifted));
        assert!(!eligible_for(&drifted, DisruptionReason::Expired));
        assert!(eligible_for(&expired, DisruptionReason::Expired));
        assert!(eligible_for(&empty, DisruptionReason::Empty));
        // Consolidatable gates Underutilized too.
        assert!(eligible_for(&empty, DisruptionReason::Underutilized));
        assert!(!eligible_for(&plain, DisruptionReason::Empty));
        assert!(!eligible_for(&plain, DisruptionReason::Underutilized));
    }

    #[test]
    fn emptiness_bundles_budgeted_candidates_without_replacements() {
        let proposal = emptiness(&[
            candidate("n1", "p1", &[COND_EMPTY, COND_CONSOLIDATABLE]),
            candidate("n2", "p1", &[COND_EMPTY, COND_CONSOLIDATABLE]),
        ])
        .expect("two empty candidates");
        assert_eq!(proposal.candidates.len(), 2);
        assert!(proposal.plans.is_empty());

        assert!(emptiness(&[]).is_none());
    }

    #[tokio::test]
    async fn consolidated_flag_tracks_cluster_sequence() {
        let cluster = Arc::new(Cluster::new());
        let eng = engine(cluster.clone());
        assert!(!eng.consolidated());

        let sequence = cluster.sequence();
        eng.note_consolidated(sequence, false);
        assert!(eng.consolidated());

        // Any cluster mutation invalidates the conclusion.
        cluster.note_node_pool_change();
        assert!(!eng.consolidated());
    }

    #[tokio::test]
    async fn stale_sequence_never_concludes_consolidated() {
        let cluster = Arc::new(Cluster::new());
        let eng = engine(cluster.clone());
        let before = cluster.sequence();
        cluster.note_node_pool_change();
        eng.note_consolidated(before, false);
        assert!(!eng.consolidated());
    }
}
