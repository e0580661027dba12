use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use kube::api::{DeleteParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Client};
use serde_json::json;
use tokio::sync::watch as signal;
use tracing::{debug, info, warn};

use crate::apis::{
    ANNOTATION_HASH, ANNOTATION_HASH_VERSION, ANNOTATION_NOMINATED_PODS, COND_CONSOLIDATABLE,
    COND_DRIFTED, COND_EMPTY, COND_EXPIRED, COND_INITIALIZED, COND_LAUNCHED, COND_REGISTERED,
    DRIFT_INSTANCE_TYPE_NOT_FOUND, DRIFT_REQUIREMENTS, DRIFT_STATIC, HASH_VERSION, NodeClaim,
    NodePool, condition_age_secs, rfc3339_age_secs, now_rfc3339, set_condition,
};
use crate::apis::nodepool::ConsolidationPolicy;
use crate::catalog::{CapacityType, Catalog};
use crate::errors::Error;
use crate::events::{EventPublisher, object_ref};
use crate::providers::provider::{CloudProvider, ProviderError, ProviderId};
use crate::requirements::LABEL_INSTANCE_TYPE;
use crate::state::{Cluster, is_daemonset_pod};

/// How many alternative offerings a single launch attempt walks before
/// giving up on the claim.
const MAX_LAUNCH_ATTEMPTS: usize = 3;

pub struct LifecycleContext {
    pub client: Client,
    pub cluster: Arc<Cluster>,
    pub catalog: Arc<Catalog>,
    pub provider: Arc<CloudProvider>,
    pub events: EventPublisher,
    /// Launched without a Node for this long means Failed.
    pub registration_ttl: Duration,
    /// Registered without initializing for this long means Failed.
    pub initialization_ttl: Duration,
    pub nomination_ttl: Duration,
}

/// Drive NodeClaims through Launched -> Registered -> Initialized, keep
/// their disruption-facing conditions (Empty, Consolidatable, Expired,
/// Drifted) current, and fail claims that stall.
pub async fn run_lifecycle_controller(
    ctx: Arc<LifecycleContext>,
    mut shutdown: signal::Receiver<bool>,
) {
    let api: Api<NodeClaim> = Api::all(ctx.client.clone());
    let controller = Controller::new(api, watcher::Config::default())
        .run(reconcile, on_error, ctx)
        .for_each(|_| async {});
    let mut controller = pin!(controller);
    tokio::select! {
        _ = &mut controller => {}
        _ = shutdown.changed() => {}
    }
}

fn on_error(_claim: Arc<NodeClaim>, error: &Error, _ctx: Arc<LifecycleContext>) -> Action {
    warn!(error = %error, "nodeclaim reconcile failed");
    Action::requeue(Duration::from_secs(5))
}

async fn reconcile(claim: Arc<NodeClaim>, ctx: Arc<LifecycleContext>) -> Result<Action, Error> {
    if claim.is_terminating() {
        // The termination controller owns the rest of this claim's life.
        return Ok(Action::await_change());
    }

    if !claim.is_launched() {
        return launch(&claim, &ctx).await;
    }
    if !claim.is_registered() {
        return registration(&claim, &ctx).await;
    }
    if !claim.is_initialized() {
        return initialization(&claim, &ctx).await;
    }
    steady_state(&claim, &ctx).await
}

async fn launch(claim: &NodeClaim, ctx: &LifecycleContext) -> Result<Action, Error> {
    let mut attempt = claim.clone();
    let mut excluded: Vec<String> = Vec::new();

    for _ in 0..MAX_LAUNCH_ATTEMPTS {
        match ctx.provider.create(&attempt).await {
            Ok(launched) => {
                let status = launched.status.clone().unwrap_or_default();
                let mut conditions = claim.conditions().to_vec();
                set_condition(&mut conditions, COND_LAUNCHED, "True", "Launched", "");
                let api: Api<NodeClaim> = Api::all(ctx.client.clone());
                api.patch_status(
                    &claim.name(),
                    &PatchParams::default(),
                    &Patch::Merge(json!({"status": {
                        "providerId": status.provider_id,
                        "imageId": status.image_id,
                        "capacity": status.capacity,
                        "allocatable": status.allocatable,
                        "conditions": conditions,
                    }})),
                )
                .await?;
                if let Some(created) = claim.metadata.creation_timestamp.as_ref() {
                    if let Some(age) = rfc3339_age_secs(&created.0.to_string()) {
                        crate::metrics::LAUNCH_SECONDS.observe(age.max(0) as f64);
                    }
                }
                ctx.events
                    .normal(&object_ref(claim), "Launched", "Cloud provider returned an instance")
                    .await;
                nominate_pods(claim, &status.provider_id, ctx).await;
                info!(node_claim = %claim.name(), provider_id = ?status.provider_id, "launched");
                return Ok(Action::requeue(Duration::from_secs(5)));
            }
            Err(ProviderError::InsufficientCapacity {
                instance_type,
                zone,
                capacity_type,
            }) => {
                if instance_type == "*" {
                    break;
                }
                let ct = match capacity_type.as_str() {
                    "spot" => CapacityType::Spot,
                    "reserved" => CapacityType::Reserved,
                    _ => CapacityType::OnDemand,
                };
                ctx.catalog.mark_unavailable(&instance_type, &zone, ct);
                excluded.push(instance_type.clone());
                debug!(node_claim = %claim.name(), instance_type, zone, "offering unavailable, retrying with remainder");
                // Retry with the failed type carved out of the set.
                if !narrow_requirements(&mut attempt, &excluded) {
                    break;
                }
            }
            Err(e @ ProviderError::Internal(_)) => return Err(e.into()),
            Err(e) => {
                return fail_claim(claim, ctx, "LaunchFailed", &e.to_string()).await;
            }
        }
    }
    fail_claim(claim, ctx, "InsufficientCapacity", "all compatible offerings exhausted").await
}

/// Remove excluded instance types from the claim's In-set. False when
/// nothing remains.
fn narrow_requirements(claim: &mut NodeClaim, excluded: &[String]) -> bool {
    for req in claim.spec.requirements.iter_mut() {
        if req.key == LABEL_INSTANCE_TYPE && req.operator == crate::requirements::Operator::In {
            req.values.retain(|v| !excluded.contains(v));
            return !req.values.is_empty();
        }
    }
    false
}

/// A claim that cannot launch is marked Failed and deleted; its pending
/// pods are still unschedulable and re-enter the next provisioning pass.
async fn fail_claim(
    claim: &NodeClaim,
    ctx: &LifecycleContext,
    reason: &str,
    message: &str,
) -> Result<Action, Error> {
    warn!(node_claim = %claim.name(), reason, message, "failing nodeclaim");
    let mut conditions = claim.conditions().to_vec();
    set_condition(&mut conditions, COND_LAUNCHED, "False", reason, message);
    let api: Api<NodeClaim> = Api::all(ctx.client.clone());
    api.patch_status(
        &claim.name(),
        &PatchParams::default(),
        &Patch::Merge(json!({"status": {"conditions": conditions}})),
    )
    .await?;
    ctx.events.warning(&object_ref(claim), reason, message).await;
    api.delete(&claim.name(), &DeleteParams::default()).await?;
    Ok(Action::await_change())
}

async fn nominate_pods(claim: &NodeClaim, provider_id: &Option<String>, ctx: &LifecycleContext) {
    let Some(pid) = provider_id else { return };
    ctx.cluster
        .nominate(&ProviderId(pid.clone()), ctx.nomination_ttl);
    let Some(nominated) = claim
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_NOMINATED_PODS))
    else {
        return;
    };
    for pod in nominated.split(',').filter(|s| !s.is_empty()) {
        debug!(pod, node_claim = %claim.name(), "pod nominated against launched claim");
    }
}

async fn registration(claim: &NodeClaim, ctx: &LifecycleContext) -> Result<Action, Error> {
    let paired = claim
        .provider_id()
        .map(ProviderId::from)
        .and_then(|id| ctx.cluster.node_by_provider_id(&id))
        .and_then(|sn| sn.node().cloned());

    if let Some(node) = paired {
        let mut conditions = claim.conditions().to_vec();
        set_condition(&mut conditions, COND_REGISTERED, "True", "NodeJoined", "");
        let api: Api<NodeClaim> = Api::all(ctx.client.clone());
        api.patch_status(
            &claim.name(),
            &PatchParams::default(),
            &Patch::Merge(json!({"status": {"conditions": conditions}})),
        )
        .await?;
        if let Some(age) = condition_age_secs(claim.conditions(), COND_LAUNCHED) {
            crate::metrics::REGISTRATION_SECONDS.observe(age.max(0) as f64);
        }
        ctx.events
            .normal(
                &object_ref(claim),
                "Registered",
                &format!("Node {} joined", node.metadata.name.as_deref().unwrap_or("")),
            )
            .await;
        return Ok(Action::requeue(Duration::from_secs(5)));
    }

    if let Some(age) = condition_age_secs(claim.conditions(), COND_LAUNCHED)
        && age.max(0) as u64 > ctx.registration_ttl.as_secs()
    {
        // Instance never joined; reclaim it.
        let _ = ctx.provider.delete(claim).await;
        return fail_claim(claim, ctx, "RegistrationTimeout", "node never joined the cluster").await;
    }
    Ok(Action::requeue(Duration::from_secs(5)))
}

async fn initialization(claim: &NodeClaim, ctx: &LifecycleContext) -> Result<Action, Error> {
    let state_node = claim
        .provider_id()
        .map(ProviderId::from)
        .and_then(|id| ctx.cluster.node_by_provider_id(&id));

    let ready = state_node.as_ref().is_some_and(|sn| {
        sn.node().is_some_and(crate::state::node_is_ready)
            && sn.startup_taints_cleared()
            && resources_registered(claim, sn)
    });

    if ready {
        let mut conditions = claim.conditions().to_vec();
        set_condition(&mut conditions, COND_INITIALIZED, "True", "Initialized", "");
        let api: Api<NodeClaim> = Api::all(ctx.client.clone());
        api.patch_status(
            &claim.name(),
            &PatchParams::default(),
            &Patch::Merge(json!({"status": {"conditions": conditions}})),
        )
        .await?;
        if let Some(age) = condition_age_secs(claim.conditions(), COND_REGISTERED) {
            crate::metrics::INITIALIZATION_SECONDS.observe(age.max(0) as f64);
        }
        ctx.events
            .normal(&object_ref(claim), "Initialized", "Node is ready and fully resourced")
            .await;
        return Ok(Action::requeue(Duration::from_secs(30)));
    }

    if let Some(age) = condition_age_secs(claim.conditions(), COND_REGISTERED)
        && age.max(0) as u64 > ctx.initialization_ttl.as_secs()
    {
        let _ = ctx.provider.delete(claim).await;
        return fail_claim(claim, ctx, "InitializationTimeout", "node never became ready").await;
    }
    Ok(Action::requeue(Duration::from_secs(5)))
}

/// Every resource the launch promised is visible on the node.
fn resources_registered(claim: &NodeClaim, sn: &crate::state::StateNode) -> bool {
    let node_alloc = sn
        .node()
        .and_then(|n| n.status.as_ref())
        .and_then(|s| s.allocatable.as_ref())
        .cloned()
        .unwrap_or_default();
    claim
        .status
        .as_ref()
        .map(|s| s.allocatable.keys().all(|k| node_alloc.contains_key(k)))
        .unwrap_or(false)
}

/// Initialized claims: keep the disruption-facing conditions current.
async fn steady_state(claim: &NodeClaim, ctx: &LifecycleContext) -> Result<Action, Error> {
    let pool = node_pool_of(claim, ctx).await?;
    let mut conditions = claim.conditions().to_vec();
    let mut status_extra = serde_json::Map::new();

    let state_node = claim
        .provider_id()
        .map(ProviderId::from)
        .and_then(|id| ctx.cluster.node_by_provider_id(&id));
    let reschedulable = state_node
        .as_ref()
        .map(|sn| {
            ctx.cluster
                .pods_bound_to(&sn.node_name())
                .iter()
                .filter(|p| !is_daemonset_pod(p))
                .count()
        })
        .unwrap_or(0);

    let was_empty = crate::apis::condition_is_true(&conditions, COND_EMPTY);
    let is_empty = reschedulable == 0;
    if set_condition(
        &mut conditions,
        COND_EMPTY,
        if is_empty { "True" } else { "False" },
        if is_empty { "NoReschedulablePods" } else { "PodsBound" },
        "",
    ) && was_empty != is_empty
    {
        status_extra.insert("lastPodEventTime".into(), json!(now_rfc3339()));
    }

    update_consolidatable(&mut conditions, pool.as_ref(), is_empty);
    update_expired(&mut conditions, claim, pool.as_ref());
    update_drifted(&mut conditions, claim, pool.as_ref(), ctx).await?;

    let mut status = serde_json::Map::new();
    status.insert("conditions".into(), serde_json::to_value(&conditions)?);
    status.extend(status_extra);
    let api: Api<NodeClaim> = Api::all(ctx.client.clone());
    api.patch_status(
        &claim.name(),
        &PatchParams::default(),
        &Patch::Merge(json!({"status": serde_json::Value::Object(status)})),
    )
    .await?;
    Ok(Action::requeue(Duration::from_secs(30)))
}

async fn node_pool_of(claim: &NodeClaim, ctx: &LifecycleContext) -> Result<Option<NodePool>, Error> {
    let Some(pool_name) = claim.node_pool_name() else {
        return Ok(None);
    };
    let api: Api<NodePool> = Api::all(ctx.client.clone());
    Ok(api.get_opt(pool_name).await?)
}

fn update_consolidatable(
    conditions: &mut Vec<crate::apis::Condition>,
    pool: Option<&NodePool>,
    is_empty: bool,
) {
    let Some(pool) = pool else { return };
    let policy = &pool.spec.disruption.consolidation_policy;
    let eligible = match policy {
        ConsolidationPolicy::Disabled => false,
        ConsolidationPolicy::WhenEmpty => is_empty,
        ConsolidationPolicy::WhenEmptyOrUnderutilized => true,
    };
    let idle_long_enough = match pool.consolidate_after() {
        None => true,
        Some(after) => condition_age_secs(conditions, COND_EMPTY)
            .map(|age| age as u64 >= after.as_secs())
            .unwrap_or(false),
    };
    let value = eligible && idle_long_enough;
    set_condition(
        conditions,
        COND_CONSOLIDATABLE,
        if value { "True" } else { "False" },
        if value { "Consolidatable" } else { "NotConsolidatable" },
        "",
    );
}

fn update_expired(
    conditions: &mut Vec<crate::apis::Condition>,
    claim: &NodeClaim,
    pool: Option<&NodePool>,
) {
    let expire_after = claim
        .spec
        .expire_after
        .as_deref()
        .and_then(|s| parse_duration::parse(s).ok())
        .or_else(|| pool.and_then(|p| p.expire_after()));
    let Some(expire_after) = expire_after else {
        return;
    };
    let expired = claim
        .metadata
        .creation_timestamp
        .as_ref()
        .and_then(|t| rfc3339_age_secs(&t.0.to_string()))
        .map(|age| age as u64 >= expire_after.as_secs())
        .unwrap_or(false);
    if expired {
        set_condition(conditions, COND_EXPIRED, "True", "TTLExpired", "");
    }
}

async fn update_drifted(
    conditions: &mut Vec<crate::apis::Condition>,
    claim: &NodeClaim,
    pool: Option<&NodePool>,
    ctx: &LifecycleContext,
) -> Result<(), Error> {
    let Some(pool) = pool else {
        return Ok(());
    };

    // Static drift compares content hashes, guarded by the hash version:
    // an algorithm change must not read as user drift.
    let annotations = claim.metadata.annotations.clone().unwrap_or_default();
    let claim_version = annotations.get(ANNOTATION_HASH_VERSION).map(String::as_str);
    if claim_version == Some(HASH_VERSION) {
        if let Some(claim_hash) = annotations.get(ANNOTATION_HASH)
            && *claim_hash != pool.static_hash()
        {
            set_condition(conditions, COND_DRIFTED, "True", DRIFT_STATIC, "nodepool template changed");
            return Ok(());
        }
    } else {
        // Hash scheme changed under us; silently upgrade the stamp.
        let api: Api<NodeClaim> = Api::all(ctx.client.clone());
        api.patch(
            &claim.name(),
            &PatchParams::default(),
            &Patch::Merge(json!({"metadata": {"annotations": {
                ANNOTATION_HASH: pool.static_hash(),
                ANNOTATION_HASH_VERSION: HASH_VERSION,
            }}})),
        )
        .await?;
        return Ok(());
    }

    // Requirement drift: the live node no longer satisfies the pool.
    if let Ok(pool_reqs) = pool.scheduling_requirements() {
        let labels = claim
            .provider_id()
            .map(ProviderId::from)
            .and_then(|id| ctx.cluster.node_by_provider_id(&id))
            .map(|sn| sn.labels())
            .unwrap_or_else(|| claim.metadata.labels.clone().unwrap_or_default());
        if !pool_reqs.matches_labels(&labels) {
            set_condition(
                conditions,
                COND_DRIFTED,
                "True",
                DRIFT_REQUIREMENTS,
                "node labels no longer satisfy nodepool requirements",
            );
            return Ok(());
        }
    }

    // The instance type backing this node left the catalog.
    if let Ok(types) = ctx.catalog.instance_types(&ctx.provider, pool).await {
        let current_type = claim
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(LABEL_INSTANCE_TYPE));
        if let Some(current) = current_type
            && !types.iter().any(|it| &it.name == current)
        {
            set_condition(
                conditions,
                COND_DRIFTED,
                "True",
                DRIFT_INSTANCE_TYPE_NOT_FOUND,
                "instance type no longer offered",
            );
            return Ok(());
        }
    }

    if let Some(reason) = ctx.provider.is_drifted(claim).await? {
        set_condition(conditions, COND_DRIFTED, "True", &reason, "provider reported drift");
        return Ok(());
    }

    set_condition(conditions, COND_DRIFTED, "False", "InSync", "");
    Ok(())
}

/// Periodically reconcile provider instances against claims: delete cloud
/// instances nothing claims, and fail claims whose instance vanished.
pub async fn run_garbage_collector(
    ctx: Arc<LifecycleContext>,
    interval: Duration,
    mut shutdown: signal::Receiver<bool>,
) {
    let grace = Duration::from_secs(300);
    let mut tick = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tick.tick() => {
                if let Err(e) = collect_garbage(&ctx, grace).await {
                    warn!(error = %e, "garbage collection pass failed");
                }
            }
        }
    }
}

async fn collect_garbage(ctx: &LifecycleContext, grace: Duration) -> Result<(), Error> {
    if !ctx.cluster.synced() {
        return Ok(());
    }
    let instances = ctx.provider.list().await?;
    for instance in instances {
        let name = instance.name();
        let claimed = ctx.cluster.claim_by_name(&name).is_some()
            || ctx
                .cluster
                .unlaunched_claims()
                .iter()
                .any(|c| c.name() == name);
        if claimed {
            continue;
        }
        let age = instance
            .metadata
            .creation_timestamp
            .as_ref()
            .and_then(|t| rfc3339_age_secs(&t.0.to_string()))
            .unwrap_or(i64::MAX);
        if age as u64 > grace.as_secs() {
            info!(instance = %name, "deleting orphaned instance");
            match ctx.provider.delete(&instance).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(instance = %name, error = %e, "orphan delete failed"),
            }
        }
    }
    Ok(())
}
