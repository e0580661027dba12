use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Taint};
use kube::api::{DeleteParams, EvictParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tokio::sync::watch as signal;
use tracing::{debug, info, warn};

use crate::apis::{
    ANNOTATION_DO_NOT_DISRUPT, COND_INSTANCE_TERMINATING, NodeClaim, TAINT_DISRUPTED,
    TERMINATION_FINALIZER, rfc3339_age_secs, set_condition,
};
use crate::errors::Error;
use crate::events::{EventPublisher, object_ref};
use crate::providers::provider::{CloudProvider, ProviderId};
use crate::state::{Cluster, is_daemonset_pod};

pub struct TerminationContext {
    pub client: Client,
    pub cluster: Arc<Cluster>,
    pub provider: Arc<CloudProvider>,
    pub events: EventPublisher,
}

/// Walks a deleting NodeClaim through drain and instance termination,
/// then releases the finalizer. Deletion cannot complete before this
/// controller says so.
pub async fn run_termination_controller(
    ctx: Arc<TerminationContext>,
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

fn on_error(_claim: Arc<NodeClaim>, error: &Error, _ctx: Arc<TerminationContext>) -> Action {
    warn!(error = %error, "termination reconcile failed");
    Action::requeue(Duration::from_secs(5))
}

async fn reconcile(claim: Arc<NodeClaim>, ctx: Arc<TerminationContext>) -> Result<Action, Error> {
    if !claim.is_terminating() {
        return Ok(Action::await_change());
    }

    let state_node = claim
        .provider_id()
        .map(ProviderId::from)
        .and_then(|id| ctx.cluster.node_by_provider_id(&id));

    // Stop new pods from binding while we drain.
    if let Some(node) = state_node.as_ref().and_then(|sn| sn.node().cloned()) {
        taint_node(&ctx, &node).await?;
    }

    let node_name = state_node.as_ref().map(|sn| sn.node_name());
    if let Some(node_name) = node_name.as_deref() {
        let remaining = drain(&claim, &ctx, node_name).await?;
        if remaining > 0 {
            debug!(node_claim = %claim.name(), remaining, "drain in progress");
            return Ok(Action::requeue(Duration::from_secs(5)));
        }
    }

    // Drained (or no node ever joined): take the instance down.
    match ctx.provider.delete(&claim).await {
        Ok(()) => {
            debug!(node_claim = %claim.name(), "instance delete issued");
        }
        Err(e) if e.is_not_found() => {}
        Err(e) => {
            // Transient; retry until the provider confirms it is gone.
            warn!(node_claim = %claim.name(), error = %e, "instance delete failed");
            return Ok(Action::requeue(Duration::from_secs(5)));
        }
    }

    // Confirm the instance is gone before releasing the finalizer.
    if let Some(pid) = claim.provider_id() {
        match ctx.provider.get(&ProviderId(pid.to_string())).await {
            Err(e) if e.is_not_found() => {}
            Ok(_) => return Ok(Action::requeue(Duration::from_secs(5))),
            Err(_) => return Ok(Action::requeue(Duration::from_secs(5))),
        }
    }

    let mut conditions = claim.conditions().to_vec();
    set_condition(
        &mut conditions,
        COND_INSTANCE_TERMINATING,
        "True",
        "InstanceTerminated",
        "",
    );
    let api: Api<NodeClaim> = Api::all(ctx.client.clone());
    api.patch_status(
        &claim.name(),
        &PatchParams::default(),
        &Patch::Merge(json!({"status": {"conditions": conditions}})),
    )
    .await?;

    remove_finalizer(&ctx, &claim).await?;
    crate::metrics::NODECLAIMS_TERMINATED
        .with_label_values(&[
            claim.node_pool_name().unwrap_or("unknown"),
            "terminated",
        ])
        .inc();
    ctx.events
        .normal(&object_ref(claim.as_ref()), "Terminated", "Instance terminated and drained")
        .await;
    info!(node_claim = %claim.name(), "termination complete");
    Ok(Action::await_change())
}

async fn taint_node(ctx: &TerminationContext, node: &k8s_openapi::api::core::v1::Node) -> Result<(), Error> {
    let mut taints = node
        .spec
        .as_ref()
        .and_then(|s| s.taints.clone())
        .unwrap_or_default();
    if taints.iter().any(|t| t.key == TAINT_DISRUPTED) {
        return Ok(());
    }
    taints.push(Taint {
        key: TAINT_DISRUPTED.into(),
        effect: "NoSchedule".into(),
        ..Default::default()
    });
    let api: Api<k8s_openapi::api::core::v1::Node> = Api::all(ctx.client.clone());
    api.patch(
        &node.name_any(),
        &PatchParams::default(),
        &Patch::Merge(json!({"spec": {"taints": taints}})),
    )
    .await?;
    Ok(())
}

/// Evict pods in waves: ordinary pods first, daemonset pods only once
/// nothing else remains. Returns how many pods still stand in the way.
async fn drain(claim: &NodeClaim, ctx: &TerminationContext, node_name: &str) -> Result<usize, Error> {
    let pods = ctx.cluster.pods_bound_to(node_name);
    let (daemonset_pods, workload_pods): (Vec<Pod>, Vec<Pod>) =
        pods.into_iter().partition(is_daemonset_pod);

    let grace_elapsed = claim_grace_elapsed(claim);
    let wave: &[Pod] = if workload_pods.is_empty() {
        &daemonset_pods
    } else {
        &workload_pods
    };

    let mut blocking = 0usize;
    for pod in wave {
        if pod.metadata.deletion_timestamp.is_some() {
            blocking += 1;
            continue;
        }
        let do_not_disrupt = pod
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(ANNOTATION_DO_NOT_DISRUPT))
            .is_some_and(|v| v == "true");

        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let name = pod.name_any();
        let api: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);

        if do_not_disrupt && !grace_elapsed {
            // Respected until the claim's own grace period runs out.
            blocking += 1;
            continue;
        }
        if do_not_disrupt && grace_elapsed {
            ctx.events
                .warning(
                    &object_ref(pod),
                    "ForcedEviction",
                    "do-not-disrupt grace period expired; force deleting pod",
                )
                .await;
            match api
                .delete(
                    &name,
                    &DeleteParams {
                        grace_period_seconds: Some(0),
                        ..Default::default()
                    },
                )
                .await
            {
                Ok(_) => {}
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(e) => warn!(pod = %name, error = %e, "force delete failed"),
            }
            blocking += 1;
            continue;
        }

        // The eviction grace comes from the claim, not the pod: a node
        // with 60 s to live must not wait out a pod's own 10 min.
        let evict_params = EvictParams {
            delete_options: Some(DeleteParams {
                grace_period_seconds: claim
                    .spec
                    .termination_grace_period_seconds
                    .and_then(|g| u32::try_from(g).ok()),
                ..Default::default()
            }),
            ..Default::default()
        };
        match api.evict(&name, &evict_params).await {
            Ok(_) => debug!(pod = %name, node = node_name, "evicted"),
            Err(kube::Error::Api(e)) if e.code == 404 => continue,
            Err(e) => {
                // PDB pushback or transient failure: event and move on;
                // the next pass retries.
                ctx.events
                    .warning(&object_ref(pod), "EvictionFailed", &e.to_string())
                    .await;
            }
        }
        blocking += 1;
    }
    // Daemonset pods not yet waved still stand between us and the
    // provider delete.
    if !workload_pods.is_empty() {
        blocking += daemonset_pods.len();
    }
    Ok(blocking)
}

/// Has the claim's terminationGracePeriodSeconds elapsed since deletion
/// was requested? Past this point do-not-disrupt loses its veto.
fn claim_grace_elapsed(claim: &NodeClaim) -> bool {
    let Some(grace) = claim.spec.termination_grace_period_seconds else {
        return false;
    };
    claim
        .metadata
        .deletion_timestamp
        .as_ref()
        .and_then(|t| rfc3339_age_secs(&t.0.to_string()))
        .map(|age| age >= grace)
        .unwrap_or(false)
}

async fn remove_finalizer(ctx: &TerminationContext, claim: &NodeClaim) -> Result<(), Error> {
    let finalizers: Vec<String> = claim
        .metadata
        .finalizers
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|f| f != TERMINATION_FINALIZER)
        .collect();
    let api: Api<NodeClaim> = Api::all(ctx.client.clone());
    match api
        .patch(
            &claim.name(),
            &PatchParams::default(),
            &Patch::Merge(json!({"metadata": {"finalizers": finalizers}})),
        )
        .await
    {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::NodeClaimSpec;
    use crate::apis::nodepool::NodeClassRef;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn terminating_claim(grace: Option<i64>, deleted_secs_ago: i64) -> NodeClaim {
        let mut claim = NodeClaim::new(
            "nc1",
            NodeClaimSpec {
                termination_grace_period_seconds: grace,
                node_class_ref: NodeClassRef::default(),
                ..Default::default()
            },
        );
        let then = k8s_openapi::jiff::Timestamp::now()
            .checked_sub(k8s_openapi::jiff::Span::new().seconds(deleted_secs_ago))
            .expect("timestamp in range");
        claim.metadata.deletion_timestamp = Some(Time(then));
        claim
    }

    #[test]
    fn grace_elapses_only_after_the_claim_period() {
        assert!(!claim_grace_elapsed(&terminating_claim(Some(60), 30)));
        assert!(claim_grace_elapsed(&terminating_claim(Some(60), 61)));
        // No grace period configured: do-not-disrupt holds indefinitely.
        assert!(!claim_grace_elapsed(&terminating_claim(None, 10_000)));
    }
}
