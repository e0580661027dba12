use std::sync::Arc;
use std::time::Duration;

use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client};
use serde_json::json;
use tokio::sync::watch as signal;
use tracing::{debug, warn};

use crate::apis::nodepool::{COND_NODECLASS_READY, COND_READY, COND_VALIDATION_SUCCEEDED};
use crate::apis::{
    ANNOTATION_HASH, ANNOTATION_HASH_VERSION, HASH_VERSION, NodePool, condition_is_true,
    set_condition,
};
use crate::errors::Result;
use crate::state::Cluster;

pub struct PoolStatusContext {
    pub client: Client,
    pub cluster: Arc<Cluster>,
}

/// Keeps NodePool status honest: content hash annotations for drift
/// detection, observed resource totals, and readiness conditions.
pub async fn run_pool_status_controller(
    ctx: Arc<PoolStatusContext>,
    interval: Duration,
    mut shutdown: signal::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tick.tick() => {
                if let Err(e) = reconcile_pools(&ctx).await {
                    warn!(error = %e, "nodepool status pass failed");
                }
            }
        }
    }
}

async fn reconcile_pools(ctx: &PoolStatusContext) -> Result<()> {
    let api: Api<NodePool> = Api::all(ctx.client.clone());
    for pool in api.list(&ListParams::default()).await?.items {
        let name = pool.name();
        stamp_hash(&api, &pool).await?;

        let resources = ctx.cluster.pool_resources(&name);
        for (resource, millis) in resources.iter() {
            crate::metrics::NODEPOOL_RESOURCES
                .with_label_values(&[&name, resource])
                .set(millis as f64 / 1000.0);
        }

        let mut conditions = pool
            .status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default();
        match pool.scheduling_requirements() {
            Ok(_) => {
                set_condition(&mut conditions, COND_VALIDATION_SUCCEEDED, "True", "Valid", "");
            }
            Err(e) => {
                set_condition(
                    &mut conditions,
                    COND_VALIDATION_SUCCEEDED,
                    "False",
                    "InvalidRequirements",
                    &e.to_string(),
                );
            }
        }
        // The NodeClass schema is provider-owned; its readiness rolls up
        // from the reference being resolvable at all.
        let class_ok = !pool.spec.template.spec.node_class_ref.name.is_empty();
        set_condition(
            &mut conditions,
            COND_NODECLASS_READY,
            if class_ok { "True" } else { "False" },
            if class_ok { "Resolved" } else { "Missing" },
            "",
        );
        let ready = condition_is_true(&conditions, COND_VALIDATION_SUCCEEDED)
            && condition_is_true(&conditions, COND_NODECLASS_READY);
        set_condition(
            &mut conditions,
            COND_READY,
            if ready { "True" } else { "False" },
            if ready { "Ready" } else { "NotReady" },
            "",
        );

        api.patch_status(
            &name,
            &PatchParams::default(),
            &Patch::Merge(json!({"status": {
                "resources": resources.to_quantities(),
                "conditions": conditions,
            }})),
        )
        .await?;
        debug!(pool = %name, resources = %resources, "nodepool status updated");
    }
    Ok(())
}

/// Keep the pool's own hash annotations current so NodeClaim drift
/// comparisons always have a reference point.
async fn stamp_hash(api: &Api<NodePool>, pool: &NodePool) -> Result<()> {
    let hash = pool.static_hash();
    let annotations = pool.metadata.annotations.clone().unwrap_or_default();
    let current = annotations.get(ANNOTATION_HASH);
    let version = annotations.get(ANNOTATION_HASH_VERSION).map(String::as_str);
    if current == Some(&hash) && version == Some(HASH_VERSION) {
        return Ok(());
    }
    api.patch(
        &pool.name(),
        &PatchParams::default(),
        &Patch::Merge(json!({"metadata": {"annotations": {
            ANNOTATION_HASH: hash,
            ANNOTATION_HASH_VERSION: HASH_VERSION,
        }}})),
    )
    .await?;
    Ok(())
}
