use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client, ResourceExt};
use tokio::sync::watch as signal;
use tracing::warn;

use crate::apis::{NodeClaim, NodePool};
use crate::state::{Cluster, PodId};

/// Feed the cluster state cache from watches on every kind it mirrors.
/// Resolves when the shutdown signal fires.
pub async fn run_state_watchers(
    client: Client,
    cluster: Arc<Cluster>,
    shutdown: signal::Receiver<bool>,
) {
    tokio::join!(
        watch_nodes(client.clone(), cluster.clone(), shutdown.clone()),
        watch_pods(client.clone(), cluster.clone(), shutdown.clone()),
        watch_node_claims(client.clone(), cluster.clone(), shutdown.clone()),
        watch_node_pools(client.clone(), cluster.clone(), shutdown.clone()),
        watch_daemon_sets(client, cluster, shutdown),
    );
}

macro_rules! watch_loop {
    ($api:expr, $shutdown:expr, $apply:expr, $delete:expr, $synced:expr) => {{
        let mut shutdown = $shutdown;
        let mut stream = pin!(watcher::watcher($api, watcher::Config::default()).boxed());
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                event = stream.next() => match event {
                    Some(Ok(Event::Init)) => {}
                    Some(Ok(Event::InitApply(obj))) | Some(Ok(Event::Apply(obj))) => $apply(obj),
                    Some(Ok(Event::InitDone)) => $synced(),
                    Some(Ok(Event::Delete(obj))) => $delete(obj),
                    Some(Err(e)) => {
                        warn!(error = %e, "watch stream error, backing off");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                    None => return,
                }
            }
        }
    }};
}

async fn watch_nodes(client: Client, cluster: Arc<Cluster>, shutdown: signal::Receiver<bool>) {
    let api: Api<Node> = Api::all(client);
    watch_loop!(
        api,
        shutdown,
        |n: Node| cluster.update_node(n),
        |n: Node| cluster.delete_node(&n.name_any()),
        || cluster.mark_synced("nodes")
    )
}

async fn watch_pods(client: Client, cluster: Arc<Cluster>, shutdown: signal::Receiver<bool>) {
    let api: Api<Pod> = Api::all(client);
    watch_loop!(
        api,
        shutdown,
        |p: Pod| cluster.update_pod(p),
        |p: Pod| cluster.delete_pod(&PodId::from_pod(&p)),
        || cluster.mark_synced("pods")
    )
}

async fn watch_node_claims(
    client: Client,
    cluster: Arc<Cluster>,
    shutdown: signal::Receiver<bool>,
) {
    let api: Api<NodeClaim> = Api::all(client);
    watch_loop!(
        api,
        shutdown,
        |c: NodeClaim| cluster.update_node_claim(c),
        |c: NodeClaim| cluster.delete_node_claim(&c.name()),
        || cluster.mark_synced("nodeclaims")
    )
}

async fn watch_node_pools(
    client: Client,
    cluster: Arc<Cluster>,
    shutdown: signal::Receiver<bool>,
) {
    let api: Api<NodePool> = Api::all(client);
    // Pools are not mirrored; the watch exists so pool edits invalidate
    // any standing "nothing to consolidate" conclusion.
    watch_loop!(
        api,
        shutdown,
        |_p: NodePool| cluster.note_node_pool_change(),
        |_p: NodePool| cluster.note_node_pool_change(),
        || cluster.mark_synced("nodepools")
    )
}

async fn watch_daemon_sets(
    client: Client,
    cluster: Arc<Cluster>,
    shutdown: signal::Receiver<bool>,
) {
    let api: Api<DaemonSet> = Api::all(client);
    watch_loop!(
        api,
        shutdown,
        |d: DaemonSet| cluster.update_daemon_set(d),
        |d: DaemonSet| cluster.delete_daemon_set(
            d.metadata.namespace.as_deref().unwrap_or_default(),
            &d.name_any()
        ),
        || cluster.mark_synced("daemonsets")
    )
}
