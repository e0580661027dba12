use std::sync::Arc;

use anyhow::Context;
use axum::{Router, routing::get};
use envconfig::Envconfig;
use kube::Client;
use tokio::net::TcpListener;
use tokio::sync::watch as signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use canopy::catalog::Catalog;
use canopy::config::Config;
use canopy::disruption::{DisruptionEngine, queue::OrchestrationQueue};
use canopy::events::EventPublisher;
use canopy::lifecycle::{LifecycleContext, run_garbage_collector, run_lifecycle_controller};
use canopy::pool_status::{PoolStatusContext, run_pool_status_controller};
use canopy::providers::kwok::KwokProvider;
use canopy::providers::provider::CloudProvider;
use canopy::provisioning::Provisioner;
use canopy::state::Cluster;
use canopy::state::watch::run_state_watchers;
use canopy::termination::{TerminationContext, run_termination_controller};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::init_from_env().context("loading configuration")?;
    info!(cluster = %config.cluster_name, "starting canopy");

    let client = Client::try_default()
        .await
        .context("initializing kubernetes client")?;
    let cluster = Arc::new(Cluster::new());
    let catalog = Arc::new(Catalog::new(config.catalog_ttl(), config.ice_ttl()));
    let provider = Arc::new(CloudProvider::Kwok(KwokProvider::new(
        client.clone(),
        config.overhead(),
    )));

    let (shutdown_tx, shutdown_rx) = signal::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let provisioner = Arc::new(Provisioner::new(
        client.clone(),
        cluster.clone(),
        catalog.clone(),
        provider.clone(),
        config.overhead(),
        config.nomination_ttl(),
    ));
    let queue = Arc::new(OrchestrationQueue::new(
        client.clone(),
        cluster.clone(),
        config.max_retry(),
        config.replacement_grace(),
    ));
    let engine = Arc::new(DisruptionEngine::new(
        client.clone(),
        cluster.clone(),
        catalog.clone(),
        provider.clone(),
        queue.clone(),
        config.overhead(),
        config.consolidation_ttl(),
    ));
    let lifecycle_ctx = Arc::new(LifecycleContext {
        client: client.clone(),
        cluster: cluster.clone(),
        catalog: catalog.clone(),
        provider: provider.clone(),
        events: EventPublisher::new(client.clone()),
        registration_ttl: config.registration_ttl(),
        initialization_ttl: config.initialization_ttl(),
        nomination_ttl: config.nomination_ttl(),
    });
    let termination_ctx = Arc::new(TerminationContext {
        client: client.clone(),
        cluster: cluster.clone(),
        provider: provider.clone(),
        events: EventPublisher::new(client.clone()),
    });
    let pool_status_ctx = Arc::new(PoolStatusContext {
        client: client.clone(),
        cluster: cluster.clone(),
    });

    let batch_window = config.batch_window();
    let mut tasks = tokio::task::JoinSet::new();
    {
        let (client, cluster, rx) = (client.clone(), cluster.clone(), shutdown_rx.clone());
        tasks.spawn(async move { run_state_watchers(client, cluster, rx).await });
    }
    {
        let (provisioner, rx) = (provisioner.clone(), shutdown_rx.clone());
        tasks.spawn(async move { provisioner.run(batch_window, rx).await });
    }
    {
        let (ctx, rx) = (lifecycle_ctx.clone(), shutdown_rx.clone());
        tasks.spawn(async move { run_lifecycle_controller(ctx, rx).await });
    }
    {
        let (ctx, rx) = (lifecycle_ctx.clone(), shutdown_rx.clone());
        tasks.spawn(async move {
            run_garbage_collector(ctx, std::time::Duration::from_secs(120), rx).await
        });
    }
    {
        let (ctx, rx) = (termination_ctx, shutdown_rx.clone());
        tasks.spawn(async move { run_termination_controller(ctx, rx).await });
    }
    {
        let (engine, rx) = (engine.clone(), shutdown_rx.clone());
        tasks.spawn(async move { engine.run(std::time::Duration::from_secs(10), rx).await });
    }
    {
        let (queue, rx) = (queue.clone(), shutdown_rx.clone());
        tasks.spawn(async move { queue.run(std::time::Duration::from_secs(2), rx).await });
    }
    {
        let (ctx, rx) = (pool_status_ctx, shutdown_rx.clone());
        tasks.spawn(async move {
            run_pool_status_controller(ctx, std::time::Duration::from_secs(30), rx).await
        });
    }

    serve_http(&config, cluster.clone(), shutdown_rx).await?;

    while tasks.join_next().await.is_some() {}
    info!("canopy stopped");
    Ok(())
}

/// Metrics on one listener, health and readiness probes on the other.
async fn serve_http(
    config: &Config,
    cluster: Arc<Cluster>,
    mut shutdown: signal::Receiver<bool>,
) -> anyhow::Result<()> {
    let metrics_app = Router::new().route("/metrics", get(|| async { canopy::metrics::gather() }));
    let probe_cluster = cluster.clone();
    let probe_app = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route(
            "/readyz",
            get(move || {
                let cluster = probe_cluster.clone();
                async move {
                    if cluster.synced() {
                        (axum::http::StatusCode::OK, "ok")
                    } else {
                        (axum::http::StatusCode::SERVICE_UNAVAILABLE, "state cache not synced")
                    }
                }
            }),
        );

    let metrics_listener = TcpListener::bind(&config.metrics_bind_addr)
        .await
        .context("binding metrics listener")?;
    let probe_listener = TcpListener::bind(&config.health_probe_bind_addr)
        .await
        .context("binding health probe listener")?;
    info!(
        metrics = %config.metrics_bind_addr,
        probes = %config.health_probe_bind_addr,
        "serving http"
    );

    tokio::select! {
        r = axum::serve(metrics_listener, metrics_app) => r.context("metrics server")?,
        r = axum::serve(probe_listener, probe_app) => r.context("probe server")?,
        _ = shutdown.changed() => {}
    }
    Ok(())
}
