use lazy_static::lazy_static;
use prometheus::{
    Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

fn histogram(name: &str, help: &str) -> Histogram {
    let h = Histogram::with_opts(
        HistogramOpts::new(name, help).buckets(vec![
            0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0,
        ]),
    )
    .expect("valid histogram opts");
    REGISTRY.register(Box::new(h.clone())).expect("unique metric");
    h
}

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    /// Observed resource totals per nodepool, mirroring NodePool status.
    pub static ref NODEPOOL_RESOURCES: GaugeVec = {
        let g = GaugeVec::new(
            Opts::new("canopy_nodepool_resources", "Aggregate resources over a nodepool's member nodes"),
            &["nodepool", "resource"],
        ).expect("valid opts");
        REGISTRY.register(Box::new(g.clone())).expect("unique metric");
        g
    };

    /// One increment per disruption decision, labelled with the outcome.
    pub static ref DISRUPTION_DECISIONS: IntCounterVec = {
        let c = IntCounterVec::new(
            Opts::new("canopy_disruption_decisions_total", "Disruption commands by reason, decision and consolidation type"),
            &["reason", "decision", "consolidation_type"],
        ).expect("valid opts");
        REGISTRY.register(Box::new(c.clone())).expect("unique metric");
        c
    };

    pub static ref QUEUE_DEPTH: IntGauge = {
        let g = IntGauge::new(
            "canopy_disruption_queue_depth",
            "Commands currently held by the orchestration queue",
        ).expect("valid opts");
        REGISTRY.register(Box::new(g.clone())).expect("unique metric");
        g
    };

    pub static ref PENDING_PODS: IntGauge = {
        let g = IntGauge::new(
            "canopy_pending_pods",
            "Pods the scheduler reported unschedulable at the last provisioning pass",
        ).expect("valid opts");
        REGISTRY.register(Box::new(g.clone())).expect("unique metric");
        g
    };

    pub static ref NODECLAIMS_CREATED: IntCounterVec = {
        let c = IntCounterVec::new(
            Opts::new("canopy_nodeclaims_created_total", "NodeClaims created, by nodepool and trigger"),
            &["nodepool", "trigger"],
        ).expect("valid opts");
        REGISTRY.register(Box::new(c.clone())).expect("unique metric");
        c
    };

    pub static ref NODECLAIMS_TERMINATED: IntCounterVec = {
        let c = IntCounterVec::new(
            Opts::new("canopy_nodeclaims_terminated_total", "NodeClaims terminated, by nodepool and reason"),
            &["nodepool", "reason"],
        ).expect("valid opts");
        REGISTRY.register(Box::new(c.clone())).expect("unique metric");
        c
    };

    /// Seconds from creation to the Launched condition.
    pub static ref LAUNCH_SECONDS: Histogram =
        histogram("canopy_nodeclaim_launch_seconds", "Time from NodeClaim creation to Launched");
    pub static ref REGISTRATION_SECONDS: Histogram =
        histogram("canopy_nodeclaim_registration_seconds", "Time from Launched to Registered");
    pub static ref INITIALIZATION_SECONDS: Histogram =
        histogram("canopy_nodeclaim_initialization_seconds", "Time from Registered to Initialized");
    pub static ref CATALOG_REFRESH_SECONDS: Histogram =
        histogram("canopy_catalog_refresh_seconds", "Instance type catalog refresh latency");

    /// 1 while the consolidated flag is standing.
    pub static ref CLUSTER_CONSOLIDATED: Gauge = {
        let g = Gauge::new(
            "canopy_cluster_consolidated",
            "Whether the last consolidation pass found nothing to do",
        ).expect("valid opts");
        REGISTRY.register(Box::new(g.clone())).expect("unique metric");
        g
    };
}

/// Render the registry in the Prometheus text exposition format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&REGISTRY.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_renders_text_format() {
        QUEUE_DEPTH.set(3);
        DISRUPTION_DECISIONS
            .with_label_values(&["Drifted", "launched", "replace"])
            .inc();
        let text = gather();
        assert!(text.contains("canopy_disruption_queue_depth 3"));
        assert!(text.contains("canopy_disruption_decisions_total"));
    }
}
