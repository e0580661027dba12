use std::time::Duration;

use envconfig::Envconfig;

use crate::catalog::OverheadSettings;

/// Process configuration, entirely from environment variables. Every
/// knob has a production default; tests construct the struct directly.
#[derive(Envconfig, Debug, Clone)]
pub struct Config {
    #[envconfig(from = "CLUSTER_NAME", default = "canopy")]
    pub cluster_name: String,

    #[envconfig(from = "CLUSTER_ENDPOINT", default = "")]
    pub cluster_endpoint: String,

    #[envconfig(from = "ISOLATED_VPC", default = "false")]
    pub isolated_vpc: bool,

    /// Fraction of instance memory hidden by the hypervisor.
    #[envconfig(from = "VM_MEMORY_OVERHEAD_PERCENT", default = "0.075")]
    pub vm_memory_overhead_percent: f64,

    /// Comma-separated feature gate names.
    #[envconfig(from = "FEATURE_GATES", default = "")]
    pub feature_gates: String,

    #[envconfig(from = "METRICS_BIND_ADDR", default = "0.0.0.0:8080")]
    pub metrics_bind_addr: String,

    #[envconfig(from = "HEALTH_PROBE_BIND_ADDR", default = "0.0.0.0:8081")]
    pub health_probe_bind_addr: String,

    /// Leader election is handled by the deployment layer; the flag only
    /// gates whether this replica waits to be told it leads.
    #[envconfig(from = "LEADER_ELECT", default = "false")]
    pub leader_elect: bool,

    /// Provisioning pass cadence; doubles as the unschedulable-pod
    /// de-duplication window.
    #[envconfig(from = "BATCH_WINDOW_SECONDS", default = "10")]
    pub batch_window_seconds: u64,

    /// Stability window between a consolidation decision and execution.
    #[envconfig(from = "CONSOLIDATION_TTL_SECONDS", default = "15")]
    pub consolidation_ttl_seconds: u64,

    /// Per-command budget in the orchestration queue.
    #[envconfig(from = "MAX_RETRY_SECONDS", default = "600")]
    pub max_retry_seconds: u64,

    /// Eventual-consistency forgiveness for vanished replacements.
    #[envconfig(from = "REPLACEMENT_GRACE_SECONDS", default = "5")]
    pub replacement_grace_seconds: u64,

    #[envconfig(from = "REGISTRATION_TTL_SECONDS", default = "900")]
    pub registration_ttl_seconds: u64,

    #[envconfig(from = "INITIALIZATION_TTL_SECONDS", default = "900")]
    pub initialization_ttl_seconds: u64,

    #[envconfig(from = "CATALOG_TTL_SECONDS", default = "300")]
    pub catalog_ttl_seconds: u64,

    /// How long an insufficient-capacity offering stays sidelined.
    #[envconfig(from = "ICE_TTL_SECONDS", default = "180")]
    pub ice_ttl_seconds: u64,

    #[envconfig(from = "NOMINATION_TTL_SECONDS", default = "60")]
    pub nomination_ttl_seconds: u64,
}

impl Config {
    pub fn overhead(&self) -> OverheadSettings {
        OverheadSettings {
            vm_memory_overhead_percent: self.vm_memory_overhead_percent,
        }
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_secs(self.batch_window_seconds)
    }

    pub fn consolidation_ttl(&self) -> Duration {
        Duration::from_secs(self.consolidation_ttl_seconds)
    }

    pub fn max_retry(&self) -> Duration {
        Duration::from_secs(self.max_retry_seconds)
    }

    pub fn replacement_grace(&self) -> Duration {
        Duration::from_secs(self.replacement_grace_seconds)
    }

    pub fn registration_ttl(&self) -> Duration {
        Duration::from_secs(self.registration_ttl_seconds)
    }

    pub fn initialization_ttl(&self) -> Duration {
        Duration::from_secs(self.initialization_ttl_seconds)
    }

    pub fn catalog_ttl(&self) -> Duration {
        Duration::from_secs(self.catalog_ttl_seconds)
    }

    pub fn ice_ttl(&self) -> Duration {
        Duration::from_secs(self.ice_ttl_seconds)
    }

    pub fn nomination_ttl(&self) -> Duration {
        Duration::from_secs(self.nomination_ttl_seconds)
    }

    pub fn feature_enabled(&self, gate: &str) -> bool {
        self.feature_gates
            .split(',')
            .map(str::trim)
            .any(|g| g == gate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_apply_with_empty_environment() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();
        assert_eq!(config.cluster_name, "canopy");
        assert_eq!(config.consolidation_ttl(), Duration::from_secs(15));
        assert_eq!(config.max_retry(), Duration::from_secs(600));
        assert!(!config.leader_elect);
    }

    #[test]
    fn feature_gates_parse_as_a_list() {
        let env = HashMap::from([(
            "FEATURE_GATES".to_string(),
            "reserved-capacity, node-overlays".to_string(),
        )]);
        let config = Config::init_from_hashmap(&env).unwrap();
        assert!(config.feature_enabled("reserved-capacity"));
        assert!(config.feature_enabled("node-overlays"));
        assert!(!config.feature_enabled("unknown"));
    }
}
