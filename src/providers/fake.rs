use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::apis::{NodeClaim, NodePool};
use crate::catalog::{InstanceType, resolve_cheapest};
use crate::providers::provider::{ProviderError, ProviderId};
use crate::requirements::{
    LABEL_ARCH, LABEL_CAPACITY_TYPE, LABEL_HOSTNAME, LABEL_INSTANCE_TYPE, LABEL_NODEPOOL, LABEL_OS,
    LABEL_ZONE,
};
use crate::requirements::Requirements;

/// What happens on the next `create()` call.
#[derive(Debug, Clone)]
pub enum CreateBehavior {
    /// Happy path - resolves the cheapest compatible offering.
    Succeed,
    /// Returns Ok after sleeping for the given duration.
    SucceedAfterDelay(Duration),
    /// The resolved offering has no capacity.
    InsufficientCapacity,
    /// General creation failure.
    CreationFailed(String),
    /// Network/API blowup.
    InternalError(String),
}

/// What happens on the next `delete()` call.
#[derive(Debug, Clone)]
pub enum DeleteBehavior {
    /// Instance removed successfully.
    Succeed,
    /// The instance was already gone.
    NotFound,
    /// Deletion failed.
    Fail(String),
}

/// Logged record of a `create()` call.
#[derive(Debug, Clone)]
pub struct CreateCall {
    pub claim_name: String,
    pub instance_type: Option<String>,
    pub zone: Option<String>,
}

/// Logged record of a `delete()` call.
#[derive(Debug, Clone)]
pub struct DeleteCall {
    pub claim_name: String,
}

/// Interior state behind the Arc<Mutex<_>>.
#[derive(Debug)]
struct FakeProviderState {
    instance_types: Vec<InstanceType>,
    create_behaviors: VecDeque<CreateBehavior>,
    delete_behaviors: VecDeque<DeleteBehavior>,
    default_create: CreateBehavior,
    default_delete: DeleteBehavior,
    drift_answers: BTreeMap<String, String>,
    instances: BTreeMap<String, NodeClaim>,
    create_calls: Vec<CreateCall>,
    delete_calls: Vec<DeleteCall>,
}

/// A deterministic, in-memory provider for testing failure modes.
///
/// Each call to `create()`/`delete()` pops the next behavior from a queue.
/// When the queue is empty, the configured default applies. Launched
/// instances live in an interior map so `get`/`list` and idempotent
/// re-creates behave like a real provider.
#[derive(Debug, Clone)]
pub struct FakeProvider {
    state: Arc<Mutex<FakeProviderState>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeProviderState {
                instance_types: Vec::new(),
                create_behaviors: VecDeque::new(),
                delete_behaviors: VecDeque::new(),
                default_create: CreateBehavior::Succeed,
                default_delete: DeleteBehavior::Succeed,
                drift_answers: BTreeMap::new(),
                instances: BTreeMap::new(),
                create_calls: Vec::new(),
                delete_calls: Vec::new(),
            })),
        }
    }

    // ── Builder methods ──────────────────────────────────────────────

    pub fn with_instance_types(self, types: Vec<InstanceType>) -> Self {
        self.state.lock().unwrap().instance_types = types;
        self
    }

    pub fn on_next_create(self, behavior: CreateBehavior) -> Self {
        self.state.lock().unwrap().create_behaviors.push_back(behavior);
        self
    }

    pub fn on_next_delete(self, behavior: DeleteBehavior) -> Self {
        self.state.lock().unwrap().delete_behaviors.push_back(behavior);
        self
    }

    pub fn with_default_create(self, behavior: CreateBehavior) -> Self {
        self.state.lock().unwrap().default_create = behavior;
        self
    }

    pub fn with_default_delete(self, behavior: DeleteBehavior) -> Self {
        self.state.lock().unwrap().default_delete = behavior;
        self
    }

    /// Answer `is_drifted` for the named claim with the given reason.
    pub fn with_drifted(self, claim_name: &str, reason: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .drift_answers
            .insert(claim_name.into(), reason.into());
        self
    }

    // ── Introspection ────────────────────────────────────────────────

    pub fn create_calls(&self) -> Vec<CreateCall> {
        self.state.lock().unwrap().create_calls.clone()
    }

    pub fn delete_calls(&self) -> Vec<DeleteCall> {
        self.state.lock().unwrap().delete_calls.clone()
    }

    /// Drop a launched instance out from under its claim, simulating
    /// outside interference.
    pub fn forget_instance(&self, claim_name: &str) {
        self.state.lock().unwrap().instances.remove(claim_name);
    }

    // ── Provider implementation ──────────────────────────────────────

    pub async fn instance_types(&self, _pool: &NodePool) -> Result<Vec<InstanceType>, ProviderError> {
        Ok(self.state.lock().unwrap().instance_types.clone())
    }

    pub async fn create(&self, claim: &NodeClaim) -> Result<NodeClaim, ProviderError> {
        let name = claim.name();
        let behavior = {
            let mut state = self.state.lock().unwrap();
            if let Some(existing) = state.instances.get(&name) {
                let existing = existing.clone();
                state.create_calls.push(CreateCall {
                    claim_name: name,
                    instance_type: existing
                        .metadata
                        .labels
                        .as_ref()
                        .and_then(|l| l.get(LABEL_INSTANCE_TYPE).cloned()),
                    zone: None,
                });
                return Ok(existing);
            }
            state
                .create_behaviors
                .pop_front()
                .unwrap_or_else(|| state.default_create.clone())
        };

        let result = match behavior {
            CreateBehavior::Succeed => self.launch(claim),
            CreateBehavior::SucceedAfterDelay(d) => {
                tokio::time::sleep(d).await;
                self.launch(claim)
            }
            CreateBehavior::InsufficientCapacity => {
                let resolved = self.peek_resolution(claim);
                Err(ProviderError::InsufficientCapacity {
                    instance_type: resolved.clone().map(|(t, _)| t).unwrap_or_else(|| "*".into()),
                    zone: resolved.map(|(_, z)| z).unwrap_or_else(|| "*".into()),
                    capacity_type: "on-demand".into(),
                })
            }
            CreateBehavior::CreationFailed(msg) => Err(ProviderError::CreationFailed { message: msg }),
            CreateBehavior::InternalError(msg) => Err(ProviderError::Internal(anyhow::anyhow!(msg))),
        };

        let mut state = self.state.lock().unwrap();
        state.create_calls.push(CreateCall {
            claim_name: claim.name(),
            instance_type: result
                .as_ref()
                .ok()
                .and_then(|c| c.metadata.labels.as_ref())
                .and_then(|l| l.get(LABEL_INSTANCE_TYPE).cloned()),
            zone: result
                .as_ref()
                .ok()
                .and_then(|c| c.metadata.labels.as_ref())
                .and_then(|l| l.get(LABEL_ZONE).cloned()),
        });
        if let Ok(launched) = &result {
            state.instances.insert(launched.name(), launched.clone());
        }
        result
    }

    fn peek_resolution(&self, claim: &NodeClaim) -> Option<(String, String)> {
        let reqs = Requirements::parse(&claim.spec.requirements).ok()?;
        let state = self.state.lock().unwrap();
        resolve_cheapest(&state.instance_types, &reqs)
            .map(|(it, o)| (it.name.clone(), o.zone.clone()))
    }

    fn launch(&self, claim: &NodeClaim) -> Result<NodeClaim, ProviderError> {
        let reqs = Requirements::parse(&claim.spec.requirements)
            .map_err(|e| ProviderError::CreationFailed { message: e.to_string() })?;
        let state = self.state.lock().unwrap();
        let (instance_type, offering) = resolve_cheapest(&state.instance_types, &reqs)
            .ok_or_else(|| ProviderError::InsufficientCapacity {
                instance_type: "*".into(),
                zone: "*".into(),
                capacity_type: "*".into(),
            })?;

        let name = claim.name();
        let mut launched = claim.clone();
        let labels = launched.metadata.labels.get_or_insert_with(BTreeMap::new);
        labels.insert(LABEL_INSTANCE_TYPE.into(), instance_type.name.clone());
        labels.insert(LABEL_ZONE.into(), offering.zone.clone());
        labels.insert(
            LABEL_CAPACITY_TYPE.into(),
            offering.capacity_type.as_str().into(),
        );
        labels.insert(LABEL_ARCH.into(), instance_type.arch.clone());
        labels.insert(LABEL_OS.into(), "linux".into());
        labels.insert(LABEL_HOSTNAME.into(), name.clone());
        let status = launched.status_mut();
        status.provider_id = Some(format!("fake://{name}"));
        status.image_id = Some("fake-image".into());
        status.capacity = instance_type.capacity.to_quantities();
        status.allocatable = instance_type
            .allocatable(&crate::catalog::OverheadSettings::default())
            .to_quantities();
        Ok(launched)
    }

    pub async fn delete(&self, claim: &NodeClaim) -> Result<(), ProviderError> {
        let name = claim.name();
        let behavior = {
            let mut state = self.state.lock().unwrap();
            state.delete_calls.push(DeleteCall { claim_name: name.clone() });
            state
                .delete_behaviors
                .pop_front()
                .unwrap_or_else(|| state.default_delete.clone())
        };

        match behavior {
            DeleteBehavior::Succeed => {
                let existed = self.state.lock().unwrap().instances.remove(&name).is_some();
                if existed {
                    Ok(())
                } else {
                    Err(ProviderError::NotFound(name))
                }
            }
            DeleteBehavior::NotFound => Err(ProviderError::NotFound(name)),
            DeleteBehavior::Fail(msg) => Err(ProviderError::CreationFailed { message: msg }),
        }
    }

    pub async fn get(&self, provider_id: &ProviderId) -> Result<NodeClaim, ProviderError> {
        self.state
            .lock()
            .unwrap()
            .instances
            .values()
            .find(|c| c.provider_id() == Some(provider_id.0.as_str()))
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(provider_id.0.clone()))
    }

    pub async fn list(&self) -> Result<Vec<NodeClaim>, ProviderError> {
        Ok(self.state.lock().unwrap().instances.values().cloned().collect())
    }

    pub async fn is_drifted(&self, claim: &NodeClaim) -> Result<Option<String>, ProviderError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .drift_answers
            .get(&claim.name())
            .cloned())
    }
}

impl Default for FakeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::{NodeClaimSpec, NodePoolSpec, nodepool::NodeClassRef};
    use crate::catalog::{CapacityType, Offering};
    use crate::resources::{CPU, MEMORY, PODS, ResourceList};

    fn test_instance_type(name: &str, cpu: i64, price: f64) -> InstanceType {
        InstanceType {
            name: name.into(),
            arch: "amd64".into(),
            capacity: ResourceList::new()
                .with(CPU, cpu * 1000)
                .with(MEMORY, 4096 * 1024 * 1024 * 1000)
                .with(PODS, 110_000),
            offerings: vec![Offering {
                zone: "a".into(),
                capacity_type: CapacityType::OnDemand,
                price,
                available: true,
            }],
        }
    }

    fn claim(name: &str) -> NodeClaim {
        NodeClaim::new(
            name,
            NodeClaimSpec {
                node_class_ref: NodeClassRef {
                    group: "canopy".into(),
                    kind: "FakeNodeClass".into(),
                    name: "default".into(),
                },
                ..Default::default()
            },
        )
    }

    fn provider() -> FakeProvider {
        FakeProvider::new().with_instance_types(vec![
            test_instance_type("expensive", 8, 1.0),
            test_instance_type("cheap", 2, 0.01),
        ])
    }

    #[tokio::test]
    async fn default_create_resolves_cheapest() {
        let p = provider();
        let launched = p.create(&claim("n1")).await.unwrap();
        assert_eq!(launched.provider_id(), Some("fake://n1"));
        let labels = launched.metadata.labels.unwrap();
        assert_eq!(labels.get(LABEL_INSTANCE_TYPE).unwrap(), "cheap");
    }

    #[tokio::test]
    async fn create_is_idempotent_by_name() {
        let p = provider();
        let first = p.create(&claim("n1")).await.unwrap();
        let second = p.create(&claim("n1")).await.unwrap();
        assert_eq!(first.provider_id(), second.provider_id());
        assert_eq!(p.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn queued_behaviors_are_consumed_in_order() {
        let p = provider()
            .on_next_create(CreateBehavior::InsufficientCapacity)
            .on_next_create(CreateBehavior::Succeed);
        let first = p.create(&claim("n1")).await;
        assert!(matches!(first, Err(ProviderError::InsufficientCapacity { .. })));
        let second = p.create(&claim("n1")).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn falls_back_to_default_when_queue_empty() {
        let p = provider()
            .with_default_create(CreateBehavior::CreationFailed("quota".into()))
            .on_next_create(CreateBehavior::Succeed);
        assert!(p.create(&claim("n1")).await.is_ok());
        assert!(matches!(
            p.create(&claim("n2")).await,
            Err(ProviderError::CreationFailed { .. })
        ));
    }

    #[tokio::test]
    async fn get_and_delete_round_trip() {
        let p = provider();
        let launched = p.create(&claim("n1")).await.unwrap();
        let id = ProviderId(launched.provider_id().unwrap().to_string());
        assert_eq!(p.get(&id).await.unwrap().name(), "n1");
        p.delete(&launched).await.unwrap();
        assert!(p.get(&id).await.unwrap_err().is_not_found());
        // Second delete: instance already gone.
        assert!(p.delete(&launched).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn drift_answers_are_per_claim() {
        let p = provider().with_drifted("n1", "ImageDrift");
        assert_eq!(
            p.is_drifted(&claim("n1")).await.unwrap().as_deref(),
            Some("ImageDrift")
        );
        assert_eq!(p.is_drifted(&claim("n2")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn calls_are_logged() {
        let p = provider();
        let launched = p.create(&claim("n1")).await.unwrap();
        p.delete(&launched).await.unwrap();
        assert_eq!(p.create_calls().len(), 1);
        assert_eq!(p.create_calls()[0].instance_type.as_deref(), Some("cheap"));
        assert_eq!(p.delete_calls().len(), 1);
        assert_eq!(p.delete_calls()[0].claim_name, "n1");
    }

    #[tokio::test]
    async fn instance_types_pass_through() {
        let p = provider();
        let pool = NodePool::new("default", NodePoolSpec::default());
        assert_eq!(p.instance_types(&pool).await.unwrap().len(), 2);
    }
}
