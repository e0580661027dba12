use crate::apis::{NodeClaim, NodePool};
use crate::catalog::InstanceType;
use crate::providers::fake::FakeProvider;
use crate::providers::kwok::KwokProvider;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProviderId(pub String);

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ProviderId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The provider couldn't create the instance at all.
    /// Bad permissions, quota exceeded, invalid config, etc.
    #[error("creation failed: {message}")]
    CreationFailed { message: String },

    /// The requested offering has no capacity right now. Carries enough
    /// identity for the catalog to sideline exactly that offering.
    #[error("insufficient capacity for {instance_type} ({capacity_type}) in {zone}")]
    InsufficientCapacity {
        instance_type: String,
        zone: String,
        capacity_type: String,
    },

    /// The instance does not exist. Termination and garbage collection
    /// treat this as success.
    #[error("instance not found: {0}")]
    NotFound(String),

    /// Required config field missing for this provider.
    #[error("missing required config: {field}")]
    MissingConfig { field: &'static str },

    /// Underlying API/network error; retryable.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ProviderError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_insufficient_capacity(&self) -> bool {
        matches!(self, Self::InsufficientCapacity { .. })
    }
}

/// Provide instances from a given backend - i.e. kwok, or the scripted
/// fake used in tests. The provider's responsibility is to turn a
/// NodeClaim into a running instance that joins the cluster, or to fail
/// loudly.
///
/// All operations are idempotent by NodeClaim name: re-issuing `create`
/// for a name that already launched returns the existing instance.
pub enum CloudProvider {
    Kwok(KwokProvider),
    Fake(FakeProvider),
}

impl CloudProvider {
    /// Instance types this provider offers to the given pool.
    pub async fn instance_types(&self, pool: &NodePool) -> Result<Vec<InstanceType>, ProviderError> {
        match self {
            Self::Kwok(p) => p.instance_types(pool).await,
            Self::Fake(p) => p.instance_types(pool).await,
        }
    }

    /// Launch an instance for the claim. The returned claim carries
    /// providerId, imageId, resolved capacity and allocatable.
    pub async fn create(&self, claim: &NodeClaim) -> Result<NodeClaim, ProviderError> {
        match self {
            Self::Kwok(p) => p.create(claim).await,
            Self::Fake(p) => p.create(claim).await,
        }
    }

    /// Terminate the instance behind the claim. NotFound means already gone.
    pub async fn delete(&self, claim: &NodeClaim) -> Result<(), ProviderError> {
        match self {
            Self::Kwok(p) => p.delete(claim).await,
            Self::Fake(p) => p.delete(claim).await,
        }
    }

    pub async fn get(&self, provider_id: &ProviderId) -> Result<NodeClaim, ProviderError> {
        match self {
            Self::Kwok(p) => p.get(provider_id).await,
            Self::Fake(p) => p.get(provider_id).await,
        }
    }

    /// Every instance this autoscaler owns, for orphan reconciliation.
    pub async fn list(&self) -> Result<Vec<NodeClaim>, ProviderError> {
        match self {
            Self::Kwok(p) => p.list().await,
            Self::Fake(p) => p.list().await,
        }
    }

    /// Provider-side drift check. `None` means not drifted.
    pub async fn is_drifted(&self, claim: &NodeClaim) -> Result<Option<String>, ProviderError> {
        match self {
            Self::Kwok(p) => p.is_drifted(claim).await,
            Self::Fake(p) => p.is_drifted(claim).await,
        }
    }
}
