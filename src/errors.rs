use thiserror::Error;

use crate::providers::provider::ProviderError;
use crate::requirements::RequirementError;

/// Controller-level error. Reconcilers bubble these to their runner,
/// which logs and requeues with backoff.
#[derive(Debug, Error)]
pub enum Error {
    #[error("kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    #[error("cloud provider error: {source}")]
    Provider {
        #[from]
        source: ProviderError,
    },

    #[error("invalid requirements: {source}")]
    Requirement {
        #[from]
        source: RequirementError,
    },

    #[error("json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    /// A long wait observed shutdown and abandoned its work cleanly.
    #[error("interrupted")]
    Interrupted,
}

pub type Result<T> = std::result::Result<T, Error>;
