pub mod config;
pub mod service;
pub mod transport;
pub mod transport_axum;

use graph::GraphError;
use lease::LeaseError;
use schema::{BatchId, ValidationError};
use store::StoreError;

pub use config::CensusConfig;
pub use service::{
    Aggregate, CensusService, Clock, FixedClock, ServiceSettings, SystemClock, lease_key,
};

/// Every failure a census operation can surface. The transport maps each
/// variant to one status code; nothing else decides statuses.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CensusError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("inconsistent relatives: {0}")]
    GraphInconsistency(#[from] GraphError),
    #[error("{0}")]
    NotFound(StoreError),
    #[error("batch {batch_id} is busy: {source}")]
    LockTimeout {
        batch_id: BatchId,
        source: LeaseError,
    },
    #[error("lease on batch {batch_id} expired before the patch was committed")]
    LeaseExpired { batch_id: BatchId },
    #[error("lease backend failure: {0}")]
    Lease(LeaseError),
    #[error("persistence failure: {0}")]
    Persistence(StoreError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for CensusError {
    fn from(value: StoreError) -> Self {
        if value.is_not_found() {
            Self::NotFound(value)
        } else {
            Self::Persistence(value)
        }
    }
}

impl CensusError {
    pub(crate) fn from_lease(batch_id: BatchId, err: LeaseError) -> Self {
        match err {
            LeaseError::Timeout { .. } => Self::LockTimeout {
                batch_id,
                source: err,
            },
            other => Self::Lease(other),
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::GraphInconsistency(_) => 400,
            Self::NotFound(_) => 404,
            Self::LockTimeout { .. } | Self::LeaseExpired { .. } => 503,
            Self::Lease(_) | Self::Persistence(_) | Self::Internal(_) => 500,
        }
    }

    /// Whether the same request may succeed if sent again unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. } | Self::LeaseExpired { .. })
    }
}
