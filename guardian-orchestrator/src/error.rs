//! Errors surfaced by the coordinator.

use guardian_keystore::AccountError;
use thiserror::Error;

use crate::beacon::BeaconError;
use crate::endpoint::{EndpointStoreError, SelectError};
use crate::gate::GateError;
use crate::interchange::ImportError;
use crate::registry::RegistryError;
use crate::service::ServiceError;
use crate::slashing::SlashingProtectionError;
use crate::types::PublicKey;

#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("no beacon node configured for {public_key}")]
    NoEndpoint { public_key: PublicKey },

    #[error(transparent)]
    Account(#[from] AccountError),

    #[error("start cancelled by operator")]
    UserCancelled,

    #[error("slashing protection import failed: {0}")]
    ImportFailed(#[from] ImportError),

    #[error("validator service failed to start: {0}")]
    ServiceStart(#[source] ServiceError),

    #[error("validator service failed to stop: {0}")]
    ServiceStop(#[source] ServiceError),

    #[error("registry conflict for {public_key}: {reason}")]
    RegistryConflict { public_key: PublicKey, reason: String },

    #[error("slashing protection error: {0}")]
    SlashingProtection(#[from] SlashingProtectionError),

    #[error("endpoint store error: {0}")]
    EndpointStore(#[from] EndpointStoreError),

    #[error("beacon node error: {0}")]
    Beacon(#[from] BeaconError),

    #[error("failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl OrchestrationError {
    /// Operator cancellation. Neutral, not a failure to report.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::UserCancelled)
    }

    /// Failures the operator can fix and retry (bad interchange file,
    /// unreachable node).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ImportFailed(_) | Self::ServiceStart(_) | Self::Beacon(_)
        )
    }
}

impl From<SelectError> for OrchestrationError {
    fn from(e: SelectError) -> Self {
        match e {
            SelectError::NoEndpoint { public_key } => Self::NoEndpoint { public_key },
            SelectError::Store(e) => Self::EndpointStore(e),
        }
    }
}

impl From<GateError> for OrchestrationError {
    fn from(e: GateError) -> Self {
        match e {
            GateError::Cancelled => Self::UserCancelled,
            GateError::Import(e) => Self::ImportFailed(e),
            GateError::Storage(e) => Self::SlashingProtection(e),
        }
    }
}

impl From<RegistryError> for OrchestrationError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::Conflict { public_key, reason } => Self::RegistryConflict { public_key, reason },
            RegistryError::Start(e) => Self::ServiceStart(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Root;

    #[test]
    fn test_cancellation_and_import_failure_are_distinguishable() {
        let cancelled = OrchestrationError::from(GateError::Cancelled);
        assert!(cancelled.is_cancellation());
        assert!(!cancelled.is_retryable());

        let mismatch = OrchestrationError::from(GateError::Import(ImportError::RootMismatch {
            expected: Root([1; 32]),
            found: Root([2; 32]),
        }));
        assert!(!mismatch.is_cancellation());
        assert!(mismatch.is_retryable());
    }
}
