//! Service-boundary errors and their RPC codes.

use ember_consensus::EngineError;
use ember_registry::RegistryError;
use ember_storage::StorageError;
use serde::{Deserialize, Serialize};

/// RPC status codes surfaced by the admission and admin services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Code {
    InvalidArgument,
    FailedPrecondition,
    PermissionDenied,
    NotFound,
    Internal,
}

/// An error at the service boundary.
///
/// Registry and engine errors are mapped here, at the edge; the inner layers
/// pass their own error types through unchanged.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    /// Malformed identifier, key, endpoint, or name; or an attempt to mutate
    /// a system-reserved object.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The receiving node cannot serve this request, typically because it is
    /// not the leader.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// The policy evaluator rejected the caller.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Lookup miss on an expected record.
    #[error("not found: {0}")]
    NotFound(String),

    /// Storage, consensus, or other internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// The RPC code for this error.
    pub fn code(&self) -> Code {
        match self {
            Self::InvalidArgument(_) => Code::InvalidArgument,
            Self::FailedPrecondition(_) => Code::FailedPrecondition,
            Self::PermissionDenied(_) => Code::PermissionDenied,
            Self::NotFound(_) => Code::NotFound,
            Self::Internal(_) => Code::Internal,
        }
    }

    /// Reconstruct from a wire `(code, message)` pair.
    pub fn from_code(code: Code, message: String) -> Self {
        match code {
            Code::InvalidArgument => Self::InvalidArgument(message),
            Code::FailedPrecondition => Self::FailedPrecondition(message),
            Code::PermissionDenied => Self::PermissionDenied(message),
            Code::NotFound => Self::NotFound(message),
            Code::Internal => Self::Internal(message),
        }
    }

    pub(crate) fn not_leader() -> Self {
        Self::FailedPrecondition("not the leader".to_string())
    }
}

impl From<RegistryError> for ServiceError {
    fn from(error: RegistryError) -> Self {
        match &error {
            RegistryError::Storage(StorageError::NotFound) => {
                Self::NotFound("record not found".to_string())
            }
            RegistryError::Storage(StorageError::NotLeader { .. }) => Self::not_leader(),
            _ => Self::Internal(error.to_string()),
        }
    }
}

impl From<EngineError> for ServiceError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::NotLeader { .. } => Self::not_leader(),
            other => Self::Internal(other.to_string()),
        }
    }
}
