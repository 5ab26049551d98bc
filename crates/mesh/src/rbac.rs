//! Authorization hook for the admin surface.

use async_trait::async_trait;

use crate::ServiceError;

/// Resource names used in authorization checks.
pub mod resources {
    pub const NETWORK_ACLS: &str = "network-acls";
    pub const ROUTES: &str = "routes";
}

/// An action submitted to the policy evaluator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RbacAction {
    pub resource: &'static str,
    pub verb: &'static str,
    /// The specific object the action targets.
    pub name: String,
}

impl RbacAction {
    pub fn delete(resource: &'static str, name: impl Into<String>) -> Self {
        Self {
            resource,
            verb: "delete",
            name: name.into(),
        }
    }
}

/// Policy evaluator consumed by the admin services.
#[async_trait]
pub trait RbacEvaluator: Clone + Send + Sync + 'static {
    /// Whether the caller may perform `action`.
    async fn evaluate(&self, action: &RbacAction) -> Result<bool, ServiceError>;
}

/// Evaluator that authorizes everything; the default for single-tenant
/// meshes.
#[derive(Debug, Clone, Default)]
pub struct AllowAll;

#[async_trait]
impl RbacEvaluator for AllowAll {
    async fn evaluate(&self, _action: &RbacAction) -> Result<bool, ServiceError> {
        Ok(true)
    }
}

/// Evaluator that rejects everything; used in tests.
#[derive(Debug, Clone, Default)]
pub struct DenyAll;

#[async_trait]
impl RbacEvaluator for DenyAll {
    async fn evaluate(&self, _action: &RbacAction) -> Result<bool, ServiceError> {
        Ok(false)
    }
}
