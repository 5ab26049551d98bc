//! Leader-only admin surface: policy object deletion.

use ember_registry::is_system_acl;
use tracing::warn;

use crate::rbac::{resources, RbacAction, RbacEvaluator};
use crate::reconciler::PeerReconciler;
use crate::watchers::MeshWatchers;
use crate::{MeshStore, ServiceError};

/// Admin CRUD endpoint over ACLs and routes.
///
/// Every mutation follows the same shape: leader check, input validation,
/// system-reserved guard, authorization, delegated mutation.
#[derive(Debug, Clone)]
pub struct AdminService<R, W, E> {
    store: MeshStore<R, W>,
    rbac: E,
}

impl<R, W, E> AdminService<R, W, E>
where
    R: PeerReconciler,
    W: MeshWatchers,
    E: RbacEvaluator,
{
    pub fn new(store: MeshStore<R, W>, rbac: E) -> Self {
        Self { store, rbac }
    }

    /// Delete the network ACL named `name`.
    ///
    /// System-reserved names are rejected before storage is touched.
    pub async fn delete_network_acl(&self, name: &str) -> Result<(), ServiceError> {
        if !self.store.is_leader() {
            return Err(ServiceError::not_leader());
        }
        if name.is_empty() {
            return Err(ServiceError::InvalidArgument(
                "acl name is required".to_string(),
            ));
        }
        if is_system_acl(name) {
            return Err(ServiceError::InvalidArgument(format!(
                "cannot delete system acl {name}"
            )));
        }
        self.authorize(RbacAction::delete(resources::NETWORK_ACLS, name))
            .await?;
        self.store
            .networking()
            .delete_acl(name)
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        Ok(())
    }

    /// Delete the route named `name`.
    pub async fn delete_route(&self, name: &str) -> Result<(), ServiceError> {
        if !self.store.is_leader() {
            return Err(ServiceError::not_leader());
        }
        if name.is_empty() {
            return Err(ServiceError::InvalidArgument(
                "route name is required".to_string(),
            ));
        }
        self.authorize(RbacAction::delete(resources::ROUTES, name))
            .await?;
        self.store
            .networking()
            .delete_route(name)
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn authorize(&self, action: RbacAction) -> Result<(), ServiceError> {
        match self.rbac.evaluate(&action).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(ServiceError::PermissionDenied(format!(
                "caller may not {} {}",
                action.verb, action.resource
            ))),
            Err(e) => {
                warn!(error = %e, "policy evaluation failed");
                Err(ServiceError::PermissionDenied(format!(
                    "caller may not {} {}",
                    action.verb, action.resource
                )))
            }
        }
    }
}
