//! Identity backup Jobs run with

use k8s_openapi::api::core::v1::ServiceAccount;

use crate::adapters::rbac_intents;
use crate::error::Result;

use super::apply::apply;
use super::ReconcileScope;

/// Apply the ServiceAccount, Role and RoleBinding used by backup Jobs
pub async fn reconcile_rbac(scope: &ReconcileScope<'_>) -> Result<ServiceAccount> {
    let (service_account, role, binding) = rbac_intents(scope.cluster);
    let service_account = apply(scope.store, scope.cluster, service_account).await?;
    apply(scope.store, scope.cluster, role).await?;
    apply(scope.store, scope.cluster, binding).await?;
    Ok(service_account)
}
