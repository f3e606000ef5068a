//! pgBackRest configuration and SSH trust material

use k8s_openapi::api::core::v1::Secret;

use crate::adapters::{config_map_intent, ssh_config_map_intent, ssh_secret_intent};
use crate::error::Result;

use super::apply::apply;
use super::ReconcileScope;

/// Apply the pgBackRest ConfigMap and, when any repository host is
/// configured, the SSH ConfigMap and Secret.
///
/// `existing_ssh_secret` is the Secret found during cleanup; its keypair is
/// carried over so hosts keep trusting each other.
pub async fn reconcile_pgbackrest_config(
    scope: &ReconcileScope<'_>,
    repo_host_name: Option<&str>,
    config_hash: &str,
    instance_names: &[String],
    existing_ssh_secret: Option<&Secret>,
) -> Result<()> {
    let config = config_map_intent(scope.cluster, repo_host_name, config_hash, instance_names)?;
    apply(scope.store, scope.cluster, config).await?;

    if !scope.cluster.repo_host_enabled() {
        return Ok(());
    }

    apply(scope.store, scope.cluster, ssh_config_map_intent(scope.cluster)).await?;
    let secret = ssh_secret_intent(scope.cluster, existing_ssh_secret)?;
    apply(scope.store, scope.cluster, secret).await?;
    Ok(())
}
