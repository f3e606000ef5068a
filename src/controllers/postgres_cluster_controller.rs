//! PostgresCluster controller
//!
//! Watches PostgresCluster resources, plus the pgBackRest resources they
//! own, and runs the pgBackRest reconcile cycle.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim};
use kube::{
    api::{ListParams, Patch, PatchParams},
    runtime::{
        controller::{Action, Controller},
        events::EventType,
        watcher::Config as WatcherConfig,
    },
    Api, Client, Resource, ResourceExt,
};
use serde_json::{json, Value};
use tracing::{error, info, instrument, warn};

use crate::controllers::Context;
use crate::crd::{PostgresCluster, PostgresClusterStatus};
use crate::error::{Error, Result};
use crate::k8s::reasons;
use crate::metrics;
use crate::naming;
use crate::reconcilers::pgbackrest::{reconcile_cluster, validate};
use crate::reconcilers::ReconcileScope;

const KIND: &str = "PostgresCluster";

/// Run the PostgresCluster controller
pub async fn run(client: Client, context: Arc<Context>) {
    let api: Api<PostgresCluster> = Api::all(client.clone());

    // Verify CRD is installed
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("PostgresCluster CRD not installed: {}", e);
        return;
    }

    info!("Starting PostgresCluster controller");
    metrics::set_ready(true);

    let owned = || WatcherConfig::default().labels(naming::LABEL_PGBACKREST);

    Controller::new(api, WatcherConfig::default())
        .owns(Api::<StatefulSet>::all(client.clone()), owned())
        .owns(Api::<PersistentVolumeClaim>::all(client.clone()), owned())
        .owns(Api::<ConfigMap>::all(client.clone()), owned())
        .owns(Api::<Job>::all(client.clone()), owned())
        .owns(Api::<CronJob>::all(client.clone()), owned())
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    info!(
                        name = %obj.name,
                        namespace = obj.namespace.as_deref().unwrap_or("default"),
                        "Reconciled PostgresCluster"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation error");
                    metrics::RECONCILIATION_ERRORS.with_label_values(&["controller"]).inc();
                }
            }
        })
        .await;

    metrics::set_ready(false);
}

/// Main reconciliation function
#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<PostgresCluster>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = metrics::RECONCILE_DURATION
        .with_label_values(&[KIND])
        .start_timer();
    metrics::RECONCILIATIONS.with_label_values(&[KIND]).inc();
    if let Some(uid) = obj.uid() {
        metrics::MANAGED_CLUSTERS.set(ctx.track(&uid) as f64);
    }

    // Owned resources are garbage collected through their owner references
    if obj.meta().deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    if let Err(e) = validate(&obj) {
        warn!(error = %e, "Validation failed");
        ctx.recorder
            .record(
                &obj.object_ref(&()),
                EventType::Warning,
                reasons::INVALID_SPEC,
                &e.to_string(),
            )
            .await;
        return Ok(Action::requeue(ctx.config.resync_interval));
    }

    let scope = ReconcileScope::new(
        &obj,
        ctx.store.as_ref(),
        ctx.exec.as_ref(),
        ctx.recorder.as_ref(),
        &ctx.config,
    );
    let (status, result) = reconcile_cluster(&scope).await?;

    if obj.status.as_ref() != Some(&status) {
        update_status(&obj, &ctx.client, &status).await?;
    }

    Ok(result.into_action(&ctx.config))
}

/// Merge-patch the status subresource
async fn update_status(
    cluster: &PostgresCluster,
    client: &Client,
    status: &PostgresClusterStatus,
) -> Result<()> {
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<PostgresCluster> = Api::namespaced(client.clone(), &namespace);

    api.patch_status(
        &cluster.name_any(),
        &PatchParams::default(),
        &Patch::Merge(status_patch(status)?),
    )
    .await?;

    Ok(())
}

/// Merge patch body for a status. Fields the reconciler may clear are sent
/// as explicit nulls so they are removed from the stored status. `patroni`
/// is written by the database controller and is left out.
pub fn status_patch(status: &PostgresClusterStatus) -> Result<Value> {
    let mut body = serde_json::to_value(status)?;

    if let Some(fields) = body.as_object_mut() {
        fields.remove("patroni");
        fields.entry("conditions").or_insert_with(|| json!([]));
        if let Some(pgbackrest) = fields.get_mut("pgbackrest").and_then(Value::as_object_mut) {
            pgbackrest.entry("repoHost").or_insert(Value::Null);
            pgbackrest.entry("repos").or_insert_with(|| json!([]));
        }
    }

    Ok(json!({ "status": body }))
}

/// Error policy for the controller
fn error_policy(obj: Arc<PostgresCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();
    error!(
        name = %name,
        error = %error,
        "Reconciliation failed, scheduling retry"
    );

    let requeue_duration = match error {
        Error::Kube(_) | Error::Store(_) => Duration::from_secs(30),
        Error::Config(_) | Error::Validation(_) => ctx.config.resync_interval,
        Error::Consistency(_) => ctx.config.requeue_now,
        _ => Duration::from_secs(30),
    };

    Action::requeue(requeue_duration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{PatroniStatus, PgBackRestStatus, RepoHostStatus, RepoStatus};

    #[test]
    fn test_status_patch_clears_repo_host() {
        let status = PostgresClusterStatus {
            observed_generation: Some(3),
            pgbackrest: Some(PgBackRestStatus {
                repo_host: None,
                repos: vec![RepoStatus {
                    name: "repo1".to_string(),
                    ..Default::default()
                }],
            }),
            ..Default::default()
        };

        let patch = status_patch(&status).unwrap();
        assert_eq!(patch["status"]["observedGeneration"], json!(3));
        assert_eq!(patch["status"]["conditions"], json!([]));
        assert!(patch["status"]["pgbackrest"]
            .as_object()
            .unwrap()
            .contains_key("repoHost"));
        assert!(patch["status"]["pgbackrest"]["repoHost"].is_null());
    }

    #[test]
    fn test_status_patch_keeps_repo_host() {
        let status = PostgresClusterStatus {
            pgbackrest: Some(PgBackRestStatus {
                repo_host: Some(RepoHostStatus {
                    ready: true,
                    ..Default::default()
                }),
                repos: vec![],
            }),
            ..Default::default()
        };

        let patch = status_patch(&status).unwrap();
        assert_eq!(patch["status"]["pgbackrest"]["repoHost"]["ready"], json!(true));
    }

    #[test]
    fn test_status_patch_leaves_patroni_alone() {
        let status = PostgresClusterStatus {
            patroni: Some(PatroniStatus {
                system_identifier: Some("7012345678901234567".to_string()),
            }),
            ..Default::default()
        };

        let patch = status_patch(&status).unwrap();
        assert!(!patch["status"].as_object().unwrap().contains_key("patroni"));
    }
}
