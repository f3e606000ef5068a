//! Replica-create backup orchestration
//!
//! New replicas are restored from a backup in the first repository. This
//! step runs that backup as a Job once the repository's stanza exists,
//! replaces the Job when it failed or no longer matches the current
//! configuration, and records completion in the repository status.
//! `ReplicaCreate` is recomputed on every exit.

use k8s_openapi::api::batch::v1::Job;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::adapters::{instance_config_key, replica_create_job_intent, BackupJobParams, CM_REPO_KEY};
use crate::crd::PostgresClusterStatus;
use crate::error::{Error, Result};
use crate::k8s::ResourceKind;
use crate::metrics;
use crate::naming;

use super::apply::apply;
use super::conditions::{
    is_condition_true, is_condition_true_or_absent, replica_create_condition, set_condition,
    ConditionFinalizer, REPLICA_REPO_READY, REPO_HOST_READY,
};
use super::pods::find_exec_target;
use super::ReconcileScope;

fn job_condition(job: &Job, type_: &str) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| conds.iter().any(|c| c.type_ == type_ && c.status == "True"))
}

/// The Job finished successfully
pub fn job_completed(job: &Job) -> bool {
    job_condition(job, "Complete")
}

/// The Job gave up
pub fn job_failed(job: &Job) -> bool {
    job_condition(job, "Failed")
}

/// Whether a replica-create Job no longer matches the current repository,
/// config file or config hash
pub fn job_drifted(job: &Job, repo_name: &str, config_name: &str, config_hash: &str) -> bool {
    let annotation = |key: &str| job.annotations().get(key).map(String::as_str);
    job.labels().get(naming::LABEL_PGBACKREST_REPO).map(String::as_str) != Some(repo_name)
        || annotation(naming::ANNOTATION_PGBACKREST_CONFIG) != Some(config_name)
        || annotation(naming::ANNOTATION_PGBACKREST_HASH) != Some(config_hash)
}

async fn delete_job(scope: &ReconcileScope<'_>, job: &Job) -> Result<()> {
    let name = job.name_any();
    scope
        .store
        .delete(ResourceKind::Job, &scope.namespace(), &name)
        .await?;
    info!(job = %name, "Deleted replica-create backup job");
    metrics::REPLICA_CREATE_BACKUPS
        .with_label_values(&["deleted"])
        .inc();
    Ok(())
}

/// Drive the replica-create backup for the first repository.
///
/// `jobs` are the replica-create Jobs found during cleanup. A deleted Job is
/// not recreated in the same pass.
pub async fn reconcile_replica_create_backup(
    scope: &ReconcileScope<'_>,
    status: &mut PostgresClusterStatus,
    jobs: &[Job],
    service_account: &str,
    config_hash: &str,
) -> Result<()> {
    let generation = scope.generation();
    let repo_name = scope.cluster.replica_create_repo_name().map(str::to_string);
    let finalizer_repo = repo_name.clone();
    let mut status = ConditionFinalizer::new(status, move |s| {
        let repo = finalizer_repo.as_deref().and_then(|name| s.repo(name));
        let condition = replica_create_condition(repo, generation);
        set_condition(&mut s.conditions, condition);
    });

    let Some(repo_name) = repo_name else {
        return Ok(());
    };
    let Some(repo_status) = status.repo(&repo_name) else {
        return Ok(());
    };
    if !status.bootstrapped() || repo_status.replica_create_backup_complete {
        return Ok(());
    }

    let replica_repo_ready = is_condition_true(&status.conditions, REPLICA_REPO_READY);
    let host_ready = is_condition_true_or_absent(&status.conditions, REPO_HOST_READY);

    let target = find_exec_target(scope).await?;
    let config_name = if scope.cluster.dedicated_repo_host_enabled() {
        CM_REPO_KEY.to_string()
    } else {
        let instance = target.instance().ok_or_else(|| {
            Error::consistency(format!(
                "pod '{}' has no instance label",
                target.pod_name()
            ))
        })?;
        instance_config_key(instance)
    };

    if let Some(job) = jobs.first() {
        let failed = job_failed(job);
        let completed = job_completed(job);

        if !completed && !failed && (!host_ready || !replica_repo_ready) {
            debug!(job = %job.name_any(), "Repository not ready, removing running replica-create backup");
            return delete_job(scope, job).await;
        }

        if failed || job_drifted(job, &repo_name, &config_name, config_hash) {
            return delete_job(scope, job).await;
        }

        if completed {
            if let Some(repo) = status.repo_mut(&repo_name) {
                repo.replica_create_backup_complete = true;
            }
            info!(repo = %repo_name, "Replica-create backup completed");
            metrics::REPLICA_CREATE_BACKUPS
                .with_label_values(&["completed"])
                .inc();
            return Ok(());
        }
    }

    if !host_ready || !replica_repo_ready {
        return Ok(());
    }

    let params = BackupJobParams {
        selector: &target.selector,
        container: target.container,
        repo_name: &repo_name,
        service_account,
        config_name: Some(&config_name),
        backup_type: None,
    };
    let mut intent = replica_create_job_intent(scope.cluster, &params, config_hash)?;
    if let Some(existing) = jobs.first() {
        intent.metadata.name = existing.metadata.name.clone();
    }

    let job = apply(scope.store, scope.cluster, intent).await?;
    debug!(job = %job.name_any(), "Replica-create backup job applied");
    metrics::REPLICA_CREATE_BACKUPS
        .with_label_values(&["applied"])
        .inc();
    Ok(())
}
