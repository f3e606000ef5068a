//! pgBackRest reconcile cycle
//!
//! Runs the backup subsystem steps in dependency order against a status
//! accumulator owned by the caller. A failing step is logged and turned
//! into a requeue request; it never stops the steps after it.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::adapters::{calculate_config_hashes, resolve_repo_storage, ConfigHashes};
use crate::crd::{PostgresCluster, PostgresClusterStatus};
use crate::error::{Error, Result};
use crate::metrics;
use crate::naming;

use super::conditions::{remove_condition, REPO_HOST_READY};
use super::configuration::reconcile_pgbackrest_config;
use super::ownership::list_and_clean;
use super::pods::{list_instances, Instances};
use super::rbac::reconcile_rbac;
use super::replica_create::reconcile_replica_create_backup;
use super::repos::{reconcile_dedicated_repo_host, reconcile_repos};
use super::schedules::{reconcile_scheduled_backups, repo_schedules, validate_schedule};
use super::stanza::{reconcile_stanza_create, StanzaOutcome};
use super::{ReconcileResult, ReconcileScope};

const MAX_REPOS: u32 = 4;

/// Validate the pgBackRest section of a cluster spec
pub fn validate(cluster: &PostgresCluster) -> Result<()> {
    let pgbackrest = cluster.pgbackrest();

    if pgbackrest.image.trim().is_empty() {
        return Err(Error::validation("A pgBackRest image must be specified"));
    }

    let mut seen = HashSet::new();
    for repo in &pgbackrest.repos {
        match naming::repo_index(&repo.name) {
            Some(index) if repo.name == format!("repo{}", index) && (1..=MAX_REPOS).contains(&index) => {}
            _ => {
                return Err(Error::validation(format!(
                    "Invalid repository name '{}': must be one of repo1 through repo{}",
                    repo.name, MAX_REPOS
                )));
            }
        }
        if !seen.insert(repo.name.as_str()) {
            return Err(Error::validation(format!(
                "Repository '{}' is defined more than once",
                repo.name
            )));
        }

        resolve_repo_storage(repo)?;

        for (_, schedule) in repo_schedules(repo) {
            validate_schedule(schedule)?;
        }
    }

    Ok(())
}

fn step_failed(step: &'static str, cluster: &str, error: &Error) {
    warn!(step, cluster, error = %error, "pgBackRest reconcile step failed");
    metrics::RECONCILIATION_ERRORS
        .with_label_values(&[step])
        .inc();
}

/// Reconcile the pgBackRest backup subsystem of a cluster.
///
/// Steps, in order: ownership cleanup, instance discovery, dedicated host,
/// configuration hashes, repositories, configuration and SSH, RBAC, stanza
/// creation, scheduled backups and the replica-create backup. Only a failure
/// to list the owned resources ends the cycle early.
pub async fn reconcile_pgbackrest(
    scope: &ReconcileScope<'_>,
    status: &mut PostgresClusterStatus,
) -> Result<ReconcileResult> {
    let cluster_name = scope.name();
    let mut result = ReconcileResult::default();

    let cleanup = list_and_clean(scope).await?;
    if let Some(e) = &cleanup.error {
        step_failed("cleanup", &cluster_name, e);
        result = result.merge(ReconcileResult::requeue());
    }
    let resources = cleanup.resources;
    debug!(
        cluster = %cluster_name,
        deleted = cleanup.deleted,
        hosts = resources.hosts.len(),
        volumes = resources.volumes.len(),
        cronjobs = resources.cronjobs.len(),
        "Observed pgBackRest resources"
    );

    let instances = match list_instances(scope).await {
        Ok(instances) => instances,
        Err(e) => {
            step_failed("instances", &cluster_name, &e);
            result = result.merge(ReconcileResult::requeue());
            Instances::default()
        }
    };

    let mut repo_host_name = None;
    if scope.cluster.dedicated_repo_host_enabled() {
        match reconcile_dedicated_repo_host(scope, status, &resources.hosts).await {
            Ok(host) => repo_host_name = host.metadata.name,
            Err(e) => {
                step_failed("repo_host", &cluster_name, &e);
                result = result.merge(ReconcileResult::requeue());
            }
        }
    } else {
        remove_condition(&mut status.conditions, REPO_HOST_READY);
        if let Some(pgbackrest) = status.pgbackrest.as_mut() {
            pgbackrest.repo_host = None;
        }
    }

    let hashes = match calculate_config_hashes(scope.cluster, repo_host_name.as_deref()) {
        Ok(hashes) => hashes,
        Err(e) => {
            step_failed("config_hash", &cluster_name, &e);
            result = result.merge(ReconcileResult::requeue());
            ConfigHashes::default()
        }
    };

    if let Err(e) = reconcile_repos(scope, status, &hashes.repos).await {
        step_failed("repos", &cluster_name, &e);
        result = result.merge(ReconcileResult::requeue());
    }

    if let Err(e) = reconcile_pgbackrest_config(
        scope,
        repo_host_name.as_deref(),
        &hashes.combined,
        &instances.names,
        resources.ssh_secret.as_ref(),
    )
    .await
    {
        step_failed("config", &cluster_name, &e);
        result = result.merge(ReconcileResult::requeue());
    }

    if let Err(e) = reconcile_rbac(scope).await {
        step_failed("rbac", &cluster_name, &e);
        result = result.merge(ReconcileResult::requeue());
    }
    let service_account = naming::rbac_name(&cluster_name);

    match reconcile_stanza_create(scope, status, &hashes.combined).await {
        Ok(StanzaOutcome::ConfigHashMismatch) => {
            info!(cluster = %cluster_name, "pgBackRest configuration still propagating, retrying stanza creation later");
            result = result.merge(scope.requeue_delayed());
        }
        Ok(_) => {}
        Err(e) => {
            step_failed("stanza", &cluster_name, &e);
            result = result.merge(scope.requeue_delayed());
        }
    }

    if reconcile_scheduled_backups(scope, &service_account).await {
        result = result.merge(scope.requeue_delayed());
    }

    if let Err(e) = reconcile_replica_create_backup(
        scope,
        status,
        &resources.replica_create_jobs,
        &service_account,
        &hashes.combined,
    )
    .await
    {
        step_failed("replica_create", &cluster_name, &e);
        result = result.merge(ReconcileResult::requeue());
    }

    Ok(result)
}

/// Run one cycle against a copy of the cluster's stored status. Returns
/// the updated status, stamped with the observed generation, and the
/// requeue request.
pub async fn reconcile_cluster(
    scope: &ReconcileScope<'_>,
) -> Result<(PostgresClusterStatus, ReconcileResult)> {
    let mut status = scope.cluster.status.clone().unwrap_or_default();
    let result = reconcile_pgbackrest(scope, &mut status).await?;
    status.observed_generation = scope.generation();
    Ok((status, result))
}
