//! Ownership listing and cleanup
//!
//! Lists every resource labeled as pgBackRest infrastructure of the cluster,
//! keeps the ones the cluster controls and its spec still calls for, and
//! deletes the rest.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Secret};
use kube::core::DynamicObject;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::crd::PostgresCluster;
use crate::error::{Error, Result};
use crate::k8s::{from_dynamic, ResourceKind};
use crate::metrics;
use crate::naming::{self, BackupType};

use super::schedules::schedule_for;
use super::ReconcileScope;

/// Typed pgBackRest resources that survived cleanup
#[derive(Clone, Debug, Default)]
pub struct RepoResources {
    pub ssh_config: Option<ConfigMap>,
    pub ssh_secret: Option<Secret>,
    pub hosts: Vec<StatefulSet>,
    pub volumes: Vec<PersistentVolumeClaim>,
    pub replica_create_jobs: Vec<Job>,
    pub cronjobs: Vec<CronJob>,
}

/// Result of the ownership step
#[derive(Debug, Default)]
pub struct Cleanup {
    pub resources: RepoResources,
    /// Number of resources deleted
    pub deleted: usize,
    /// Deletion failures. They do not stop the remaining steps.
    pub error: Option<Error>,
}

/// What the cleanup step does with an owned resource
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Retention {
    Keep,
    Delete,
}

/// Decide whether an owned resource is still called for by the spec.
///
/// The first matching class label decides. Dedicated host resources are
/// checked before repository host resources since they carry both labels.
pub fn classify(cluster: &PostgresCluster, labels: &BTreeMap<String, String>) -> Retention {
    let keep_if = |keep: bool| if keep { Retention::Keep } else { Retention::Delete };
    let repo_label = labels.get(naming::LABEL_PGBACKREST_REPO).map(String::as_str);
    let repos = &cluster.pgbackrest().repos;

    if labels.contains_key(naming::LABEL_PGBACKREST_CONFIG) {
        Retention::Keep
    } else if labels.contains_key(naming::LABEL_PGBACKREST_DEDICATED) {
        keep_if(cluster.dedicated_repo_host_enabled())
    } else if labels.contains_key(naming::LABEL_PGBACKREST_HOST) {
        keep_if(cluster.repo_host_enabled())
    } else if labels.contains_key(naming::LABEL_PGBACKREST_VOLUME) {
        keep_if(
            repos
                .iter()
                .any(|r| r.volume.is_some() && Some(r.name.as_str()) == repo_label),
        )
    } else if labels.contains_key(naming::LABEL_PGBACKREST_BACKUP) {
        keep_if(repos.iter().any(|r| Some(r.name.as_str()) == repo_label))
    } else if let Some(backup_type) = labels.get(naming::LABEL_PGBACKREST_CRONJOB) {
        let scheduled = repos
            .iter()
            .find(|r| Some(r.name.as_str()) == repo_label)
            .and_then(|r| r.backup_schedules.as_ref())
            .zip(BackupType::from_label(backup_type))
            .is_some_and(|(s, t)| schedule_for(s, t).is_some());
        keep_if(scheduled)
    } else {
        Retention::Delete
    }
}

fn controlled_by(obj: &DynamicObject, cluster: &PostgresCluster) -> bool {
    let Some(uid) = cluster.uid() else {
        return false;
    };
    obj.owner_references()
        .iter()
        .any(|o| o.controller == Some(true) && o.uid == uid)
}

/// List, clean up and decode the pgBackRest resources of a cluster.
///
/// A failed list aborts the step. Failed deletions are collected and
/// returned alongside the surviving resources.
pub async fn list_and_clean(scope: &ReconcileScope<'_>) -> Result<Cleanup> {
    let namespace = scope.namespace();
    let selector = naming::pgbackrest_selector(&scope.name());
    let mut cleanup = Cleanup::default();
    let mut errors = Vec::new();

    for kind in ResourceKind::OWNED {
        let objects = scope.store.list(kind, &namespace, &selector).await?;

        for obj in objects {
            if !controlled_by(&obj, scope.cluster) {
                debug!(kind = %kind, name = %obj.name_any(), "Skipping resource not controlled by cluster");
                continue;
            }

            match classify(scope.cluster, obj.labels()) {
                Retention::Keep => collect(scope.cluster, kind, &obj, &mut cleanup.resources)?,
                Retention::Delete => {
                    let name = obj.name_any();
                    match scope.store.delete(kind, &namespace, &name).await {
                        Ok(()) => {
                            info!(kind = %kind, name = %name, "Deleted pgBackRest resource no longer in spec");
                            metrics::CLEANUP_DELETIONS
                                .with_label_values(&[kind.as_str()])
                                .inc();
                            cleanup.deleted += 1;
                        }
                        Err(e) => {
                            warn!(kind = %kind, name = %name, error = %e, "Failed to delete pgBackRest resource");
                            errors.push(Error::from(e));
                        }
                    }
                }
            }
        }
    }

    cleanup.error = Error::aggregate(errors).err();
    Ok(cleanup)
}

fn collect(
    cluster: &PostgresCluster,
    kind: ResourceKind,
    obj: &DynamicObject,
    resources: &mut RepoResources,
) -> Result<()> {
    let cluster_name = cluster.name_any();
    match kind {
        ResourceKind::ConfigMap => {
            if obj.name_any() == naming::ssh_config_name(&cluster_name) {
                resources.ssh_config = Some(from_dynamic(kind, obj)?);
            }
        }
        ResourceKind::Secret => {
            if obj.name_any() == naming::ssh_secret_name(&cluster_name) {
                resources.ssh_secret = Some(from_dynamic(kind, obj)?);
            }
        }
        ResourceKind::StatefulSet => resources.hosts.push(from_dynamic(kind, obj)?),
        ResourceKind::PersistentVolumeClaim => resources.volumes.push(from_dynamic(kind, obj)?),
        ResourceKind::Job => {
            let replica_create = obj
                .labels()
                .get(naming::LABEL_PGBACKREST_BACKUP)
                .is_some_and(|v| v == naming::BACKUP_REPLICA_CREATE);
            if replica_create {
                resources.replica_create_jobs.push(from_dynamic(kind, obj)?);
            }
        }
        ResourceKind::CronJob => resources.cronjobs.push(from_dynamic(kind, obj)?),
        _ => {}
    }
    Ok(())
}
