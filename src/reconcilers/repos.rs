//! Repository lifecycle: the dedicated repository host, repository volumes
//! and the per-repository status they feed

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{info, warn};

use crate::adapters::{repo_host_intent, repo_volume_intent};
use crate::crd::{PostgresClusterStatus, RepoHostStatus, RepoStatus};
use crate::error::{Error, Result};
use crate::k8s::reasons;
use crate::naming;

use super::apply::{apply, apply_tracked};
use super::conditions::{repo_host_ready_condition, set_condition, ConditionFinalizer};
use super::ReconcileScope;

/// Oldest host by creation time, the canonical one when several exist
pub fn canonical_host(hosts: &[StatefulSet]) -> Option<&StatefulSet> {
    hosts
        .iter()
        .min_by_key(|h| h.metadata.creation_timestamp.as_ref().map(|t| t.0))
}

/// Apply the dedicated repository host and record its readiness.
///
/// `hosts` are the host StatefulSets found during cleanup. The oldest one is
/// kept under its current name; with none a deterministic name is used.
/// `RepoHostReady` is recomputed from the recorded host status on every
/// exit, including failures.
pub async fn reconcile_dedicated_repo_host(
    scope: &ReconcileScope<'_>,
    status: &mut PostgresClusterStatus,
    hosts: &[StatefulSet],
) -> Result<StatefulSet> {
    let generation = scope.generation();
    let mut status = ConditionFinalizer::new(status, move |s| {
        let condition = repo_host_ready_condition(s, generation);
        set_condition(&mut s.conditions, condition);
    });

    let (name, is_create) = match canonical_host(hosts) {
        Some(host) => (host.name_any(), false),
        None => (naming::repo_host_name(&scope.name()), true),
    };
    let applied = apply_tracked(scope.store, scope.cluster, repo_host_intent(scope.cluster, &name)).await?;

    if is_create || applied.created {
        info!(name = %name, "Created pgBackRest repository host");
        scope
            .events
            .record(
                &scope.object_ref(),
                EventType::Normal,
                reasons::REPO_HOST_CREATED,
                &format!("Created pgBackRest repository host StatefulSet/{}", name),
            )
            .await;
    }

    status.pgbackrest_mut().repo_host = Some(repo_host_status(&applied.object));
    Ok(applied.object)
}

/// Host status derived from the StatefulSet's replica counts
pub fn repo_host_status(host: &StatefulSet) -> RepoHostStatus {
    let desired = host.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let ready = host
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);

    RepoHostStatus {
        api_version: Some("apps/v1".to_string()),
        kind: Some("StatefulSet".to_string()),
        ready: ready == desired,
    }
}

/// Binding state of an applied repository volume
#[derive(Clone, Debug, PartialEq)]
pub struct VolumeObservation {
    pub repo: String,
    pub bound: bool,
    pub volume: Option<String>,
}

impl VolumeObservation {
    pub fn from_claim(repo: &str, claim: &PersistentVolumeClaim) -> Self {
        Self {
            repo: repo.to_string(),
            bound: claim
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                == Some("Bound"),
            volume: claim.spec.as_ref().and_then(|s| s.volume_name.clone()),
        }
    }
}

/// Fold volume observations and external repository hashes into the
/// repository statuses.
///
/// Only repositories with an applied volume or an options hash are
/// reported, except those named in `carried`, whose prior status is kept
/// while their volume could not be applied. A changed options hash resets
/// stanza and replica-create progress for that repository, and only the
/// replica-create repository may report a complete replica-create backup.
/// The result is sorted by name.
pub fn fold_repo_status(
    prior: &[RepoStatus],
    volumes: &[VolumeObservation],
    repo_hashes: &BTreeMap<String, String>,
    carried: &[String],
    replica_create_repo: Option<&str>,
) -> Vec<RepoStatus> {
    let previous = |name: &str| prior.iter().find(|r| r.name == name).cloned();
    let mut folded: Vec<RepoStatus> = Vec::new();

    for volume in volumes {
        let mut repo = previous(&volume.repo).unwrap_or_else(|| RepoStatus {
            name: volume.repo.clone(),
            ..Default::default()
        });
        repo.bound = volume.bound;
        if volume.volume.is_some() {
            repo.volume = volume.volume.clone();
        }
        folded.push(repo);
    }

    for (name, hash) in repo_hashes {
        let repo = match previous(name) {
            Some(mut repo) => {
                if repo.repo_options_hash.as_deref() != Some(hash.as_str()) {
                    repo.repo_options_hash = Some(hash.clone());
                    repo.stanza_created = false;
                    repo.replica_create_backup_complete = false;
                }
                repo
            }
            None => RepoStatus {
                name: name.clone(),
                repo_options_hash: Some(hash.clone()),
                ..Default::default()
            },
        };
        folded.push(repo);
    }

    for name in carried {
        if folded.iter().all(|r| &r.name != name) {
            folded.extend(previous(name));
        }
    }

    for repo in folded.iter_mut() {
        if Some(repo.name.as_str()) != replica_create_repo {
            repo.replica_create_backup_complete = false;
        }
    }
    folded.sort_by(|a, b| a.name.cmp(&b.name));
    folded
}

/// Apply a volume for every volume-backed repository and refresh the
/// repository statuses
pub async fn reconcile_repos(
    scope: &ReconcileScope<'_>,
    status: &mut PostgresClusterStatus,
    repo_hashes: &BTreeMap<String, String>,
) -> Result<()> {
    let mut observed = Vec::new();
    let mut carried = Vec::new();
    let mut errors = Vec::new();

    for repo in &scope.cluster.pgbackrest().repos {
        let Some(volume) = &repo.volume else {
            continue;
        };
        match apply(scope.store, scope.cluster, repo_volume_intent(scope.cluster, &repo.name, volume)).await {
            Ok(claim) => observed.push(VolumeObservation::from_claim(&repo.name, &claim)),
            Err(e) => {
                warn!(repo = %repo.name, cluster = %scope.cluster.name_any(), error = %e, "Failed to apply repository volume");
                carried.push(repo.name.clone());
                errors.push(e);
            }
        }
    }

    let repos = fold_repo_status(
        status.repos(),
        &observed,
        repo_hashes,
        &carried,
        scope.cluster.replica_create_repo_name(),
    );
    status.pgbackrest_mut().repos = repos;

    Error::aggregate(errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{StatefulSetSpec, StatefulSetStatus};

    fn status(name: &str) -> RepoStatus {
        RepoStatus {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn hashes(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_new_volume_repo_is_added() {
        let folded = fold_repo_status(
            &[],
            &[VolumeObservation {
                repo: "repo1".to_string(),
                bound: true,
                volume: Some("pv-1".to_string()),
            }],
            &BTreeMap::new(),
            &[],
            Some("repo1"),
        );
        assert_eq!(folded.len(), 1);
        assert!(folded[0].bound);
        assert_eq!(folded[0].volume.as_deref(), Some("pv-1"));
        assert!(!folded[0].stanza_created);
    }

    #[test]
    fn test_hash_change_resets_progress() {
        let mut prior = status("repo2");
        prior.repo_options_hash = Some("old".to_string());
        prior.stanza_created = true;
        prior.replica_create_backup_complete = true;

        let folded = fold_repo_status(&[prior], &[], &hashes(&[("repo2", "new")]), &[], Some("repo2"));
        assert_eq!(folded[0].repo_options_hash.as_deref(), Some("new"));
        assert!(!folded[0].stanza_created);
        assert!(!folded[0].replica_create_backup_complete);
    }

    #[test]
    fn test_unchanged_hash_keeps_progress() {
        let mut prior = status("repo2");
        prior.repo_options_hash = Some("same".to_string());
        prior.stanza_created = true;
        prior.replica_create_backup_complete = true;

        let folded = fold_repo_status(
            &[prior.clone()],
            &[],
            &hashes(&[("repo2", "same")]),
            &[],
            Some("repo2"),
        );
        assert_eq!(folded, vec![prior]);
    }

    #[test]
    fn test_replica_create_completion_follows_repo_identity() {
        let mut prior = status("repo1");
        prior.stanza_created = true;
        prior.replica_create_backup_complete = true;

        let folded = fold_repo_status(
            &[prior],
            &[VolumeObservation {
                repo: "repo1".to_string(),
                bound: true,
                volume: None,
            }],
            &BTreeMap::new(),
            &[],
            Some("repo2"),
        );
        assert!(folded[0].stanza_created);
        assert!(!folded[0].replica_create_backup_complete);
    }

    #[test]
    fn test_repos_absent_from_spec_are_dropped_and_result_sorted() {
        let prior = vec![status("repo3"), status("repo4")];
        let folded = fold_repo_status(
            &prior,
            &[VolumeObservation {
                repo: "repo3".to_string(),
                bound: false,
                volume: None,
            }],
            &hashes(&[("repo1", "h1")]),
            &[],
            Some("repo1"),
        );
        let names: Vec<_> = folded.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["repo1", "repo3"]);
    }

    #[test]
    fn test_failed_volume_keeps_prior_status() {
        let mut prior = status("repo1");
        prior.bound = true;
        prior.stanza_created = true;

        let folded = fold_repo_status(
            &[prior.clone()],
            &[],
            &BTreeMap::new(),
            &["repo1".to_string()],
            Some("repo1"),
        );
        assert_eq!(folded, vec![prior]);
    }

    #[test]
    fn test_oldest_host_is_canonical() {
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
        use kube::api::ObjectMeta;

        let host = |name: &str, age_secs: i64| StatefulSet {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                creation_timestamp: Some(Time(chrono::Utc::now() - chrono::Duration::seconds(age_secs))),
                ..Default::default()
            },
            ..Default::default()
        };
        let hosts = vec![host("newer", 10), host("older", 100)];
        assert_eq!(canonical_host(&hosts).unwrap().name_any(), "older");
        assert!(canonical_host(&[]).is_none());
    }

    #[test]
    fn test_host_ready_when_all_replicas_ready() {
        let mut host = StatefulSet {
            spec: Some(StatefulSetSpec {
                replicas: Some(1),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(!repo_host_status(&host).ready);

        host.status = Some(StatefulSetStatus {
            ready_replicas: Some(1),
            ..Default::default()
        });
        let status = repo_host_status(&host);
        assert!(status.ready);
        assert_eq!(status.kind.as_deref(), Some("StatefulSet"));
    }
}
