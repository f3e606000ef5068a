//! Workload intents for pgBackRest
//!
//! Builders for the fully specified objects the reconciler applies: the
//! dedicated repository host, repository volumes, backup Jobs and CronJobs,
//! and the RBAC those Jobs run with. Owner references are set by the applier.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, Job, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, PodSecurityContext, PodSpec, PodTemplateSpec,
    ServiceAccount, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ObjectMeta;
use kube::ResourceExt;

use crate::crd::{PostgresCluster, RepoVolumeSpec};
use crate::error::{Error, Result};
use crate::naming::{self, BackupType};

use super::pgbackrest_config::{add_config_to_pod, CM_REPO_KEY};
use super::repo_storage::repo_path;
use super::ssh::add_ssh_to_pod;

/// Container running pgBackRest on repository hosts and in backup Jobs
pub const PGBACKREST_CONTAINER: &str = "pgbackrest";
/// Container running PostgreSQL in instance pods
pub const DATABASE_CONTAINER: &str = "database";

const PGBACKREST_BINARY: &str = "/opt/crunchy/bin/pgbackrest";

/// Pod selector and container in which pgBackRest commands run.
///
/// With a dedicated repository host the commands run there, otherwise on the
/// current primary. The primary only has a pgBackRest container when some
/// repository host is configured.
pub fn exec_target(cluster: &PostgresCluster) -> (String, &'static str) {
    let name = cluster.name_any();
    if cluster.dedicated_repo_host_enabled() {
        (naming::dedicated_selector(&name), PGBACKREST_CONTAINER)
    } else if cluster.repo_host_enabled() {
        (naming::primary_selector(&name), PGBACKREST_CONTAINER)
    } else {
        (naming::primary_selector(&name), DATABASE_CONTAINER)
    }
}

fn object_meta(
    cluster: &PostgresCluster,
    name: String,
    labels: BTreeMap<String, String>,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: Some(naming::namespace(cluster)),
        labels: Some(labels),
        annotations: Some(naming::merged_annotations(cluster)),
        ..Default::default()
    }
}

/// Build the dedicated repository host StatefulSet
pub fn repo_host_intent(cluster: &PostgresCluster, name: &str) -> StatefulSet {
    let cluster_name = cluster.name_any();
    let labels = naming::merged_labels(cluster, naming::dedicated_labels(&cluster_name));
    let pgbackrest = cluster.pgbackrest();

    let mut volumes = Vec::new();
    let mut mounts = Vec::new();
    for repo in pgbackrest.repos.iter().filter(|r| r.volume.is_some()) {
        let volume_name = format!("{}-volume", repo.name);
        volumes.push(Volume {
            name: volume_name.clone(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: naming::repo_volume_name(&cluster_name, &repo.name),
                read_only: None,
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: volume_name,
            mount_path: repo_path(&repo.name),
            ..Default::default()
        });
    }

    let mut template = PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels.clone()),
            annotations: Some(naming::merged_annotations(cluster)),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers: vec![Container {
                name: PGBACKREST_CONTAINER.to_string(),
                image: Some(pgbackrest.image.clone()),
                command: Some(vec![
                    "/usr/sbin/sshd".to_string(),
                    "-D".to_string(),
                    "-e".to_string(),
                ]),
                volume_mounts: Some(mounts),
                ..Default::default()
            }],
            volumes: Some(volumes),
            priority_class_name: pgbackrest
                .repo_host
                .as_ref()
                .and_then(|h| h.dedicated.as_ref())
                .and_then(|d| d.priority_class_name.clone()),
            security_context: Some(PodSecurityContext {
                fs_group: Some(26),
                supplemental_groups: Some(vec![65534]),
                ..Default::default()
            }),
            ..Default::default()
        }),
    };
    add_ssh_to_pod(cluster, &mut template);
    add_config_to_pod(cluster, &mut template, Some(CM_REPO_KEY), PGBACKREST_CONTAINER);

    StatefulSet {
        metadata: object_meta(cluster, name.to_string(), labels),
        spec: Some(StatefulSetSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(naming::dedicated_labels(&cluster_name)),
                ..Default::default()
            },
            service_name: format!("{}-pods", cluster_name),
            template,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build the PersistentVolumeClaim backing a repository
pub fn repo_volume_intent(
    cluster: &PostgresCluster,
    repo_name: &str,
    volume: &RepoVolumeSpec,
) -> PersistentVolumeClaim {
    let cluster_name = cluster.name_any();
    let mut requests = BTreeMap::new();
    requests.insert("storage".to_string(), Quantity(volume.size.clone()));

    PersistentVolumeClaim {
        metadata: object_meta(
            cluster,
            naming::repo_volume_name(&cluster_name, repo_name),
            naming::merged_labels(cluster, naming::repo_volume_labels(&cluster_name, repo_name)),
        ),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(volume.access_modes.clone()),
            storage_class_name: volume.storage_class_name.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Inputs shared by every backup Job
#[derive(Debug, Clone)]
pub struct BackupJobParams<'a> {
    /// Selector of the pod the backup command is sent to
    pub selector: &'a str,
    /// Container in that pod
    pub container: &'a str,
    pub repo_name: &'a str,
    pub service_account: &'a str,
    /// Config file mounted into the Job. Only the config hash is mounted
    /// when `None`.
    pub config_name: Option<&'a str>,
    /// `None` lets pgBackRest pick the backup type
    pub backup_type: Option<BackupType>,
}

/// Build the spec of a Job that runs `pgbackrest backup` against a repository
pub fn backup_job_spec(
    cluster: &PostgresCluster,
    params: &BackupJobParams<'_>,
    labels: &BTreeMap<String, String>,
) -> Result<JobSpec> {
    let index = naming::repo_index(params.repo_name).ok_or_else(|| {
        Error::validation(format!(
            "Repository name '{}' has no index",
            params.repo_name
        ))
    })?;

    let mut opts = vec![
        format!("--stanza={}", naming::STANZA),
        format!("--repo={}", index),
    ];
    if let Some(backup_type) = params.backup_type {
        opts.push(format!("--type={}", backup_type));
    }

    let env = |name: &str, value: String| EnvVar {
        name: name.to_string(),
        value: Some(value),
        ..Default::default()
    };

    let mut template = PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels.clone()),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers: vec![Container {
                name: PGBACKREST_CONTAINER.to_string(),
                image: Some(cluster.pgbackrest().image.clone()),
                command: Some(vec![PGBACKREST_BINARY.to_string()]),
                env: Some(vec![
                    env("COMMAND", "backup".to_string()),
                    env("COMMAND_OPTS", opts.join(" ")),
                    env("COMPARE_HASH", "true".to_string()),
                    env("CONTAINER", params.container.to_string()),
                    env("NAMESPACE", naming::namespace(cluster)),
                    env("SELECTOR", params.selector.to_string()),
                ]),
                ..Default::default()
            }],
            restart_policy: Some("Never".to_string()),
            service_account_name: Some(params.service_account.to_string()),
            ..Default::default()
        }),
    };
    add_config_to_pod(cluster, &mut template, params.config_name, PGBACKREST_CONTAINER);

    Ok(JobSpec {
        template,
        ..Default::default()
    })
}

/// Build the CronJob running scheduled backups of one type for a repository
pub fn backup_cronjob_intent(
    cluster: &PostgresCluster,
    schedule: &str,
    params: &BackupJobParams<'_>,
) -> Result<CronJob> {
    let backup_type = params.backup_type.ok_or_else(|| {
        Error::validation("Scheduled backups require a backup type")
    })?;
    let cluster_name = cluster.name_any();
    let labels = naming::merged_labels(
        cluster,
        naming::cronjob_labels(&cluster_name, params.repo_name, backup_type),
    );
    let job_spec = backup_job_spec(cluster, params, &labels)?;

    Ok(CronJob {
        metadata: object_meta(
            cluster,
            naming::cronjob_name(&cluster_name, params.repo_name, backup_type),
            labels.clone(),
        ),
        spec: Some(CronJobSpec {
            schedule: schedule.to_string(),
            concurrency_policy: Some("Forbid".to_string()),
            job_template: JobTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(naming::merged_annotations(cluster)),
                    ..Default::default()
                }),
                spec: Some(job_spec),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Build the replica-create backup Job
pub fn replica_create_job_intent(
    cluster: &PostgresCluster,
    params: &BackupJobParams<'_>,
    config_hash: &str,
) -> Result<Job> {
    let cluster_name = cluster.name_any();
    let labels = naming::merged_labels(
        cluster,
        naming::replica_create_job_labels(&cluster_name, params.repo_name),
    );

    let config_name = params.config_name.ok_or_else(|| {
        Error::validation("The replica-create backup requires a config file")
    })?;
    let mut annotations = naming::merged_annotations(cluster);
    annotations.insert(
        naming::ANNOTATION_PGBACKREST_CONFIG.to_string(),
        config_name.to_string(),
    );
    annotations.insert(
        naming::ANNOTATION_PGBACKREST_HASH.to_string(),
        config_hash.to_string(),
    );

    let spec = backup_job_spec(cluster, params, &labels)?;
    let mut metadata = object_meta(cluster, naming::replica_create_job_name(&cluster_name), labels);
    metadata.annotations = Some(annotations);

    Ok(Job {
        metadata,
        spec: Some(spec),
        ..Default::default()
    })
}

/// Build the ServiceAccount, Role and RoleBinding backup Jobs run with
pub fn rbac_intents(cluster: &PostgresCluster) -> (ServiceAccount, Role, RoleBinding) {
    let cluster_name = cluster.name_any();
    let name = naming::rbac_name(&cluster_name);
    let labels = naming::merged_labels(cluster, naming::pgbackrest_labels(&cluster_name));

    let service_account = ServiceAccount {
        metadata: object_meta(cluster, name.clone(), labels.clone()),
        ..Default::default()
    };

    let role = Role {
        metadata: object_meta(cluster, name.clone(), labels.clone()),
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(vec!["pods".to_string()]),
                verbs: vec!["get".to_string(), "list".to_string()],
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(vec!["pods/exec".to_string()]),
                verbs: vec!["create".to_string()],
                ..Default::default()
            },
        ]),
    };

    let binding = RoleBinding {
        metadata: object_meta(cluster, name.clone(), labels),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: name.clone(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name,
            ..Default::default()
        }]),
    };

    (service_account, role, binding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        DedicatedRepoHostSpec, PgBackRestRepo, PostgresClusterSpec, RepoHostSpec,
    };

    fn cluster() -> PostgresCluster {
        let mut c = PostgresCluster::new("hippo", PostgresClusterSpec::default());
        c.metadata.namespace = Some("db".to_string());
        c.spec.backups.pgbackrest.image = "pgbackrest:2.38".to_string();
        c.spec.backups.pgbackrest.repos = vec![PgBackRestRepo {
            name: "repo1".to_string(),
            volume: Some(RepoVolumeSpec::default()),
            ..Default::default()
        }];
        c
    }

    fn params<'a>(backup_type: Option<BackupType>) -> BackupJobParams<'a> {
        BackupJobParams {
            selector: "postgres.oso.sh/cluster=hippo,postgres.oso.sh/role=master",
            container: DATABASE_CONTAINER,
            repo_name: "repo1",
            service_account: "hippo-pgbackrest",
            config_name: Some("hippo-00.conf"),
            backup_type,
        }
    }

    fn env_value(spec: &JobSpec, name: &str) -> Option<String> {
        spec.template.spec.as_ref()?.containers[0]
            .env
            .as_ref()?
            .iter()
            .find(|e| e.name == name)?
            .value
            .clone()
    }

    #[test]
    fn test_exec_target_follows_repo_host() {
        let mut c = cluster();
        assert_eq!(exec_target(&c).1, DATABASE_CONTAINER);

        c.spec.backups.pgbackrest.repo_host = Some(RepoHostSpec { dedicated: None });
        assert_eq!(exec_target(&c).1, PGBACKREST_CONTAINER);
        assert!(exec_target(&c).0.contains("role=master"));

        c.spec.backups.pgbackrest.repo_host = Some(RepoHostSpec {
            dedicated: Some(DedicatedRepoHostSpec::default()),
        });
        assert!(exec_target(&c).0.contains("pgbackrest-dedicated"));
    }

    #[test]
    fn test_backup_job_invokes_pgbackrest() {
        let spec = backup_job_spec(&cluster(), &params(None), &BTreeMap::new()).unwrap();
        assert_eq!(env_value(&spec, "COMMAND").as_deref(), Some("backup"));
        assert_eq!(
            env_value(&spec, "COMMAND_OPTS").as_deref(),
            Some("--stanza=db --repo=1")
        );
        assert_eq!(env_value(&spec, "NAMESPACE").as_deref(), Some("db"));

        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        assert_eq!(pod.service_account_name.as_deref(), Some("hippo-pgbackrest"));
        assert_eq!(
            pod.containers[0].volume_mounts.as_ref().unwrap()[0].mount_path,
            "/etc/pgbackrest/conf.d"
        );
    }

    #[test]
    fn test_cronjob_carries_backup_type() {
        let cron = backup_cronjob_intent(&cluster(), "0 1 * * *", &params(Some(BackupType::Full)))
            .unwrap();
        assert_eq!(cron.metadata.name.as_deref(), Some("hippo-repo1-full-backup"));

        let spec = cron.spec.unwrap();
        assert_eq!(spec.schedule, "0 1 * * *");
        let job = spec.job_template.spec.unwrap();
        assert_eq!(
            env_value(&job, "COMMAND_OPTS").as_deref(),
            Some("--stanza=db --repo=1 --type=full")
        );
    }

    #[test]
    fn test_replica_create_job_is_annotated() {
        let job = replica_create_job_intent(&cluster(), &params(None), "hash1").unwrap();
        let annotations = job.metadata.annotations.unwrap();
        assert_eq!(annotations[naming::ANNOTATION_PGBACKREST_CONFIG], "hippo-00.conf");
        assert_eq!(annotations[naming::ANNOTATION_PGBACKREST_HASH], "hash1");

        let labels = job.metadata.labels.unwrap();
        assert_eq!(labels[naming::LABEL_PGBACKREST_BACKUP], "replica-create");
        assert_eq!(labels[naming::LABEL_PGBACKREST_REPO], "repo1");
    }

    #[test]
    fn test_repo_host_mounts_volumes() {
        let sts = repo_host_intent(&cluster(), "hippo-repo-host");
        let spec = sts.spec.unwrap();
        assert_eq!(spec.replicas, Some(1));

        let pod = spec.template.spec.unwrap();
        let mounts = pod.containers[0].volume_mounts.clone().unwrap();
        assert!(mounts.iter().any(|m| m.mount_path == "/pgbackrest/repo1"));
        assert!(mounts.iter().any(|m| m.mount_path == "/etc/ssh"));
    }

    #[test]
    fn test_rbac_allows_pod_exec() {
        let (sa, role, binding) = rbac_intents(&cluster());
        assert_eq!(sa.metadata.name.as_deref(), Some("hippo-pgbackrest"));
        let rules = role.rules.unwrap();
        assert!(rules
            .iter()
            .any(|r| r.resources.as_ref().unwrap().contains(&"pods/exec".to_string())));
        assert_eq!(binding.role_ref.name, "hippo-pgbackrest");
    }
}
