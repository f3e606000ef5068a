//! pgBackRest configuration adapter
//!
//! Renders the shared pgBackRest ConfigMap for a cluster and computes the
//! hashes used to detect configuration drift. The ConfigMap holds one
//! `<instance>.conf` per database instance, `pgbackrest_repo.conf` when a
//! dedicated repository host runs, and the combined `config-hash`.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapProjection, KeyToPath, PodTemplateSpec, ProjectedVolumeSource, Volume,
    VolumeMount, VolumeProjection,
};
use kube::api::ObjectMeta;
use kube::ResourceExt;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::crd::PostgresCluster;
use crate::error::Result;
use crate::naming;

use super::repo_storage::{repo_options, repo_path, resolve_repo_storage, RepoStorage};

/// ConfigMap key of the dedicated repository host configuration
pub const CM_REPO_KEY: &str = "pgbackrest_repo.conf";
/// ConfigMap key holding the combined configuration hash
pub const CM_CONFIG_HASH_KEY: &str = "config-hash";
/// Directory pgBackRest reads additional configuration from
pub const CONFIG_MOUNT_PATH: &str = "/etc/pgbackrest/conf.d";
/// Name of the projected configuration volume
pub const CONFIG_VOLUME_NAME: &str = "pgbackrest-config";

const PGDATA_PATH: &str = "/pgdata/pg";
const PG_SOCKET_PATH: &str = "/tmp/postgres";
const PG_PORT: &str = "5432";

/// Configuration fingerprints for a cluster
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigHashes {
    /// Options hash per external repository name
    pub repos: BTreeMap<String, String>,
    /// Hash over the repository host name and every external repository hash
    pub combined: String,
}

/// Config file key for a database instance
pub fn instance_config_key(instance: &str) -> String {
    format!("{}.conf", instance)
}

/// Stable short fingerprint of a serializable value
pub fn hash_value<T: Serialize>(value: &T) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    let digest = Sha256::digest(&bytes);
    Ok(digest[..8].iter().map(|b| format!("{:02x}", b)).collect())
}

/// Compute the per-repository hashes of external repositories and the
/// combined configuration hash
pub fn calculate_config_hashes(
    cluster: &PostgresCluster,
    repo_host_name: Option<&str>,
) -> Result<ConfigHashes> {
    let mut repos = BTreeMap::new();
    for repo in &cluster.pgbackrest().repos {
        let storage = resolve_repo_storage(repo)?;
        if storage.is_external() {
            let options = repo_options(&repo.name, &storage)?;
            repos.insert(repo.name.clone(), hash_value(&options)?);
        }
    }

    let combined = hash_value(&(repo_host_name.unwrap_or_default(), &repos))?;
    Ok(ConfigHashes { repos, combined })
}

fn pod_host(pod: &str, cluster: &str, namespace: &str) -> String {
    format!("{}.{}-pods.{}.svc", pod, cluster, namespace)
}

fn render_ini(sections: &[(&str, BTreeMap<String, String>)]) -> String {
    let mut out = String::new();
    for (i, (name, options)) in sections.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let _ = writeln!(out, "[{}]", name);
        for (key, value) in options {
            let _ = writeln!(out, "{}={}", key, value);
        }
    }
    out
}

/// Configuration read by pgBackRest inside a database instance
fn instance_config(
    cluster: &PostgresCluster,
    repo_host: Option<&str>,
    namespace: &str,
) -> Result<String> {
    let mut global = BTreeMap::new();
    global.insert("log-path".to_string(), "/pgdata/pgbackrest/log".to_string());

    for repo in &cluster.pgbackrest().repos {
        let storage = resolve_repo_storage(repo)?;
        let options = repo_options(&repo.name, &storage)?;
        global.extend(options);

        if let (RepoStorage::Volume(_), Some(host)) = (&storage, repo_host) {
            if let Some(index) = naming::repo_index(&repo.name) {
                global.insert(
                    format!("repo{}-host", index),
                    pod_host(&format!("{}-0", host), &cluster.name_any(), namespace),
                );
                global.insert(format!("repo{}-host-user", index), "postgres".to_string());
            }
        }
    }

    let mut db = BTreeMap::new();
    db.insert("pg1-path".to_string(), PGDATA_PATH.to_string());
    db.insert("pg1-port".to_string(), PG_PORT.to_string());
    db.insert("pg1-socket-path".to_string(), PG_SOCKET_PATH.to_string());

    Ok(render_ini(&[("global", global), (naming::STANZA, db)]))
}

/// Configuration read by pgBackRest on the dedicated repository host
fn repo_host_config(
    cluster: &PostgresCluster,
    instance_names: &[String],
    namespace: &str,
) -> Result<String> {
    let mut global = BTreeMap::new();
    global.insert("log-path".to_string(), format!("{}/log", repo_path("repo-host")));

    for repo in &cluster.pgbackrest().repos {
        let storage = resolve_repo_storage(repo)?;
        global.extend(repo_options(&repo.name, &storage)?);
    }

    let mut db = BTreeMap::new();
    for (i, instance) in instance_names.iter().enumerate() {
        let n = i + 1;
        db.insert(
            format!("pg{}-host", n),
            pod_host(&format!("{}-0", instance), &cluster.name_any(), namespace),
        );
        db.insert(format!("pg{}-path", n), PGDATA_PATH.to_string());
        db.insert(format!("pg{}-port", n), PG_PORT.to_string());
        db.insert(format!("pg{}-socket-path", n), PG_SOCKET_PATH.to_string());
    }

    Ok(render_ini(&[("global", global), (naming::STANZA, db)]))
}

/// Build the pgBackRest ConfigMap for a cluster
pub fn config_map_intent(
    cluster: &PostgresCluster,
    repo_host_name: Option<&str>,
    config_hash: &str,
    instance_names: &[String],
) -> Result<ConfigMap> {
    let namespace = naming::namespace(cluster);
    let name = cluster.name_any();

    let mut data = BTreeMap::new();
    for instance in instance_names {
        data.insert(
            instance_config_key(instance),
            instance_config(cluster, repo_host_name, &namespace)?,
        );
    }
    if cluster.dedicated_repo_host_enabled() {
        data.insert(
            CM_REPO_KEY.to_string(),
            repo_host_config(cluster, instance_names, &namespace)?,
        );
    }
    data.insert(CM_CONFIG_HASH_KEY.to_string(), config_hash.to_string());

    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(naming::config_map_name(&name)),
            namespace: Some(namespace),
            labels: Some(naming::merged_labels(cluster, naming::config_labels(&name))),
            annotations: Some(naming::merged_annotations(cluster)),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    })
}

/// Mount a configuration file (if any) plus the config hash into a container
/// of the pod template
pub fn add_config_to_pod(
    cluster: &PostgresCluster,
    template: &mut PodTemplateSpec,
    config_name: Option<&str>,
    container_name: &str,
) {
    let items = config_name
        .into_iter()
        .chain([CM_CONFIG_HASH_KEY])
        .map(|key| KeyToPath {
            key: key.to_string(),
            path: key.to_string(),
            ..Default::default()
        })
        .collect();
    let projection = VolumeProjection {
        config_map: Some(ConfigMapProjection {
            name: naming::config_map_name(&cluster.name_any()),
            items: Some(items),
            ..Default::default()
        }),
        ..Default::default()
    };

    let Some(spec) = template.spec.as_mut() else {
        return;
    };
    spec.volumes.get_or_insert_with(Vec::new).push(Volume {
        name: CONFIG_VOLUME_NAME.to_string(),
        projected: Some(ProjectedVolumeSource {
            sources: Some(vec![projection]),
            ..Default::default()
        }),
        ..Default::default()
    });

    for container in spec.containers.iter_mut().filter(|c| c.name == container_name) {
        container
            .volume_mounts
            .get_or_insert_with(Vec::new)
            .push(VolumeMount {
                name: CONFIG_VOLUME_NAME.to_string(),
                mount_path: CONFIG_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        DedicatedRepoHostSpec, PgBackRestRepo, PostgresClusterSpec, RepoHostSpec, RepoS3Spec,
        RepoVolumeSpec,
    };

    fn cluster(repos: Vec<PgBackRestRepo>) -> PostgresCluster {
        let mut cluster = PostgresCluster::new("hippo", PostgresClusterSpec::default());
        cluster.metadata.namespace = Some("db".to_string());
        cluster.spec.backups.pgbackrest.image = "pgbackrest:latest".to_string();
        cluster.spec.backups.pgbackrest.repos = repos;
        cluster
    }

    fn volume_repo(name: &str) -> PgBackRestRepo {
        PgBackRestRepo {
            name: name.to_string(),
            volume: Some(RepoVolumeSpec::default()),
            ..Default::default()
        }
    }

    fn s3_repo(name: &str, bucket: &str) -> PgBackRestRepo {
        PgBackRestRepo {
            name: name.to_string(),
            s3: Some(RepoS3Spec {
                bucket: bucket.to_string(),
                endpoint: "s3.amazonaws.com".to_string(),
                region: "us-east-1".to_string(),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_only_external_repos_are_hashed() {
        let c = cluster(vec![volume_repo("repo1"), s3_repo("repo2", "a")]);
        let hashes = calculate_config_hashes(&c, None).unwrap();
        assert_eq!(hashes.repos.len(), 1);
        assert!(hashes.repos.contains_key("repo2"));
        assert_eq!(hashes.repos["repo2"].len(), 16);
    }

    #[test]
    fn test_hashes_are_stable_and_detect_changes() {
        let a = calculate_config_hashes(&cluster(vec![s3_repo("repo1", "a")]), None).unwrap();
        let again = calculate_config_hashes(&cluster(vec![s3_repo("repo1", "a")]), None).unwrap();
        let b = calculate_config_hashes(&cluster(vec![s3_repo("repo1", "b")]), None).unwrap();

        assert_eq!(a, again);
        assert_ne!(a.repos["repo1"], b.repos["repo1"]);
        assert_ne!(a.combined, b.combined);
    }

    #[test]
    fn test_combined_hash_covers_repo_host() {
        let c = cluster(vec![volume_repo("repo1")]);
        let without = calculate_config_hashes(&c, None).unwrap();
        let with = calculate_config_hashes(&c, Some("hippo-repo-host")).unwrap();
        assert_ne!(without.combined, with.combined);
    }

    #[test]
    fn test_config_map_has_instance_files_and_hash() {
        let c = cluster(vec![volume_repo("repo1")]);
        let cm = config_map_intent(&c, None, "abc123", &["hippo-00".to_string()]).unwrap();
        let data = cm.data.unwrap();

        assert_eq!(data[CM_CONFIG_HASH_KEY], "abc123");
        assert!(data["hippo-00.conf"].contains("repo1-path=/pgbackrest/repo1"));
        assert!(data["hippo-00.conf"].contains("[db]"));
        assert!(!data.contains_key(CM_REPO_KEY));
        assert_eq!(cm.metadata.name.as_deref(), Some("hippo-pgbackrest-config"));
        assert!(cm.metadata.labels.unwrap().contains_key(naming::LABEL_PGBACKREST_CONFIG));
    }

    #[test]
    fn test_dedicated_host_renders_repo_config() {
        let mut c = cluster(vec![volume_repo("repo1")]);
        c.spec.backups.pgbackrest.repo_host = Some(RepoHostSpec {
            dedicated: Some(DedicatedRepoHostSpec::default()),
        });

        let cm = config_map_intent(&c, Some("hippo-repo-host"), "h", &["hippo-00".to_string()])
            .unwrap();
        let data = cm.data.unwrap();

        assert!(data[CM_REPO_KEY].contains("pg1-host=hippo-00-0.hippo-pods.db.svc"));
        assert!(data["hippo-00.conf"].contains("repo1-host=hippo-repo-host-0.hippo-pods.db.svc"));
    }
}
