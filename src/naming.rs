//! Deterministic names, labels and selectors for pgBackRest resources
//!
//! Every resource produced for a cluster carries the cluster label and the
//! `pgbackrest` label so one selector finds them all. The remaining labels
//! tell the cleanup step which class a resource belongs to.

use std::collections::BTreeMap;
use std::fmt;

use kube::ResourceExt;

use crate::crd::PostgresCluster;

pub const LABEL_CLUSTER: &str = "postgres.oso.sh/cluster";
pub const LABEL_PGBACKREST: &str = "postgres.oso.sh/pgbackrest";
pub const LABEL_PGBACKREST_CONFIG: &str = "postgres.oso.sh/pgbackrest-config";
pub const LABEL_PGBACKREST_HOST: &str = "postgres.oso.sh/pgbackrest-host";
pub const LABEL_PGBACKREST_DEDICATED: &str = "postgres.oso.sh/pgbackrest-dedicated";
pub const LABEL_PGBACKREST_VOLUME: &str = "postgres.oso.sh/pgbackrest-volume";
pub const LABEL_PGBACKREST_REPO: &str = "postgres.oso.sh/pgbackrest-repo";
pub const LABEL_PGBACKREST_BACKUP: &str = "postgres.oso.sh/pgbackrest-backup";
pub const LABEL_PGBACKREST_CRONJOB: &str = "postgres.oso.sh/pgbackrest-cronjob";
pub const LABEL_INSTANCE: &str = "postgres.oso.sh/instance";
pub const LABEL_ROLE: &str = "postgres.oso.sh/role";

pub const ROLE_PRIMARY: &str = "master";
pub const BACKUP_REPLICA_CREATE: &str = "replica-create";

/// Config file name recorded on backup jobs
pub const ANNOTATION_PGBACKREST_CONFIG: &str = "postgres.oso.sh/pgbackrest-config";
/// Config hash recorded on backup jobs
pub const ANNOTATION_PGBACKREST_HASH: &str = "postgres.oso.sh/pgbackrest-hash";

/// Stanza every repository is initialised with
pub const STANZA: &str = "db";

/// Kinds of recurring backup
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BackupType {
    Full,
    Differential,
    Incremental,
}

impl BackupType {
    pub const ALL: [BackupType; 3] = [
        BackupType::Full,
        BackupType::Differential,
        BackupType::Incremental,
    ];

    /// pgBackRest `--type` value, also used in names and labels
    pub fn as_str(self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Differential => "diff",
            BackupType::Incremental => "incr",
        }
    }

    pub fn from_label(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == value)
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn repo_host_name(cluster: &str) -> String {
    format!("{}-repo-host", cluster)
}

pub fn repo_volume_name(cluster: &str, repo: &str) -> String {
    format!("{}-{}", cluster, repo)
}

pub fn config_map_name(cluster: &str) -> String {
    format!("{}-pgbackrest-config", cluster)
}

pub fn ssh_config_name(cluster: &str) -> String {
    format!("{}-ssh-config", cluster)
}

pub fn ssh_secret_name(cluster: &str) -> String {
    format!("{}-ssh", cluster)
}

/// Shared by the service account, role and role binding
pub fn rbac_name(cluster: &str) -> String {
    format!("{}-pgbackrest", cluster)
}

pub fn replica_create_job_name(cluster: &str) -> String {
    format!("{}-backup-replica-create", cluster)
}

pub fn cronjob_name(cluster: &str, repo: &str, backup_type: BackupType) -> String {
    format!("{}-{}-{}-backup", cluster, repo, backup_type)
}

/// Selects every pgBackRest resource of a cluster
pub fn pgbackrest_selector(cluster: &str) -> String {
    format!("{}={},{}", LABEL_CLUSTER, cluster, LABEL_PGBACKREST)
}

/// Selects the pods of the dedicated repository host
pub fn dedicated_selector(cluster: &str) -> String {
    format!(
        "{}={},{},{}",
        LABEL_CLUSTER, cluster, LABEL_PGBACKREST, LABEL_PGBACKREST_DEDICATED
    )
}

/// Selects the current primary instance pod
pub fn primary_selector(cluster: &str) -> String {
    format!(
        "{}={},{}={}",
        LABEL_CLUSTER, cluster, LABEL_ROLE, ROLE_PRIMARY
    )
}

/// Selects every database instance pod
pub fn instance_selector(cluster: &str) -> String {
    format!("{}={},{}", LABEL_CLUSTER, cluster, LABEL_INSTANCE)
}

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Labels shared by every pgBackRest resource
pub fn pgbackrest_labels(cluster: &str) -> BTreeMap<String, String> {
    labels(&[(LABEL_CLUSTER, cluster), (LABEL_PGBACKREST, "")])
}

pub fn config_labels(cluster: &str) -> BTreeMap<String, String> {
    let mut l = pgbackrest_labels(cluster);
    l.insert(LABEL_PGBACKREST_CONFIG.to_string(), String::new());
    l
}

pub fn repo_host_labels(cluster: &str) -> BTreeMap<String, String> {
    let mut l = pgbackrest_labels(cluster);
    l.insert(LABEL_PGBACKREST_HOST.to_string(), String::new());
    l
}

pub fn dedicated_labels(cluster: &str) -> BTreeMap<String, String> {
    let mut l = repo_host_labels(cluster);
    l.insert(LABEL_PGBACKREST_DEDICATED.to_string(), String::new());
    l
}

pub fn repo_volume_labels(cluster: &str, repo: &str) -> BTreeMap<String, String> {
    let mut l = pgbackrest_labels(cluster);
    l.insert(LABEL_PGBACKREST_VOLUME.to_string(), String::new());
    l.insert(LABEL_PGBACKREST_REPO.to_string(), repo.to_string());
    l
}

pub fn replica_create_job_labels(cluster: &str, repo: &str) -> BTreeMap<String, String> {
    let mut l = pgbackrest_labels(cluster);
    l.insert(LABEL_PGBACKREST_REPO.to_string(), repo.to_string());
    l.insert(
        LABEL_PGBACKREST_BACKUP.to_string(),
        BACKUP_REPLICA_CREATE.to_string(),
    );
    l
}

pub fn cronjob_labels(cluster: &str, repo: &str, backup_type: BackupType) -> BTreeMap<String, String> {
    let mut l = pgbackrest_labels(cluster);
    l.insert(LABEL_PGBACKREST_REPO.to_string(), repo.to_string());
    l.insert(
        LABEL_PGBACKREST_CRONJOB.to_string(),
        backup_type.as_str().to_string(),
    );
    l
}

/// User labels from the cluster and pgBackRest metadata overlaid with the
/// component labels, which always win
pub fn merged_labels(
    cluster: &PostgresCluster,
    component: BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = BTreeMap::new();
    for meta in [
        cluster.spec.metadata.as_ref(),
        cluster.pgbackrest().metadata.as_ref(),
    ]
    .into_iter()
    .flatten()
    {
        if let Some(extra) = &meta.labels {
            merged.extend(extra.clone());
        }
    }
    merged.extend(component);
    merged
}

/// User annotations from the cluster and pgBackRest metadata
pub fn merged_annotations(cluster: &PostgresCluster) -> BTreeMap<String, String> {
    let mut merged = BTreeMap::new();
    for meta in [
        cluster.spec.metadata.as_ref(),
        cluster.pgbackrest().metadata.as_ref(),
    ]
    .into_iter()
    .flatten()
    {
        if let Some(extra) = &meta.annotations {
            merged.extend(extra.clone());
        }
    }
    merged
}

/// Namespace of the cluster, `default` when unset
pub fn namespace(cluster: &PostgresCluster) -> String {
    cluster.namespace().unwrap_or_else(|| "default".to_string())
}

/// Numeric index of a repository name (`repo2` is 2)
pub fn repo_index(repo: &str) -> Option<u32> {
    let digits: String = repo
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}
