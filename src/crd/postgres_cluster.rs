//! PostgresCluster Custom Resource Definition
//!
//! Only the parts of the cluster resource that the pgBackRest reconciler reads
//! or writes are modelled here. Instance topology and replication are owned by
//! other controllers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// PostgresCluster resource specification
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "postgres.oso.sh",
    version = "v1alpha1",
    kind = "PostgresCluster",
    plural = "postgresclusters",
    singular = "postgrescluster",
    shortname = "pgc",
    namespaced,
    status = "PostgresClusterStatus",
    printcolumn = r#"{"name": "Replica Create", "type": "string", "jsonPath": ".status.conditions[?(@.type==\"ReplicaCreate\")].status"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterSpec {
    /// Labels and annotations applied to every resource produced for the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ResourceMetadata>,

    /// Backup configuration
    pub backups: BackupsSpec,
}

/// Extra labels and annotations merged onto produced resources
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// Backup section of the cluster spec
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupsSpec {
    /// pgBackRest archive configuration
    pub pgbackrest: PgBackRestArchive,
}

/// pgBackRest configuration for a cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PgBackRestArchive {
    /// Image containing pgBackRest, used for the repo host and backup jobs
    pub image: String,

    /// Labels and annotations applied to pgBackRest resources only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ResourceMetadata>,

    /// Repositories. The first repository is used for replica creation.
    #[serde(default)]
    pub repos: Vec<PgBackRestRepo>,

    /// Repository host configuration. Absent means pgBackRest runs in the
    /// database container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_host: Option<RepoHostSpec>,
}

/// A single pgBackRest repository
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PgBackRestRepo {
    /// Repository name (repo1 through repo4)
    pub name: String,

    /// Local volume backing the repository
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<RepoVolumeSpec>,

    /// S3 bucket backing the repository
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<RepoS3Spec>,

    /// GCS bucket backing the repository
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcs: Option<RepoGcsSpec>,

    /// Azure Blob container backing the repository
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<RepoAzureSpec>,

    /// Cron schedules for recurring backups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_schedules: Option<BackupSchedules>,
}

impl PgBackRestRepo {
    /// Whether the repository is hosted on an external object store
    pub fn is_external(&self) -> bool {
        self.s3.is_some() || self.gcs.is_some() || self.azure.is_some()
    }
}

/// Volume claim template for a repository
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RepoVolumeSpec {
    /// Access modes
    #[serde(default = "default_access_modes")]
    pub access_modes: Vec<String>,

    /// Storage class name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    /// Requested size (e.g., "10Gi")
    #[serde(default = "default_volume_size")]
    pub size: String,
}

impl Default for RepoVolumeSpec {
    fn default() -> Self {
        Self {
            access_modes: default_access_modes(),
            storage_class_name: None,
            size: default_volume_size(),
        }
    }
}

fn default_access_modes() -> Vec<String> {
    vec!["ReadWriteOnce".to_string()]
}

fn default_volume_size() -> String {
    "10Gi".to_string()
}

/// S3 repository specification
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RepoS3Spec {
    pub bucket: String,
    pub endpoint: String,
    pub region: String,
}

/// GCS repository specification
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RepoGcsSpec {
    pub bucket: String,
}

/// Azure Blob repository specification
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RepoAzureSpec {
    pub container: String,
}

/// Backup schedules for a repository, in standard 5-field cron format
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupSchedules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub differential: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incremental: Option<String>,
}

/// Repository host configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepoHostSpec {
    /// Run pgBackRest on a dedicated StatefulSet instead of the primary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedicated: Option<DedicatedRepoHostSpec>,
}

/// Dedicated repository host settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DedicatedRepoHostSpec {
    /// Priority class for the repo host pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
}

impl PostgresCluster {
    /// pgBackRest section of the spec
    pub fn pgbackrest(&self) -> &PgBackRestArchive {
        &self.spec.backups.pgbackrest
    }

    /// Any form of repository host is configured
    pub fn repo_host_enabled(&self) -> bool {
        self.pgbackrest().repo_host.is_some()
    }

    /// A dedicated repository host is configured
    pub fn dedicated_repo_host_enabled(&self) -> bool {
        self.pgbackrest()
            .repo_host
            .as_ref()
            .is_some_and(|host| host.dedicated.is_some())
    }

    /// Name of the repository used for replica creation (the first one)
    pub fn replica_create_repo_name(&self) -> Option<&str> {
        self.pgbackrest().repos.first().map(|repo| repo.name.as_str())
    }

    /// Look up a repository by name
    pub fn repo(&self, name: &str) -> Option<&PgBackRestRepo> {
        self.pgbackrest().repos.iter().find(|repo| repo.name == name)
    }
}

/// PostgresCluster status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterStatus {
    /// Observed generation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// pgBackRest status
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pgbackrest: Option<PgBackRestStatus>,

    /// Patroni status, written by the instance controller
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patroni: Option<PatroniStatus>,
}

impl PostgresClusterStatus {
    /// Whether the database cluster finished its initial bootstrap
    pub fn bootstrapped(&self) -> bool {
        self.patroni
            .as_ref()
            .and_then(|p| p.system_identifier.as_deref())
            .is_some_and(|id| !id.is_empty())
    }

    /// pgBackRest status, created on first access
    pub fn pgbackrest_mut(&mut self) -> &mut PgBackRestStatus {
        self.pgbackrest.get_or_insert_with(PgBackRestStatus::default)
    }

    /// Repository statuses, empty when no pgBackRest status exists yet
    pub fn repos(&self) -> &[RepoStatus] {
        self.pgbackrest
            .as_ref()
            .map(|s| s.repos.as_slice())
            .unwrap_or_default()
    }

    /// Status of a single repository
    pub fn repo(&self, name: &str) -> Option<&RepoStatus> {
        self.repos().iter().find(|r| r.name == name)
    }

    /// Mutable status of a single repository
    pub fn repo_mut(&mut self, name: &str) -> Option<&mut RepoStatus> {
        self.pgbackrest
            .as_mut()
            .and_then(|s| s.repos.iter_mut().find(|r| r.name == name))
    }
}

/// Patroni status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PatroniStatus {
    /// PostgreSQL system identifier, set once the cluster is bootstrapped
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_identifier: Option<String>,
}

/// pgBackRest status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PgBackRestStatus {
    /// Dedicated repository host status
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_host: Option<RepoHostStatus>,

    /// Repository statuses, sorted by name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repos: Vec<RepoStatus>,
}

/// Dedicated repository host status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RepoHostStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// All replicas of the repo host are ready
    #[serde(default)]
    pub ready: bool,
}

/// Status of a single repository
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RepoStatus {
    /// Repository name
    pub name: String,

    /// The repository volume claim is bound
    #[serde(default)]
    pub bound: bool,

    /// Name of the bound volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<String>,

    /// Fingerprint of external repository options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_options_hash: Option<String>,

    /// The stanza exists in this repository
    #[serde(default)]
    pub stanza_created: bool,

    /// The backup required for replica creation finished
    #[serde(default)]
    pub replica_create_backup_complete: bool,
}

/// Condition status values
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Status condition
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type
    #[serde(rename = "type")]
    pub type_: String,

    /// Status (True, False, Unknown)
    pub status: ConditionStatus,

    /// Last transition time
    pub last_transition_time: DateTime<Utc>,

    /// Reason for the condition
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Generation of the cluster the condition was computed for
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
