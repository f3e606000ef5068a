//! Repository storage adapter
//!
//! Converts a repository entry of the cluster spec into the pgBackRest
//! options that describe where the repository lives.

use std::collections::BTreeMap;

use crate::crd::{PgBackRestRepo, RepoAzureSpec, RepoGcsSpec, RepoS3Spec, RepoVolumeSpec};
use crate::error::{Error, Result};
use crate::naming;

/// Mount path of repository volumes
pub const REPO_VOLUME_ROOT: &str = "/pgbackrest";

/// Resolved repository storage
#[derive(Debug, Clone, PartialEq)]
pub enum RepoStorage {
    /// Local volume (PersistentVolumeClaim)
    Volume(RepoVolumeSpec),
    /// S3 bucket
    S3(RepoS3Spec),
    /// Google Cloud Storage bucket
    Gcs(RepoGcsSpec),
    /// Azure Blob container
    Azure(RepoAzureSpec),
}

impl RepoStorage {
    pub fn is_external(&self) -> bool {
        !matches!(self, RepoStorage::Volume(_))
    }

    /// pgBackRest `repoN-type` value
    pub fn repo_type(&self) -> &'static str {
        match self {
            RepoStorage::Volume(_) => "posix",
            RepoStorage::S3(_) => "s3",
            RepoStorage::Gcs(_) => "gcs",
            RepoStorage::Azure(_) => "azure",
        }
    }
}

/// Resolve the storage of a repository, which must declare exactly one kind
pub fn resolve_repo_storage(repo: &PgBackRestRepo) -> Result<RepoStorage> {
    let mut found = Vec::new();
    if let Some(volume) = &repo.volume {
        found.push(RepoStorage::Volume(volume.clone()));
    }
    if let Some(s3) = &repo.s3 {
        found.push(RepoStorage::S3(s3.clone()));
    }
    if let Some(gcs) = &repo.gcs {
        found.push(RepoStorage::Gcs(gcs.clone()));
    }
    if let Some(azure) = &repo.azure {
        found.push(RepoStorage::Azure(azure.clone()));
    }

    match found.len() {
        1 => Ok(found.remove(0)),
        0 => Err(Error::validation(format!(
            "Repository '{}' must define one of volume, s3, gcs or azure",
            repo.name
        ))),
        _ => Err(Error::validation(format!(
            "Repository '{}' defines more than one storage type",
            repo.name
        ))),
    }
}

/// Path of a repository inside the container that owns it
pub fn repo_path(repo_name: &str) -> String {
    format!("{}/{}", REPO_VOLUME_ROOT, repo_name)
}

/// pgBackRest options for a repository, keyed by option name
pub fn repo_options(repo_name: &str, storage: &RepoStorage) -> Result<BTreeMap<String, String>> {
    let index = naming::repo_index(repo_name).ok_or_else(|| {
        Error::validation(format!("Repository name '{}' has no index", repo_name))
    })?;
    let key = |option: &str| format!("repo{}-{}", index, option);

    let mut options = BTreeMap::new();
    match storage {
        RepoStorage::Volume(_) => {
            options.insert(key("path"), repo_path(repo_name));
        }
        RepoStorage::S3(s3) => {
            options.insert(key("type"), storage.repo_type().to_string());
            options.insert(key("path"), format!("/{}", repo_name));
            options.insert(key("s3-bucket"), s3.bucket.clone());
            options.insert(key("s3-endpoint"), s3.endpoint.clone());
            options.insert(key("s3-region"), s3.region.clone());
        }
        RepoStorage::Gcs(gcs) => {
            options.insert(key("type"), storage.repo_type().to_string());
            options.insert(key("path"), format!("/{}", repo_name));
            options.insert(key("gcs-bucket"), gcs.bucket.clone());
        }
        RepoStorage::Azure(azure) => {
            options.insert(key("type"), storage.repo_type().to_string());
            options.insert(key("path"), format!("/{}", repo_name));
            options.insert(key("azure-container"), azure.container.clone());
        }
    }
    Ok(options)
}
