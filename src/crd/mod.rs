//! Custom Resource Definitions for the pgBackRest operator

mod postgres_cluster;

pub use postgres_cluster::*;

use kube::CustomResourceExt;

use crate::error::Result;

/// Generate all CRD YAML manifests
pub fn generate_crds() -> Result<Vec<String>> {
    Ok(vec![serde_yaml::to_string(&PostgresCluster::crd())?])
}
