//! Pod discovery for exec targets and database instances

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use crate::adapters::exec_target;
use crate::error::{Error, Result};
use crate::k8s::{from_dynamic, ResourceKind};
use crate::naming;

use super::ReconcileScope;

/// Pod and container in which pgBackRest commands are run
#[derive(Clone, Debug)]
pub struct ExecTarget {
    pub pod: Pod,
    pub container: &'static str,
    pub selector: String,
}

impl ExecTarget {
    pub fn pod_name(&self) -> String {
        self.pod.name_any()
    }

    /// Instance name label of the target pod
    pub fn instance(&self) -> Option<&str> {
        self.pod.labels().get(naming::LABEL_INSTANCE).map(String::as_str)
    }
}

/// Find the single pod commands are sent to.
///
/// Zero or several matches mean the cache does not reflect a settled state
/// yet and are reported as consistency errors.
pub async fn find_exec_target(scope: &ReconcileScope<'_>) -> Result<ExecTarget> {
    let (selector, container) = exec_target(scope.cluster);
    let objects = scope
        .store
        .list(ResourceKind::Pod, &scope.namespace(), &selector)
        .await?;

    match objects.len() {
        1 => Ok(ExecTarget {
            pod: from_dynamic(ResourceKind::Pod, &objects[0])?,
            container,
            selector,
        }),
        count => Err(Error::consistency(format!(
            "expected exactly one pod matching '{}' for pgBackRest commands, found {}",
            selector, count
        ))),
    }
}

/// Database instances of a cluster
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Instances {
    /// Sorted, unique instance names
    pub names: Vec<String>,
    /// Instance of the current primary, if one is labeled
    pub primary: Option<String>,
}

/// Discover database instances from the labels of their pods
pub async fn list_instances(scope: &ReconcileScope<'_>) -> Result<Instances> {
    let objects = scope
        .store
        .list(
            ResourceKind::Pod,
            &scope.namespace(),
            &naming::instance_selector(&scope.name()),
        )
        .await?;

    let mut instances = Instances::default();
    for obj in &objects {
        let labels = obj.labels();
        let Some(instance) = labels.get(naming::LABEL_INSTANCE) else {
            continue;
        };
        if labels.get(naming::LABEL_ROLE).map(String::as_str) == Some(naming::ROLE_PRIMARY) {
            instances.primary = Some(instance.clone());
        }
        instances.names.push(instance.clone());
    }
    instances.names.sort();
    instances.names.dedup();
    Ok(instances)
}
