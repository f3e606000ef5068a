//! Typed access to the namespaced resource collections the reconciler manages
//!
//! Every call goes through [`ResourceStore`], which speaks in
//! [`DynamicObject`]s keyed by a [`ResourceKind`]. The production
//! implementation is backed by the Kubernetes API server; tests use the
//! in-memory store from `test_support`.

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1 as appsv1, batch::v1 as batchv1, core::v1 as corev1, rbac::v1 as rbacv1,
};
use kube::{
    api::{DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject},
    Api, Client, Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::debug;

/// Resource kinds the reconciler reads or writes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    ConfigMap,
    Secret,
    StatefulSet,
    PersistentVolumeClaim,
    Job,
    CronJob,
    Pod,
    ServiceAccount,
    Role,
    RoleBinding,
}

impl ResourceKind {
    /// Kinds that may carry pgBackRest ownership labels and are subject to cleanup
    pub const OWNED: [ResourceKind; 6] = [
        ResourceKind::ConfigMap,
        ResourceKind::Job,
        ResourceKind::PersistentVolumeClaim,
        ResourceKind::Secret,
        ResourceKind::StatefulSet,
        ResourceKind::CronJob,
    ];

    /// Kubernetes kind name
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::ConfigMap => "ConfigMap",
            ResourceKind::Secret => "Secret",
            ResourceKind::StatefulSet => "StatefulSet",
            ResourceKind::PersistentVolumeClaim => "PersistentVolumeClaim",
            ResourceKind::Job => "Job",
            ResourceKind::CronJob => "CronJob",
            ResourceKind::Pod => "Pod",
            ResourceKind::ServiceAccount => "ServiceAccount",
            ResourceKind::Role => "Role",
            ResourceKind::RoleBinding => "RoleBinding",
        }
    }

    /// API discovery information for the kind
    pub fn api_resource(self) -> ApiResource {
        match self {
            ResourceKind::ConfigMap => ApiResource::erase::<corev1::ConfigMap>(&()),
            ResourceKind::Secret => ApiResource::erase::<corev1::Secret>(&()),
            ResourceKind::StatefulSet => ApiResource::erase::<appsv1::StatefulSet>(&()),
            ResourceKind::PersistentVolumeClaim => {
                ApiResource::erase::<corev1::PersistentVolumeClaim>(&())
            }
            ResourceKind::Job => ApiResource::erase::<batchv1::Job>(&()),
            ResourceKind::CronJob => ApiResource::erase::<batchv1::CronJob>(&()),
            ResourceKind::Pod => ApiResource::erase::<corev1::Pod>(&()),
            ResourceKind::ServiceAccount => ApiResource::erase::<corev1::ServiceAccount>(&()),
            ResourceKind::Role => ApiResource::erase::<rbacv1::Role>(&()),
            ResourceKind::RoleBinding => ApiResource::erase::<rbacv1::RoleBinding>(&()),
        }
    }

    /// Resolve the kind from a Kubernetes kind name
    pub fn from_kind_name(kind: &str) -> Option<Self> {
        [
            ResourceKind::ConfigMap,
            ResourceKind::Secret,
            ResourceKind::StatefulSet,
            ResourceKind::PersistentVolumeClaim,
            ResourceKind::Job,
            ResourceKind::CronJob,
            ResourceKind::Pod,
            ResourceKind::ServiceAccount,
            ResourceKind::Role,
            ResourceKind::RoleBinding,
        ]
        .into_iter()
        .find(|k| k.as_str() == kind)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Store adapter errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// Object does not exist
    #[error("{kind} {name} not found")]
    NotFound { kind: ResourceKind, name: String },

    /// Optimistic concurrency conflict, the write was based on a stale object
    #[error("conflict writing {kind} {name}: {message}")]
    Conflict {
        kind: ResourceKind,
        name: String,
        message: String,
    },

    /// The API server rejected the object
    #[error("{kind} {name} rejected: {message}")]
    Invalid {
        kind: ResourceKind,
        name: String,
        message: String,
    },

    /// The store could not be reached or failed internally
    #[error("{kind} store unavailable: {message}")]
    Unavailable { kind: ResourceKind, message: String },

    /// Any other client failure
    #[error("{kind} request failed: {source}")]
    Api {
        kind: ResourceKind,
        #[source]
        source: kube::Error,
    },

    /// The object could not be converted to or from its typed form
    #[error("malformed {kind} object: {source}")]
    Decode {
        kind: ResourceKind,
        #[source]
        source: serde_json::Error,
    },

    /// Object has no name
    #[error("{kind} object has no name")]
    MissingName { kind: ResourceKind },
}

impl StoreError {
    /// Classify a client error for the given object
    pub fn from_kube(kind: ResourceKind, name: &str, error: kube::Error) -> Self {
        match error {
            kube::Error::Api(resp) => match resp.code {
                404 => StoreError::NotFound {
                    kind,
                    name: name.to_string(),
                },
                409 => StoreError::Conflict {
                    kind,
                    name: name.to_string(),
                    message: resp.message,
                },
                400 | 422 => StoreError::Invalid {
                    kind,
                    name: name.to_string(),
                    message: resp.message,
                },
                code if code >= 500 => StoreError::Unavailable {
                    kind,
                    message: resp.message,
                },
                _ => StoreError::Api {
                    kind,
                    source: kube::Error::Api(resp),
                },
            },
            other => StoreError::Api {
                kind,
                source: other,
            },
        }
    }

    /// Whether retrying the same request later may succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            StoreError::Invalid { .. } | StoreError::Decode { .. } | StoreError::MissingName { .. }
        )
    }
}

/// Convert a typed object into its dynamic form
pub fn to_dynamic<K>(obj: &K) -> Result<DynamicObject, StoreError>
where
    K: Resource<DynamicType = ()> + Serialize,
{
    let kind = ResourceKind::from_kind_name(&K::kind(&())).unwrap_or(ResourceKind::ConfigMap);
    let mut value = serde_json::to_value(obj).map_err(|source| StoreError::Decode { kind, source })?;
    if let Some(map) = value.as_object_mut() {
        map.insert("apiVersion".into(), K::api_version(&()).into());
        map.insert("kind".into(), K::kind(&()).into());
    }
    serde_json::from_value(value).map_err(|source| StoreError::Decode { kind, source })
}

/// Convert a dynamic object into its typed form
pub fn from_dynamic<K>(kind: ResourceKind, obj: &DynamicObject) -> Result<K, StoreError>
where
    K: DeserializeOwned,
{
    let value = serde_json::to_value(obj).map_err(|source| StoreError::Decode { kind, source })?;
    serde_json::from_value(value).map_err(|source| StoreError::Decode { kind, source })
}

/// Labeled, typed resource collections
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// List objects of a kind in a namespace matching a label selector
    async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<DynamicObject>, StoreError>;

    /// Get a single object, `None` if it does not exist
    async fn get(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, StoreError>;

    /// Create an object
    async fn create(&self, kind: ResourceKind, obj: &DynamicObject)
        -> Result<DynamicObject, StoreError>;

    /// Server-side merge of the object into the stored one
    async fn patch(&self, kind: ResourceKind, obj: &DynamicObject)
        -> Result<DynamicObject, StoreError>;

    /// Delete an object, leaving dependents to be collected in the background
    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str)
        -> Result<(), StoreError>;
}

/// [`ResourceStore`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    field_manager: String,
}

impl KubeStore {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn api(&self, kind: ResourceKind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &kind.api_resource())
    }
}

fn object_coordinates(kind: ResourceKind, obj: &DynamicObject) -> Result<(String, String), StoreError> {
    let name = obj
        .metadata
        .name
        .clone()
        .ok_or(StoreError::MissingName { kind })?;
    let namespace = obj.metadata.namespace.clone().unwrap_or_else(|| "default".to_string());
    Ok((namespace, name))
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<DynamicObject>, StoreError> {
        let list = self
            .api(kind, namespace)
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(|e| StoreError::from_kube(kind, selector, e))?;
        debug!(kind = %kind, namespace, selector, count = list.items.len(), "Listed resources");
        Ok(list.items)
    }

    async fn get(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, StoreError> {
        self.api(kind, namespace)
            .get_opt(name)
            .await
            .map_err(|e| StoreError::from_kube(kind, name, e))
    }

    async fn create(
        &self,
        kind: ResourceKind,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        let (namespace, name) = object_coordinates(kind, obj)?;
        let params = PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        };
        self.api(kind, &namespace)
            .create(&params, obj)
            .await
            .map_err(|e| StoreError::from_kube(kind, &name, e))
    }

    async fn patch(
        &self,
        kind: ResourceKind,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        let (namespace, name) = object_coordinates(kind, obj)?;
        let params = PatchParams::apply(&self.field_manager).force();
        self.api(kind, &namespace)
            .patch(&name, &params, &Patch::Apply(obj))
            .await
            .map_err(|e| StoreError::from_kube(kind, &name, e))
    }

    async fn delete(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        match self
            .api(kind, namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(StoreError::from_kube(kind, name, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("code {}", code),
            reason: "Test".to_string(),
            code,
        })
    }

    #[test]
    fn kube_errors_are_classified() {
        let kind = ResourceKind::Job;
        assert!(matches!(
            StoreError::from_kube(kind, "j", api_error(404)),
            StoreError::NotFound { .. }
        ));
        assert!(matches!(
            StoreError::from_kube(kind, "j", api_error(409)),
            StoreError::Conflict { .. }
        ));
        assert!(matches!(
            StoreError::from_kube(kind, "j", api_error(422)),
            StoreError::Invalid { .. }
        ));
        assert!(matches!(
            StoreError::from_kube(kind, "j", api_error(503)),
            StoreError::Unavailable { .. }
        ));
    }

    #[test]
    fn conflicts_are_retryable_rejections_are_not() {
        let conflict = StoreError::from_kube(ResourceKind::Secret, "s", api_error(409));
        let invalid = StoreError::from_kube(ResourceKind::Secret, "s", api_error(422));
        assert!(conflict.is_retryable());
        assert!(!invalid.is_retryable());
    }

    #[test]
    fn typed_objects_round_trip_through_dynamic_form() {
        let cm = corev1::ConfigMap {
            metadata: kube::api::ObjectMeta {
                name: Some("demo".to_string()),
                namespace: Some("db".to_string()),
                ..Default::default()
            },
            data: Some([("k".to_string(), "v".to_string())].into()),
            ..Default::default()
        };

        let dynamic = to_dynamic(&cm).unwrap();
        assert_eq!(dynamic.types.as_ref().unwrap().kind, "ConfigMap");

        let back: corev1::ConfigMap = from_dynamic(ResourceKind::ConfigMap, &dynamic).unwrap();
        assert_eq!(back.data.unwrap()["k"], "v");
    }

    #[test]
    fn kind_names_resolve() {
        for kind in ResourceKind::OWNED {
            assert_eq!(ResourceKind::from_kind_name(kind.as_str()), Some(kind));
        }
        assert_eq!(ResourceKind::from_kind_name("Deployment"), None);
    }
}
