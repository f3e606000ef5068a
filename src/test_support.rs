//! In-memory fakes for driving reconcile steps without a cluster
//!
//! [`MemoryStore`] keeps objects in a map with merge-patch semantics and
//! counts every call, [`ScriptedExecutor`] replays queued command results and
//! [`RecordingEvents`] keeps what was published.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{ObjectReference, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::ObjectMeta;
use kube::core::DynamicObject;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::crd::{
    PatroniStatus, PgBackRestRepo, PostgresCluster, PostgresClusterSpec, PostgresClusterStatus,
    RepoVolumeSpec,
};
use crate::k8s::{
    from_dynamic, to_dynamic, EventRecorder, ExecError, ExecOutput, PodExecutor, ResourceKind,
    ResourceStore, StoreError,
};
use crate::naming;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Store operations, for counting and failure injection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    List,
    Get,
    Create,
    Patch,
    Delete,
}

/// Number of calls per store operation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub list: usize,
    pub get: usize,
    pub create: usize,
    pub patch: usize,
    pub delete: usize,
}

impl CallCounts {
    /// Calls that change stored objects
    pub fn mutations(&self) -> usize {
        self.create + self.patch + self.delete
    }

    pub fn total(&self) -> usize {
        self.list + self.get + self.mutations()
    }
}

type Key = (ResourceKind, String, String);

#[derive(Default)]
struct StoreState {
    objects: BTreeMap<Key, DynamicObject>,
    counts: CallCounts,
    failures: Vec<(Operation, ResourceKind)>,
    next_uid: u64,
}

/// [`ResourceStore`] over an in-memory map
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

fn key(kind: ResourceKind, obj: &DynamicObject) -> Result<Key, StoreError> {
    let name = obj
        .metadata
        .name
        .clone()
        .ok_or(StoreError::MissingName { kind })?;
    let namespace = obj
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string());
    Ok((kind, namespace, name))
}

/// Whether the labels satisfy a selector of `key=value` and `key` terms
pub fn selector_matches(selector: &str, labels: &BTreeMap<String, String>) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => labels.contains_key(term),
        })
}

/// RFC 7386 JSON merge patch
pub fn merge_patch(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (k, v) in patch {
                if v.is_null() {
                    target.remove(k);
                } else {
                    merge_patch(target.entry(k.clone()).or_insert(Value::Null), v);
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        lock(&self.state)
    }

    /// Make every following `operation` on `kind` fail as unavailable
    pub fn fail(&self, operation: Operation, kind: ResourceKind) {
        self.state().failures.push((operation, kind));
    }

    /// Remove all injected failures
    pub fn heal(&self) {
        self.state().failures.clear();
    }

    pub fn counts(&self) -> CallCounts {
        self.state().counts
    }

    pub fn reset_counts(&self) {
        self.state().counts = CallCounts::default();
    }

    fn check(&self, state: &StoreState, operation: Operation, kind: ResourceKind) -> Result<(), StoreError> {
        if state.failures.contains(&(operation, kind)) {
            return Err(StoreError::Unavailable {
                kind,
                message: format!("injected {:?} failure", operation),
            });
        }
        Ok(())
    }

    fn stamp(state: &mut StoreState, obj: &mut DynamicObject) {
        state.next_uid += 1;
        let meta = &mut obj.metadata;
        if meta.uid.is_none() {
            meta.uid = Some(format!("uid-{}", state.next_uid));
        }
        if meta.creation_timestamp.is_none() {
            meta.creation_timestamp = Some(Time(Utc::now()));
        }
        if meta.namespace.is_none() {
            meta.namespace = Some("default".to_string());
        }
        meta.resource_version = Some(state.next_uid.to_string());
    }

    /// Store an object directly, without counting the call
    pub fn insert<K>(&self, obj: &K) -> DynamicObject
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let kind = ResourceKind::from_kind_name(&K::kind(&())).unwrap_or(ResourceKind::ConfigMap);
        let mut dynamic = match to_dynamic(obj) {
            Ok(d) => d,
            Err(e) => panic!("object does not serialize: {}", e),
        };
        let mut state = self.state();
        Self::stamp(&mut state, &mut dynamic);
        if let Ok(k) = key(kind, &dynamic) {
            state.objects.insert(k, dynamic.clone());
        }
        dynamic
    }

    /// Typed copy of a stored object
    pub fn get_typed<K>(&self, namespace: &str, name: &str) -> Option<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let kind = ResourceKind::from_kind_name(&K::kind(&()))?;
        let state = self.state();
        let obj = state
            .objects
            .get(&(kind, namespace.to_string(), name.to_string()))?;
        from_dynamic(kind, obj).ok()
    }

    /// Typed copies of every stored object of a kind in a namespace
    pub fn list_typed<K>(&self, namespace: &str) -> Vec<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let Some(kind) = ResourceKind::from_kind_name(&K::kind(&())) else {
            return Vec::new();
        };
        self.state()
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && ns == namespace)
            .filter_map(|(_, obj)| from_dynamic(kind, obj).ok())
            .collect()
    }

    /// Merge `status` into a stored object's status, as other controllers would
    pub fn update_status(&self, kind: ResourceKind, namespace: &str, name: &str, status: Value) {
        let mut state = self.state();
        if let Some(obj) = state
            .objects
            .get_mut(&(kind, namespace.to_string(), name.to_string()))
        {
            let current = obj.data.as_object_mut().map(|data| {
                data.entry("status".to_string())
                    .or_insert_with(|| Value::Object(Default::default()))
            });
            if let Some(current) = current {
                merge_patch(current, &status);
            }
        }
    }

    /// Number of stored objects of a kind
    pub fn count(&self, kind: ResourceKind) -> usize {
        self.state().objects.keys().filter(|(k, _, _)| *k == kind).count()
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<DynamicObject>, StoreError> {
        let mut state = self.state();
        state.counts.list += 1;
        self.check(&state, Operation::List, kind)?;
        Ok(state
            .objects
            .iter()
            .filter(|((k, ns, _), obj)| {
                *k == kind && ns == namespace && selector_matches(selector, obj.labels())
            })
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn get(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, StoreError> {
        let mut state = self.state();
        state.counts.get += 1;
        self.check(&state, Operation::Get, kind)?;
        Ok(state
            .objects
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create(
        &self,
        kind: ResourceKind,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        let mut state = self.state();
        state.counts.create += 1;
        self.check(&state, Operation::Create, kind)?;
        let mut obj = obj.clone();
        Self::stamp(&mut state, &mut obj);
        let k = key(kind, &obj)?;
        if state.objects.contains_key(&k) {
            return Err(StoreError::Conflict {
                kind,
                name: k.2,
                message: "already exists".to_string(),
            });
        }
        state.objects.insert(k, obj.clone());
        Ok(obj)
    }

    async fn patch(
        &self,
        kind: ResourceKind,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        let mut state = self.state();
        state.counts.patch += 1;
        self.check(&state, Operation::Patch, kind)?;
        let k = key(kind, obj)?;

        let merged = match state.objects.get(&k) {
            Some(existing) => {
                let mut current = serde_json::to_value(existing)
                    .map_err(|source| StoreError::Decode { kind, source })?;
                let patch = serde_json::to_value(obj)
                    .map_err(|source| StoreError::Decode { kind, source })?;
                merge_patch(&mut current, &patch);
                serde_json::from_value(current).map_err(|source| StoreError::Decode { kind, source })?
            }
            None => obj.clone(),
        };

        let mut merged: DynamicObject = merged;
        Self::stamp(&mut state, &mut merged);
        state.objects.insert(k, merged.clone());
        Ok(merged)
    }

    async fn delete(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        state.counts.delete += 1;
        self.check(&state, Operation::Delete, kind)?;
        state
            .objects
            .remove(&(kind, namespace.to_string(), name.to_string()));
        Ok(())
    }
}

/// A command sent to a [`ScriptedExecutor`]
#[derive(Clone, Debug, PartialEq)]
pub struct ExecCall {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub command: Vec<String>,
}

/// [`PodExecutor`] replaying queued results. With nothing queued every
/// command succeeds with empty output.
#[derive(Default)]
pub struct ScriptedExecutor {
    responses: Mutex<VecDeque<Result<ExecOutput, ExecError>>>,
    calls: Mutex<Vec<ExecCall>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_success(&self, stdout: &str) {
        lock(&self.responses).push_back(Ok(ExecOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
        }));
    }

    pub fn push_failure(&self, stderr: &str) {
        lock(&self.responses).push_back(Err(ExecError::Failed {
            message: "command terminated with non-zero exit code".to_string(),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }));
    }

    pub fn calls(&self) -> Vec<ExecCall> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl PodExecutor for ScriptedExecutor {
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        _stdin: Option<Vec<u8>>,
        command: Vec<String>,
    ) -> Result<ExecOutput, ExecError> {
        lock(&self.calls).push(ExecCall {
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            container: container.to_string(),
            command,
        });
        lock(&self.responses)
            .pop_front()
            .unwrap_or_else(|| Ok(ExecOutput::default()))
    }
}

/// An event captured by [`RecordingEvents`]
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    pub warning: bool,
    pub reason: String,
    pub message: String,
}

/// [`EventRecorder`] keeping every event in memory
#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        lock(&self.events).clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

#[async_trait]
impl EventRecorder for RecordingEvents {
    async fn record(&self, _object: &ObjectReference, type_: EventType, reason: &str, message: &str) {
        lock(&self.events).push(RecordedEvent {
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}

/// Namespace used by the fixtures
pub const NAMESPACE: &str = "db";

/// A cluster named `name` with one volume repository, as stored by the API
/// server
pub fn cluster(name: &str) -> PostgresCluster {
    let mut cluster = PostgresCluster::new(name, PostgresClusterSpec::default());
    cluster.metadata.namespace = Some(NAMESPACE.to_string());
    cluster.metadata.uid = Some(format!("{}-uid", name));
    cluster.metadata.generation = Some(1);
    cluster.spec.backups.pgbackrest.image = "registry.example.com/pgbackrest:2.38".to_string();
    cluster.spec.backups.pgbackrest.repos = vec![PgBackRestRepo {
        name: "repo1".to_string(),
        volume: Some(RepoVolumeSpec::default()),
        ..Default::default()
    }];
    cluster
}

/// Status of a cluster that finished bootstrapping
pub fn bootstrapped_status() -> PostgresClusterStatus {
    PostgresClusterStatus {
        patroni: Some(PatroniStatus {
            system_identifier: Some("7012345678901234567".to_string()),
        }),
        ..Default::default()
    }
}

/// A database instance pod of the cluster
pub fn instance_pod(cluster: &str, instance: &str, primary: bool) -> Pod {
    let mut labels = BTreeMap::new();
    labels.insert(naming::LABEL_CLUSTER.to_string(), cluster.to_string());
    labels.insert(naming::LABEL_INSTANCE.to_string(), instance.to_string());
    if primary {
        labels.insert(naming::LABEL_ROLE.to_string(), naming::ROLE_PRIMARY.to_string());
    }
    Pod {
        metadata: ObjectMeta {
            name: Some(format!("{}-0", instance)),
            namespace: Some(NAMESPACE.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// The pod of the dedicated repository host
pub fn repo_host_pod(cluster: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(format!("{}-0", naming::repo_host_name(cluster))),
            namespace: Some(NAMESPACE.to_string()),
            labels: Some(naming::dedicated_labels(cluster)),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use serde_json::json;

    #[test]
    fn test_selector_terms() {
        let labels: BTreeMap<String, String> = [
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), String::new()),
        ]
        .into();
        assert!(selector_matches("a=1,b", &labels));
        assert!(selector_matches("", &labels));
        assert!(!selector_matches("a=2", &labels));
        assert!(!selector_matches("c", &labels));
    }

    #[test]
    fn test_merge_patch_replaces_and_removes() {
        let mut target = json!({"a": {"b": 1, "c": 2}, "d": [1, 2]});
        merge_patch(&mut target, &json!({"a": {"b": 3, "c": null}, "d": [3]}));
        assert_eq!(target, json!({"a": {"b": 3}, "d": [3]}));
    }

    #[tokio::test]
    async fn test_store_round_trip_counts_calls() {
        let store = MemoryStore::new();
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some("c".to_string()),
                namespace: Some(NAMESPACE.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let dynamic = to_dynamic(&cm).unwrap();
        let created = store.create(ResourceKind::ConfigMap, &dynamic).await.unwrap();
        assert!(created.metadata.uid.is_some());
        assert!(store.create(ResourceKind::ConfigMap, &dynamic).await.is_err());

        store.fail(Operation::Get, ResourceKind::ConfigMap);
        assert!(store.get(ResourceKind::ConfigMap, NAMESPACE, "c").await.is_err());
        store.heal();

        assert!(store.get_typed::<ConfigMap>(NAMESPACE, "c").is_some());
        let counts = store.counts();
        assert_eq!(counts.create, 2);
        assert_eq!(counts.get, 1);
        assert_eq!(counts.mutations(), 2);
    }
}
