//! Intent applier
//!
//! Converges a stored object to a desired one. The cluster is set as the
//! controlling owner, the object is created when absent, and it is patched
//! only when the stored object does not already contain every desired field.

use kube::{Resource, ResourceExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::crd::PostgresCluster;
use crate::error::{Error, Result};
use crate::k8s::{from_dynamic, to_dynamic, ResourceKind, ResourceStore};

/// Outcome of applying an intent
#[derive(Clone, Debug)]
pub struct Applied<K> {
    /// The object as stored after the apply
    pub object: K,
    /// The object did not exist before
    pub created: bool,
}

/// Apply `intent` as a child of `cluster` and return the stored object
pub async fn apply<K>(store: &dyn ResourceStore, cluster: &PostgresCluster, intent: K) -> Result<K>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
{
    Ok(apply_tracked(store, cluster, intent).await?.object)
}

/// Like [`apply`], also reporting whether the object was created
pub async fn apply_tracked<K>(
    store: &dyn ResourceStore,
    cluster: &PostgresCluster,
    mut intent: K,
) -> Result<Applied<K>>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
{
    let kind_name = K::kind(&());
    let kind = ResourceKind::from_kind_name(&kind_name)
        .ok_or_else(|| Error::config(format!("Unsupported kind {}", kind_name)))?;

    let owner = cluster.controller_owner_ref(&()).ok_or_else(|| {
        Error::config(format!(
            "PostgresCluster '{}' has no uid to own {} objects",
            cluster.name_any(),
            kind
        ))
    })?;
    intent.meta_mut().owner_references = Some(vec![owner]);
    if intent.meta().namespace.is_none() {
        intent.meta_mut().namespace = cluster.namespace();
    }

    let name = intent.name_any();
    let namespace = intent.namespace().unwrap_or_default();
    let desired = to_dynamic(&intent)?;

    let (stored, created) = match store.get(kind, &namespace, &name).await? {
        None => {
            debug!(kind = %kind, name = %name, "Creating object");
            (store.create(kind, &desired).await?, true)
        }
        Some(existing) if contains(&serde_json::to_value(&existing)?, &serde_json::to_value(&desired)?) => {
            debug!(kind = %kind, name = %name, "Object already up to date");
            (existing, false)
        }
        Some(_) => {
            debug!(kind = %kind, name = %name, "Patching object");
            (store.patch(kind, &desired).await?, false)
        }
    };

    Ok(Applied {
        object: from_dynamic(kind, &stored)?,
        created,
    })
}

/// Whether `existing` holds every field set in `desired`.
///
/// Objects may carry extra keys. Arrays must match element by element.
pub fn contains(existing: &Value, desired: &Value) -> bool {
    match (existing, desired) {
        (_, Value::Null) => true,
        (Value::Object(have), Value::Object(want)) => want.iter().all(|(key, value)| match have.get(key) {
            Some(current) => contains(current, value),
            None => value.is_null(),
        }),
        (Value::Array(have), Value::Array(want)) => {
            have.len() == want.len() && have.iter().zip(want).all(|(h, w)| contains(h, w))
        }
        (have, want) => have == want,
    }
}
