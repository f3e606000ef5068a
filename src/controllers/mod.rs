//! Kubernetes controllers for the pgBackRest operator
//!
//! This module contains the controller that watches PostgresClusters and
//! the resources they own, and triggers reconciliation.

mod postgres_cluster_controller;

pub use postgres_cluster_controller::run as run_postgres_cluster_controller;
pub use postgres_cluster_controller::status_patch;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use kube::Client;

use crate::config::OperatorConfig;
use crate::k8s::{
    EventRecorder, KubeEventRecorder, KubePodExecutor, KubeStore, PodExecutor, ResourceStore,
};

/// Shared context for the controller
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Store used to read and write owned resources
    pub store: Arc<dyn ResourceStore>,
    /// Runs pgBackRest inside cluster pods
    pub exec: Arc<dyn PodExecutor>,
    /// Publishes events on clusters
    pub recorder: Arc<dyn EventRecorder>,
    /// Operator settings
    pub config: OperatorConfig,
    seen: Mutex<HashSet<String>>,
}

impl Context {
    /// Create a new context backed by the API server
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        Self {
            store: Arc::new(KubeStore::new(client.clone(), config.field_manager.clone())),
            exec: Arc::new(KubePodExecutor::new(client.clone())),
            recorder: Arc::new(KubeEventRecorder::new(client.clone(), &config.field_manager)),
            client,
            config,
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Remember a cluster uid and return the number of distinct clusters seen
    pub(crate) fn track(&self, uid: &str) -> usize {
        match self.seen.lock() {
            Ok(mut seen) => {
                seen.insert(uid.to_string());
                seen.len()
            }
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}
