//! Reconcilers for the pgBackRest backup subsystem
//!
//! Each module owns one step of a cluster's reconciliation:
//! - Ownership listing and cleanup of stale resources
//! - Applying desired objects
//! - Repository host, volumes, configuration and RBAC
//! - Stanza creation
//! - Scheduled and replica-create backups
//!
//! [`pgbackrest::reconcile_pgbackrest`] runs the steps in order and folds
//! their outcomes into a single [`ReconcileResult`].

pub mod apply;
pub mod conditions;
pub mod configuration;
pub mod ownership;
pub mod pgbackrest;
pub mod pods;
pub mod rbac;
pub mod replica_create;
pub mod repos;
pub mod schedules;
pub mod stanza;

use std::time::Duration;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};

use crate::config::OperatorConfig;
use crate::crd::PostgresCluster;
use crate::k8s::{EventRecorder, PodExecutor, ResourceStore};
use crate::naming;

/// Everything a reconcile step needs besides the status it writes to
pub struct ReconcileScope<'a> {
    pub cluster: &'a PostgresCluster,
    pub store: &'a dyn ResourceStore,
    pub exec: &'a dyn PodExecutor,
    pub events: &'a dyn EventRecorder,
    pub config: &'a OperatorConfig,
}

impl<'a> ReconcileScope<'a> {
    pub fn new(
        cluster: &'a PostgresCluster,
        store: &'a dyn ResourceStore,
        exec: &'a dyn PodExecutor,
        events: &'a dyn EventRecorder,
        config: &'a OperatorConfig,
    ) -> Self {
        Self {
            cluster,
            store,
            exec,
            events,
            config,
        }
    }

    pub fn name(&self) -> String {
        self.cluster.name_any()
    }

    pub fn namespace(&self) -> String {
        naming::namespace(self.cluster)
    }

    pub fn generation(&self) -> Option<i64> {
        self.cluster.metadata.generation
    }

    /// Reference events are recorded against
    pub fn object_ref(&self) -> ObjectReference {
        self.cluster.object_ref(&())
    }

    /// Result asking for a retry after the configured delay
    pub fn requeue_delayed(&self) -> ReconcileResult {
        ReconcileResult::requeue_after(self.config.requeue_delay)
    }
}

/// Requeue request accumulated across reconcile steps
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    /// Retry as soon as possible
    pub requeue: bool,
    /// Retry after this delay
    pub requeue_after: Option<Duration>,
}

impl ReconcileResult {
    /// Result asking for an immediate retry
    pub fn requeue() -> Self {
        Self {
            requeue: true,
            requeue_after: None,
        }
    }

    /// Result asking for a retry after `delay`
    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue: false,
            requeue_after: Some(delay),
        }
    }

    /// Combine two results. Requeue flags are or-ed and the shortest
    /// non-zero delay wins.
    pub fn merge(self, other: ReconcileResult) -> ReconcileResult {
        let requeue_after = match (
            self.requeue_after.filter(|d| !d.is_zero()),
            other.requeue_after.filter(|d| !d.is_zero()),
        ) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        ReconcileResult {
            requeue: self.requeue || other.requeue,
            requeue_after,
        }
    }

    /// Whether neither a retry nor a delayed retry was requested
    pub fn is_done(&self) -> bool {
        !self.requeue && self.requeue_after.is_none()
    }

    /// Convert into a controller action. A delay takes precedence over an
    /// immediate retry; with nothing pending the cluster is resynced.
    pub fn into_action(self, config: &OperatorConfig) -> Action {
        match (self.requeue_after, self.requeue) {
            (Some(delay), _) => Action::requeue(delay),
            (None, true) => Action::requeue(config.requeue_now),
            (None, false) => Action::requeue(config.resync_interval),
        }
    }
}
