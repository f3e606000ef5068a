//! Kubernetes Event recording
//!
//! Events are fire-and-forget: a failure to publish is logged and never
//! reaches the reconcile result.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

#[cfg(test)]
use mockall::automock;

/// Publishes Events about a cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventRecorder: Send + Sync {
    /// Record an event on the referenced object
    async fn record(&self, object: &ObjectReference, type_: EventType, reason: &str, message: &str);
}

/// [`EventRecorder`] wrapping `kube::runtime::events::Recorder`.
///
/// A `Recorder` is bound to one object, so one is built per event.
pub struct KubeEventRecorder {
    client: Client,
    reporter: Reporter,
}

impl KubeEventRecorder {
    /// Create a recorder reporting as the given controller
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self { client, reporter }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn record(&self, object: &ObjectReference, type_: EventType, reason: &str, message: &str) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: actions::RECONCILE.to_string(),
            secondary: None,
        };
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), object.clone());
        if let Err(e) = recorder.publish(event).await {
            warn!(reason, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Event reasons emitted by the pgBackRest reconciler
pub mod reasons {
    /// Dedicated repository host StatefulSet was created
    pub const REPO_HOST_CREATED: &str = "RepoHostCreated";
    /// `stanza-create` succeeded for every repository
    pub const STANZAS_CREATED: &str = "StanzasCreated";
    /// `stanza-create` failed
    pub const UNABLE_TO_CREATE_STANZAS: &str = "UnableToCreateStanzas";
    /// A scheduled backup CronJob could not be applied
    pub const UNABLE_TO_CREATE_BACKUP_CRON_JOB: &str = "UnableToCreateBackupCronJob";
    /// The cluster spec was rejected
    pub const INVALID_SPEC: &str = "InvalidSpec";
}

/// Event actions
pub mod actions {
    pub const RECONCILE: &str = "Reconcile";
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::Config;

    #[tokio::test]
    async fn unreachable_api_does_not_fail_recording() {
        let config = Config::new("http://127.0.0.1:9".parse().unwrap());
        let client = Client::try_from(config).unwrap();
        let recorder = KubeEventRecorder::new(client, "pgbackrest-operator");
        let object = ObjectReference {
            api_version: Some("postgres.oso.sh/v1alpha1".to_string()),
            kind: Some("PostgresCluster".to_string()),
            name: Some("hippo".to_string()),
            namespace: Some("db".to_string()),
            ..Default::default()
        };

        recorder
            .record(&object, EventType::Warning, reasons::INVALID_SPEC, "bad spec")
            .await;
        recorder
            .record(&object, EventType::Normal, reasons::STANZAS_CREATED, "created")
            .await;
    }
}
