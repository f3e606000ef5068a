//! Integration tests for the dedicated repository host

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Secret;
use serde_json::json;

use pgbackrest_operator::adapters::CM_REPO_KEY;
use pgbackrest_operator::config::OperatorConfig;
use pgbackrest_operator::crd::{
    ConditionStatus, DedicatedRepoHostSpec, PostgresCluster, RepoHostSpec,
};
use pgbackrest_operator::k8s::{reasons, ResourceKind};
use pgbackrest_operator::naming;
use pgbackrest_operator::reconcilers::conditions::{find_condition, REPO_HOST_READY};
use pgbackrest_operator::reconcilers::pgbackrest::reconcile_cluster;
use pgbackrest_operator::reconcilers::ReconcileScope;
use pgbackrest_operator::test_support::{
    bootstrapped_status, cluster, instance_pod, repo_host_pod, MemoryStore, RecordingEvents,
    ScriptedExecutor, NAMESPACE,
};

// ============================================================================
// Test Helpers
// ============================================================================

struct Harness {
    store: MemoryStore,
    exec: ScriptedExecutor,
    events: RecordingEvents,
    config: OperatorConfig,
}

impl Harness {
    fn new() -> Self {
        Self {
            store: MemoryStore::new(),
            exec: ScriptedExecutor::new(),
            events: RecordingEvents::new(),
            config: OperatorConfig::default(),
        }
    }

    async fn cycle(&self, cluster: &mut PostgresCluster) {
        let scope = ReconcileScope::new(cluster, &self.store, &self.exec, &self.events, &self.config);
        let (status, _) = reconcile_cluster(&scope).await.unwrap();
        cluster.status = Some(status);
    }

    fn mark_host_ready(&self) {
        self.store.update_status(
            ResourceKind::StatefulSet,
            NAMESPACE,
            &naming::repo_host_name("hippo"),
            json!({ "replicas": 1, "readyReplicas": 1 }),
        );
    }
}

fn dedicated(name: &str) -> PostgresCluster {
    let mut c = cluster(name);
    c.spec.backups.pgbackrest.repo_host = Some(RepoHostSpec {
        dedicated: Some(DedicatedRepoHostSpec::default()),
    });
    c.status = Some(bootstrapped_status());
    c
}

fn host_ready(cluster: &PostgresCluster) -> Option<ConditionStatus> {
    let status = cluster.status.as_ref()?;
    find_condition(&status.conditions, REPO_HOST_READY).map(|c| c.status)
}

// ============================================================================
// Repository Host Tests
// ============================================================================

#[tokio::test]
async fn host_is_created_once() {
    let h = Harness::new();
    let mut c = dedicated("hippo");

    h.cycle(&mut c).await;

    let host: StatefulSet = h
        .store
        .get_typed(NAMESPACE, &naming::repo_host_name("hippo"))
        .unwrap();
    assert_eq!(host.spec.unwrap().replicas, Some(1));
    assert_eq!(h.events.reasons(), vec![reasons::REPO_HOST_CREATED.to_string()]);
    assert_eq!(host_ready(&c), Some(ConditionStatus::False));
    assert!(h
        .store
        .get_typed::<Secret>(NAMESPACE, &naming::ssh_secret_name("hippo"))
        .is_some());

    h.store.reset_counts();
    h.cycle(&mut c).await;

    assert_eq!(h.store.counts().mutations(), 0);
    assert_eq!(h.events.reasons().len(), 1);
    assert_eq!(h.store.count(ResourceKind::StatefulSet), 1);
}

#[tokio::test]
async fn ssh_keys_survive_cycles() {
    let h = Harness::new();
    let mut c = dedicated("hippo");

    h.cycle(&mut c).await;
    let first: Secret = h
        .store
        .get_typed(NAMESPACE, &naming::ssh_secret_name("hippo"))
        .unwrap();
    h.cycle(&mut c).await;
    let second: Secret = h
        .store
        .get_typed(NAMESPACE, &naming::ssh_secret_name("hippo"))
        .unwrap();

    assert_eq!(first.data, second.data);
}

#[tokio::test]
async fn stanza_waits_for_ready_host() {
    let h = Harness::new();
    let mut c = dedicated("hippo");
    h.store.insert(&repo_host_pod("hippo"));
    h.store.insert(&instance_pod("hippo", "hippo-00", true));

    h.cycle(&mut c).await;
    assert!(h.exec.calls().is_empty());
    assert_eq!(h.store.count(ResourceKind::Job), 0);

    h.mark_host_ready();
    h.cycle(&mut c).await;

    assert_eq!(host_ready(&c), Some(ConditionStatus::True));
    let calls = h.exec.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].pod, format!("{}-0", naming::repo_host_name("hippo")));
    assert_eq!(calls[0].container, "pgbackrest");

    let job: Job = h
        .store
        .get_typed(NAMESPACE, &naming::replica_create_job_name("hippo"))
        .unwrap();
    assert_eq!(
        job.metadata
            .annotations
            .unwrap()
            .get(naming::ANNOTATION_PGBACKREST_CONFIG)
            .map(String::as_str),
        Some(CM_REPO_KEY)
    );
}

#[tokio::test]
async fn disabling_host_removes_it() {
    let h = Harness::new();
    let mut c = dedicated("hippo");
    h.cycle(&mut c).await;
    h.mark_host_ready();
    h.cycle(&mut c).await;
    assert!(c.status.as_ref().unwrap().pgbackrest.as_ref().unwrap().repo_host.is_some());

    c.spec.backups.pgbackrest.repo_host = None;
    h.cycle(&mut c).await;

    assert_eq!(h.store.count(ResourceKind::StatefulSet), 0);
    assert_eq!(host_ready(&c), None);
    assert!(c.status.as_ref().unwrap().pgbackrest.as_ref().unwrap().repo_host.is_none());
}
