//! Stanza gate
//!
//! Runs `pgbackrest stanza-create` once the cluster is bootstrapped and the
//! repository host is ready, and only while some repository still lacks a
//! stanza. `ReplicaRepoReady` is recomputed on every exit.

use kube::runtime::events::EventType;
use tracing::{info, warn};

use crate::adapters::{is_config_hash_mismatch, stanza_create_command};
use crate::crd::PostgresClusterStatus;
use crate::error::{Error, Result};
use crate::k8s::reasons;
use crate::metrics;

use super::conditions::{
    is_condition_true_or_absent, replica_repo_ready_condition, set_condition, ConditionFinalizer,
    REPO_HOST_READY,
};
use super::pods::find_exec_target;
use super::ReconcileScope;

/// Outcome of the stanza gate
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StanzaOutcome {
    /// Preconditions unmet or every stanza already exists
    NotNeeded,
    /// `stanza-create` ran and every repository is marked
    Created,
    /// The target pod has not picked up the current configuration yet
    ConfigHashMismatch,
}

impl StanzaOutcome {
    pub fn is_config_hash_mismatch(self) -> bool {
        self == StanzaOutcome::ConfigHashMismatch
    }
}

/// Create stanzas for every repository if needed
pub async fn reconcile_stanza_create(
    scope: &ReconcileScope<'_>,
    status: &mut PostgresClusterStatus,
    config_hash: &str,
) -> Result<StanzaOutcome> {
    let generation = scope.generation();
    let replica_repo = scope.cluster.replica_create_repo_name().map(str::to_string);
    let mut status = ConditionFinalizer::new(status, move |s| {
        if let Some(repo) = replica_repo.as_deref() {
            let condition = replica_repo_ready_condition(s.repo(repo), generation);
            set_condition(&mut s.conditions, condition);
        }
    });

    if !status.bootstrapped()
        || !is_condition_true_or_absent(&status.conditions, REPO_HOST_READY)
        || status.repos().iter().all(|r| r.stanza_created)
    {
        return Ok(StanzaOutcome::NotNeeded);
    }

    let target = find_exec_target(scope).await?;
    let pod = target.pod_name();
    let result = scope
        .exec
        .exec(
            &scope.namespace(),
            &pod,
            target.container,
            None,
            stanza_create_command(config_hash),
        )
        .await;

    match result {
        Ok(_) => {
            info!(pod = %pod, "Created pgBackRest stanzas");
            metrics::STANZA_CREATES.with_label_values(&["created"]).inc();
            scope
                .events
                .record(
                    &scope.object_ref(),
                    EventType::Normal,
                    reasons::STANZAS_CREATED,
                    "pgBackRest stanza creation completed successfully",
                )
                .await;
            if let Some(pgbackrest) = status.pgbackrest.as_mut() {
                for repo in pgbackrest.repos.iter_mut() {
                    repo.stanza_created = true;
                }
            }
            Ok(StanzaOutcome::Created)
        }
        Err(e) if e.stderr().is_some_and(is_config_hash_mismatch) => {
            info!(pod = %pod, "pgBackRest configuration not yet propagated, deferring stanza creation");
            metrics::STANZA_CREATES
                .with_label_values(&["config_hash_mismatch"])
                .inc();
            Ok(StanzaOutcome::ConfigHashMismatch)
        }
        Err(e) => {
            warn!(pod = %pod, error = %e, "Failed to create pgBackRest stanzas");
            metrics::STANZA_CREATES.with_label_values(&["failed"]).inc();
            scope
                .events
                .record(
                    &scope.object_ref(),
                    EventType::Warning,
                    reasons::UNABLE_TO_CREATE_STANZAS,
                    &e.to_string(),
                )
                .await;
            Err(Error::from(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::CONFIG_HASH_MISMATCH;
    use crate::config::OperatorConfig;
    use crate::crd::{PgBackRestStatus, RepoStatus};
    use crate::k8s::{ExecError, ExecOutput, MockEventRecorder, MockPodExecutor};
    use crate::reconcilers::conditions::{find_condition, REPLICA_REPO_READY};
    use crate::test_support::{bootstrapped_status, cluster, instance_pod, MemoryStore};
    use crate::crd::ConditionStatus;

    fn pending_status() -> PostgresClusterStatus {
        let mut status = bootstrapped_status();
        status.pgbackrest = Some(PgBackRestStatus {
            repo_host: None,
            repos: vec![RepoStatus {
                name: "repo1".to_string(),
                ..Default::default()
            }],
        });
        status
    }

    #[test]
    fn test_not_bootstrapped_makes_no_calls() {
        let c = cluster("hippo");
        let store = MemoryStore::new();
        let mut exec = MockPodExecutor::new();
        exec.expect_exec().times(0);
        let mut events = MockEventRecorder::new();
        events.expect_record().times(0);
        let config = OperatorConfig::default();
        let scope = ReconcileScope::new(&c, &store, &exec, &events, &config);

        let mut status = pending_status();
        status.patroni = None;
        let outcome = tokio_test::block_on(reconcile_stanza_create(&scope, &mut status, "h1"));

        assert_eq!(outcome.unwrap(), StanzaOutcome::NotNeeded);
        assert_eq!(store.counts().total(), 0);
        let condition = find_condition(&status.conditions, REPLICA_REPO_READY).unwrap();
        assert_eq!(condition.status, ConditionStatus::False);
    }

    #[test]
    fn test_success_marks_every_repo() {
        let c = cluster("hippo");
        let store = MemoryStore::new();
        store.insert(&instance_pod("hippo", "hippo-00", true));
        let mut exec = MockPodExecutor::new();
        exec.expect_exec()
            .withf(|_, pod, container, _, command| {
                pod.to_string() == "hippo-00-0"
                    && container.to_string() == "database"
                    && command.iter().any(|a| a == "h1")
            })
            .times(1)
            .returning(|_, _, _, _, _| Ok(ExecOutput::default()));
        let mut events = MockEventRecorder::new();
        events
            .expect_record()
            .withf(|_, _, reason, _| reason.to_string() == reasons::STANZAS_CREATED)
            .times(1)
            .return_const(());
        let config = OperatorConfig::default();
        let scope = ReconcileScope::new(&c, &store, &exec, &events, &config);

        let mut status = pending_status();
        let outcome = tokio_test::block_on(reconcile_stanza_create(&scope, &mut status, "h1"));

        assert_eq!(outcome.unwrap(), StanzaOutcome::Created);
        assert!(status.repo("repo1").unwrap().stanza_created);
        let condition = find_condition(&status.conditions, REPLICA_REPO_READY).unwrap();
        assert_eq!(condition.status, ConditionStatus::True);
    }

    #[test]
    fn test_hash_mismatch_is_not_an_error() {
        let c = cluster("hippo");
        let store = MemoryStore::new();
        store.insert(&instance_pod("hippo", "hippo-00", true));
        let mut exec = MockPodExecutor::new();
        exec.expect_exec().times(1).returning(|_, _, _, _, _| {
            Err(ExecError::Failed {
                message: "exit code 1".to_string(),
                stdout: String::new(),
                stderr: CONFIG_HASH_MISMATCH.to_string(),
            })
        });
        let mut events = MockEventRecorder::new();
        events.expect_record().times(0);
        let config = OperatorConfig::default();
        let scope = ReconcileScope::new(&c, &store, &exec, &events, &config);

        let mut status = pending_status();
        let outcome = tokio_test::block_on(reconcile_stanza_create(&scope, &mut status, "h1"));

        assert!(outcome.unwrap().is_config_hash_mismatch());
        assert!(!status.repo("repo1").unwrap().stanza_created);
    }

    #[test]
    fn test_missing_pod_is_a_consistency_error() {
        let c = cluster("hippo");
        let store = MemoryStore::new();
        let mut exec = MockPodExecutor::new();
        exec.expect_exec().times(0);
        let mut events = MockEventRecorder::new();
        events.expect_record().times(0);
        let config = OperatorConfig::default();
        let scope = ReconcileScope::new(&c, &store, &exec, &events, &config);

        let mut status = pending_status();
        let result = tokio_test::block_on(reconcile_stanza_create(&scope, &mut status, "h1"));

        assert!(result.unwrap_err().is_consistency());
        assert_eq!(store.counts().mutations(), 0);
    }
}
