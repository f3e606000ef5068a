//! Condition ledger helpers
//!
//! Conditions are recomputed from observed state on every cycle and upserted
//! by type. [`ConditionFinalizer`] ties the recomputation to the end of a
//! step, so the condition is written on every exit path including early
//! returns and errors.

use std::ops::{Deref, DerefMut};

use chrono::Utc;

use crate::crd::{Condition, ConditionStatus, PostgresClusterStatus, RepoStatus};

/// Dedicated repository host readiness
pub const REPO_HOST_READY: &str = "RepoHostReady";
/// Stanza readiness of the replica-create repository
pub const REPLICA_REPO_READY: &str = "ReplicaRepoReady";
/// Replica creation is possible from the replica-create repository
pub const REPLICA_CREATE: &str = "ReplicaCreate";

/// Build a condition stamped with the current time
pub fn new_condition(
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: &str,
    observed_generation: Option<i64>,
) -> Condition {
    Condition {
        type_: type_.to_string(),
        status,
        last_transition_time: Utc::now(),
        reason: reason.to_string(),
        message: message.to_string(),
        observed_generation,
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Whether the condition is present with status True
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some_and(|c| c.status == ConditionStatus::True)
}

/// Whether the condition is absent or True. Absence means the gate it
/// represents does not apply.
pub fn is_condition_true_or_absent(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).map_or(true, |c| c.status == ConditionStatus::True)
}

/// Insert or replace a condition by type. The previous transition time is
/// kept when the status did not change.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

pub fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) {
    conditions.retain(|c| c.type_ != type_);
}

/// `RepoHostReady` from the repository host status
pub fn repo_host_ready_condition(status: &PostgresClusterStatus, generation: Option<i64>) -> Condition {
    let host = status.pgbackrest.as_ref().and_then(|p| p.repo_host.as_ref());
    let (state, reason, message) = match host {
        None => (
            ConditionStatus::Unknown,
            "RepoHostStatusMissing",
            "pgBackRest dedicated repository host status is missing",
        ),
        Some(h) if h.ready => (
            ConditionStatus::True,
            "RepoHostReady",
            "pgBackRest dedicated repository host is ready",
        ),
        Some(_) => (
            ConditionStatus::False,
            "RepoHostNotReady",
            "pgBackRest dedicated repository host is not ready",
        ),
    };
    new_condition(REPO_HOST_READY, state, reason, message, generation)
}

/// `ReplicaRepoReady` from the replica-create repository status
pub fn replica_repo_ready_condition(repo: Option<&RepoStatus>, generation: Option<i64>) -> Condition {
    let (state, reason, message) = match repo {
        None => (
            ConditionStatus::Unknown,
            "RepoStatusMissing",
            "Status is missing for the replica creation repo",
        ),
        Some(r) if r.stanza_created => (
            ConditionStatus::True,
            "StanzaCreated",
            "pgBackRest replica create repo is ready for backups",
        ),
        Some(_) => (
            ConditionStatus::False,
            "StanzaNotCreated",
            "pgBackRest replica create repo is not ready for backups",
        ),
    };
    new_condition(REPLICA_REPO_READY, state, reason, message, generation)
}

/// `ReplicaCreate` from the replica-create repository status
pub fn replica_create_condition(repo: Option<&RepoStatus>, generation: Option<i64>) -> Condition {
    let (state, reason, message) = match repo {
        None => (
            ConditionStatus::Unknown,
            "RepoStatusMissing",
            "Status is missing for the replica create repo",
        ),
        Some(r) if r.replica_create_backup_complete => (
            ConditionStatus::True,
            "RepoBackupComplete",
            "pgBackRest replica creation is now possible",
        ),
        Some(_) => (
            ConditionStatus::False,
            "RepoBackupNotComplete",
            "pgBackRest replica creation is not currently possible",
        ),
    };
    new_condition(REPLICA_CREATE, state, reason, message, generation)
}

/// Mutable access to the status that runs `finalize` when dropped
pub struct ConditionFinalizer<'a, F>
where
    F: FnMut(&mut PostgresClusterStatus),
{
    status: &'a mut PostgresClusterStatus,
    finalize: F,
}

impl<'a, F> ConditionFinalizer<'a, F>
where
    F: FnMut(&mut PostgresClusterStatus),
{
    pub fn new(status: &'a mut PostgresClusterStatus, finalize: F) -> Self {
        Self { status, finalize }
    }
}

impl<F> Deref for ConditionFinalizer<'_, F>
where
    F: FnMut(&mut PostgresClusterStatus),
{
    type Target = PostgresClusterStatus;

    fn deref(&self) -> &PostgresClusterStatus {
        self.status
    }
}

impl<F> DerefMut for ConditionFinalizer<'_, F>
where
    F: FnMut(&mut PostgresClusterStatus),
{
    fn deref_mut(&mut self) -> &mut PostgresClusterStatus {
        self.status
    }
}

impl<F> Drop for ConditionFinalizer<'_, F>
where
    F: FnMut(&mut PostgresClusterStatus),
{
    fn drop(&mut self) {
        (self.finalize)(self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_upsert_keeps_transition_time_when_status_unchanged() {
        let mut conditions = Vec::new();
        let mut first = new_condition(REPLICA_CREATE, ConditionStatus::False, "A", "a", Some(1));
        first.last_transition_time = Utc::now() - Duration::hours(1);
        let original_time = first.last_transition_time;
        set_condition(&mut conditions, first);

        set_condition(
            &mut conditions,
            new_condition(REPLICA_CREATE, ConditionStatus::False, "B", "b", Some(2)),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].reason, "B");
        assert_eq!(conditions[0].last_transition_time, original_time);

        set_condition(
            &mut conditions,
            new_condition(REPLICA_CREATE, ConditionStatus::True, "C", "c", Some(2)),
        );
        assert_ne!(conditions[0].last_transition_time, original_time);
    }

    #[test]
    fn test_absent_gate_counts_as_open() {
        let mut conditions = Vec::new();
        assert!(is_condition_true_or_absent(&conditions, REPO_HOST_READY));
        assert!(!is_condition_true(&conditions, REPO_HOST_READY));

        set_condition(
            &mut conditions,
            new_condition(REPO_HOST_READY, ConditionStatus::Unknown, "X", "x", None),
        );
        assert!(!is_condition_true_or_absent(&conditions, REPO_HOST_READY));

        remove_condition(&mut conditions, REPO_HOST_READY);
        assert!(conditions.is_empty());
    }

    #[test]
    fn test_finalizer_runs_on_early_return() {
        fn step(status: &mut PostgresClusterStatus, fail: bool) -> Result<(), ()> {
            let mut status = ConditionFinalizer::new(status, |s| {
                let c = replica_create_condition(s.repos().first(), Some(3));
                set_condition(&mut s.conditions, c);
            });
            if fail {
                return Err(());
            }
            status.observed_generation = Some(3);
            Ok(())
        }

        let mut status = PostgresClusterStatus::default();
        assert!(step(&mut status, true).is_err());
        let c = find_condition(&status.conditions, REPLICA_CREATE).unwrap();
        assert_eq!(c.status, ConditionStatus::Unknown);
        assert_eq!(c.reason, "RepoStatusMissing");
        assert_eq!(c.observed_generation, Some(3));
    }

    #[test]
    fn test_replica_conditions_follow_repo_flags() {
        let mut repo = RepoStatus {
            name: "repo1".to_string(),
            ..Default::default()
        };
        assert_eq!(
            replica_repo_ready_condition(Some(&repo), None).reason,
            "StanzaNotCreated"
        );
        repo.stanza_created = true;
        repo.replica_create_backup_complete = true;
        assert_eq!(
            replica_repo_ready_condition(Some(&repo), None).status,
            ConditionStatus::True
        );
        assert_eq!(
            replica_create_condition(Some(&repo), None).reason,
            "RepoBackupComplete"
        );
    }
}
