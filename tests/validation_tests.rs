//! Integration tests for cluster spec validation
//!
//! These tests verify that invalid pgBackRest sections are rejected before
//! any resource is touched.

use pgbackrest_operator::crd::{
    BackupSchedules, PgBackRestRepo, PostgresCluster, RepoAzureSpec, RepoGcsSpec, RepoVolumeSpec,
};
use pgbackrest_operator::reconcilers::pgbackrest::validate;
use pgbackrest_operator::reconcilers::schedules::validate_schedule;
use pgbackrest_operator::test_support::cluster;
use pgbackrest_operator::Error;

// ============================================================================
// Test Helpers
// ============================================================================

fn with_repos(repos: Vec<PgBackRestRepo>) -> PostgresCluster {
    let mut c = cluster("hippo");
    c.spec.backups.pgbackrest.repos = repos;
    c
}

fn volume_repo(name: &str) -> PgBackRestRepo {
    PgBackRestRepo {
        name: name.to_string(),
        volume: Some(RepoVolumeSpec::default()),
        ..Default::default()
    }
}

fn scheduled_repo(schedules: BackupSchedules) -> PgBackRestRepo {
    PgBackRestRepo {
        backup_schedules: Some(schedules),
        ..volume_repo("repo1")
    }
}

// ============================================================================
// Repository Validation Tests
// ============================================================================

#[test]
fn fixture_cluster_passes_validation() {
    assert!(validate(&cluster("hippo")).is_ok());
}

#[test]
fn mixed_storage_repos_pass_validation() {
    let c = with_repos(vec![
        volume_repo("repo1"),
        PgBackRestRepo {
            name: "repo2".to_string(),
            gcs: Some(RepoGcsSpec {
                bucket: "backups".to_string(),
            }),
            ..Default::default()
        },
        PgBackRestRepo {
            name: "repo3".to_string(),
            azure: Some(RepoAzureSpec {
                container: "backups".to_string(),
            }),
            ..Default::default()
        },
    ]);
    assert!(validate(&c).is_ok());
}

#[test]
fn blank_image_fails_validation() {
    let mut c = cluster("hippo");
    c.spec.backups.pgbackrest.image = "  ".to_string();
    assert!(matches!(validate(&c), Err(Error::Validation(_))));
}

#[test]
fn out_of_range_repo_fails_validation() {
    let result = validate(&with_repos(vec![volume_repo("repo5")]));
    let message = result.unwrap_err().to_string();
    assert!(message.contains("repo5"), "{}", message);
}

#[test]
fn duplicate_repo_fails_validation() {
    let c = with_repos(vec![volume_repo("repo2"), volume_repo("repo2")]);
    assert!(matches!(validate(&c), Err(Error::Validation(_))));
}

#[test]
fn repo_without_storage_fails_validation() {
    let c = with_repos(vec![PgBackRestRepo {
        name: "repo1".to_string(),
        ..Default::default()
    }]);
    assert!(matches!(validate(&c), Err(Error::Validation(_))));
}

// ============================================================================
// Schedule Validation Tests
// ============================================================================

#[test]
fn standard_schedules_pass_validation() {
    let c = with_repos(vec![scheduled_repo(BackupSchedules {
        full: Some("0 1 * * 0".to_string()),
        differential: Some("0 1 * * 1-6".to_string()),
        incremental: Some("*/30 * * * *".to_string()),
    })]);
    assert!(validate(&c).is_ok());
}

#[test]
fn blank_schedule_passes_validation() {
    let c = with_repos(vec![scheduled_repo(BackupSchedules {
        full: Some("0 1 * * 0".to_string()),
        differential: Some(String::new()),
        ..Default::default()
    })]);
    assert!(validate(&c).is_ok());
}

#[test]
fn malformed_schedule_fails_validation() {
    let c = with_repos(vec![scheduled_repo(BackupSchedules {
        incremental: Some("61 * * * *".to_string()),
        ..Default::default()
    })]);
    assert!(validate(&c).is_err());
}

#[test]
fn schedule_field_count_is_checked() {
    assert!(validate_schedule("0 1 * *").is_err());
    assert!(validate_schedule("0 0 1 * * 0").is_err());
    assert!(validate_schedule("").is_err());
}
