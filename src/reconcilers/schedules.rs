//! Scheduled backups
//!
//! One CronJob per repository and backup type with a schedule. Failures are
//! reported as events and turn into a requeue; they never fail the cycle.

use std::str::FromStr;

use cron::Schedule;
use kube::runtime::events::EventType;
use tracing::warn;

use crate::adapters::{backup_cronjob_intent, exec_target, BackupJobParams, CM_REPO_KEY};
use crate::crd::{BackupSchedules, PgBackRestRepo};
use crate::error::{Error, Result};
use crate::k8s::reasons;
use crate::naming::{self, BackupType};

use super::apply::apply;
use super::ReconcileScope;

/// Schedule configured for a backup type. Blank schedules count as unset.
pub fn schedule_for(schedules: &BackupSchedules, backup_type: BackupType) -> Option<&str> {
    let schedule = match backup_type {
        BackupType::Full => schedules.full.as_deref(),
        BackupType::Differential => schedules.differential.as_deref(),
        BackupType::Incremental => schedules.incremental.as_deref(),
    };
    schedule.filter(|s| !s.trim().is_empty())
}

/// Every (backup type, schedule) pair configured for a repository
pub fn repo_schedules(repo: &PgBackRestRepo) -> Vec<(BackupType, &str)> {
    let Some(schedules) = repo.backup_schedules.as_ref() else {
        return Vec::new();
    };
    BackupType::ALL
        .into_iter()
        .filter_map(|t| schedule_for(schedules, t).map(|s| (t, s)))
        .collect()
}

/// Check that a standard 5-field cron expression (or `@` macro) is valid
pub fn validate_schedule(schedule: &str) -> Result<()> {
    let expression = to_cron_expression(schedule)?;
    Schedule::from_str(&expression)
        .map(|_| ())
        .map_err(|e| Error::validation(format!("Invalid cron schedule '{}': {}", schedule, e)))
}

/// Translate a Kubernetes CronJob schedule into the seconds-first form the
/// `cron` crate parses. Day-of-week numbers are shifted from 0-7 with Sunday
/// as 0 or 7 to 1-7 with Sunday as 1.
fn to_cron_expression(schedule: &str) -> Result<String> {
    let trimmed = schedule.trim();
    if trimmed.starts_with('@') {
        return Ok(trimmed.to_string());
    }

    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(Error::validation(format!(
            "Invalid cron schedule '{}': expected 5 fields, found {}",
            schedule,
            fields.len()
        )));
    }

    let day_of_week = convert_day_of_week(fields[4])
        .map_err(|e| Error::validation(format!("Invalid cron schedule '{}': {}", schedule, e)))?;
    Ok(format!(
        "0 {} {} {} {} {}",
        fields[0], fields[1], fields[2], fields[3], day_of_week
    ))
}

fn convert_day_of_week(field: &str) -> std::result::Result<String, String> {
    let mut days = Vec::new();
    for part in field.split(',') {
        if part.starts_with('*') || part == "?" || part.chars().any(|c| c.is_ascii_alphabetic()) {
            return Ok(field.to_string());
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => (
                range,
                step.parse::<u32>()
                    .map_err(|_| format!("invalid step '{}'", step))?,
            ),
            None => (part, 1),
        };
        if step == 0 {
            return Err("step must be positive".to_string());
        }

        let parse = |v: &str| {
            v.parse::<u32>()
                .ok()
                .filter(|d| *d <= 7)
                .ok_or_else(|| format!("invalid day of week '{}'", v))
        };
        let (low, high) = match range.split_once('-') {
            Some((low, high)) => (parse(low)?, parse(high)?),
            None if part.contains('/') => (parse(range)?, 6),
            None => (parse(range)?, parse(range)?),
        };
        if low > high {
            return Err(format!("invalid day of week range '{}'", range));
        }

        days.extend((low..=high).step_by(step as usize).map(|d| d % 7 + 1));
    }
    days.sort_unstable();
    days.dedup();
    Ok(days
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(","))
}

/// Apply a CronJob for every configured schedule. Returns whether a retry
/// is needed.
///
/// The CronJobs depend on the spec alone. Their Jobs send the backup to the
/// exec target by selector and mount the config hash, plus the repository
/// host config when a dedicated host runs.
pub async fn reconcile_scheduled_backups(scope: &ReconcileScope<'_>, service_account: &str) -> bool {
    let repos: Vec<_> = scope
        .cluster
        .pgbackrest()
        .repos
        .iter()
        .filter(|r| !repo_schedules(r).is_empty())
        .collect();
    if repos.is_empty() {
        return false;
    }

    let config_name = scope
        .cluster
        .dedicated_repo_host_enabled()
        .then_some(CM_REPO_KEY);
    let (selector, container) = exec_target(scope.cluster);

    let mut requeue = false;
    for repo in repos {
        for (backup_type, schedule) in repo_schedules(repo) {
            let params = BackupJobParams {
                selector: &selector,
                container,
                repo_name: &repo.name,
                service_account,
                config_name,
                backup_type: Some(backup_type),
            };
            let applied = match validate_schedule(schedule) {
                Ok(()) => match backup_cronjob_intent(scope.cluster, schedule, &params) {
                    Ok(intent) => apply(scope.store, scope.cluster, intent).await.map(|_| ()),
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };

            if let Err(e) = applied {
                let name = naming::cronjob_name(&scope.name(), &repo.name, backup_type);
                warn!(cronjob = %name, error = %e, "Failed to apply scheduled backup");
                scope
                    .events
                    .record(
                        &scope.object_ref(),
                        EventType::Warning,
                        reasons::UNABLE_TO_CREATE_BACKUP_CRON_JOB,
                        &e.to_string(),
                    )
                    .await;
                requeue = true;
            }
        }
    }
    requeue
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_schedules_are_accepted() {
        for schedule in [
            "0 1 * * *",
            "*/15 * * * *",
            "30 2 * * 0",
            "30 2 * * 7",
            "0 3 * * 1-5",
            "0 4 1 * *",
            "@daily",
        ] {
            assert!(validate_schedule(schedule).is_ok(), "{}", schedule);
        }
    }

    #[test]
    fn test_invalid_schedules_are_rejected() {
        for schedule in ["", "0 1 * *", "0 1 * * * *", "61 * * * *", "0 1 * * 8", "bogus"] {
            assert!(validate_schedule(schedule).is_err(), "{}", schedule);
        }
    }

    #[test]
    fn test_day_of_week_is_shifted() {
        assert_eq!(convert_day_of_week("0").unwrap(), "1");
        assert_eq!(convert_day_of_week("7").unwrap(), "1");
        assert_eq!(convert_day_of_week("1-5").unwrap(), "2,3,4,5,6");
        assert_eq!(convert_day_of_week("0,6").unwrap(), "1,7");
        assert_eq!(convert_day_of_week("*").unwrap(), "*");
    }

    #[test]
    fn test_blank_schedules_are_unset() {
        let schedules = BackupSchedules {
            full: Some("0 1 * * 0".to_string()),
            differential: Some(String::new()),
            incremental: Some("  ".to_string()),
        };
        assert_eq!(schedule_for(&schedules, BackupType::Full), Some("0 1 * * 0"));
        assert_eq!(schedule_for(&schedules, BackupType::Differential), None);
        assert_eq!(schedule_for(&schedules, BackupType::Incremental), None);
    }

    #[test]
    fn test_repo_schedules_lists_configured_types() {
        let repo = PgBackRestRepo {
            name: "repo1".to_string(),
            backup_schedules: Some(BackupSchedules {
                full: Some("0 1 * * 0".to_string()),
                incremental: Some("0 1 * * 1-6".to_string()),
                differential: None,
            }),
            ..Default::default()
        };
        let schedules = repo_schedules(&repo);
        assert_eq!(
            schedules,
            vec![
                (BackupType::Full, "0 1 * * 0"),
                (BackupType::Incremental, "0 1 * * 1-6")
            ]
        );
    }
}
