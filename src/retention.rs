//! Retention planning
//!
//! Decides which catalog records have expired. Planning is pure: it looks at
//! records, a [`RetentionPolicy`] and the current instant, and returns ids.
//! [`crate::catalog::Catalog::apply_retention_policy`] performs the deletion.
//!
//! Rules:
//!
//! - An incremental expires once it is older than `keep_incremental_days` or
//!   `max_age_days`.
//! - A full backup survives if it is not older than `max_age_days` and it is
//!   either among the newest `keep_last_full_backups` fulls, or the newest full
//!   of its calendar month within the newest `keep_monthly_backups` months
//!   that have one.
//! - A full backup that is the baseline of a surviving incremental always
//!   survives.
//! - Records that are not `Completed` are only subject to `max_age_days`.

use crate::types::{BackupRecord, BackupStatus, BackupType, RetentionPolicy};
use chrono::{DateTime, Datelike, Duration, Utc};
use std::collections::HashSet;
use tracing::debug;

/// Outcome of planning
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPlan {
    /// Records to delete, oldest first
    pub expired: Vec<String>,
    /// Fulls that were eligible for deletion but are baselines of live incrementals
    pub kept_as_baseline: Vec<String>,
}

/// Plan retention for `records` at instant `now`
pub fn plan(
    records: &[BackupRecord],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> RetentionPlan {
    let max_age = Duration::days(policy.max_age_days);
    let incremental_age = Duration::days(policy.keep_incremental_days);
    let age = |record: &BackupRecord| now - record.created_at;

    let mut sorted: Vec<&BackupRecord> = records.iter().collect();
    sorted.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));

    let mut expired: HashSet<&str> = HashSet::new();
    let mut live_baselines: HashSet<&str> = HashSet::new();

    for record in &sorted {
        if record.status != BackupStatus::Completed {
            if age(record) > max_age {
                expired.insert(&record.id);
            }
            continue;
        }
        if record.backup_type == BackupType::Incremental {
            if age(record) > incremental_age || age(record) > max_age {
                expired.insert(&record.id);
            } else if let Some(baseline) = record.baseline_id.as_deref() {
                live_baselines.insert(baseline);
            }
        }
    }

    let fulls: Vec<&BackupRecord> = sorted
        .iter()
        .copied()
        .filter(|r| r.status == BackupStatus::Completed && r.backup_type == BackupType::Full)
        .collect();

    let mut monthly_keepers: HashSet<&str> = HashSet::new();
    let mut months_seen: Vec<(i32, u32)> = Vec::new();
    for full in &fulls {
        let month = (full.created_at.year(), full.created_at.month());
        if !months_seen.contains(&month) {
            months_seen.push(month);
            if months_seen.len() <= policy.keep_monthly_backups {
                monthly_keepers.insert(&full.id);
            }
        }
    }

    let mut kept_as_baseline = Vec::new();
    for (rank, full) in fulls.iter().enumerate() {
        let too_old = age(full) > max_age;
        let recent = rank < policy.keep_last_full_backups;
        let monthly = monthly_keepers.contains(full.id.as_str());
        if !too_old && (recent || monthly) {
            continue;
        }
        if live_baselines.contains(full.id.as_str()) {
            debug!("Keeping full backup {} because live incrementals depend on it", full.id);
            kept_as_baseline.push(full.id.clone());
            continue;
        }
        expired.insert(&full.id);
    }

    let expired = sorted
        .iter()
        .rev()
        .filter(|r| expired.contains(r.id.as_str()))
        .map(|r| r.id.clone())
        .collect();

    RetentionPlan {
        expired,
        kept_as_baseline,
    }
}
