use bastion_core::{BackupRecord, BackupTag, Clock, ContractError, RetentionConfig};
use bastion_storage::{LedgerStore, StorageError};
use chrono::{DateTime, Datelike, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_GRACE_PERIOD_HOURS: i64 = 24;

#[derive(Debug, Error)]
pub enum RetentionError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("contract error: {0}")]
    Contract(#[from] ContractError),
    #[error("schedule {schedule_id} not found")]
    ScheduleNotFound { schedule_id: String },
    #[error("backup {backup_id} not found")]
    NotFound { backup_id: String },
    #[error("grace period out of range: {hours} hour(s)")]
    InvalidGracePeriod { hours: i64 },
}

#[derive(Debug, Clone)]
pub struct RetentionEngineConfig {
    /// How long a marked backup stays recoverable before cleanup may take it.
    pub grace_period_hours: i64,
}

impl Default for RetentionEngineConfig {
    fn default() -> Self {
        Self {
            grace_period_hours: DEFAULT_GRACE_PERIOD_HOURS,
        }
    }
}

/// GFS outcome for one schedule. Each rule lists its kept ids newest first;
/// a backup kept by several rules appears in each of their lists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionPlan {
    pub kept_daily: Vec<String>,
    pub kept_weekly: Vec<String>,
    pub kept_monthly: Vec<String>,
    pub kept_yearly: Vec<String>,
    pub kept_explicit: Vec<String>,
    pub kept_archival: Vec<String>,
    /// Oldest first.
    pub candidates: Vec<String>,
}

impl RetentionPlan {
    pub fn kept_ids(&self) -> BTreeSet<&str> {
        self.kept_daily
            .iter()
            .chain(&self.kept_weekly)
            .chain(&self.kept_monthly)
            .chain(&self.kept_yearly)
            .chain(&self.kept_explicit)
            .chain(&self.kept_archival)
            .map(String::as_str)
            .collect()
    }

    pub fn is_kept(&self, backup_id: &str) -> bool {
        self.kept_ids().contains(backup_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub schedule_id: String,
    pub dry_run: bool,
    pub candidates: Vec<String>,
    pub newly_marked: usize,
}

/// Computes the GFS keep set over COMPLETED backups. Input order does not
/// matter; non-completed rows are ignored.
pub fn evaluate(backups: &[BackupRecord], config: &RetentionConfig) -> RetentionPlan {
    let mut completed = backups
        .iter()
        .filter(|backup| backup.is_completed())
        .collect::<Vec<_>>();
    completed.sort_by(|left, right| newest_first(left, right));

    let kept_daily = completed
        .iter()
        .filter(|backup| backup.tag == BackupTag::Daily)
        .take(config.daily as usize)
        .map(|backup| backup.id.clone())
        .collect::<Vec<_>>();

    let kept_weekly = newest_per_period(&completed, config.weekly, |at| {
        let week = at.iso_week();
        (week.year(), week.week())
    });
    let kept_monthly = newest_per_period(&completed, config.monthly, |at| (at.year(), at.month()));
    let kept_yearly = newest_per_period(&completed, config.yearly, |at| at.year());

    let kept_explicit = completed
        .iter()
        .filter(|backup| {
            matches!(
                backup.tag,
                BackupTag::Weekly | BackupTag::Monthly | BackupTag::Yearly
            )
        })
        .map(|backup| backup.id.clone())
        .collect::<Vec<_>>();
    let kept_archival = completed
        .iter()
        .filter(|backup| backup.tag == BackupTag::Archival)
        .map(|backup| backup.id.clone())
        .collect::<Vec<_>>();

    let mut plan = RetentionPlan {
        kept_daily,
        kept_weekly,
        kept_monthly,
        kept_yearly,
        kept_explicit,
        kept_archival,
        candidates: Vec::new(),
    };

    let kept = plan
        .kept_ids()
        .into_iter()
        .map(str::to_string)
        .collect::<BTreeSet<_>>();
    plan.candidates = completed
        .iter()
        .rev()
        .filter(|backup| !kept.contains(&backup.id))
        .map(|backup| backup.id.clone())
        .collect();
    plan
}

/// Most recent backup per period key, then the `keep` newest periods.
fn newest_per_period<K, F>(ordered: &[&BackupRecord], keep: u32, period_of: F) -> Vec<String>
where
    K: Ord,
    F: Fn(DateTime<Utc>) -> K,
{
    if keep == 0 {
        return Vec::new();
    }
    let mut seen = BTreeSet::new();
    let mut representatives = Vec::new();
    for backup in ordered {
        if seen.insert(period_of(backup.effective_completed_at())) {
            representatives.push(backup.id.clone());
        }
    }
    representatives.truncate(keep as usize);
    representatives
}

fn newest_first(left: &BackupRecord, right: &BackupRecord) -> std::cmp::Ordering {
    right
        .effective_completed_at()
        .cmp(&left.effective_completed_at())
        .then_with(|| right.id.cmp(&left.id))
}

pub struct RetentionEngine {
    config: RetentionEngineConfig,
    clock: Arc<dyn Clock>,
}

impl RetentionEngine {
    pub fn new(config: RetentionEngineConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    /// Read-only GFS preview for a stored schedule.
    pub fn evaluate_schedule(
        &self,
        store: &LedgerStore,
        schedule_id: &str,
    ) -> Result<RetentionPlan, RetentionError> {
        let retention = schedule_retention(store, schedule_id)?;
        let backups = store.completed_backups_for_schedule(schedule_id)?;
        Ok(evaluate(&backups, &retention))
    }

    /// Marks every GFS candidate of the schedule as expired at `now`. The
    /// whole pass runs in one write transaction; already-marked rows keep
    /// their original mark, so a re-run after a crash is harmless.
    pub fn apply(
        &self,
        store: &mut LedgerStore,
        schedule_id: &str,
        dry_run: bool,
    ) -> Result<RetentionReport, RetentionError> {
        let retention = schedule_retention(store, schedule_id)?;

        if dry_run {
            let backups = store.completed_backups_for_schedule(schedule_id)?;
            let plan = evaluate(&backups, &retention);
            debug!(
                event = "retention_dry_run",
                schedule_id,
                candidates = plan.candidates.len()
            );
            return Ok(RetentionReport {
                schedule_id: schedule_id.to_string(),
                dry_run: true,
                candidates: plan.candidates,
                newly_marked: 0,
            });
        }

        let now = self.clock.now();
        let txn = store.immediate_transaction()?;
        let backups = txn.completed_backups_for_schedule(schedule_id)?;
        let plan = evaluate(&backups, &retention);
        let newly_marked = txn.mark_expired(&plan.candidates, now)?;
        txn.commit()?;

        info!(
            event = "retention_marked",
            schedule_id,
            candidates = plan.candidates.len(),
            newly_marked
        );
        Ok(RetentionReport {
            schedule_id: schedule_id.to_string(),
            dry_run: false,
            candidates: plan.candidates,
            newly_marked,
        })
    }

    /// Backups marked at least `grace_period_hours` ago (engine default when
    /// `None`), oldest mark first.
    pub fn get_expired_backups(
        &self,
        store: &LedgerStore,
        grace_period_hours: Option<i64>,
    ) -> Result<Vec<BackupRecord>, RetentionError> {
        let hours = grace_period_hours.unwrap_or(self.config.grace_period_hours);
        let cutoff = if hours < 0 {
            None
        } else {
            Duration::try_hours(hours).and_then(|grace| self.clock.now().checked_sub_signed(grace))
        };
        let Some(cutoff) = cutoff else {
            return Err(RetentionError::InvalidGracePeriod { hours });
        };
        Ok(store.expired_backups(cutoff)?)
    }

    /// Clears a pending expiry mark. Returns false if the backup was not marked.
    pub fn cancel_expiry(
        &self,
        store: &LedgerStore,
        backup_id: &str,
    ) -> Result<bool, RetentionError> {
        if store.backup(backup_id)?.is_none() {
            return Err(RetentionError::NotFound {
                backup_id: backup_id.to_string(),
            });
        }
        let cleared = store.clear_expiry(backup_id)?;
        if cleared {
            info!(event = "retention_expiry_cancelled", backup_id);
        }
        Ok(cleared)
    }
}

fn schedule_retention(
    store: &LedgerStore,
    schedule_id: &str,
) -> Result<RetentionConfig, RetentionError> {
    let schedule = store
        .schedule(schedule_id)?
        .ok_or_else(|| RetentionError::ScheduleNotFound {
            schedule_id: schedule_id.to_string(),
        })?;
    schedule.retention.validate()?;
    Ok(schedule.retention)
}
