use bastion_core::{BackupRecord, Clock, ContractError, DeleteDecision, RetentionMode};
use bastion_storage::{format_timestamp, LedgerStore, StorageError};
use chrono::{DateTime, Datelike, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_LEGAL_HOLD_FALLBACK_DAYS: i64 = 30;
/// Deadlines are stored as RFC3339 text and compared as strings, which
/// only orders correctly for four-digit years.
const LATEST_DEADLINE_YEAR: i32 = 9999;

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("contract error: {0}")]
    Contract(#[from] ContractError),
    #[error("backup {backup_id} not found")]
    NotFound { backup_id: String },
    #[error("backup {backup_id} is already immutable")]
    AlreadyImmutable { backup_id: String },
    #[error("backup {backup_id} is not under legal hold")]
    NotUnderLegalHold { backup_id: String },
    #[error("retention days out of range: {days}")]
    InvalidRetentionDays { days: i64 },
}

#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// COMPLIANCE period applied when a legal hold is lifted and the owning
    /// schedule has no daily retention to borrow.
    pub legal_hold_fallback_days: i64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            legal_hold_fallback_days: DEFAULT_LEGAL_HOLD_FALLBACK_DAYS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionStatistics {
    pub governance: usize,
    pub compliance: usize,
    pub legal_hold: usize,
    pub total_immutable: usize,
    /// Still flagged immutable although `retention_until` has passed.
    pub expired_but_immutable: usize,
}

/// Answers whether a backup may be destroyed under its WORM settings.
pub struct ImmutabilityGuard {
    config: GuardConfig,
    clock: Arc<dyn Clock>,
}

impl ImmutabilityGuard {
    pub fn new(config: GuardConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    /// LEGAL_HOLD gets no deadline; the other modes run `retention_days`
    /// from the backup's creation time.
    pub fn make_immutable(
        &self,
        store: &LedgerStore,
        backup_id: &str,
        retention_days: i64,
        mode: RetentionMode,
        reason: &str,
    ) -> Result<BackupRecord, GuardError> {
        if retention_days < 0 {
            return Err(GuardError::InvalidRetentionDays {
                days: retention_days,
            });
        }
        let mut backup = load_backup(store, backup_id)?;
        if backup.immutable {
            return Err(GuardError::AlreadyImmutable {
                backup_id: backup.id,
            });
        }

        backup.immutable = true;
        backup.retention_mode = Some(mode);
        backup.retention_until = match mode {
            RetentionMode::LegalHold => None,
            RetentionMode::Governance | RetentionMode::Compliance => {
                Some(deadline(backup.created_at, retention_days)?)
            }
        };
        backup.immutability_reason = Some(reason.to_string());
        backup.check_protection_fields()?;
        store.update_protection(&backup)?;

        info!(
            event = "backup_made_immutable",
            backup_id = %backup.id,
            mode = %mode,
            retention_until = %backup.retention_until.map(format_timestamp).unwrap_or_default()
        );
        Ok(backup)
    }

    pub fn can_delete(
        &self,
        store: &LedgerStore,
        backup_id: &str,
        is_admin: bool,
        override_governance: bool,
    ) -> Result<DeleteDecision, GuardError> {
        let Some(backup) = store.backup(backup_id)? else {
            return Ok(DeleteDecision::deny(format!("backup {backup_id} not found")));
        };
        Ok(self.decide(&backup, is_admin, override_governance))
    }

    /// Decision table over an already-loaded record.
    pub fn decide(
        &self,
        backup: &BackupRecord,
        is_admin: bool,
        override_governance: bool,
    ) -> DeleteDecision {
        if !backup.immutable {
            return DeleteDecision::allow();
        }
        let now = self.clock.now();

        let Some(mode) = backup.retention_mode else {
            warn!(event = "immutable_without_mode", backup_id = %backup.id);
            return DeleteDecision::deny(format!(
                "backup {} is immutable with no retention mode recorded; refusing deletion",
                backup.id
            ));
        };

        match mode {
            RetentionMode::LegalHold => DeleteDecision::deny(format!(
                "backup {} is under LEGAL_HOLD; hold must be removed first",
                backup.id
            )),
            RetentionMode::Compliance => match backup.retention_until {
                Some(until) if now >= until => DeleteDecision::allow(),
                Some(until) => DeleteDecision::deny(format!(
                    "backup {} is under COMPLIANCE retention for {} more day(s); early deletion is not possible",
                    backup.id,
                    days_remaining(now, until)
                )),
                None => missing_deadline(backup, mode),
            },
            RetentionMode::Governance => match backup.retention_until {
                Some(until) if now >= until => DeleteDecision::allow(),
                Some(until) if is_admin && override_governance => {
                    warn!(
                        event = "governance_override",
                        backup_id = %backup.id,
                        days_remaining = days_remaining(now, until)
                    );
                    DeleteDecision::allow_with(format!(
                        "GOVERNANCE retention overridden by administrator with {} day(s) remaining",
                        days_remaining(now, until)
                    ))
                }
                Some(until) => DeleteDecision::deny(format!(
                    "backup {} is under GOVERNANCE retention for {} more day(s); an administrator may delete it with the governance override",
                    backup.id,
                    days_remaining(now, until)
                )),
                None => missing_deadline(backup, mode),
            },
        }
    }

    /// Converts LEGAL_HOLD into a COMPLIANCE period starting now. One way only.
    pub fn remove_legal_hold(
        &self,
        store: &LedgerStore,
        backup_id: &str,
    ) -> Result<BackupRecord, GuardError> {
        let mut backup = load_backup(store, backup_id)?;
        if !backup.immutable || backup.retention_mode != Some(RetentionMode::LegalHold) {
            return Err(GuardError::NotUnderLegalHold {
                backup_id: backup.id,
            });
        }

        let days = self.standard_retention_days(store, &backup)?;
        let now = self.clock.now();
        let previous = backup.immutability_reason.take().unwrap_or_default();

        backup.retention_mode = Some(RetentionMode::Compliance);
        backup.retention_until = Some(deadline(now, days)?);
        backup.immutability_reason = Some(format!(
            "legal hold lifted at {}; COMPLIANCE for {} day(s) (was: {})",
            format_timestamp(now),
            days,
            previous
        ));
        backup.check_protection_fields()?;
        store.update_protection(&backup)?;

        info!(
            event = "legal_hold_removed",
            backup_id = %backup.id,
            compliance_days = days
        );
        Ok(backup)
    }

    pub fn retention_statistics(
        &self,
        store: &LedgerStore,
    ) -> Result<RetentionStatistics, GuardError> {
        let now = self.clock.now();
        let mut stats = RetentionStatistics::default();
        for backup in store.immutable_backups()? {
            stats.total_immutable += 1;
            match backup.retention_mode {
                Some(RetentionMode::Governance) => stats.governance += 1,
                Some(RetentionMode::Compliance) => stats.compliance += 1,
                Some(RetentionMode::LegalHold) => stats.legal_hold += 1,
                None => {}
            }
            if backup.retention_until.is_some_and(|until| until <= now) {
                stats.expired_but_immutable += 1;
            }
        }
        Ok(stats)
    }

    fn standard_retention_days(
        &self,
        store: &LedgerStore,
        backup: &BackupRecord,
    ) -> Result<i64, GuardError> {
        let Some(schedule_id) = backup.schedule_id.as_deref() else {
            return Ok(self.config.legal_hold_fallback_days);
        };
        Ok(store
            .schedule(schedule_id)?
            .map(|schedule| i64::from(schedule.retention.daily))
            .filter(|days| *days > 0)
            .unwrap_or(self.config.legal_hold_fallback_days))
    }
}

fn load_backup(store: &LedgerStore, backup_id: &str) -> Result<BackupRecord, GuardError> {
    store
        .backup(backup_id)?
        .ok_or_else(|| GuardError::NotFound {
            backup_id: backup_id.to_string(),
        })
}

fn missing_deadline(backup: &BackupRecord, mode: RetentionMode) -> DeleteDecision {
    warn!(event = "retention_deadline_missing", backup_id = %backup.id, mode = %mode);
    DeleteDecision::deny(format!(
        "backup {} is under {} retention with no deadline recorded; refusing deletion",
        backup.id, mode
    ))
}

fn deadline(from: DateTime<Utc>, days: i64) -> Result<DateTime<Utc>, GuardError> {
    if days < 0 {
        return Err(GuardError::InvalidRetentionDays { days });
    }
    Duration::try_days(days)
        .and_then(|span| from.checked_add_signed(span))
        .filter(|until| until.year() <= LATEST_DEADLINE_YEAR)
        .ok_or(GuardError::InvalidRetentionDays { days })
}

/// Whole days left, rounded up so "less than a day" still reads as 1.
fn days_remaining(now: DateTime<Utc>, until: DateTime<Utc>) -> i64 {
    let seconds = (until - now).num_seconds().max(0);
    (seconds + 86_399) / 86_400
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_core::{
        BackupMode, BackupSchedule, BackupStatus, FixedClock, RetentionConfig, SourceType,
    };
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 8, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn setup() -> (LedgerStore, ImmutabilityGuard, Arc<FixedClock>) {
        let store = LedgerStore::open_in_memory().expect("open db");
        let clock = Arc::new(FixedClock::new(start()));
        let guard = ImmutabilityGuard::new(GuardConfig::default(), clock.clone());
        (store, guard, clock)
    }

    fn insert_backup(store: &LedgerStore, id: &str) -> BackupRecord {
        let mut backup = BackupRecord::pending(SourceType::Vm, "vm-1", BackupMode::Full, start());
        backup.id = id.to_string();
        backup.status = BackupStatus::Completed;
        backup.completed_at = Some(start());
        store.upsert_backup(&backup).expect("insert backup");
        backup
    }

    #[test]
    fn mutable_backup_is_deletable_and_missing_backup_is_not() {
        let (store, guard, _) = setup();
        insert_backup(&store, "plain");
        assert!(guard.can_delete(&store, "plain", false, false).expect("decision").allowed);

        let missing = guard.can_delete(&store, "ghost", true, true).expect("decision");
        assert!(!missing.allowed);
        assert!(missing.reason.expect("reason").contains("not found"));
    }

    #[test]
    fn compliance_blocks_until_the_deadline_passes() {
        let (store, guard, clock) = setup();
        insert_backup(&store, "b-1");
        let locked = guard
            .make_immutable(&store, "b-1", 5, RetentionMode::Compliance, "audit")
            .expect("lock");
        assert_eq!(locked.retention_until, Some(start() + Duration::days(5)));

        let denied = guard.can_delete(&store, "b-1", true, true).expect("decision");
        assert!(!denied.allowed);
        assert!(denied.reason.expect("reason").contains("5 more day(s)"));

        clock.advance(Duration::days(5) + Duration::seconds(1));
        assert!(guard.can_delete(&store, "b-1", false, false).expect("decision").allowed);
    }

    #[test]
    fn legal_hold_ignores_admin_override() {
        let (store, guard, clock) = setup();
        insert_backup(&store, "b-1");
        let held = guard
            .make_immutable(&store, "b-1", 90, RetentionMode::LegalHold, "litigation 42")
            .expect("hold");
        assert!(held.retention_until.is_none());

        clock.advance(Duration::days(3650));
        let denied = guard.can_delete(&store, "b-1", true, true).expect("decision");
        assert!(!denied.allowed);
        assert!(denied.reason.expect("reason").contains("LEGAL_HOLD"));
    }

    #[test]
    fn governance_yields_only_to_admin_override() {
        let (store, guard, clock) = setup();
        insert_backup(&store, "b-1");
        guard
            .make_immutable(&store, "b-1", 10, RetentionMode::Governance, "policy")
            .expect("lock");

        let denied = guard.can_delete(&store, "b-1", false, false).expect("decision");
        assert!(!denied.allowed);
        assert!(denied.reason.expect("reason").contains("override"));
        assert!(!guard.can_delete(&store, "b-1", true, false).expect("decision").allowed);
        assert!(!guard.can_delete(&store, "b-1", false, true).expect("decision").allowed);

        let overridden = guard.can_delete(&store, "b-1", true, true).expect("decision");
        assert!(overridden.allowed);
        assert!(overridden.reason.is_some());

        clock.advance(Duration::days(10));
        let lapsed = guard.can_delete(&store, "b-1", false, false).expect("decision");
        assert_eq!(lapsed, DeleteDecision::allow());
    }

    #[test]
    fn second_lock_is_rejected() {
        let (store, guard, _) = setup();
        insert_backup(&store, "b-1");
        guard
            .make_immutable(&store, "b-1", 1, RetentionMode::Governance, "first")
            .expect("lock");
        assert!(matches!(
            guard.make_immutable(&store, "b-1", 1, RetentionMode::Compliance, "second"),
            Err(GuardError::AlreadyImmutable { .. })
        ));
        assert!(matches!(
            guard.make_immutable(&store, "nope", 1, RetentionMode::Compliance, "x"),
            Err(GuardError::NotFound { .. })
        ));
        assert!(matches!(
            guard.make_immutable(&store, "b-1", -1, RetentionMode::Compliance, "x"),
            Err(GuardError::InvalidRetentionDays { days: -1 })
        ));
    }

    #[test]
    fn oversized_retention_is_rejected_without_locking() {
        let (store, guard, _) = setup();
        insert_backup(&store, "b-1");
        for days in [200_000_000, i64::MAX, 3_000_000] {
            assert!(matches!(
                guard.make_immutable(&store, "b-1", days, RetentionMode::Compliance, "x"),
                Err(GuardError::InvalidRetentionDays { .. })
            ));
        }
        assert!(!store.backup("b-1").expect("load").expect("row").immutable);

        let locked = guard
            .make_immutable(&store, "b-1", 36_500, RetentionMode::Governance, "century")
            .expect("lock");
        assert_eq!(locked.retention_until, Some(start() + Duration::days(36_500)));
    }

    #[test]
    fn oversized_fallback_fails_the_lift_and_keeps_the_hold() {
        let store = LedgerStore::open_in_memory().expect("open db");
        let guard = ImmutabilityGuard::new(
            GuardConfig {
                legal_hold_fallback_days: i64::MAX,
            },
            Arc::new(FixedClock::new(start())),
        );
        insert_backup(&store, "b-1");
        guard
            .make_immutable(&store, "b-1", 0, RetentionMode::LegalHold, "case 9")
            .expect("hold");

        assert!(matches!(
            guard.remove_legal_hold(&store, "b-1"),
            Err(GuardError::InvalidRetentionDays { .. })
        ));
        let kept = store.backup("b-1").expect("load").expect("row");
        assert_eq!(kept.retention_mode, Some(RetentionMode::LegalHold));
    }

    #[test]
    fn immutable_row_without_mode_fails_closed() {
        let (store, guard, _) = setup();
        let mut backup = insert_backup(&store, "b-1");
        backup.immutable = true;
        store.update_protection(&backup).expect("update");
        assert!(!guard.can_delete(&store, "b-1", true, true).expect("decision").allowed);

        backup.retention_mode = Some(RetentionMode::Compliance);
        store.update_protection(&backup).expect("update");
        assert!(!guard.can_delete(&store, "b-1", true, true).expect("decision").allowed);
    }

    #[test]
    fn lifting_a_hold_starts_compliance_from_schedule_daily_count() {
        let (store, guard, clock) = setup();
        store
            .upsert_schedule(&BackupSchedule {
                id: "s-1".to_string(),
                name: "nightly".to_string(),
                source_type: SourceType::Vm,
                source_id: "vm-1".to_string(),
                mode: BackupMode::Full,
                retention: RetentionConfig {
                    daily: 7,
                    weekly: 0,
                    monthly: 0,
                    yearly: 0,
                },
                enabled: true,
            })
            .expect("schedule");
        let mut backup = insert_backup(&store, "b-1");
        backup.schedule_id = Some("s-1".to_string());
        store.upsert_backup(&backup).expect("update");
        guard
            .make_immutable(&store, "b-1", 0, RetentionMode::LegalHold, "case 7")
            .expect("hold");

        clock.advance(Duration::days(100));
        let lifted = guard.remove_legal_hold(&store, "b-1").expect("lift");
        assert_eq!(lifted.retention_mode, Some(RetentionMode::Compliance));
        assert_eq!(
            lifted.retention_until,
            Some(start() + Duration::days(100) + Duration::days(7))
        );
        assert!(lifted
            .immutability_reason
            .as_deref()
            .expect("reason")
            .contains("case 7"));

        assert!(!guard.can_delete(&store, "b-1", true, true).expect("decision").allowed);
        clock.advance(Duration::days(7));
        assert!(guard.can_delete(&store, "b-1", false, false).expect("decision").allowed);

        assert!(matches!(
            guard.remove_legal_hold(&store, "b-1"),
            Err(GuardError::NotUnderLegalHold { .. })
        ));
    }

    #[test]
    fn lifting_a_hold_without_schedule_uses_fallback_days() {
        let (store, guard, _) = setup();
        insert_backup(&store, "b-1");
        guard
            .make_immutable(&store, "b-1", 0, RetentionMode::LegalHold, "case 8")
            .expect("hold");
        let lifted = guard.remove_legal_hold(&store, "b-1").expect("lift");
        assert_eq!(
            lifted.retention_until,
            Some(start() + Duration::days(DEFAULT_LEGAL_HOLD_FALLBACK_DAYS))
        );
    }

    #[test]
    fn statistics_count_modes_and_lapsed_locks() {
        let (store, guard, clock) = setup();
        for id in ["g", "c", "h", "plain"] {
            insert_backup(&store, id);
        }
        guard
            .make_immutable(&store, "g", 1, RetentionMode::Governance, "g")
            .expect("lock");
        guard
            .make_immutable(&store, "c", 30, RetentionMode::Compliance, "c")
            .expect("lock");
        guard
            .make_immutable(&store, "h", 0, RetentionMode::LegalHold, "h")
            .expect("lock");

        clock.advance(Duration::days(2));
        let stats = guard.retention_statistics(&store).expect("stats");
        assert_eq!(
            stats,
            RetentionStatistics {
                governance: 1,
                compliance: 1,
                legal_hold: 1,
                total_immutable: 3,
                expired_but_immutable: 1,
            }
        );
    }

    #[test]
    fn partial_days_round_up() {
        assert_eq!(days_remaining(start(), start() + Duration::hours(1)), 1);
        assert_eq!(days_remaining(start(), start() + Duration::days(2)), 2);
        assert_eq!(days_remaining(start(), start()), 0);
    }
}
