use bastion_chain::{ChainError, ChainManager};
use bastion_core::{BackupRecord, DeleteDecision};
use bastion_immutability::{GuardError, ImmutabilityGuard};
use bastion_retention::{RetentionEngine, RetentionError};
use bastion_storage::{LedgerStore, StorageError};
use serde::Serialize;
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod byte_storage;

pub use byte_storage::{ByteStorage, ByteStorageError, LocalDirStorage, StorageUsage};

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("retention error: {0}")]
    Retention(#[from] RetentionError),
    #[error("guard error: {0}")]
    Guard(#[from] GuardError),
    #[error("chain error: {0}")]
    Chain(#[from] ChainError),
    #[error("byte storage error: {0}")]
    ByteStorage(#[from] ByteStorageError),
    #[error("backup {backup_id} not found")]
    NotFound { backup_id: String },
    #[error("deletion of backup {backup_id} blocked: {reason}")]
    DeletionBlocked { backup_id: String, reason: String },
}

#[derive(Debug, Clone, Default)]
pub struct CleanupConfig {
    /// Overrides the retention engine's grace period when set.
    pub grace_period_hours: Option<i64>,
    pub max_deletions_per_sweep: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockedDeletion {
    pub backup_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub dry_run: bool,
    pub examined: usize,
    /// Deleted, or in a dry run the ones that would be.
    pub deleted: Vec<String>,
    pub blocked: Vec<BlockedDeletion>,
    /// Ledger rows whose artifact was already gone from byte storage.
    pub missing_artifacts: Vec<String>,
    pub bytes_reclaimed: u64,
}

/// Physically removes expired backups that every guard agrees on.
pub struct CleanupSweeper<'a> {
    config: CleanupConfig,
    retention: &'a RetentionEngine,
    guard: &'a ImmutabilityGuard,
    chains: &'a ChainManager,
    storage: &'a dyn ByteStorage,
}

impl<'a> CleanupSweeper<'a> {
    pub fn new(
        config: CleanupConfig,
        retention: &'a RetentionEngine,
        guard: &'a ImmutabilityGuard,
        chains: &'a ChainManager,
        storage: &'a dyn ByteStorage,
    ) -> Self {
        Self {
            config,
            retention,
            guard,
            chains,
            storage,
        }
    }

    /// Walks backups past their grace period, newest chain members first so a
    /// parent can go in the same sweep as its expired children.
    pub fn sweep(
        &self,
        store: &mut LedgerStore,
        dry_run: bool,
    ) -> Result<CleanupReport, CleanupError> {
        let mut expired = self
            .retention
            .get_expired_backups(store, self.config.grace_period_hours)?;
        expired.sort_by(|left, right| {
            right
                .sequence_number
                .cmp(&left.sequence_number)
                .then_with(|| left.expires_at.cmp(&right.expires_at))
                .then_with(|| left.id.cmp(&right.id))
        });

        let mut report = CleanupReport {
            dry_run,
            examined: expired.len(),
            ..CleanupReport::default()
        };
        let mut planned = BTreeSet::new();

        for backup in &expired {
            if self
                .config
                .max_deletions_per_sweep
                .is_some_and(|limit| report.deleted.len() >= limit)
            {
                debug!(event = "cleanup_limit_reached", deleted = report.deleted.len());
                break;
            }

            let decision = self.check(store, backup, false, false, &planned)?;
            if !decision.allowed {
                let reason = decision.reason.unwrap_or_default();
                debug!(event = "cleanup_blocked", backup_id = %backup.id, reason = %reason);
                report.blocked.push(BlockedDeletion {
                    backup_id: backup.id.clone(),
                    reason,
                });
                continue;
            }

            if dry_run {
                planned.insert(backup.id.clone());
            } else {
                match self.destroy(store, backup) {
                    Ok(artifact_found) => {
                        if !artifact_found && backup.storage_path.is_some() {
                            report.missing_artifacts.push(backup.id.clone());
                        }
                    }
                    Err(CleanupError::Storage(StorageError::DeletionRejected {
                        reason, ..
                    })) => {
                        warn!(
                            event = "cleanup_vetoed_by_ledger",
                            backup_id = %backup.id,
                            reason = %reason
                        );
                        report.blocked.push(BlockedDeletion {
                            backup_id: backup.id.clone(),
                            reason,
                        });
                        continue;
                    }
                    Err(err) => return Err(err),
                }
            }
            report.bytes_reclaimed += stored_size(backup);
            report.deleted.push(backup.id.clone());
        }

        info!(
            event = "cleanup_sweep",
            dry_run,
            examined = report.examined,
            deleted = report.deleted.len(),
            blocked = report.blocked.len(),
            bytes_reclaimed = report.bytes_reclaimed
        );
        Ok(report)
    }

    /// Operator-initiated deletion of one backup, expired or not. Denials
    /// come back as [`CleanupError::DeletionBlocked`].
    pub fn delete_backup(
        &self,
        store: &mut LedgerStore,
        backup_id: &str,
        is_admin: bool,
        override_governance: bool,
    ) -> Result<DeleteDecision, CleanupError> {
        let backup = store
            .backup(backup_id)?
            .ok_or_else(|| CleanupError::NotFound {
                backup_id: backup_id.to_string(),
            })?;
        let decision = self.check(
            store,
            &backup,
            is_admin,
            override_governance,
            &BTreeSet::new(),
        )?;
        if !decision.allowed {
            return Err(CleanupError::DeletionBlocked {
                backup_id: backup.id,
                reason: decision.reason.unwrap_or_default(),
            });
        }
        self.destroy(store, &backup)?;
        info!(
            event = "backup_deleted",
            backup_id = %backup.id,
            admin = is_admin,
            override_governance
        );
        Ok(decision)
    }

    /// Immutability first, then chain dependencies. Dependents already
    /// planned for deletion in a dry run do not count.
    fn check(
        &self,
        store: &LedgerStore,
        backup: &BackupRecord,
        is_admin: bool,
        override_governance: bool,
        planned: &BTreeSet<String>,
    ) -> Result<DeleteDecision, CleanupError> {
        let immutability = self
            .guard
            .can_delete(store, &backup.id, is_admin, override_governance)?;
        if !immutability.allowed {
            return Ok(immutability);
        }

        let dependency = if planned.is_empty() {
            self.chains.can_delete(store, &backup.id)?
        } else {
            let remaining = self
                .chains
                .dependents(store, &backup.id)?
                .into_iter()
                .filter(|child| !planned.contains(&child.id))
                .count();
            if remaining == 0 {
                DeleteDecision::allow()
            } else {
                DeleteDecision::deny(format!("{remaining} dependent backup(s) exist"))
            }
        };
        Ok(immutability.and(dependency))
    }

    /// Ledger row first so the storage triggers get the last word; the
    /// artifact delete happens before commit and a failure rolls the row back.
    fn destroy(&self, store: &mut LedgerStore, backup: &BackupRecord) -> Result<bool, CleanupError> {
        let txn = store.immediate_transaction()?;
        if !txn.delete_backup(&backup.id)? {
            return Err(CleanupError::NotFound {
                backup_id: backup.id.clone(),
            });
        }
        let artifact_found = match backup.storage_path.as_deref() {
            Some(path) => self.storage.delete(path)?,
            None => false,
        };
        txn.commit()?;
        Ok(artifact_found)
    }
}

fn stored_size(backup: &BackupRecord) -> u64 {
    backup
        .compressed_size_bytes
        .unwrap_or(backup.original_size_bytes)
}
