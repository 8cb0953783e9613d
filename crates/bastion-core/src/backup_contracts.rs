use crate::{BackupMode, BackupStatus, BackupTag, EncryptionScheme, RetentionMode, SourceType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContractError {
    #[error("invalid retention config: {reason}")]
    InvalidRetentionConfig { reason: String },
    #[error("legal hold cannot carry a retention deadline (backup {backup_id})")]
    LegalHoldWithDeadline { backup_id: String },
}

/// One backup artifact as recorded in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub id: String,
    pub schedule_id: Option<String>,
    pub source_type: SourceType,
    pub source_id: String,
    pub mode: BackupMode,
    #[serde(default)]
    pub tag: BackupTag,

    pub chain_id: Option<String>,
    pub parent_backup_id: Option<String>,
    pub sequence_number: u32,

    pub original_size_bytes: u64,
    pub deduped_size_bytes: Option<u64>,
    pub compressed_size_bytes: Option<u64>,
    pub dedupe_ratio: f64,
    pub compression_ratio: f64,
    pub space_saved_bytes: u64,

    pub status: BackupStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,

    pub immutable: bool,
    pub retention_until: Option<DateTime<Utc>>,
    pub retention_mode: Option<RetentionMode>,
    pub immutability_reason: Option<String>,

    pub encryption_key_id: Option<String>,
    #[serde(default)]
    pub encryption_scheme: EncryptionScheme,
    pub storage_path: Option<String>,
}

impl BackupRecord {
    /// A fresh PENDING row, as the scheduler hands it to the engine.
    pub fn pending(
        source_type: SourceType,
        source_id: impl Into<String>,
        mode: BackupMode,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            schedule_id: None,
            source_type,
            source_id: source_id.into(),
            mode,
            tag: BackupTag::default(),
            chain_id: None,
            parent_backup_id: None,
            sequence_number: 0,
            original_size_bytes: 0,
            deduped_size_bytes: None,
            compressed_size_bytes: None,
            dedupe_ratio: 1.0,
            compression_ratio: 1.0,
            space_saved_bytes: 0,
            status: BackupStatus::Pending,
            created_at,
            completed_at: None,
            expires_at: None,
            immutable: false,
            retention_until: None,
            retention_mode: None,
            immutability_reason: None,
            encryption_key_id: None,
            encryption_scheme: EncryptionScheme::default(),
            storage_path: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status.is_completed()
    }

    /// Timestamp used for every "most recent" ordering: completion, falling
    /// back to creation for rows that never recorded one.
    pub fn effective_completed_at(&self) -> DateTime<Utc> {
        self.completed_at.unwrap_or(self.created_at)
    }

    pub fn check_protection_fields(&self) -> Result<(), ContractError> {
        if self.retention_mode == Some(RetentionMode::LegalHold) && self.retention_until.is_some() {
            return Err(ContractError::LegalHoldWithDeadline {
                backup_id: self.id.clone(),
            });
        }
        Ok(())
    }
}

/// Size facts reported by a byte producer when a backup finishes.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactFacts {
    pub original_size: u64,
    pub deduped_size: Option<u64>,
    pub compressed_size: Option<u64>,
}

/// GFS keep counts for a schedule.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetentionConfig {
    pub daily: u32,
    pub weekly: u32,
    pub monthly: u32,
    pub yearly: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            daily: 7,
            weekly: 4,
            monthly: 12,
            yearly: 1,
        }
    }
}

impl RetentionConfig {
    pub fn validate(&self) -> Result<(), ContractError> {
        if self.daily == 0 && self.weekly == 0 && self.monthly == 0 && self.yearly == 0 {
            return Err(ContractError::InvalidRetentionConfig {
                reason: "at least one of daily/weekly/monthly/yearly must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackupSchedule {
    pub id: String,
    pub name: String,
    pub source_type: SourceType,
    pub source_id: String,
    pub mode: BackupMode,
    pub retention: RetentionConfig,
    pub enabled: bool,
}

/// Outcome of a deletion check. A denial is a normal answer, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl DeleteDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn allow_with(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: Some(reason.into()),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }

    /// Combine two independent checks. The first denial wins; when both
    /// allow, the first reason given is kept.
    pub fn and(self, other: DeleteDecision) -> DeleteDecision {
        match (self.allowed, other.allowed) {
            (false, _) => self,
            (true, false) => other,
            (true, true) if self.reason.is_some() => self,
            (true, true) => other,
        }
    }
}
