use bastion_core::{
    BackupRecord, BackupSchedule, EncryptionKeyRecord, KeyType, RetentionConfig, RetentionMode,
    SourceType,
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{
    params, Connection, ErrorCode, OptionalExtension, Params, Row, Transaction,
    TransactionBehavior,
};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

pub const LEDGER_SCHEMA_VERSION: i64 = 2;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("ledger rejected deletion of backup {backup_id}: {reason}")]
    DeletionRejected { backup_id: String, reason: String },
}

const BACKUP_COLUMNS: &str = "
    id, schedule_id, source_type, source_id, mode, tag,
    chain_id, parent_backup_id, sequence_number,
    original_size_bytes, deduped_size_bytes, compressed_size_bytes,
    dedupe_ratio, compression_ratio, space_saved_bytes,
    status, created_at, completed_at, expires_at,
    immutable, retention_until, retention_mode, immutability_reason,
    encryption_key_id, encryption_scheme, storage_path
";

const KEY_COLUMNS: &str = "
    id, key_type, reference_id, encrypted_key, key_version, algorithm,
    active, created_at, rotated_at, metadata_json
";

/// Durable record of backups, schedules and encryption keys.
pub struct LedgerStore {
    conn: Connection,
}

impl LedgerStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let mut current = self.schema_version()?;
        if current > LEDGER_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: LEDGER_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_ledger_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
            current = 1;
        }

        if current < 2 {
            let sql = include_str!("../migrations/0002_deletion_guards.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 2", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    /// Opens a write transaction that takes the database write lock up front,
    /// so a check-then-insert inside it cannot interleave with another writer.
    pub fn immediate_transaction(&mut self) -> Result<LedgerTxn<'_>, StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        Ok(LedgerTxn { tx })
    }

    pub fn upsert_schedule(&self, schedule: &BackupSchedule) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO backup_schedules (
                id,
                name,
                source_type,
                source_id,
                mode,
                retention_daily,
                retention_weekly,
                retention_monthly,
                retention_yearly,
                enabled
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(id) DO UPDATE SET
                name=excluded.name,
                source_type=excluded.source_type,
                source_id=excluded.source_id,
                mode=excluded.mode,
                retention_daily=excluded.retention_daily,
                retention_weekly=excluded.retention_weekly,
                retention_monthly=excluded.retention_monthly,
                retention_yearly=excluded.retention_yearly,
                enabled=excluded.enabled
            ",
            params![
                schedule.id,
                schedule.name,
                schedule.source_type.as_str(),
                schedule.source_id,
                schedule.mode.as_str(),
                i64::from(schedule.retention.daily),
                i64::from(schedule.retention.weekly),
                i64::from(schedule.retention.monthly),
                i64::from(schedule.retention.yearly),
                schedule.enabled,
            ],
        )?;
        Ok(())
    }

    pub fn schedule(&self, schedule_id: &str) -> Result<Option<BackupSchedule>, StorageError> {
        let schedule = self
            .conn
            .query_row(
                "
                SELECT id, name, source_type, source_id, mode,
                       retention_daily, retention_weekly, retention_monthly, retention_yearly,
                       enabled
                FROM backup_schedules
                WHERE id = ?1
                ",
                [schedule_id],
                |row| {
                    Ok(BackupSchedule {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        source_type: enum_column(row, 2)?,
                        source_id: row.get(3)?,
                        mode: enum_column(row, 4)?,
                        retention: RetentionConfig {
                            daily: count_column(row, 5)?,
                            weekly: count_column(row, 6)?,
                            monthly: count_column(row, 7)?,
                            yearly: count_column(row, 8)?,
                        },
                        enabled: row.get(9)?,
                    })
                },
            )
            .optional()?;
        Ok(schedule)
    }

    pub fn upsert_backup(&self, backup: &BackupRecord) -> Result<(), StorageError> {
        self.conn.execute(
            &format!(
                "
                INSERT INTO backups ({BACKUP_COLUMNS})
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                        ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26)
                ON CONFLICT(id) DO UPDATE SET
                    schedule_id=excluded.schedule_id,
                    source_type=excluded.source_type,
                    source_id=excluded.source_id,
                    mode=excluded.mode,
                    tag=excluded.tag,
                    chain_id=excluded.chain_id,
                    parent_backup_id=excluded.parent_backup_id,
                    sequence_number=excluded.sequence_number,
                    original_size_bytes=excluded.original_size_bytes,
                    deduped_size_bytes=excluded.deduped_size_bytes,
                    compressed_size_bytes=excluded.compressed_size_bytes,
                    dedupe_ratio=excluded.dedupe_ratio,
                    compression_ratio=excluded.compression_ratio,
                    space_saved_bytes=excluded.space_saved_bytes,
                    status=excluded.status,
                    created_at=excluded.created_at,
                    completed_at=excluded.completed_at,
                    expires_at=excluded.expires_at,
                    immutable=excluded.immutable,
                    retention_until=excluded.retention_until,
                    retention_mode=excluded.retention_mode,
                    immutability_reason=excluded.immutability_reason,
                    encryption_key_id=excluded.encryption_key_id,
                    encryption_scheme=excluded.encryption_scheme,
                    storage_path=excluded.storage_path
                "
            ),
            params![
                backup.id,
                backup.schedule_id,
                backup.source_type.as_str(),
                backup.source_id,
                backup.mode.as_str(),
                backup.tag.as_str(),
                backup.chain_id,
                backup.parent_backup_id,
                i64::from(backup.sequence_number),
                backup.original_size_bytes as i64,
                backup.deduped_size_bytes.map(|value| value as i64),
                backup.compressed_size_bytes.map(|value| value as i64),
                backup.dedupe_ratio,
                backup.compression_ratio,
                backup.space_saved_bytes as i64,
                backup.status.as_str(),
                format_timestamp(backup.created_at),
                backup.completed_at.map(format_timestamp),
                backup.expires_at.map(format_timestamp),
                backup.immutable,
                backup.retention_until.map(format_timestamp),
                backup.retention_mode.map(|mode| mode.as_str()),
                backup.immutability_reason,
                backup.encryption_key_id,
                backup.encryption_scheme.as_str(),
                backup.storage_path,
            ],
        )?;
        Ok(())
    }

    pub fn backup(&self, backup_id: &str) -> Result<Option<BackupRecord>, StorageError> {
        let backup = self
            .conn
            .query_row(
                &format!("SELECT {BACKUP_COLUMNS} FROM backups WHERE id = ?1"),
                [backup_id],
                backup_from_row,
            )
            .optional()?;
        Ok(backup)
    }

    /// Physically removes a ledger row. The schema triggers veto rows that are
    /// still under WORM retention or still have dependents.
    pub fn delete_backup(&self, backup_id: &str) -> Result<bool, StorageError> {
        delete_backup_on(&self.conn, backup_id)
    }

    /// Most recent COMPLETED backup for a source, ignoring `excluding_id`.
    pub fn latest_completed_for_source(
        &self,
        source_type: SourceType,
        source_id: &str,
        excluding_id: &str,
    ) -> Result<Option<BackupRecord>, StorageError> {
        let backup = self
            .conn
            .query_row(
                &format!(
                    "
                    SELECT {BACKUP_COLUMNS}
                    FROM backups
                    WHERE source_type = ?1 AND source_id = ?2 AND status = 'COMPLETED' AND id != ?3
                    ORDER BY COALESCE(completed_at, created_at) DESC, sequence_number DESC
                    LIMIT 1
                    "
                ),
                params![source_type.as_str(), source_id, excluding_id],
                backup_from_row,
            )
            .optional()?;
        Ok(backup)
    }

    /// Every member of a chain regardless of status, by sequence number.
    pub fn chain_members(&self, chain_id: &str) -> Result<Vec<BackupRecord>, StorageError> {
        query_backups(
            &self.conn,
            &format!(
                "
                SELECT {BACKUP_COLUMNS}
                FROM backups
                WHERE chain_id = ?1
                ORDER BY sequence_number ASC, created_at ASC
                "
            ),
            [chain_id],
        )
    }

    pub fn children_of(&self, backup_id: &str) -> Result<Vec<BackupRecord>, StorageError> {
        query_backups(
            &self.conn,
            &format!(
                "
                SELECT {BACKUP_COLUMNS}
                FROM backups
                WHERE parent_backup_id = ?1
                ORDER BY sequence_number ASC
                "
            ),
            [backup_id],
        )
    }

    pub fn completed_backups(&self) -> Result<Vec<BackupRecord>, StorageError> {
        query_backups(
            &self.conn,
            &format!(
                "
                SELECT {BACKUP_COLUMNS}
                FROM backups
                WHERE status = 'COMPLETED'
                ORDER BY chain_id ASC, sequence_number ASC
                "
            ),
            [],
        )
    }

    pub fn completed_backups_for_schedule(
        &self,
        schedule_id: &str,
    ) -> Result<Vec<BackupRecord>, StorageError> {
        completed_for_schedule_on(&self.conn, schedule_id)
    }

    /// Backups whose parent pointer names a row that no longer exists.
    pub fn orphaned_backups(&self) -> Result<Vec<BackupRecord>, StorageError> {
        query_backups(
            &self.conn,
            &format!(
                "
                SELECT {BACKUP_COLUMNS}
                FROM backups
                WHERE parent_backup_id IS NOT NULL
                  AND parent_backup_id NOT IN (SELECT id FROM backups)
                ORDER BY chain_id ASC, sequence_number ASC
                "
            ),
            [],
        )
    }

    pub fn clear_expiry(&self, backup_id: &str) -> Result<bool, StorageError> {
        let changes = self.conn.execute(
            "UPDATE backups SET expires_at = NULL WHERE id = ?1 AND expires_at IS NOT NULL",
            [backup_id],
        )?;
        Ok(changes > 0)
    }

    /// COMPLETED backups marked expired at or before `cutoff`.
    pub fn expired_backups(&self, cutoff: DateTime<Utc>) -> Result<Vec<BackupRecord>, StorageError> {
        query_backups(
            &self.conn,
            &format!(
                "
                SELECT {BACKUP_COLUMNS}
                FROM backups
                WHERE status = 'COMPLETED'
                  AND expires_at IS NOT NULL
                  AND expires_at <= ?1
                ORDER BY expires_at ASC, sequence_number DESC
                "
            ),
            [format_timestamp(cutoff)],
        )
    }

    pub fn update_protection(&self, backup: &BackupRecord) -> Result<bool, StorageError> {
        let changes = self.conn.execute(
            "
            UPDATE backups SET
                immutable = ?2,
                retention_until = ?3,
                retention_mode = ?4,
                immutability_reason = ?5
            WHERE id = ?1
            ",
            params![
                backup.id,
                backup.immutable,
                backup.retention_until.map(format_timestamp),
                backup.retention_mode.map(|mode| mode.as_str()),
                backup.immutability_reason,
            ],
        )?;
        Ok(changes > 0)
    }

    pub fn immutable_backups(&self) -> Result<Vec<BackupRecord>, StorageError> {
        query_backups(
            &self.conn,
            &format!(
                "
                SELECT {BACKUP_COLUMNS}
                FROM backups
                WHERE immutable = 1
                ORDER BY created_at ASC
                "
            ),
            [],
        )
    }

    pub fn active_keys(
        &self,
        key_type: KeyType,
        reference_id: Option<&str>,
    ) -> Result<Vec<EncryptionKeyRecord>, StorageError> {
        active_keys_on(&self.conn, key_type, reference_id)
    }

    pub fn keys_for_scope(
        &self,
        key_type: KeyType,
        reference_id: Option<&str>,
    ) -> Result<Vec<EncryptionKeyRecord>, StorageError> {
        query_keys(
            &self.conn,
            &format!(
                "
                SELECT {KEY_COLUMNS}
                FROM encryption_keys
                WHERE key_type = ?1 AND reference_id IS ?2
                ORDER BY key_version ASC
                "
            ),
            params![key_type.as_str(), reference_id],
        )
    }

    pub fn key_by_version(
        &self,
        key_type: KeyType,
        reference_id: Option<&str>,
        key_version: u32,
    ) -> Result<Option<EncryptionKeyRecord>, StorageError> {
        key_by_version_on(&self.conn, key_type, reference_id, key_version)
    }

    pub fn key(&self, key_id: &str) -> Result<Option<EncryptionKeyRecord>, StorageError> {
        let key = self
            .conn
            .query_row(
                &format!("SELECT {KEY_COLUMNS} FROM encryption_keys WHERE id = ?1"),
                [key_id],
                key_from_row,
            )
            .optional()?;
        Ok(key)
    }

    pub fn all_keys(&self) -> Result<Vec<EncryptionKeyRecord>, StorageError> {
        query_keys(
            &self.conn,
            &format!(
                "
                SELECT {KEY_COLUMNS}
                FROM encryption_keys
                ORDER BY key_type ASC, reference_id ASC, key_version ASC
                "
            ),
            [],
        )
    }

    /// Raw insert outside any scope lock; the key manager goes through
    /// [`LedgerTxn::insert_key`] instead.
    pub fn insert_key(&self, key: &EncryptionKeyRecord) -> Result<(), StorageError> {
        insert_key_on(&self.conn, key)
    }

    pub fn key_count(&self) -> Result<i64, StorageError> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM encryption_keys", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }
}

/// Write transaction over the ledger. Dropping it without [`LedgerTxn::commit`]
/// rolls everything back.
pub struct LedgerTxn<'a> {
    tx: Transaction<'a>,
}

impl LedgerTxn<'_> {
    pub fn commit(self) -> Result<(), StorageError> {
        self.tx.commit()?;
        Ok(())
    }

    /// Sets `expires_at` on rows not already marked. Returns rows changed.
    pub fn mark_expired(
        &self,
        backup_ids: &[String],
        at: DateTime<Utc>,
    ) -> Result<usize, StorageError> {
        let mut statement = self.tx.prepare(
            "UPDATE backups SET expires_at = ?2 WHERE id = ?1 AND expires_at IS NULL",
        )?;
        let at = format_timestamp(at);
        let mut changed = 0;
        for backup_id in backup_ids {
            changed += statement.execute(params![backup_id, at])?;
        }
        Ok(changed)
    }

    pub fn completed_backups_for_schedule(
        &self,
        schedule_id: &str,
    ) -> Result<Vec<BackupRecord>, StorageError> {
        completed_for_schedule_on(&self.tx, schedule_id)
    }

    /// Same veto rules as [`LedgerStore::delete_backup`], undone on rollback.
    pub fn delete_backup(&self, backup_id: &str) -> Result<bool, StorageError> {
        delete_backup_on(&self.tx, backup_id)
    }

    pub fn active_keys(
        &self,
        key_type: KeyType,
        reference_id: Option<&str>,
    ) -> Result<Vec<EncryptionKeyRecord>, StorageError> {
        active_keys_on(&self.tx, key_type, reference_id)
    }

    pub fn max_key_version(
        &self,
        key_type: KeyType,
        reference_id: Option<&str>,
    ) -> Result<Option<u32>, StorageError> {
        let version: Option<i64> = self.tx.query_row(
            "
            SELECT MAX(key_version)
            FROM encryption_keys
            WHERE key_type = ?1 AND reference_id IS ?2
            ",
            params![key_type.as_str(), reference_id],
            |row| row.get(0),
        )?;
        Ok(version.map(|value| value as u32))
    }

    pub fn key_by_version(
        &self,
        key_type: KeyType,
        reference_id: Option<&str>,
        key_version: u32,
    ) -> Result<Option<EncryptionKeyRecord>, StorageError> {
        key_by_version_on(&self.tx, key_type, reference_id, key_version)
    }

    pub fn insert_key(&self, key: &EncryptionKeyRecord) -> Result<(), StorageError> {
        insert_key_on(&self.tx, key)
    }

    pub fn deactivate_key(
        &self,
        key_id: &str,
        rotated_at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let changes = self.tx.execute(
            "
            UPDATE encryption_keys
            SET active = 0, rotated_at = ?2
            WHERE id = ?1 AND active = 1
            ",
            params![key_id, format_timestamp(rotated_at)],
        )?;
        Ok(changes > 0)
    }
}

fn delete_backup_on(conn: &Connection, backup_id: &str) -> Result<bool, StorageError> {
    match conn.execute("DELETE FROM backups WHERE id = ?1", [backup_id]) {
        Ok(changes) => Ok(changes > 0),
        Err(rusqlite::Error::SqliteFailure(failure, message))
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            Err(StorageError::DeletionRejected {
                backup_id: backup_id.to_string(),
                reason: message.unwrap_or_else(|| "constraint violation".to_string()),
            })
        }
        Err(err) => Err(err.into()),
    }
}

fn completed_for_schedule_on(
    conn: &Connection,
    schedule_id: &str,
) -> Result<Vec<BackupRecord>, StorageError> {
    query_backups(
        conn,
        &format!(
            "
            SELECT {BACKUP_COLUMNS}
            FROM backups
            WHERE schedule_id = ?1 AND status = 'COMPLETED'
            ORDER BY COALESCE(completed_at, created_at) ASC, id ASC
            "
        ),
        [schedule_id],
    )
}

fn active_keys_on(
    conn: &Connection,
    key_type: KeyType,
    reference_id: Option<&str>,
) -> Result<Vec<EncryptionKeyRecord>, StorageError> {
    query_keys(
        conn,
        &format!(
            "
            SELECT {KEY_COLUMNS}
            FROM encryption_keys
            WHERE key_type = ?1 AND reference_id IS ?2 AND active = 1
            ORDER BY key_version ASC
            "
        ),
        params![key_type.as_str(), reference_id],
    )
}

fn key_by_version_on(
    conn: &Connection,
    key_type: KeyType,
    reference_id: Option<&str>,
    key_version: u32,
) -> Result<Option<EncryptionKeyRecord>, StorageError> {
    let key = conn
        .query_row(
            &format!(
                "
                SELECT {KEY_COLUMNS}
                FROM encryption_keys
                WHERE key_type = ?1 AND reference_id IS ?2 AND key_version = ?3
                "
            ),
            params![key_type.as_str(), reference_id, i64::from(key_version)],
            key_from_row,
        )
        .optional()?;
    Ok(key)
}

fn insert_key_on(conn: &Connection, key: &EncryptionKeyRecord) -> Result<(), StorageError> {
    let metadata_json = serde_json::to_string(&key.metadata)
        .map_err(|err| StorageError::Serialization(err.to_string()))?;
    conn.execute(
        &format!(
            "
            INSERT INTO encryption_keys ({KEY_COLUMNS})
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "
        ),
        params![
            key.id,
            key.key_type.as_str(),
            key.reference_id,
            key.encrypted_key,
            i64::from(key.key_version),
            key.algorithm,
            key.active,
            format_timestamp(key.created_at),
            key.rotated_at.map(format_timestamp),
            metadata_json,
        ],
    )?;
    Ok(())
}

fn query_backups<P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<BackupRecord>, StorageError> {
    let mut statement = conn.prepare(sql)?;
    let rows = statement.query_map(params, backup_from_row)?;
    let mut backups = Vec::new();
    for row in rows {
        backups.push(row?);
    }
    Ok(backups)
}

fn query_keys<P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<EncryptionKeyRecord>, StorageError> {
    let mut statement = conn.prepare(sql)?;
    let rows = statement.query_map(params, key_from_row)?;
    let mut keys = Vec::new();
    for row in rows {
        keys.push(row?);
    }
    Ok(keys)
}

fn backup_from_row(row: &Row<'_>) -> rusqlite::Result<BackupRecord> {
    Ok(BackupRecord {
        id: row.get(0)?,
        schedule_id: row.get(1)?,
        source_type: enum_column(row, 2)?,
        source_id: row.get(3)?,
        mode: enum_column(row, 4)?,
        tag: enum_column(row, 5)?,
        chain_id: row.get(6)?,
        parent_backup_id: row.get(7)?,
        sequence_number: count_column(row, 8)?,
        original_size_bytes: row.get::<_, i64>(9)? as u64,
        deduped_size_bytes: row.get::<_, Option<i64>>(10)?.map(|value| value as u64),
        compressed_size_bytes: row.get::<_, Option<i64>>(11)?.map(|value| value as u64),
        dedupe_ratio: row.get(12)?,
        compression_ratio: row.get(13)?,
        space_saved_bytes: row.get::<_, i64>(14)? as u64,
        status: enum_column(row, 15)?,
        created_at: timestamp_column(row, 16)?,
        completed_at: optional_timestamp_column(row, 17)?,
        expires_at: optional_timestamp_column(row, 18)?,
        immutable: row.get::<_, i64>(19)? != 0,
        retention_until: optional_timestamp_column(row, 20)?,
        retention_mode: row
            .get::<_, Option<String>>(21)?
            .map(|value| {
                value
                    .parse::<RetentionMode>()
                    .map_err(|err| invalid_column(21, err))
            })
            .transpose()?,
        immutability_reason: row.get(22)?,
        encryption_key_id: row.get(23)?,
        encryption_scheme: enum_column(row, 24)?,
        storage_path: row.get(25)?,
    })
}

fn key_from_row(row: &Row<'_>) -> rusqlite::Result<EncryptionKeyRecord> {
    let metadata_json: String = row.get(9)?;
    let metadata = serde_json::from_str(&metadata_json).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(9, Type::Text, Box::new(err))
    })?;

    Ok(EncryptionKeyRecord {
        id: row.get(0)?,
        key_type: enum_column(row, 1)?,
        reference_id: row.get(2)?,
        encrypted_key: row.get(3)?,
        key_version: count_column(row, 4)?,
        algorithm: row.get(5)?,
        active: row.get::<_, i64>(6)? != 0,
        created_at: timestamp_column(row, 7)?,
        rotated_at: optional_timestamp_column(row, 8)?,
        metadata,
    })
}

fn enum_column<T>(row: &Row<'_>, index: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.get(index)?;
    raw.parse().map_err(|err| invalid_column(index, err))
}

fn count_column(row: &Row<'_>, index: usize) -> rusqlite::Result<u32> {
    let value: i64 = row.get(index)?;
    u32::try_from(value).map_err(|_| invalid_column(index, format!("count out of range: {value}")))
}

fn timestamp_column(row: &Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(index)?;
    parse_timestamp(&raw)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(err)))
}

fn optional_timestamp_column(
    row: &Row<'_>,
    index: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(index)?
        .map(|raw| {
            parse_timestamp(&raw).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(err))
            })
        })
        .transpose()
}

fn invalid_column(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

/// Fixed-width UTC form so lexicographic order in SQL matches time order.
pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}
