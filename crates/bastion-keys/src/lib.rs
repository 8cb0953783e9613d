//! Envelope key management: per-scope DEKs wrapped by one externally
//! supplied KEK, with versioned rotation and passphrase-sealed exports.

use bastion_core::{
    scope_label, Clock, EncryptionKeyRecord, ExportedKey, KeyExportBundle, KeyType,
    KEY_BUNDLE_VERSION,
};
use bastion_storage::{LedgerStore, LedgerTxn, StorageError};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use zeroize::Zeroizing;

pub mod bundle;
pub mod envelope;

pub use bundle::{open_bundle, seal_bundle, BUNDLE_FORMAT_VERSION, BUNDLE_MAGIC, PBKDF2_ITERATIONS};
pub use envelope::{decrypt_with, encrypt_with, DataKey, KeyEncryptionKey, ALGORITHM, KEY_SIZE};

#[derive(Debug, Error)]
pub enum KeyManagementError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("master key (KEK) is not configured")]
    KekUnavailable,
    #[error("invalid master key: {reason}")]
    InvalidKek { reason: String },
    #[error("{key_type} keys require a reference id")]
    MissingReference { key_type: KeyType },
    #[error("{count} active keys for scope {scope}; refusing to choose one")]
    MultipleActiveKeys { scope: String, count: usize },
    #[error("scope {scope} already has an active key; rotate it instead")]
    ActiveKeyExists { scope: String },
    #[error("scope {scope} has no active key")]
    NoActiveKey { scope: String },
    #[error("key version {version} not found for scope {scope}")]
    KeyNotFound { scope: String, version: u32 },
    #[error("key {key_id} could not be unwrapped with the current master key")]
    UnwrapFailed { key_id: String },
    #[error("crypto error: {0}")]
    Crypto(String),
    #[error("export passphrase must not be empty")]
    InvalidPassphrase,
    #[error("invalid key bundle: {reason}")]
    BundleFormat { reason: String },
    #[error("key bundle could not be decrypted; wrong passphrase or corrupted file")]
    BundleDecrypt,
    #[error("imported key {scope} v{version} conflicts with a stored key")]
    ImportConflict { scope: String, version: u32 },
    #[error("serialization error: {0}")]
    Serialization(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationOutcome {
    pub retired: EncryptionKeyRecord,
    pub current: EncryptionKeyRecord,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub imported: usize,
    /// Keys already present with identical material (same-KEK restores only).
    pub already_present: usize,
}

pub struct EnvelopeKeyManager {
    kek: Option<KeyEncryptionKey>,
    clock: Arc<dyn Clock>,
}

impl EnvelopeKeyManager {
    pub fn new(kek: Option<KeyEncryptionKey>, clock: Arc<dyn Clock>) -> Self {
        Self { kek, clock }
    }

    pub fn has_kek(&self) -> bool {
        self.kek.is_some()
    }

    /// Creates the first key of a scope. Fails if the scope already has an
    /// active key.
    pub fn generate(
        &self,
        store: &mut LedgerStore,
        key_type: KeyType,
        reference_id: Option<&str>,
    ) -> Result<EncryptionKeyRecord, KeyManagementError> {
        check_scope(key_type, reference_id)?;
        let kek = self.kek()?;
        let txn = store.immediate_transaction()?;
        let active = txn.active_keys(key_type, reference_id)?;
        if !active.is_empty() {
            return Err(KeyManagementError::ActiveKeyExists {
                scope: scope_label(key_type, reference_id),
            });
        }
        let record = self.insert_new_version(&txn, kek, key_type, reference_id, "generate")?;
        txn.commit()?;
        Ok(record)
    }

    /// The single active key of a scope. Several active rows are corruption
    /// and surface as [`KeyManagementError::MultipleActiveKeys`].
    pub fn get_active(
        &self,
        store: &mut LedgerStore,
        key_type: KeyType,
        reference_id: Option<&str>,
        create_if_missing: bool,
    ) -> Result<Option<EncryptionKeyRecord>, KeyManagementError> {
        check_scope(key_type, reference_id)?;
        if !create_if_missing {
            let active = store.active_keys(key_type, reference_id)?;
            return single_active(key_type, reference_id, active);
        }

        let kek = self.kek()?;
        let txn = store.immediate_transaction()?;
        let active = txn.active_keys(key_type, reference_id)?;
        if let Some(existing) = single_active(key_type, reference_id, active)? {
            return Ok(Some(existing));
        }
        let record = self.insert_new_version(&txn, kek, key_type, reference_id, "generate")?;
        txn.commit()?;
        Ok(Some(record))
    }

    /// Retires the active key and activates version + 1 in one transaction.
    /// Retired rows stay in the ledger so older backups remain decryptable.
    pub fn rotate(
        &self,
        store: &mut LedgerStore,
        key_type: KeyType,
        reference_id: Option<&str>,
    ) -> Result<RotationOutcome, KeyManagementError> {
        check_scope(key_type, reference_id)?;
        let kek = self.kek()?;
        let now = self.clock.now();
        let txn = store.immediate_transaction()?;

        let active = txn.active_keys(key_type, reference_id)?;
        let Some(mut retired) = single_active(key_type, reference_id, active)? else {
            return Err(KeyManagementError::NoActiveKey {
                scope: scope_label(key_type, reference_id),
            });
        };
        txn.deactivate_key(&retired.id, now)?;
        retired.active = false;
        retired.rotated_at = Some(now);

        let current = self.insert_new_version(&txn, kek, key_type, reference_id, "rotate")?;
        txn.commit()?;

        info!(
            event = "key_rotated",
            scope = %scope_label(key_type, reference_id),
            retired_version = retired.key_version,
            current_version = current.key_version
        );
        Ok(RotationOutcome { retired, current })
    }

    pub fn key_by_version(
        &self,
        store: &LedgerStore,
        key_type: KeyType,
        reference_id: Option<&str>,
        key_version: u32,
    ) -> Result<EncryptionKeyRecord, KeyManagementError> {
        store
            .key_by_version(key_type, reference_id, key_version)?
            .ok_or_else(|| KeyManagementError::KeyNotFound {
                scope: scope_label(key_type, reference_id),
                version: key_version,
            })
    }

    /// Every version of a scope, oldest first.
    pub fn list_keys(
        &self,
        store: &LedgerStore,
        key_type: KeyType,
        reference_id: Option<&str>,
    ) -> Result<Vec<EncryptionKeyRecord>, KeyManagementError> {
        Ok(store.keys_for_scope(key_type, reference_id)?)
    }

    /// Unwraps a stored DEK with the KEK.
    pub fn decrypt_dek(&self, record: &EncryptionKeyRecord) -> Result<DataKey, KeyManagementError> {
        let kek = self.kek()?;
        let plaintext = envelope::open(kek.as_bytes(), &record.encrypted_key).ok_or_else(|| {
            KeyManagementError::UnwrapFailed {
                key_id: record.id.clone(),
            }
        })?;
        DataKey::from_slice(&plaintext)
    }

    /// Serializes every key (all versions) with its DEK unwrapped, then seals
    /// the document under a passphrase-derived key.
    ///
    /// Unwrapped key material lives only in zeroizing buffers inside this
    /// call. Callers that later open the returned bundle with
    /// [`open_bundle`] hold plaintext DEKs and must drop that buffer as soon
    /// as they are done with it. Any key that fails to unwrap aborts the
    /// export.
    pub fn export_for_disaster_recovery(
        &self,
        store: &LedgerStore,
        passphrase: &str,
    ) -> Result<Vec<u8>, KeyManagementError> {
        if passphrase.is_empty() {
            return Err(KeyManagementError::InvalidPassphrase);
        }
        let records = store.all_keys()?;
        let mut keys = Vec::with_capacity(records.len());
        let mut scopes = BTreeSet::new();
        for record in &records {
            let dek = self.decrypt_dek(record)?;
            scopes.insert(record.scope_label());
            keys.push(ExportedKey {
                key_type: record.key_type,
                reference_id: record.reference_id.clone(),
                key_version: record.key_version,
                algorithm: record.algorithm.clone(),
                active: record.active,
                created_at: record.created_at,
                rotated_at: record.rotated_at,
                decrypted_key_base64: dek.to_base64(),
                metadata: record.metadata.clone(),
            });
        }

        let mut metadata = BTreeMap::new();
        metadata.insert("scopeCount".to_string(), Value::from(scopes.len()));
        metadata.insert("algorithm".to_string(), Value::from(ALGORITHM));
        let document = KeyExportBundle {
            version: KEY_BUNDLE_VERSION,
            export_date: self.clock.now(),
            key_count: keys.len(),
            keys,
            metadata,
        };
        let json = Zeroizing::new(
            serde_json::to_vec(&document)
                .map_err(|err| KeyManagementError::Serialization(err.to_string()))?,
        );
        let sealed = seal_bundle(&json, passphrase)?;

        warn!(
            event = "keys_exported",
            key_count = document.key_count,
            scopes = scopes.len()
        );
        Ok(sealed)
    }

    /// Restores a sealed export inside one transaction; any bad record rolls
    /// the whole import back. DEKs are always wrapped with the current KEK.
    ///
    /// With `reencrypt_with_current_kek` the target is treated as a fresh
    /// environment and any (scope, version) already stored is a conflict.
    /// Without it the target is the environment the bundle came from: rows
    /// already stored must hold the same DEK and are left untouched, and
    /// only missing rows are inserted.
    pub fn import_from_backup(
        &self,
        store: &mut LedgerStore,
        sealed: &[u8],
        passphrase: &str,
        reencrypt_with_current_kek: bool,
    ) -> Result<ImportReport, KeyManagementError> {
        let kek = self.kek()?;
        let json = open_bundle(sealed, passphrase)?;
        let document: KeyExportBundle = serde_json::from_slice(&json).map_err(|err| {
            KeyManagementError::BundleFormat {
                reason: format!("bundle document: {err}"),
            }
        })?;
        if document.version != KEY_BUNDLE_VERSION {
            return Err(KeyManagementError::BundleFormat {
                reason: format!("unsupported bundle document version {}", document.version),
            });
        }
        if document.key_count != document.keys.len() {
            return Err(KeyManagementError::BundleFormat {
                reason: format!(
                    "keyCount {} does not match {} keys",
                    document.key_count,
                    document.keys.len()
                ),
            });
        }

        let txn = store.immediate_transaction()?;
        let mut report = ImportReport::default();
        let mut touched = BTreeMap::new();

        for exported in &document.keys {
            let reference_id = exported.reference_id.as_deref();
            check_scope(exported.key_type, reference_id)?;
            let scope = scope_label(exported.key_type, reference_id);
            let dek = DataKey::from_base64(&exported.decrypted_key_base64).map_err(|_| {
                KeyManagementError::BundleFormat {
                    reason: format!("key {scope} v{} is not a valid DEK", exported.key_version),
                }
            })?;

            if let Some(stored) =
                txn.key_by_version(exported.key_type, reference_id, exported.key_version)?
            {
                let matches = !reencrypt_with_current_kek && self.decrypt_dek(&stored)? == dek;
                if !matches {
                    return Err(KeyManagementError::ImportConflict {
                        scope,
                        version: exported.key_version,
                    });
                }
                report.already_present += 1;
                continue;
            }

            txn.insert_key(&EncryptionKeyRecord {
                id: uuid::Uuid::new_v4().to_string(),
                key_type: exported.key_type,
                reference_id: exported.reference_id.clone(),
                encrypted_key: envelope::seal(kek.as_bytes(), dek.as_bytes())?,
                key_version: exported.key_version,
                algorithm: exported.algorithm.clone(),
                active: exported.active,
                created_at: exported.created_at,
                rotated_at: exported.rotated_at,
                metadata: exported.metadata.clone(),
            })?;
            touched.insert(scope, (exported.key_type, exported.reference_id.clone()));
            report.imported += 1;
        }

        for (key_type, reference_id) in touched.values() {
            let active = txn.active_keys(*key_type, reference_id.as_deref())?;
            single_active(*key_type, reference_id.as_deref(), active)?;
        }
        txn.commit()?;

        info!(
            event = "keys_imported",
            imported = report.imported,
            already_present = report.already_present,
            reencrypted = reencrypt_with_current_kek
        );
        Ok(report)
    }

    fn kek(&self) -> Result<&KeyEncryptionKey, KeyManagementError> {
        self.kek.as_ref().ok_or(KeyManagementError::KekUnavailable)
    }

    fn insert_new_version(
        &self,
        txn: &LedgerTxn<'_>,
        kek: &KeyEncryptionKey,
        key_type: KeyType,
        reference_id: Option<&str>,
        origin: &str,
    ) -> Result<EncryptionKeyRecord, KeyManagementError> {
        let version = txn
            .max_key_version(key_type, reference_id)?
            .map_or(1, |latest| latest + 1);
        let dek = DataKey::generate();
        let mut metadata = BTreeMap::new();
        metadata.insert("origin".to_string(), Value::from(origin));

        let record = EncryptionKeyRecord {
            id: uuid::Uuid::new_v4().to_string(),
            key_type,
            reference_id: reference_id.map(str::to_string),
            encrypted_key: envelope::seal(kek.as_bytes(), dek.as_bytes())?,
            key_version: version,
            algorithm: ALGORITHM.to_string(),
            active: true,
            created_at: self.clock.now(),
            rotated_at: None,
            metadata,
        };
        txn.insert_key(&record)?;

        info!(
            event = "key_generated",
            scope = %record.scope_label(),
            version,
            origin
        );
        Ok(record)
    }
}

fn check_scope(key_type: KeyType, reference_id: Option<&str>) -> Result<(), KeyManagementError> {
    if key_type.requires_reference() && reference_id.map_or(true, str::is_empty) {
        return Err(KeyManagementError::MissingReference { key_type });
    }
    Ok(())
}

fn single_active(
    key_type: KeyType,
    reference_id: Option<&str>,
    mut active: Vec<EncryptionKeyRecord>,
) -> Result<Option<EncryptionKeyRecord>, KeyManagementError> {
    match active.len() {
        0 => Ok(None),
        1 => Ok(active.pop()),
        count => {
            let scope = scope_label(key_type, reference_id);
            error!(event = "multiple_active_keys", scope = %scope, count);
            Err(KeyManagementError::MultipleActiveKeys { scope, count })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_core::FixedClock;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    const TEST_KEK: [u8; KEY_SIZE] = [0x42; KEY_SIZE];

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 3, 12, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn manager_with(kek: [u8; KEY_SIZE]) -> (EnvelopeKeyManager, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(start()));
        let manager =
            EnvelopeKeyManager::new(Some(KeyEncryptionKey::from_bytes(kek)), clock.clone());
        (manager, clock)
    }

    #[test]
    fn generate_wraps_a_fresh_v1_key() {
        let mut store = LedgerStore::open_in_memory().expect("open db");
        let (manager, _) = manager_with(TEST_KEK);
        let record = manager
            .generate(&mut store, KeyType::Vm, Some("vm-1"))
            .expect("generate");
        assert_eq!(record.key_version, 1);
        assert!(record.active);
        assert_eq!(record.algorithm, ALGORITHM);
        assert_eq!(record.encrypted_key.len(), 12 + KEY_SIZE + 16);
        manager.decrypt_dek(&record).expect("unwrap");

        assert!(matches!(
            manager.generate(&mut store, KeyType::Vm, Some("vm-1")),
            Err(KeyManagementError::ActiveKeyExists { .. })
        ));
        assert!(matches!(
            manager.generate(&mut store, KeyType::Container, None),
            Err(KeyManagementError::MissingReference { .. })
        ));
    }

    #[test]
    fn missing_kek_is_a_hard_failure() {
        let mut store = LedgerStore::open_in_memory().expect("open db");
        let manager = EnvelopeKeyManager::new(None, Arc::new(FixedClock::new(start())));
        assert!(matches!(
            manager.generate(&mut store, KeyType::Global, None),
            Err(KeyManagementError::KekUnavailable)
        ));
        assert_eq!(store.key_count().expect("count"), 0);
    }

    #[test]
    fn get_active_creates_only_when_asked() {
        let mut store = LedgerStore::open_in_memory().expect("open db");
        let (manager, _) = manager_with(TEST_KEK);
        assert!(manager
            .get_active(&mut store, KeyType::Global, None, false)
            .expect("lookup")
            .is_none());
        let created = manager
            .get_active(&mut store, KeyType::Global, None, true)
            .expect("create")
            .expect("present");
        let again = manager
            .get_active(&mut store, KeyType::Global, None, true)
            .expect("lookup")
            .expect("present");
        assert_eq!(created.id, again.id);
        assert_eq!(store.key_count().expect("count"), 1);
    }

    #[test]
    fn two_active_rows_are_never_resolved() {
        let mut store = LedgerStore::open_in_memory().expect("open db");
        let (manager, _) = manager_with(TEST_KEK);
        let first = manager
            .generate(&mut store, KeyType::StorageBackend, Some("s3-eu"))
            .expect("generate");
        let mut second = first.clone();
        second.id = "injected".to_string();
        second.key_version = 2;
        store.insert_key(&second).expect("raw insert");

        for create in [false, true] {
            assert!(matches!(
                manager.get_active(&mut store, KeyType::StorageBackend, Some("s3-eu"), create),
                Err(KeyManagementError::MultipleActiveKeys { count: 2, .. })
            ));
        }
        assert!(matches!(
            manager.rotate(&mut store, KeyType::StorageBackend, Some("s3-eu")),
            Err(KeyManagementError::MultipleActiveKeys { .. })
        ));
    }

    #[test]
    fn rotation_keeps_old_versions_decryptable() {
        let mut store = LedgerStore::open_in_memory().expect("open db");
        let (manager, clock) = manager_with(TEST_KEK);
        let original = manager
            .generate(&mut store, KeyType::Vm, Some("vm-7"))
            .expect("generate");
        let old_dek = manager.decrypt_dek(&original).expect("unwrap");
        let payload = encrypt_with(&old_dek, b"disk image block").expect("encrypt");

        clock.advance(Duration::days(90));
        let outcome = manager
            .rotate(&mut store, KeyType::Vm, Some("vm-7"))
            .expect("rotate");
        assert!(!outcome.retired.active);
        assert_eq!(outcome.retired.rotated_at, Some(start() + Duration::days(90)));
        assert_eq!(outcome.current.key_version, original.key_version + 1);
        assert!(outcome.current.active);

        let stored_old = manager
            .key_by_version(&store, KeyType::Vm, Some("vm-7"), 1)
            .expect("lookup");
        assert!(!stored_old.active);
        assert!(stored_old.rotated_at.is_some());
        let reopened = manager.decrypt_dek(&stored_old).expect("unwrap old");
        assert_eq!(
            decrypt_with(&reopened, &payload).expect("decrypt"),
            b"disk image block"
        );
        let new_dek = manager.decrypt_dek(&outcome.current).expect("unwrap new");
        assert!(decrypt_with(&new_dek, &payload).is_err());

        assert_eq!(
            manager
                .list_keys(&store, KeyType::Vm, Some("vm-7"))
                .expect("list")
                .len(),
            2
        );
        assert!(matches!(
            manager.key_by_version(&store, KeyType::Vm, Some("vm-7"), 5),
            Err(KeyManagementError::KeyNotFound { version: 5, .. })
        ));
    }

    #[test]
    fn rotate_without_active_key_is_refused() {
        let mut store = LedgerStore::open_in_memory().expect("open db");
        let (manager, _) = manager_with(TEST_KEK);
        assert!(matches!(
            manager.rotate(&mut store, KeyType::Global, None),
            Err(KeyManagementError::NoActiveKey { .. })
        ));
    }

    #[test]
    fn wrong_kek_cannot_unwrap() {
        let mut store = LedgerStore::open_in_memory().expect("open db");
        let (manager, _) = manager_with(TEST_KEK);
        let record = manager
            .generate(&mut store, KeyType::Global, None)
            .expect("generate");
        let (other, _) = manager_with([0x07; KEY_SIZE]);
        assert!(matches!(
            other.decrypt_dek(&record),
            Err(KeyManagementError::UnwrapFailed { .. })
        ));
        assert!(matches!(
            other.export_for_disaster_recovery(&store, "pass"),
            Err(KeyManagementError::UnwrapFailed { .. })
        ));
    }

    fn seeded_keys(store: &mut LedgerStore, manager: &EnvelopeKeyManager) {
        manager
            .generate(store, KeyType::Global, None)
            .expect("generate global");
        manager
            .generate(store, KeyType::Vm, Some("vm-1"))
            .expect("generate vm");
        manager
            .rotate(store, KeyType::Vm, Some("vm-1"))
            .expect("rotate vm");
    }

    fn plaintext_by_scope(
        store: &LedgerStore,
        manager: &EnvelopeKeyManager,
    ) -> BTreeMap<(String, u32, bool), [u8; KEY_SIZE]> {
        store
            .all_keys()
            .expect("keys")
            .iter()
            .map(|record| {
                let dek = manager.decrypt_dek(record).expect("unwrap");
                (
                    (record.scope_label(), record.key_version, record.active),
                    *dek.as_bytes(),
                )
            })
            .collect()
    }

    #[test]
    fn export_then_import_into_new_environment_preserves_deks() {
        let mut source = LedgerStore::open_in_memory().expect("open source");
        let (exporter, _) = manager_with(TEST_KEK);
        seeded_keys(&mut source, &exporter);
        let bundle = exporter
            .export_for_disaster_recovery(&source, "dr passphrase")
            .expect("export");
        assert_eq!(&bundle[..8], BUNDLE_MAGIC);

        let mut target = LedgerStore::open_in_memory().expect("open target");
        let (importer, _) = manager_with([0x99; KEY_SIZE]);
        let report = importer
            .import_from_backup(&mut target, &bundle, "dr passphrase", true)
            .expect("import");
        assert_eq!(report.imported, 3);

        assert_eq!(
            plaintext_by_scope(&source, &exporter),
            plaintext_by_scope(&target, &importer)
        );
        let retired = importer
            .key_by_version(&target, KeyType::Vm, Some("vm-1"), 1)
            .expect("lookup");
        let original = exporter
            .key_by_version(&source, KeyType::Vm, Some("vm-1"), 1)
            .expect("lookup");
        assert_eq!(retired.rotated_at, original.rotated_at);
        assert_eq!(retired.created_at, original.created_at);
    }

    #[test]
    fn exported_document_uses_wire_field_names() {
        let mut store = LedgerStore::open_in_memory().expect("open db");
        let (manager, _) = manager_with(TEST_KEK);
        seeded_keys(&mut store, &manager);
        let bundle = manager
            .export_for_disaster_recovery(&store, "pw")
            .expect("export");
        let json = open_bundle(&bundle, "pw").expect("open");
        let value: Value = serde_json::from_slice(&json).expect("json");
        assert_eq!(value["version"], 1);
        assert_eq!(value["keyCount"], 3);
        assert!(value["exportDate"].is_string());
        assert!(value["keys"][0]["decryptedKeyBase64"].is_string());
        assert!(value["keys"][0].get("keyVersion").is_some());
    }

    #[test]
    fn import_is_all_or_nothing() {
        let mut source = LedgerStore::open_in_memory().expect("open source");
        let (manager, _) = manager_with(TEST_KEK);
        seeded_keys(&mut source, &manager);
        let bundle = manager
            .export_for_disaster_recovery(&source, "pw")
            .expect("export");

        let mut target = LedgerStore::open_in_memory().expect("open target");
        assert!(matches!(
            manager.import_from_backup(&mut target, &bundle, "wrong", true),
            Err(KeyManagementError::BundleDecrypt)
        ));
        assert_eq!(target.key_count().expect("count"), 0);

        // An active VM key already in place makes the bundle's active VM key a
        // second active row; nothing from the bundle may land.
        let mut scratch = LedgerStore::open_in_memory().expect("open scratch");
        let mut blocker = manager
            .generate(&mut scratch, KeyType::Vm, Some("vm-1"))
            .expect("generate");
        blocker.key_version = 9;
        let mut occupied = LedgerStore::open_in_memory().expect("open target");
        occupied.insert_key(&blocker).expect("insert blocker");
        assert!(matches!(
            manager.import_from_backup(&mut occupied, &bundle, "pw", true),
            Err(KeyManagementError::MultipleActiveKeys { count: 2, .. })
        ));
        assert_eq!(occupied.key_count().expect("count"), 1);
    }

    #[test]
    fn same_environment_import_skips_identical_rows() {
        let mut store = LedgerStore::open_in_memory().expect("open db");
        let (manager, _) = manager_with(TEST_KEK);
        seeded_keys(&mut store, &manager);
        let bundle = manager
            .export_for_disaster_recovery(&store, "pw")
            .expect("export");

        let report = manager
            .import_from_backup(&mut store, &bundle, "pw", false)
            .expect("merge");
        assert_eq!(
            report,
            ImportReport {
                imported: 0,
                already_present: 3,
            }
        );
        assert!(matches!(
            manager.import_from_backup(&mut store, &bundle, "pw", true),
            Err(KeyManagementError::ImportConflict { .. })
        ));
    }
}
