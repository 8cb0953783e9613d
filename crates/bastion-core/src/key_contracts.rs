use crate::KeyType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use zeroize::Zeroize;

pub const KEY_BUNDLE_VERSION: u32 = 1;

/// One versioned DEK row. `encrypted_key` is the DEK wrapped by the KEK.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKeyRecord {
    pub id: String,
    pub key_type: KeyType,
    pub reference_id: Option<String>,
    pub encrypted_key: Vec<u8>,
    pub key_version: u32,
    pub algorithm: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub rotated_at: Option<DateTime<Utc>>,
    pub metadata: BTreeMap<String, Value>,
}

impl EncryptionKeyRecord {
    pub fn scope_label(&self) -> String {
        scope_label(self.key_type, self.reference_id.as_deref())
    }
}

impl fmt::Debug for EncryptionKeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKeyRecord")
            .field("id", &self.id)
            .field("key_type", &self.key_type)
            .field("reference_id", &self.reference_id)
            .field("encrypted_key", &format_args!("[{} bytes]", self.encrypted_key.len()))
            .field("key_version", &self.key_version)
            .field("algorithm", &self.algorithm)
            .field("active", &self.active)
            .field("created_at", &self.created_at)
            .field("rotated_at", &self.rotated_at)
            .finish()
    }
}

pub fn scope_label(key_type: KeyType, reference_id: Option<&str>) -> String {
    match reference_id {
        Some(reference_id) => format!("{key_type}:{reference_id}"),
        None => key_type.to_string(),
    }
}

/// Plaintext disaster-recovery document. Holds decrypted DEKs; it only ever
/// exists in memory between serialization and bundle encryption.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeyExportBundle {
    pub version: u32,
    pub export_date: DateTime<Utc>,
    pub key_count: usize,
    pub keys: Vec<ExportedKey>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExportedKey {
    pub key_type: KeyType,
    pub reference_id: Option<String>,
    pub key_version: u32,
    pub algorithm: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub rotated_at: Option<DateTime<Utc>>,
    pub decrypted_key_base64: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl fmt::Debug for ExportedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportedKey")
            .field("key_type", &self.key_type)
            .field("reference_id", &self.reference_id)
            .field("key_version", &self.key_version)
            .field("active", &self.active)
            .field("decrypted_key_base64", &"[REDACTED]")
            .finish()
    }
}

impl Drop for ExportedKey {
    fn drop(&mut self) {
        self.decrypted_key_base64.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn exported() -> ExportedKey {
        ExportedKey {
            key_type: KeyType::Vm,
            reference_id: Some("vm-7".to_string()),
            key_version: 2,
            algorithm: "chacha20poly1305".to_string(),
            active: true,
            created_at: Utc
                .with_ymd_and_hms(2026, 2, 1, 0, 0, 0)
                .single()
                .expect("valid timestamp"),
            rotated_at: None,
            decrypted_key_base64: "c2VjcmV0".to_string(),
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn bundle_serializes_with_camel_case_field_names() {
        let bundle = KeyExportBundle {
            version: KEY_BUNDLE_VERSION,
            export_date: Utc
                .with_ymd_and_hms(2026, 2, 2, 0, 0, 0)
                .single()
                .expect("valid timestamp"),
            key_count: 1,
            keys: vec![exported()],
            metadata: BTreeMap::new(),
        };
        let value = serde_json::to_value(&bundle).expect("serialize");
        assert_eq!(value["version"], 1);
        assert_eq!(value["keyCount"], 1);
        assert!(value.get("exportDate").is_some());
        let key = &value["keys"][0];
        assert_eq!(key["keyType"], "VM");
        assert_eq!(key["referenceId"], "vm-7");
        assert_eq!(key["keyVersion"], 2);
        assert_eq!(key["decryptedKeyBase64"], "c2VjcmV0");
        assert!(key.get("rotatedAt").is_some());
    }

    #[test]
    fn debug_output_never_shows_key_material() {
        let rendered = format!("{:?}", exported());
        assert!(!rendered.contains("c2VjcmV0"));
        assert!(rendered.contains("REDACTED"));
    }

    #[test]
    fn scope_label_omits_missing_reference() {
        assert_eq!(scope_label(KeyType::Global, None), "GLOBAL");
        assert_eq!(scope_label(KeyType::Vm, Some("vm-1")), "VM:vm-1");
    }
}
