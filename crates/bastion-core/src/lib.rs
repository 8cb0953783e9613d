use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod backup_contracts;
pub mod clock;
pub mod key_contracts;

pub use backup_contracts::{
    ArtifactFacts, BackupRecord, BackupSchedule, ContractError, DeleteDecision, RetentionConfig,
};
pub use clock::{Clock, FixedClock, SystemClock};
pub use key_contracts::{
    scope_label, EncryptionKeyRecord, ExportedKey, KeyExportBundle, KEY_BUNDLE_VERSION,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupMode {
    Full,
    Incremental,
}

impl BackupMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupMode::Full => "FULL",
            BackupMode::Incremental => "INCREMENTAL",
        }
    }
}

impl fmt::Display for BackupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupMode {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_uppercase().as_str() {
            "FULL" => Ok(BackupMode::Full),
            "INCREMENTAL" | "INCR" => Ok(BackupMode::Incremental),
            other => Err(format!("Unknown backup mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl Default for BackupStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Pending => "PENDING",
            BackupStatus::Running => "RUNNING",
            BackupStatus::Completed => "COMPLETED",
            BackupStatus::Failed => "FAILED",
            BackupStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, BackupStatus::Completed)
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_uppercase().as_str() {
            "PENDING" => Ok(BackupStatus::Pending),
            "RUNNING" => Ok(BackupStatus::Running),
            "COMPLETED" => Ok(BackupStatus::Completed),
            "FAILED" => Ok(BackupStatus::Failed),
            "CANCELLED" | "CANCELED" => Ok(BackupStatus::Cancelled),
            other => Err(format!("Unknown backup status: {other}")),
        }
    }
}

/// WORM retention modes, ordered from most to least overridable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetentionMode {
    Governance,
    Compliance,
    LegalHold,
}

impl RetentionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetentionMode::Governance => "GOVERNANCE",
            RetentionMode::Compliance => "COMPLIANCE",
            RetentionMode::LegalHold => "LEGAL_HOLD",
        }
    }
}

impl fmt::Display for RetentionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetentionMode {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_uppercase().replace('-', "_").as_str() {
            "GOVERNANCE" => Ok(RetentionMode::Governance),
            "COMPLIANCE" => Ok(RetentionMode::Compliance),
            "LEGAL_HOLD" => Ok(RetentionMode::LegalHold),
            other => Err(format!("Unknown retention mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyType {
    Global,
    StorageBackend,
    Vm,
    Container,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::Global => "GLOBAL",
            KeyType::StorageBackend => "STORAGE_BACKEND",
            KeyType::Vm => "VM",
            KeyType::Container => "CONTAINER",
        }
    }

    /// Only the global scope is addressed without a reference id.
    pub fn requires_reference(&self) -> bool {
        !matches!(self, KeyType::Global)
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyType {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_uppercase().replace('-', "_").as_str() {
            "GLOBAL" => Ok(KeyType::Global),
            "STORAGE_BACKEND" | "STORAGE" => Ok(KeyType::StorageBackend),
            "VM" => Ok(KeyType::Vm),
            "CONTAINER" => Ok(KeyType::Container),
            other => Err(format!("Unknown key type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceType {
    Vm,
    Container,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Vm => "VM",
            SourceType::Container => "CONTAINER",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_uppercase().as_str() {
            "VM" => Ok(SourceType::Vm),
            "CONTAINER" => Ok(SourceType::Container),
            other => Err(format!("Unknown source type: {other}")),
        }
    }
}

/// Rotation tag a backup was produced under.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupTag {
    Daily,
    Weekly,
    Monthly,
    Yearly,
    Archival,
}

impl Default for BackupTag {
    fn default() -> Self {
        Self::Daily
    }
}

impl BackupTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupTag::Daily => "DAILY",
            BackupTag::Weekly => "WEEKLY",
            BackupTag::Monthly => "MONTHLY",
            BackupTag::Yearly => "YEARLY",
            BackupTag::Archival => "ARCHIVAL",
        }
    }
}

impl fmt::Display for BackupTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupTag {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_uppercase().as_str() {
            "DAILY" => Ok(BackupTag::Daily),
            "WEEKLY" => Ok(BackupTag::Weekly),
            "MONTHLY" => Ok(BackupTag::Monthly),
            "YEARLY" => Ok(BackupTag::Yearly),
            "ARCHIVAL" => Ok(BackupTag::Archival),
            other => Err(format!("Unknown backup tag: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EncryptionScheme {
    Global,
    Storage,
    Vm,
    Container,
}

impl Default for EncryptionScheme {
    fn default() -> Self {
        Self::Global
    }
}

impl EncryptionScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncryptionScheme::Global => "GLOBAL",
            EncryptionScheme::Storage => "STORAGE",
            EncryptionScheme::Vm => "VM",
            EncryptionScheme::Container => "CONTAINER",
        }
    }

    /// The key scope a backup under this scheme draws its DEK from.
    pub fn key_type(&self) -> KeyType {
        match self {
            EncryptionScheme::Global => KeyType::Global,
            EncryptionScheme::Storage => KeyType::StorageBackend,
            EncryptionScheme::Vm => KeyType::Vm,
            EncryptionScheme::Container => KeyType::Container,
        }
    }
}

impl fmt::Display for EncryptionScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EncryptionScheme {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_uppercase().as_str() {
            "GLOBAL" => Ok(EncryptionScheme::Global),
            "STORAGE" => Ok(EncryptionScheme::Storage),
            "VM" => Ok(EncryptionScheme::Vm),
            "CONTAINER" => Ok(EncryptionScheme::Container),
            other => Err(format!("Unknown encryption scheme: {other}")),
        }
    }
}
