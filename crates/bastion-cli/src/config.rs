use anyhow::{Context, Result};
use bastion_keys::KeyEncryptionKey;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

pub const DEFAULT_CONFIG_FILE: &str = "bastion.toml";
pub const DEFAULT_KEK_ENV: &str = "BASTION_MASTER_KEK";
const DEFAULT_DATABASE: &str = "bastion.db";
const DEFAULT_STORAGE_ROOT: &str = "artifacts";

/// `bastion.toml`. Every field is optional.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub database_path: Option<PathBuf>,
    pub kek_file: Option<PathBuf>,
    pub kek_env: Option<String>,
    pub grace_period_hours: Option<i64>,
    pub legal_hold_fallback_days: Option<i64>,
    pub max_chain_length: Option<usize>,
    pub storage_root: Option<PathBuf>,
}

/// Flag values that take precedence over the file.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub database_path: Option<PathBuf>,
    pub kek_file: Option<PathBuf>,
    pub storage_root: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    pub database_path: PathBuf,
    pub kek_file: Option<PathBuf>,
    pub kek_env: String,
    pub grace_period_hours: i64,
    pub legal_hold_fallback_days: i64,
    pub max_chain_length: usize,
    pub storage_root: PathBuf,
}

impl Settings {
    pub fn resolve(file: FileConfig, overrides: Overrides) -> Self {
        Self {
            database_path: overrides
                .database_path
                .or(file.database_path)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE)),
            kek_file: overrides.kek_file.or(file.kek_file),
            kek_env: file
                .kek_env
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_KEK_ENV.to_string()),
            grace_period_hours: file
                .grace_period_hours
                .unwrap_or(bastion_retention::DEFAULT_GRACE_PERIOD_HOURS),
            legal_hold_fallback_days: file
                .legal_hold_fallback_days
                .unwrap_or(bastion_immutability::DEFAULT_LEGAL_HOLD_FALLBACK_DAYS),
            max_chain_length: file
                .max_chain_length
                .unwrap_or(bastion_chain::DEFAULT_MAX_CHAIN_LENGTH),
            storage_root: overrides
                .storage_root
                .or(file.storage_root)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_ROOT)),
        }
    }

    /// The KEK from `kek_file` if configured, else from the environment
    /// variable. `None` when neither is set; key commands then fail.
    pub fn load_kek(&self) -> Result<Option<KeyEncryptionKey>> {
        if let Some(path) = &self.kek_file {
            let data = Zeroizing::new(
                fs::read(path)
                    .with_context(|| format!("Failed to read KEK file {}", path.display()))?,
            );
            let kek = KeyEncryptionKey::from_data(&data)
                .with_context(|| format!("Invalid KEK in {}", path.display()))?;
            return Ok(Some(kek));
        }

        match std::env::var(&self.kek_env) {
            Ok(value) if !value.trim().is_empty() => {
                let value = Zeroizing::new(value);
                let kek = KeyEncryptionKey::from_base64(&value)
                    .with_context(|| format!("Invalid KEK in ${}", self.kek_env))?;
                Ok(Some(kek))
            }
            _ => Ok(None),
        }
    }
}

/// An explicitly named file must exist; the default one may be absent.
pub fn load_file_config(explicit: Option<&Path>) -> Result<FileConfig> {
    let (path, required) = match explicit {
        Some(path) => (path.to_path_buf(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    };
    if !required && !path.exists() {
        return Ok(FileConfig::default());
    }
    let contents = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("Failed to parse config {}", path.display()))
}
