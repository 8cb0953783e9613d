use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ByteStorageError {
    #[error("invalid artifact path {path:?}")]
    InvalidPath { path: String },
    #[error("artifact {path} not found")]
    NotFound { path: String },
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StorageUsage {
    pub objects: u64,
    pub bytes: u64,
}

/// Where backup artifacts physically live. Paths are relative, `/`-separated.
pub trait ByteStorage {
    fn upload(&self, path: &str, bytes: &[u8]) -> Result<(), ByteStorageError>;
    fn download(&self, path: &str) -> Result<Vec<u8>, ByteStorageError>;
    /// Returns false when there was nothing to delete.
    fn delete(&self, path: &str) -> Result<bool, ByteStorageError>;
    fn list(&self, prefix: &str) -> Result<Vec<String>, ByteStorageError>;
    fn usage(&self, prefix: &str) -> Result<StorageUsage, ByteStorageError>;
}

/// Artifacts stored as plain files under one root directory.
#[derive(Debug, Clone)]
pub struct LocalDirStorage {
    root: PathBuf,
}

impl LocalDirStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, ByteStorageError> {
        let relative = Path::new(path);
        let normal = !path.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !normal {
            return Err(ByteStorageError::InvalidPath {
                path: path.to_string(),
            });
        }
        Ok(self.root.join(relative))
    }

    fn walk(&self, dir: &Path, found: &mut Vec<(String, u64)>) -> Result<(), ByteStorageError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(io_error(dir, err)),
        };
        for entry in entries {
            let entry = entry.map_err(|err| io_error(dir, err))?;
            let path = entry.path();
            let metadata = entry.metadata().map_err(|err| io_error(&path, err))?;
            if metadata.is_dir() {
                self.walk(&path, found)?;
            } else if let Ok(relative) = path.strip_prefix(&self.root) {
                let name = relative
                    .components()
                    .map(|component| component.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                found.push((name, metadata.len()));
            }
        }
        Ok(())
    }

    fn matching(&self, prefix: &str) -> Result<Vec<(String, u64)>, ByteStorageError> {
        let mut found = Vec::new();
        self.walk(&self.root, &mut found)?;
        found.retain(|(name, _)| name.starts_with(prefix));
        found.sort();
        Ok(found)
    }
}

impl ByteStorage for LocalDirStorage {
    fn upload(&self, path: &str, bytes: &[u8]) -> Result<(), ByteStorageError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|err| io_error(parent, err))?;
        }
        fs::write(&target, bytes).map_err(|err| io_error(&target, err))
    }

    fn download(&self, path: &str) -> Result<Vec<u8>, ByteStorageError> {
        let target = self.resolve(path)?;
        fs::read(&target).map_err(|err| match err.kind() {
            ErrorKind::NotFound => ByteStorageError::NotFound {
                path: path.to_string(),
            },
            _ => io_error(&target, err),
        })
    }

    fn delete(&self, path: &str) -> Result<bool, ByteStorageError> {
        let target = self.resolve(path)?;
        match fs::remove_file(&target) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(io_error(&target, err)),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, ByteStorageError> {
        Ok(self
            .matching(prefix)?
            .into_iter()
            .map(|(name, _)| name)
            .collect())
    }

    fn usage(&self, prefix: &str) -> Result<StorageUsage, ByteStorageError> {
        let found = self.matching(prefix)?;
        Ok(StorageUsage {
            objects: found.len() as u64,
            bytes: found.iter().map(|(_, size)| size).sum(),
        })
    }
}

fn io_error(path: &Path, source: std::io::Error) -> ByteStorageError {
    ByteStorageError::Io {
        path: path.display().to_string(),
        source,
    }
}
