//! Registry persistence
//!
//! The device registry lives at `<config_dir>/tether/config.json`.
//! `TETHER_CONFIG_DIR` replaces the whole `<config_dir>/tether` prefix.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use super::types::{Device, DeviceRegistry};

/// Environment override for the configuration directory
pub const CONFIG_DIR_ENV: &str = "TETHER_CONFIG_DIR";

const REGISTRY_FILE: &str = "config.json";
const CONTEXT_DIR: &str = "context";

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Cannot determine the user configuration directory")]
    NoConfigDir,

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Base directory for all tether client state
pub fn config_dir() -> Result<PathBuf, StorageError> {
    if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    dirs::config_dir()
        .map(|d| d.join("tether"))
        .ok_or(StorageError::NoConfigDir)
}

/// Directory holding one conversation context file per device
pub fn context_dir(base: &Path) -> PathBuf {
    base.join(CONTEXT_DIR)
}

/// Reads and writes the device registry.
#[derive(Debug, Clone)]
pub struct ConfigStorage {
    dir: PathBuf,
}

impl ConfigStorage {
    /// Storage rooted at the default configuration directory
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self::at(config_dir()?))
    }

    /// Storage rooted at an explicit directory
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn registry_path(&self) -> PathBuf {
        self.dir.join(REGISTRY_FILE)
    }

    /// Load the registry. A missing file is an empty registry.
    pub fn load(&self) -> Result<DeviceRegistry, StorageError> {
        let path = self.registry_path();
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No registry at {:?}, starting empty", path);
                return Ok(DeviceRegistry::default());
            }
            Err(source) => return Err(StorageError::Io { path, source }),
        };

        serde_json::from_slice(&data).map_err(|source| StorageError::Json { path, source })
    }

    /// Write the registry with owner-only permissions.
    pub fn save(&self, registry: &DeviceRegistry) -> Result<(), StorageError> {
        let path = self.registry_path();
        let data = serde_json::to_vec_pretty(registry).map_err(|source| StorageError::Json {
            path: path.clone(),
            source,
        })?;
        write_private(&path, &data)
    }

    /// Forget a paired device. Returns the removed entry, if there was one.
    pub fn remove_device(&self, name: &str) -> Result<Option<Device>, StorageError> {
        let mut registry = self.load()?;
        let removed = registry.remove_device(name);
        if removed.is_some() {
            self.save(&registry)?;
        }
        Ok(removed)
    }
}

/// Create parent directories (0700) and write `data` to `path` (0600).
pub fn write_private(path: &Path, data: &[u8]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| StorageError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
        restrict_permissions(parent, 0o700);
    }

    std::fs::write(path, data).map_err(|source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    restrict_permissions(path, 0o600);
    Ok(())
}

#[cfg(unix)]
fn restrict_permissions(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)) {
        // Not fatal: the write itself succeeded
        warn!("Failed to set permissions {:o} on {:?}: {}", mode, path, e);
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path, _mode: u32) {}
