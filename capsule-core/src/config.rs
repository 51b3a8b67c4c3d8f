//! Configuration for the backup manager and its store
//!
//! This module provides the tunables of the time capsule (backup cadence,
//! retention, contour synchronisation after restore) and the selection of the
//! key-value store backend behind it.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Enumeration of supported store backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local memory
    Memory,
    /// One file per entry under a directory
    Directory,
}

/// Configuration structure for store backend settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// The store backend to use
    pub backend: StoreBackend,
    /// Base directory (required for the directory backend)
    #[serde(default)]
    pub directory: Option<PathBuf>,
    /// Upper bound on stored bytes (memory backend only)
    #[serde(default)]
    pub quota_bytes: Option<u64>,
    /// Gzip entries before writing them (directory backend only)
    #[serde(default = "default_compress")]
    pub compress: bool,
}

fn default_compress() -> bool {
    true
}

impl StoreConfig {
    /// Create a configuration for an unbounded memory store
    pub fn default_memory() -> Self {
        StoreConfig {
            backend: StoreBackend::Memory,
            directory: None,
            quota_bytes: None,
            compress: default_compress(),
        }
    }

    /// Create a configuration for a compressed directory store
    pub fn directory<P: AsRef<Path>>(dir: P) -> Self {
        StoreConfig {
            backend: StoreBackend::Directory,
            directory: Some(dir.as_ref().to_path_buf()),
            quota_bytes: None,
            compress: default_compress(),
        }
    }

    /// Parse a store URI
    ///
    /// Supports formats:
    /// - `memory://` for an in-process store
    /// - `file:///some/dir` or a bare path for a directory store
    pub fn from_uri(uri: &str) -> crate::Result<StoreConfig> {
        if uri == "memory://" || uri == "memory" {
            return Ok(StoreConfig::default_memory());
        }

        let path = uri.strip_prefix("file://").unwrap_or(uri);
        if path.is_empty() {
            return Err(crate::CapsuleError::validation(
                "Invalid store URI: missing directory",
            ));
        }
        Ok(StoreConfig::directory(path))
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        match self.backend {
            StoreBackend::Directory => {
                let missing = self
                    .directory
                    .as_ref()
                    .map_or(true, |dir| dir.as_os_str().is_empty());
                if missing {
                    return Err(crate::CapsuleError::validation(
                        "Directory backend requires a directory",
                    ));
                }
            }
            StoreBackend::Memory => {}
        }
        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::default_memory()
    }
}

/// How a restore hands the first contour of each map to the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ContourSync {
    /// Broadcast contour events as soon as the maps are registered
    Immediate,
    /// Wait until the UI marks each map ready, or until the timeout elapses
    AwaitReady {
        #[serde(with = "duration_ms")]
        timeout: Duration,
    },
}

impl Default for ContourSync {
    fn default() -> Self {
        ContourSync::AwaitReady {
            timeout: Duration::from_millis(2500),
        }
    }
}

/// Tunables of the time capsule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapsuleConfig {
    /// Structural edits between automatic backups
    pub modification_threshold: u32,
    /// Automatic backups retained; manual backups are never evicted
    pub max_backup_count: usize,
    /// Turn every backup write into a no-op
    pub disable_backups: bool,
    /// Contour hand-off after a restore
    pub contour_sync: ContourSync,
    /// Store backend
    pub store: StoreConfig,
}

impl Default for CapsuleConfig {
    fn default() -> Self {
        Self {
            modification_threshold: 5,
            max_backup_count: 10,
            disable_backups: false,
            contour_sync: ContourSync::default(),
            store: StoreConfig::default(),
        }
    }
}

impl CapsuleConfig {
    /// Load a configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: CapsuleConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.modification_threshold == 0 {
            return Err(crate::CapsuleError::validation(
                "modification_threshold must be at least 1",
            ));
        }
        if self.max_backup_count == 0 {
            return Err(crate::CapsuleError::validation(
                "max_backup_count must be at least 1",
            ));
        }
        self.store.validate()
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
