//! Global configuration model for qimi.
//!
//! Every host path and pool dimension the core touches lives here rather
//! than in hidden globals, so tests can point the allocator and the
//! orchestrator at a scratch directory and a smaller pool.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{QimiError, Result};
use crate::types::{NamespaceMount, default_namespace_mounts};

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QimiConfig {
    /// Base directory for qimi state.
    pub data_dir: PathBuf,
    /// Directory under which mount points are created.
    pub mount_dir: PathBuf,
    /// Directory holding device association records.
    pub metadata_dir: PathBuf,
    /// Directory holding resolv.conf backup slots.
    pub backup_dir: PathBuf,
    /// Persisted mount table.
    pub state_file: PathBuf,
    /// Host resolver configuration copied into guests.
    pub host_resolv_conf: PathBuf,
    /// Live mount table.
    pub mount_table: PathBuf,
    /// NBD pool layout.
    pub device_pool: DevicePoolConfig,
    /// Namespace mount set, in setup order.
    pub namespace_mounts: Vec<NamespaceMount>,
    /// Prefixes under which namespace teardown may operate.
    pub teardown_prefixes: Vec<String>,
}

impl Default for QimiConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(constants::DEFAULT_DATA_DIR),
            mount_dir: PathBuf::from(constants::DEFAULT_MOUNT_DIR),
            metadata_dir: PathBuf::from(constants::DEFAULT_METADATA_DIR),
            backup_dir: PathBuf::from(constants::DEFAULT_BACKUP_DIR),
            state_file: PathBuf::from(constants::DEFAULT_STATE_FILE),
            host_resolv_conf: PathBuf::from(constants::HOST_RESOLV_CONF),
            mount_table: PathBuf::from(constants::PROC_MOUNTS),
            device_pool: DevicePoolConfig::default(),
            namespace_mounts: default_namespace_mounts(),
            teardown_prefixes: constants::TEARDOWN_PREFIXES
                .iter()
                .map(|p| (*p).to_string())
                .collect(),
        }
    }
}

impl QimiConfig {
    /// Loads a configuration file. Keys the file omits keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid JSON, or
    /// fails [`QimiConfig::validate`].
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| QimiError::io(path, e))?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Derives every directory from a single base directory.
    #[must_use]
    pub fn rooted_at(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            mount_dir: data_dir.join("mounts"),
            metadata_dir: data_dir.join("metadata"),
            backup_dir: data_dir.join("files"),
            state_file: data_dir.join("state.json"),
            ..Self::default()
        }
    }

    /// Rejects configurations the core cannot operate safely with.
    ///
    /// # Errors
    ///
    /// Returns `QimiError::Config` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.device_pool.size == 0 {
            return Err(QimiError::Config {
                message: "device_pool.size must be at least 1".into(),
            });
        }
        if self.teardown_prefixes.is_empty() {
            return Err(QimiError::Config {
                message: "teardown_prefixes must not be empty".into(),
            });
        }
        if let Some(bad) = self
            .teardown_prefixes
            .iter()
            .find(|p| !p.starts_with('/') || !p.ends_with('/') || p.as_str() == "/")
        {
            return Err(QimiError::Config {
                message: format!(
                    "teardown prefix {bad:?} must be an absolute, slash-terminated directory other than /"
                ),
            });
        }
        let mount_dir = format!("{}/", self.mount_dir.display().to_string().trim_end_matches('/'));
        let escapes = self
            .mount_dir
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir));
        if escapes
            || !self
                .teardown_prefixes
                .iter()
                .any(|p| mount_dir.starts_with(p.as_str()))
        {
            return Err(QimiError::Config {
                message: format!(
                    "mount_dir {} is outside every teardown prefix {:?}; namespace mounts under it could never be removed",
                    self.mount_dir.display(),
                    self.teardown_prefixes
                ),
            });
        }
        if let Some(bad) = self
            .namespace_mounts
            .iter()
            .find(|m| !m.target.starts_with('/') || m.relative_target().is_empty())
        {
            return Err(QimiError::Config {
                message: format!("namespace mount target {:?} must be an absolute sub-path", bad.target),
            });
        }
        Ok(())
    }
}

/// Layout of the NBD device pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicePoolConfig {
    /// Device node prefix; slot `i` is `{prefix}{i}`.
    pub device_prefix: String,
    /// Number of slots scanned.
    pub size: usize,
    /// Directory containing `<device>/pid` owner markers.
    pub sysfs_dir: PathBuf,
    /// Kernel module listing checked for `nbd`.
    pub modules_file: PathBuf,
    /// Pause after a partition-table rescan, in milliseconds.
    pub settle_delay_ms: u64,
}

impl Default for DevicePoolConfig {
    fn default() -> Self {
        Self {
            device_prefix: constants::NBD_DEVICE_PREFIX.into(),
            size: constants::NBD_POOL_SIZE,
            sysfs_dir: PathBuf::from(constants::NBD_SYSFS_DIR),
            modules_file: PathBuf::from(constants::PROC_MODULES),
            settle_delay_ms: constants::SETTLE_DELAY_MS,
        }
    }
}

impl DevicePoolConfig {
    /// Device node of slot `index`.
    #[must_use]
    pub fn slot_path(&self, index: usize) -> PathBuf {
        PathBuf::from(format!("{}{index}", self.device_prefix))
    }
}
