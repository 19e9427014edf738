//! Unified error types for the qimi workspace.
//!
//! The first group of variants is the operator-facing taxonomy: every
//! failure the mount/exec layer can report maps onto exactly one of them.
//! The remaining variants cover ambient plumbing (I/O, configuration,
//! serialization).

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum QimiError {
    /// A kernel module or external tool the core depends on is absent.
    #[error("missing dependency: {what}")]
    DependencyMissing {
        /// Name of the missing module or tool, with an install hint.
        what: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// Every slot in the block-device pool is owned by a live process.
    #[error("no free NBD device found (all {pool_size} slots are in use)")]
    DeviceExhausted {
        /// Number of slots that were scanned.
        pool_size: usize,
    },

    /// Partition auto-detection could not pick a single candidate.
    #[error(
        "cannot choose a partition on {device}: candidates {} are indistinguishable, pass a partition number",
        candidates.join(", ")
    )]
    AmbiguousSelection {
        /// Base device that was probed.
        device: PathBuf,
        /// Device paths of the competing partitions.
        candidates: Vec<String>,
    },

    /// An external command exited unsuccessfully.
    #[error("{command} failed ({status}): {output}")]
    ExternalTool {
        /// Rendered command line.
        command: String,
        /// Exit status description.
        status: String,
        /// Captured stdout and stderr.
        output: String,
    },

    /// The device-association record for a mount point is missing.
    #[error(
        "no device record for {}: {message}",
        mount_point.display()
    )]
    MetadataMismatch {
        /// Mount point whose record was expected.
        mount_point: PathBuf,
        /// Reconciliation hint for the operator.
        message: String,
    },

    /// An unmount target failed a host-protection check.
    #[error("refusing to touch {path}: {reason}")]
    SafetyRejected {
        /// The rejected path.
        path: String,
        /// Which invariant it violated.
        reason: String,
    },

    /// A supplied nameserver is not an IP literal.
    #[error("invalid nameserver IP address: {value}")]
    InvalidNameserver {
        /// The offending entry.
        value: String,
    },

    /// A resource with the same identity is already registered.
    #[error("{kind} already exists: {id}")]
    AlreadyExists {
        /// Type of the conflicting resource.
        kind: &'static str,
        /// Identifier of the conflicting resource.
        id: String,
    },

    /// An I/O operation failed.
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A permission or privilege error.
    #[error("permission denied: {message}")]
    PermissionDenied {
        /// Description of the denied operation.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl QimiError {
    /// Wraps an I/O error with the path it occurred at.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, QimiError>;
