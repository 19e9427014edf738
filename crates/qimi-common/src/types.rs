//! Domain primitive types used across the qimi workspace.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// One slot of the NBD device pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceSlot {
    /// Position in the pool.
    pub index: usize,
    /// Device node, e.g. `/dev/nbd3`.
    pub path: PathBuf,
}

impl DeviceSlot {
    /// Kernel name of the device (`nbd3`).
    #[must_use]
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

impl fmt::Display for DeviceSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Ownership state of a device slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotState {
    /// No live process owns the slot.
    Free,
    /// An image is attached and its server process is alive.
    Connected,
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// A mountable block device discovered on a connected slot.
///
/// Never persisted; rebuilt every time a device is probed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionDescriptor {
    /// Partition number, `None` for the base device itself.
    pub number: Option<u32>,
    /// Device node to mount.
    pub path: PathBuf,
    /// Filesystem type reported by the probe, if any.
    pub fstype: Option<String>,
    /// Size in bytes, if the probe reported one.
    pub size_bytes: Option<u64>,
}

impl PartitionDescriptor {
    /// Lower-cased filesystem type, or `None` when absent or blank.
    #[must_use]
    pub fn normalized_fstype(&self) -> Option<String> {
        self.fstype
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty() && *t != "-")
            .map(str::to_ascii_lowercase)
    }
}

/// Persisted association between an image and where it is mounted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRecord {
    /// Image path as the operator supplied it.
    pub image_path: String,
    /// Directory the selected partition is mounted at.
    pub mount_point: PathBuf,
    /// Optional operator-chosen alias.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Whether the image was attached and mounted read-only.
    pub read_only: bool,
    /// RFC 3339 timestamp of the mount.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mounted_at: String,
}

impl MountRecord {
    /// Key the record is stored under: the alias if set, else the image path.
    #[must_use]
    pub fn key(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.image_path)
    }

    /// Whether the record answers to the given alias or image path.
    #[must_use]
    pub fn matches(&self, alias_or_path: &str) -> bool {
        self.name.as_deref() == Some(alias_or_path) || self.image_path == alias_or_path
    }
}

/// How a namespace entry is mounted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum MountKind {
    /// `mount -t <fstype> <source> <target>`.
    Filesystem {
        /// Filesystem type handed to `mount -t`.
        fstype: String,
    },
    /// `mount --bind <source> <target>`.
    Bind,
    /// `mount --rbind <source> <target>`.
    RecursiveBind,
}

impl fmt::Display for MountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Filesystem { fstype } => write!(f, "{fstype}"),
            Self::Bind => write!(f, "bind"),
            Self::RecursiveBind => write!(f, "rbind"),
        }
    }
}

/// One entry of the namespace mount set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceMount {
    /// Mount source (`none`, `tmpfs`, or a host path for binds).
    pub source: String,
    /// Absolute path inside the guest, e.g. `/proc`.
    pub target: String,
    /// Mount flavor.
    #[serde(flatten)]
    pub kind: MountKind,
}

impl NamespaceMount {
    /// Target path relative to the guest root (`proc` for `/proc`).
    #[must_use]
    pub fn relative_target(&self) -> &str {
        self.target.trim_start_matches('/')
    }

    /// Resolves the target under `root` without normalizing the result.
    #[must_use]
    pub fn target_under(&self, root: &Path) -> PathBuf {
        root.join(self.relative_target())
    }
}

/// The minimal virtual filesystem set that makes a chroot usable.
#[must_use]
pub fn default_namespace_mounts() -> Vec<NamespaceMount> {
    vec![
        NamespaceMount {
            source: "none".into(),
            target: "/proc".into(),
            kind: MountKind::Filesystem {
                fstype: "proc".into(),
            },
        },
        NamespaceMount {
            source: "none".into(),
            target: "/sys".into(),
            kind: MountKind::Filesystem {
                fstype: "sysfs".into(),
            },
        },
        NamespaceMount {
            source: "/dev".into(),
            target: "/dev".into(),
            kind: MountKind::RecursiveBind,
        },
        NamespaceMount {
            source: "tmpfs".into(),
            target: "/tmp".into(),
            kind: MountKind::Filesystem {
                fstype: "tmpfs".into(),
            },
        },
    ]
}
