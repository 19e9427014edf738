//! System-wide constants and default paths.

/// Base directory for qimi state. Mounts do not survive a reboot, so
/// neither does anything kept here.
pub const DEFAULT_DATA_DIR: &str = "/tmp/qimi";
/// Directory holding one mount point per mounted image.
pub const DEFAULT_MOUNT_DIR: &str = "/tmp/qimi/mounts";
/// Directory holding the per-mount-point device association records.
pub const DEFAULT_METADATA_DIR: &str = "/tmp/qimi/metadata";
/// Directory holding resolv.conf backup slots.
pub const DEFAULT_BACKUP_DIR: &str = "/tmp/qimi/files";
/// Default path of the persisted mount table.
pub const DEFAULT_STATE_FILE: &str = "/tmp/qimi/state.json";

/// Device node prefix of the NBD pool; slot `i` is `{prefix}{i}`.
pub const NBD_DEVICE_PREFIX: &str = "/dev/nbd";
/// Number of slots in the NBD pool.
pub const NBD_POOL_SIZE: usize = 16;
/// Directory containing per-device `pid` owner markers.
pub const NBD_SYSFS_DIR: &str = "/sys/devices/virtual/block";
/// Kernel module listing.
pub const PROC_MODULES: &str = "/proc/modules";
/// Live mount table.
pub const PROC_MOUNTS: &str = "/proc/mounts";
/// Pause after a partition-table rescan, in milliseconds.
pub const SETTLE_DELAY_MS: u64 = 500;

/// Host resolver configuration.
pub const HOST_RESOLV_CONF: &str = "/etc/resolv.conf";
/// Guest resolver configuration, relative to the mount point.
pub const GUEST_RESOLV_CONF: &str = "etc/resolv.conf";

/// Suffix appended to an image's base name to form its mount point.
pub const MOUNT_POINT_SUFFIX: &str = ".mount";
/// Extension of device association records.
pub const DEVICE_RECORD_EXTENSION: &str = "nbd";

/// Filesystem types partition auto-detection recognizes, most preferred first.
pub const PREFERRED_FILESYSTEMS: &[&str] = &[
    "ext4", "ext3", "ext2", "xfs", "btrfs", "f2fs", "ntfs", "fat32", "vfat", "hfs", "hfsplus",
];

/// Filesystem types conventionally used as an OS root.
pub const ROOT_FILESYSTEMS: &[&str] = &["ext4", "ext3", "ext2", "xfs", "btrfs", "f2fs"];

/// Paths namespace teardown must never operate on directly.
pub const PROTECTED_PATHS: &[&str] = &["/", "/dev", "/proc", "/sys"];

/// Prefixes under which namespace teardown is allowed.
pub const TEARDOWN_PREFIXES: &[&str] = &["/tmp/", "/mnt/"];

/// Application name used in CLI output and state files.
pub const APP_NAME: &str = "qimi";

/// Environment variable naming a configuration file.
pub const CONFIG_ENV: &str = "QIMI_CONFIG";
