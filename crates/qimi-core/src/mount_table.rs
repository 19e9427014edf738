//! Live mount-table lookups.
//!
//! Reads `/proc/mounts` as plain text. Only the mount-point column is
//! interpreted; the kernel escapes spaces and a few other bytes in it as
//! three-digit octal sequences (`\040`).

use std::path::Path;

use qimi_common::error::{QimiError, Result};

/// Snapshot of the mount points listed in a mount table.
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    targets: Vec<String>,
}

impl MountTable {
    /// Reads and parses the mount table at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn read(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| QimiError::io(path, e))?;
        Ok(Self::parse(&raw))
    }

    /// Parses mount-table text.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let targets = raw
            .lines()
            .filter_map(|line| line.split_whitespace().nth(1))
            .map(unescape)
            .collect();
        Self { targets }
    }

    /// Whether `target` is an active mount point.
    #[must_use]
    pub fn contains(&self, target: &Path) -> bool {
        let wanted = target.to_string_lossy();
        let trimmed = wanted.trim_end_matches('/');
        let wanted = if trimmed.is_empty() { "/" } else { trimmed };
        self.targets.iter().any(|t| t == wanted)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether the table has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Whether `target` is currently mounted according to the table at
/// `table_path`. An unreadable table counts as "not mounted".
#[must_use]
pub fn is_mounted(table_path: &Path, target: &Path) -> bool {
    match MountTable::read(table_path) {
        Ok(table) => table.contains(target),
        Err(e) => {
            tracing::debug!(error = %e, "mount table unreadable");
            false
        }
    }
}

fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() && is_octal_triplet(&bytes[i + 1..i + 4]) {
            let value = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            if let Ok(byte) = u8::try_from(value) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn is_octal_triplet(bytes: &[u8]) -> bool {
    bytes.len() == 3 && bytes.iter().all(|b| (b'0'..=b'7').contains(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0
/dev/nbd0p1 /tmp/qimi/mounts/debian.qcow2.mount ext4 rw,relatime 0 0
proc /tmp/qimi/mounts/debian.qcow2.mount/proc proc rw,relatime 0 0
/dev/nbd1 /tmp/qimi/mounts/my\\040disk.img.mount xfs ro 0 0
";

    #[test]
    fn contains_matches_whole_field() {
        let table = MountTable::parse(SAMPLE);
        assert_eq!(table.len(), 4);
        assert!(table.contains(Path::new("/tmp/qimi/mounts/debian.qcow2.mount")));
        assert!(table.contains(Path::new("/tmp/qimi/mounts/debian.qcow2.mount/proc")));
        assert!(!table.contains(Path::new("/tmp/qimi/mounts/debian.qcow2.mount/sys")));
        assert!(!table.contains(Path::new("/tmp/qimi/mounts/debian")));
    }

    #[test]
    fn trailing_slash_is_ignored() {
        let table = MountTable::parse(SAMPLE);
        assert!(table.contains(Path::new("/tmp/qimi/mounts/debian.qcow2.mount/")));
    }

    #[test]
    fn octal_escapes_are_decoded() {
        let table = MountTable::parse(SAMPLE);
        assert!(table.contains(Path::new("/tmp/qimi/mounts/my disk.img.mount")));
    }

    #[test]
    fn unreadable_table_means_not_mounted() {
        assert!(!is_mounted(
            Path::new("/nonexistent/qimi/mounts"),
            Path::new("/sys")
        ));
    }

    #[test]
    fn is_mounted_reads_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mounts");
        std::fs::write(&path, SAMPLE).expect("write");
        assert!(is_mounted(&path, Path::new("/sys")));
        assert!(!is_mounted(&path, Path::new("/proc")));
    }
}
