//! Kernel mount calls behind the namespace mount set.

use std::path::Path;

use nix::mount::{MntFlags, MsFlags};
use qimi_common::error::{QimiError, Result};
use qimi_common::types::{MountKind, NamespaceMount};

/// The `mount(2)` / `umount2(2)` pair the namespace manager needs.
pub trait MountOps: Send + Sync {
    /// Mounts `entry` at `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel refuses the mount.
    fn mount(&self, entry: &NamespaceMount, target: &Path) -> Result<()>;

    /// Unmounts `target`, lazily detaching it when `detach` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel refuses the unmount.
    fn unmount(&self, target: &Path, detach: bool) -> Result<()>;
}

/// [`MountOps`] issuing the syscalls directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyscallMounts;

impl MountOps for SyscallMounts {
    fn mount(&self, entry: &NamespaceMount, target: &Path) -> Result<()> {
        let (fstype, flags) = mount_flags(&entry.kind);
        nix::mount::mount(
            Some(entry.source.as_str()),
            target,
            fstype,
            flags,
            None::<&str>,
        )
        .map_err(|e| QimiError::io(target, std::io::Error::from(e)))
    }

    fn unmount(&self, target: &Path, detach: bool) -> Result<()> {
        let flags = if detach {
            MntFlags::MNT_DETACH
        } else {
            MntFlags::empty()
        };
        nix::mount::umount2(target, flags).map_err(|e| QimiError::io(target, std::io::Error::from(e)))
    }
}

/// Filesystem type and flags for one mount flavor.
fn mount_flags(kind: &MountKind) -> (Option<&str>, MsFlags) {
    match kind {
        MountKind::Filesystem { fstype } => (Some(fstype.as_str()), MsFlags::empty()),
        MountKind::Bind => (None, MsFlags::MS_BIND),
        MountKind::RecursiveBind => (None, MsFlags::MS_BIND | MsFlags::MS_REC),
    }
}

/// The `mount(8)` command line equivalent to mounting `entry` at `target`.
#[must_use]
pub fn render_mount(entry: &NamespaceMount, target: &Path) -> String {
    let flavor = match &entry.kind {
        MountKind::Filesystem { fstype } => format!("-t {fstype}"),
        MountKind::Bind => "--bind".to_string(),
        MountKind::RecursiveBind => "--rbind".to_string(),
    };
    format!("mount {flavor} {} {}", entry.source, target.display())
}

/// The `umount(8)` command line equivalent to unmounting `target`.
#[must_use]
pub fn render_unmount(target: &Path, detach: bool) -> String {
    if detach {
        format!("umount -l {}", target.display())
    } else {
        format!("umount {}", target.display())
    }
}

#[cfg(test)]
mod tests {
    use qimi_common::types::default_namespace_mounts;

    use super::*;

    #[test]
    fn flags_per_flavor() {
        let set = default_namespace_mounts();
        assert_eq!(mount_flags(&set[0].kind), (Some("proc"), MsFlags::empty()));
        assert_eq!(
            mount_flags(&set[2].kind),
            (None, MsFlags::MS_BIND | MsFlags::MS_REC)
        );
        assert_eq!(mount_flags(&MountKind::Bind), (None, MsFlags::MS_BIND));
    }

    #[test]
    fn rendering_matches_mount_command_lines() {
        let set = default_namespace_mounts();
        let root = Path::new("/tmp/g");
        assert_eq!(render_mount(&set[1], &root.join("sys")), "mount -t sysfs none /tmp/g/sys");
        assert_eq!(render_mount(&set[2], &root.join("dev")), "mount --rbind /dev /tmp/g/dev");
        assert_eq!(render_unmount(&root.join("dev"), true), "umount -l /tmp/g/dev");
    }

    #[test]
    fn unmounting_a_plain_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = SyscallMounts.unmount(dir.path(), false).expect_err("not a mount");
        assert!(matches!(err, QimiError::Io { .. }));
    }
}
