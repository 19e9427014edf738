//! Guest resolver configuration with exact restore.
//!
//! Before a command runs inside a guest, its `etc/resolv.conf` is replaced
//! with either operator-supplied nameservers or the host's resolver
//! configuration. The original state is captured once per mount point in a
//! pair of backup slots:
//!
//! - the *symlink slot* holds the link target when the original was a
//!   symlink;
//! - the *content slot* holds the original bytes, or is zero bytes long
//!   when there was no original file.
//!
//! Slots are named from a SHA-256 of the mount-point string and are never
//! overwritten, so later invocations against the same mount point restore
//! to the state seen by the first one.

use std::ffi::OsString;
use std::fmt::Write as _;
use std::io::Write;
use std::net::IpAddr;
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};

use qimi_common::constants::GUEST_RESOLV_CONF;
use qimi_common::error::{QimiError, Result};
use sha2::{Digest, Sha256};

/// Backup slot paths for one mount point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSlots {
    /// Original file bytes, or empty for "no original".
    pub content: PathBuf,
    /// Original symlink target.
    pub symlink: PathBuf,
}

/// Backs up, rewrites and restores guest resolv.conf files.
#[derive(Debug, Clone)]
pub struct ResolvConfManager {
    backup_dir: PathBuf,
    host_resolv_conf: PathBuf,
}

impl ResolvConfManager {
    /// Creates a manager storing slots under `backup_dir`.
    pub fn new(backup_dir: impl Into<PathBuf>, host_resolv_conf: impl Into<PathBuf>) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            host_resolv_conf: host_resolv_conf.into(),
        }
    }

    /// Slot paths for `mount_point`.
    #[must_use]
    pub fn slots(&self, mount_point: &Path) -> BackupSlots {
        let digest = Sha256::digest(mount_point.as_os_str().as_encoded_bytes());
        let tag = digest[..8]
            .iter()
            .fold(String::with_capacity(16), |mut tag, b| {
                let _ = write!(tag, "{b:02x}");
                tag
            });
        BackupSlots {
            content: self.backup_dir.join(format!("resolv_conf_backup_{tag}")),
            symlink: self.backup_dir.join(format!("resolv_conf_symlink_{tag}")),
        }
    }

    /// Whether an original state has been recorded for `mount_point`.
    #[must_use]
    pub fn has_backup(&self, mount_point: &Path) -> bool {
        let slots = self.slots(mount_point);
        slots.content.exists() || slots.symlink.exists()
    }

    /// Replaces the guest's resolv.conf, backing up the original first.
    ///
    /// With `nameservers`, every entry must be an IP literal; one bad entry
    /// fails the call before anything is written. Without them, the host's
    /// resolv.conf (followed through symlinks) is copied byte for byte.
    ///
    /// # Errors
    ///
    /// Returns `QimiError::InvalidNameserver` for a non-IP entry, or an I/O
    /// error from reading the host file, recording the backup, or writing
    /// the new file.
    pub fn install(&self, mount_point: &Path, nameservers: &[String]) -> Result<()> {
        let content = if nameservers.is_empty() {
            self.host_content()?
        } else {
            render_nameservers(nameservers)?.into_bytes()
        };

        let target = mount_point.join(GUEST_RESOLV_CONF);
        if let Some(etc) = target.parent() {
            std::fs::create_dir_all(etc).map_err(|e| QimiError::io(etc, e))?;
        }
        self.backup(mount_point)?;

        remove_if_present(&target)?;
        std::fs::write(&target, &content).map_err(|e| QimiError::io(&target, e))?;
        tracing::debug!(target = %target.display(), bytes = content.len(), "resolv.conf written");
        Ok(())
    }

    /// Records the original state of the guest's resolv.conf unless a
    /// backup for this mount point already exists.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the original cannot be inspected or the slot
    /// cannot be written.
    pub fn backup(&self, mount_point: &Path) -> Result<()> {
        if self.has_backup(mount_point) {
            tracing::debug!(mount_point = %mount_point.display(), "backup already recorded");
            return Ok(());
        }
        std::fs::create_dir_all(&self.backup_dir).map_err(|e| QimiError::io(&self.backup_dir, e))?;

        let slots = self.slots(mount_point);
        let target = mount_point.join(GUEST_RESOLV_CONF);
        match std::fs::symlink_metadata(&target) {
            Ok(meta) if meta.file_type().is_symlink() => {
                let link = std::fs::read_link(&target).map_err(|e| QimiError::io(&target, e))?;
                write_once(&slots.symlink, link.as_os_str().as_encoded_bytes())?;
                tracing::debug!(link = %link.display(), "backed up resolv.conf symlink");
            }
            Ok(_) => {
                let bytes = std::fs::read(&target).map_err(|e| QimiError::io(&target, e))?;
                write_once(&slots.content, &bytes)?;
                tracing::debug!(bytes = bytes.len(), "backed up resolv.conf contents");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                write_once(&slots.content, b"")?;
                tracing::debug!("no original resolv.conf, recorded absence");
            }
            Err(e) => return Err(QimiError::io(&target, e)),
        }
        Ok(())
    }

    /// Puts the guest's resolv.conf back the way the backup recorded it.
    ///
    /// A non-empty symlink slot wins and the link is recreated. Otherwise
    /// the content slot decides: missing or empty means the file is
    /// removed, anything else is written back verbatim.
    ///
    /// An empty slot is the "no original" marker, so a guest whose
    /// resolv.conf existed but was empty comes back without one.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the target cannot be removed, relinked or
    /// rewritten.
    pub fn restore(&self, mount_point: &Path) -> Result<()> {
        let slots = self.slots(mount_point);
        let target = mount_point.join(GUEST_RESOLV_CONF);

        if let Ok(link) = std::fs::read(&slots.symlink) {
            if !link.is_empty() {
                let link = PathBuf::from(OsString::from_vec(link));
                remove_if_present(&target)?;
                std::os::unix::fs::symlink(&link, &target).map_err(|e| QimiError::io(&target, e))?;
                tracing::debug!(target = %target.display(), link = %link.display(), "restored resolv.conf symlink");
                return Ok(());
            }
        }

        match std::fs::read(&slots.content) {
            Err(e) => {
                tracing::debug!(error = %e, "no content backup, removing resolv.conf");
                remove_if_present(&target)
            }
            Ok(original) if original.is_empty() => {
                tracing::debug!("original resolv.conf was absent, removing");
                remove_if_present(&target)
            }
            Ok(original) => {
                remove_if_present(&target)?;
                std::fs::write(&target, &original).map_err(|e| QimiError::io(&target, e))?;
                tracing::debug!(bytes = original.len(), "restored resolv.conf contents");
                Ok(())
            }
        }
    }

    /// Deletes both backup slots for `mount_point`. Missing slots are fine.
    pub fn remove_backups(&self, mount_point: &Path) {
        let slots = self.slots(mount_point);
        for slot in [&slots.content, &slots.symlink] {
            if let Err(e) = std::fs::remove_file(slot) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(slot = %slot.display(), error = %e, "failed to remove backup slot");
                }
            }
        }
    }

    fn host_content(&self) -> Result<Vec<u8>> {
        let source = match std::fs::canonicalize(&self.host_resolv_conf) {
            Ok(real) => real,
            Err(e) => {
                tracing::debug!(error = %e, "cannot resolve host resolv.conf, reading it directly");
                self.host_resolv_conf.clone()
            }
        };
        std::fs::read(&source).map_err(|e| QimiError::io(&source, e))
    }
}

/// Restores a guest's resolv.conf when dropped.
///
/// Create it before the guarded command starts; it fires on every exit
/// path, including unwinding. If no backup was ever recorded it leaves
/// the file alone.
#[derive(Debug)]
pub struct ResolvConfGuard<'a> {
    manager: &'a ResolvConfManager,
    mount_point: PathBuf,
}

impl<'a> ResolvConfGuard<'a> {
    /// Arms a restore of `mount_point`'s resolv.conf.
    pub fn new(manager: &'a ResolvConfManager, mount_point: &Path) -> Self {
        Self {
            manager,
            mount_point: mount_point.to_path_buf(),
        }
    }
}

impl Drop for ResolvConfGuard<'_> {
    fn drop(&mut self) {
        if !self.manager.has_backup(&self.mount_point) {
            tracing::debug!(mount_point = %self.mount_point.display(), "nothing recorded, leaving resolv.conf as is");
            return;
        }
        tracing::debug!(mount_point = %self.mount_point.display(), "restoring resolv.conf");
        if let Err(e) = self.manager.restore(&self.mount_point) {
            tracing::warn!(error = %e, "failed to restore resolv.conf");
        }
    }
}

/// Validates nameserver entries as IP literals and renders one
/// `nameserver` line per entry.
///
/// # Errors
///
/// Returns `QimiError::InvalidNameserver` naming the first bad entry.
pub fn render_nameservers(nameservers: &[String]) -> Result<String> {
    validate_nameservers(nameservers)?;
    Ok(nameservers
        .iter()
        .map(|ns| format!("nameserver {}\n", ns.trim()))
        .collect())
}

/// Checks that every entry parses as an IPv4 or IPv6 address.
///
/// # Errors
///
/// Returns `QimiError::InvalidNameserver` naming the first bad entry.
pub fn validate_nameservers(nameservers: &[String]) -> Result<()> {
    if let Some(bad) = nameservers
        .iter()
        .find(|ns| ns.trim().parse::<IpAddr>().is_err())
    {
        return Err(QimiError::InvalidNameserver { value: bad.clone() });
    }
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(QimiError::io(path, e)),
    }
}

fn write_once(slot: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(slot)
        .map_err(|e| QimiError::io(slot, e))?;
    file.write_all(bytes).map_err(|e| QimiError::io(slot, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        dir: tempfile::TempDir,
        manager: ResolvConfManager,
        root: PathBuf,
        host: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("guest.mount");
        std::fs::create_dir_all(root.join("etc")).expect("mkdir etc");
        let host = dir.path().join("host-resolv.conf");
        std::fs::write(&host, "nameserver 10.0.0.53\n").expect("host");
        let manager = ResolvConfManager::new(dir.path().join("files"), &host);
        Fixture {
            dir,
            manager,
            root,
            host,
        }
    }

    fn guest_file(f: &Fixture) -> PathBuf {
        f.root.join("etc/resolv.conf")
    }

    #[test]
    fn slots_are_deterministic_per_mount_point() {
        let f = fixture();
        let a = f.manager.slots(Path::new("/tmp/qimi/mounts/a.mount"));
        let b = f.manager.slots(Path::new("/tmp/qimi/mounts/a.mount"));
        let c = f.manager.slots(Path::new("/tmp/qimi/mounts/b.mount"));
        assert_eq!(a, b);
        assert_ne!(a.content, c.content);
        let name = a.content.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("resolv_conf_backup_"));
        assert_eq!(name.len(), "resolv_conf_backup_".len() + 16);
    }

    #[test]
    fn regular_file_round_trips() {
        let f = fixture();
        let original = b"# guest\nnameserver 192.168.1.1\nsearch lan\n";
        std::fs::write(guest_file(&f), original).unwrap();

        f.manager.install(&f.root, &[]).expect("install");
        assert_eq!(std::fs::read(guest_file(&f)).unwrap(), b"nameserver 10.0.0.53\n");

        f.manager.restore(&f.root).expect("restore");
        assert_eq!(std::fs::read(guest_file(&f)).unwrap(), original);
    }

    #[test]
    fn symlink_round_trips() {
        let f = fixture();
        std::os::unix::fs::symlink("../run/systemd/resolve/stub-resolv.conf", guest_file(&f))
            .unwrap();

        f.manager
            .install(&f.root, &["1.1.1.1".to_string()])
            .expect("install");
        let meta = std::fs::symlink_metadata(guest_file(&f)).unwrap();
        assert!(meta.file_type().is_file());

        f.manager.restore(&f.root).expect("restore");
        assert_eq!(
            std::fs::read_link(guest_file(&f)).unwrap(),
            PathBuf::from("../run/systemd/resolve/stub-resolv.conf")
        );
    }

    #[test]
    fn absent_original_is_removed_again() {
        let f = fixture();
        f.manager.install(&f.root, &[]).expect("install");
        assert!(guest_file(&f).exists());
        assert_eq!(std::fs::read(f.manager.slots(&f.root).content).unwrap(), b"");

        f.manager.restore(&f.root).expect("restore");
        assert!(std::fs::symlink_metadata(guest_file(&f)).is_err());
    }

    #[test]
    fn install_creates_missing_etc() {
        let f = fixture();
        std::fs::remove_dir(f.root.join("etc")).unwrap();
        f.manager.install(&f.root, &[]).expect("install");
        assert!(guest_file(&f).is_file());
    }

    #[test]
    fn second_install_keeps_first_backup() {
        let f = fixture();
        std::fs::write(guest_file(&f), "nameserver 192.168.1.1\n").unwrap();
        f.manager.install(&f.root, &[]).expect("first install");

        std::fs::write(&f.host, "nameserver 172.16.0.1\n").unwrap();
        f.manager.install(&f.root, &[]).expect("second install");
        assert_eq!(std::fs::read(guest_file(&f)).unwrap(), b"nameserver 172.16.0.1\n");

        let slots = f.manager.slots(&f.root);
        assert_eq!(std::fs::read(&slots.content).unwrap(), b"nameserver 192.168.1.1\n");
        f.manager.restore(&f.root).expect("restore");
        assert_eq!(std::fs::read(guest_file(&f)).unwrap(), b"nameserver 192.168.1.1\n");
    }

    #[test]
    fn custom_nameservers_are_rendered() {
        let f = fixture();
        f.manager
            .install(&f.root, &["8.8.8.8".to_string(), "2001:4860:4860::8888".to_string()])
            .expect("install");
        assert_eq!(
            std::fs::read_to_string(guest_file(&f)).unwrap(),
            "nameserver 8.8.8.8\nnameserver 2001:4860:4860::8888\n"
        );
    }

    #[test]
    fn invalid_nameserver_writes_nothing() {
        let f = fixture();
        std::fs::write(guest_file(&f), "original\n").unwrap();
        let err = f
            .manager
            .install(&f.root, &["8.8.8.8".to_string(), "dns.google".to_string()])
            .expect_err("invalid");
        assert!(matches!(err, QimiError::InvalidNameserver { ref value } if value == "dns.google"));
        assert_eq!(std::fs::read(guest_file(&f)).unwrap(), b"original\n");
        assert!(!f.manager.has_backup(&f.root));
        assert!(!f.dir.path().join("files").exists());
    }

    #[test]
    fn empty_original_is_restored_as_absent() {
        let f = fixture();
        std::fs::write(guest_file(&f), b"").unwrap();

        f.manager.install(&f.root, &["1.1.1.1".to_string()]).expect("install");
        f.manager.restore(&f.root).expect("restore");
        assert!(std::fs::symlink_metadata(guest_file(&f)).is_err());
    }

    #[test]
    fn host_symlink_is_followed() {
        let f = fixture();
        let real = f.dir.path().join("stub-resolv.conf");
        std::fs::write(&real, "nameserver 127.0.0.53\noptions edns0\n").unwrap();
        std::fs::remove_file(&f.host).unwrap();
        std::os::unix::fs::symlink(&real, &f.host).unwrap();

        f.manager.install(&f.root, &[]).expect("install");
        assert_eq!(
            std::fs::read(guest_file(&f)).unwrap(),
            b"nameserver 127.0.0.53\noptions edns0\n"
        );
    }

    #[test]
    fn restore_without_any_backup_removes_target() {
        let f = fixture();
        std::fs::write(guest_file(&f), "leftover\n").unwrap();
        f.manager.restore(&f.root).expect("restore");
        assert!(!guest_file(&f).exists());
    }

    #[test]
    fn guard_restores_on_drop() {
        let f = fixture();
        std::fs::write(guest_file(&f), "original\n").unwrap();
        {
            let _guard = ResolvConfGuard::new(&f.manager, &f.root);
            f.manager.install(&f.root, &["9.9.9.9".to_string()]).expect("install");
            assert_eq!(std::fs::read(guest_file(&f)).unwrap(), b"nameserver 9.9.9.9\n");
        }
        assert_eq!(std::fs::read(guest_file(&f)).unwrap(), b"original\n");
    }

    #[test]
    fn guard_without_backup_leaves_file() {
        let f = fixture();
        std::fs::write(guest_file(&f), "original\n").unwrap();
        drop(ResolvConfGuard::new(&f.manager, &f.root));
        assert_eq!(std::fs::read(guest_file(&f)).unwrap(), b"original\n");
    }

    #[test]
    fn remove_backups_clears_both_slots() {
        let f = fixture();
        f.manager.install(&f.root, &[]).expect("install");
        assert!(f.manager.has_backup(&f.root));
        f.manager.remove_backups(&f.root);
        assert!(!f.manager.has_backup(&f.root));
    }

    #[test]
    fn validate_accepts_v4_and_v6() {
        assert!(validate_nameservers(&["1.1.1.1".into(), "::1".into()]).is_ok());
        assert!(validate_nameservers(&["300.1.1.1".into()]).is_err());
    }
}
