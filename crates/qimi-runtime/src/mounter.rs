//! Mount manager: image path in, mounted directory out.
//!
//! A mount is all-or-nothing. Each resource acquired along the way (the
//! mount-point directory, the connected device, the mounted filesystem) is
//! held by a guard that undoes it on drop, and the guards are only
//! disarmed once the device record has been written.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use qimi_common::config::QimiConfig;
use qimi_common::constants::{DEVICE_RECORD_EXTENSION, MOUNT_POINT_SUFFIX};
use qimi_common::error::{QimiError, Result};
use qimi_core::command::{CommandRunner, Invocation};
use qimi_core::dns::ResolvConfManager;
use qimi_core::nbd::DeviceAllocator;

/// Path of the device record for `mount_point`: `<metadata_dir>/<name>.nbd`.
#[must_use]
pub fn device_record_path(metadata_dir: &Path, mount_point: &Path) -> PathBuf {
    let mut name = mount_point
        .file_name()
        .map(std::ffi::OsStr::to_os_string)
        .unwrap_or_default();
    name.push(".");
    name.push(DEVICE_RECORD_EXTENSION);
    metadata_dir.join(name)
}

/// Attaches images and mounts their root filesystem.
pub struct MountManager {
    allocator: DeviceAllocator,
    runner: Arc<dyn CommandRunner>,
    dns: ResolvConfManager,
    mount_dir: PathBuf,
    metadata_dir: PathBuf,
}

impl std::fmt::Debug for MountManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountManager")
            .field("allocator", &self.allocator)
            .field("mount_dir", &self.mount_dir)
            .field("metadata_dir", &self.metadata_dir)
            .finish_non_exhaustive()
    }
}

impl MountManager {
    /// Creates a mount manager from the configured host layout.
    pub fn new(config: &QimiConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let allocator = DeviceAllocator::new(config.device_pool.clone(), Arc::clone(&runner));
        Self::with_allocator(config, runner, allocator)
    }

    /// Creates a mount manager around an existing allocator.
    pub fn with_allocator(
        config: &QimiConfig,
        runner: Arc<dyn CommandRunner>,
        allocator: DeviceAllocator,
    ) -> Self {
        Self {
            allocator,
            runner,
            dns: ResolvConfManager::new(&config.backup_dir, &config.host_resolv_conf),
            mount_dir: config.mount_dir.clone(),
            metadata_dir: config.metadata_dir.clone(),
        }
    }

    /// The device allocator in use.
    #[must_use]
    pub const fn allocator(&self) -> &DeviceAllocator {
        &self.allocator
    }

    /// Mount point for `image`: `<mount_dir>/<basename>.mount`.
    ///
    /// # Errors
    ///
    /// Returns `QimiError::NotFound` if the path has no file name.
    pub fn mount_point_for(&self, image: &Path) -> Result<PathBuf> {
        let Some(base) = image.file_name() else {
            return Err(QimiError::NotFound {
                kind: "image",
                id: image.display().to_string(),
            });
        };
        let mut name = base.to_os_string();
        name.push(MOUNT_POINT_SUFFIX);
        Ok(self.mount_dir.join(name))
    }

    /// Device the record for `mount_point` names, if a record exists.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the record exists but cannot be read.
    pub fn recorded_device(&self, mount_point: &Path) -> Result<Option<PathBuf>> {
        let record = device_record_path(&self.metadata_dir, mount_point);
        match std::fs::read_to_string(&record) {
            Ok(raw) => Ok(Some(PathBuf::from(raw.trim()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(QimiError::io(record, e)),
        }
    }

    /// Attaches `image` to a free device, picks a partition and mounts it.
    ///
    /// `partition` forces a partition number; `None` auto-detects. Returns
    /// the mount point.
    ///
    /// # Errors
    ///
    /// Returns `QimiError::NotFound` for a missing image or requested
    /// partition, `QimiError::AlreadyExists` if the image already has a
    /// device record, `QimiError::DeviceExhausted`,
    /// `QimiError::AmbiguousSelection`, or the failing tool's
    /// `QimiError::ExternalTool`. On any error nothing is left behind.
    pub fn mount(&self, image: &Path, read_only: bool, partition: Option<u32>) -> Result<PathBuf> {
        let image = std::path::absolute(image).map_err(|e| QimiError::io(image, e))?;
        if !image.exists() {
            return Err(QimiError::NotFound {
                kind: "image",
                id: image.display().to_string(),
            });
        }
        let mount_point = self.mount_point_for(&image)?;
        let record = device_record_path(&self.metadata_dir, &mount_point);
        if record.exists() {
            return Err(QimiError::AlreadyExists {
                kind: "mount",
                id: mount_point.display().to_string(),
            });
        }
        tracing::debug!(image = %image.display(), mount_point = %mount_point.display(), read_only, ?partition, "mounting image");

        std::fs::create_dir_all(&self.metadata_dir)
            .map_err(|e| QimiError::io(&self.metadata_dir, e))?;
        let slot = self.allocator.find_free_device()?;

        let dir = DirGuard::create(&mount_point)?;
        self.allocator.connect(&image, &slot, read_only)?;
        let device = DeviceGuard::new(&self.allocator, &slot.path);

        self.allocator.probe_partitions(&slot.path)?;
        let chosen = self.allocator.select_partition(&slot.path, partition)?;

        let mut inv = Invocation::new("mount");
        if read_only {
            inv = inv.arg("-r");
        }
        let inv = inv.arg(&chosen.path).arg(&mount_point);
        let _ = self.runner.output(&inv)?.check(&inv)?;
        let mounted = MountedGuard::new(self.runner.as_ref(), &mount_point);

        std::fs::write(&record, slot.path.display().to_string())
            .map_err(|e| QimiError::io(&record, e))?;

        mounted.disarm();
        device.disarm();
        dir.disarm();
        tracing::info!(
            image = %image.display(),
            device = %slot,
            partition = %chosen.path.display(),
            mount_point = %mount_point.display(),
            "image mounted"
        );
        Ok(mount_point)
    }

    /// Unmounts `mount_point` and releases its device.
    ///
    /// Every step runs even if an earlier one failed: the filesystem
    /// unmount ("not mounted" is fine), the device disconnect driven by
    /// the device record, removal of that record and of the resolv.conf
    /// backups, and removal of the directory if it is empty. A non-empty
    /// directory is left in place.
    ///
    /// # Errors
    ///
    /// Returns the first failure. A missing device record is reported as
    /// `QimiError::MetadataMismatch`: the device may still be connected
    /// and has to be found and disconnected by hand.
    pub fn unmount(&self, mount_point: &Path) -> Result<()> {
        tracing::debug!(mount_point = %mount_point.display(), "unmounting");
        let mut first_error: Option<QimiError> = None;

        let inv = Invocation::new("umount").arg(mount_point);
        match self.runner.output(&inv) {
            Ok(out) if out.success() => tracing::debug!(mount_point = %mount_point.display(), "filesystem unmounted"),
            Ok(out) if reports_not_mounted(&out.combined()) => {
                tracing::debug!(mount_point = %mount_point.display(), "already unmounted");
            }
            Ok(out) => {
                let err = out.check(&inv).err();
                if let Some(e) = &err {
                    tracing::warn!(error = %e, "filesystem unmount failed");
                }
                first_error = first_error.or(err);
            }
            Err(e) => {
                tracing::warn!(error = %e, "filesystem unmount failed");
                first_error = first_error.or(Some(e));
            }
        }

        let record = device_record_path(&self.metadata_dir, mount_point);
        match self.recorded_device(mount_point) {
            Ok(Some(device)) => {
                self.allocator.disconnect(&device);
                if let Err(e) = std::fs::remove_file(&record) {
                    tracing::warn!(record = %record.display(), error = %e, "failed to remove device record");
                    first_error = first_error.or(Some(QimiError::io(&record, e)));
                }
            }
            Ok(None) => {
                tracing::warn!(
                    mount_point = %mount_point.display(),
                    "device record missing; check lsblk and run qemu-nbd --disconnect on the device by hand"
                );
                first_error = first_error.or(Some(QimiError::MetadataMismatch {
                    mount_point: mount_point.to_path_buf(),
                    message: "find the device with lsblk and detach it with qemu-nbd --disconnect".into(),
                }));
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot read device record");
                first_error = first_error.or(Some(e));
            }
        }

        self.dns.remove_backups(mount_point);

        if let Err(e) = remove_if_empty(mount_point) {
            first_error = first_error.or(Some(e));
        }

        first_error.map_or(Ok(()), Err)
    }
}

fn reports_not_mounted(output: &str) -> bool {
    let output = output.to_ascii_lowercase();
    ["not mounted", "no mount point specified", "no such file or directory"]
        .iter()
        .any(|needle| output.contains(needle))
}

fn remove_if_empty(dir: &Path) -> Result<()> {
    let mut entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(QimiError::io(dir, e)),
    };
    if entries.next().is_some() {
        tracing::warn!(mount_point = %dir.display(), "mount point is not empty, leaving it in place");
        return Ok(());
    }
    std::fs::remove_dir(dir).map_err(|e| QimiError::io(dir, e))?;
    tracing::debug!(mount_point = %dir.display(), "mount point removed");
    Ok(())
}

/// Removes a directory this mount created, unless disarmed.
struct DirGuard {
    path: PathBuf,
    created: bool,
    armed: bool,
}

impl DirGuard {
    fn create(path: &Path) -> Result<Self> {
        let created = !path.exists();
        std::fs::create_dir_all(path).map_err(|e| QimiError::io(path, e))?;
        tracing::debug!(mount_point = %path.display(), created, "mount point ready");
        Ok(Self {
            path: path.to_path_buf(),
            created,
            armed: true,
        })
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for DirGuard {
    fn drop(&mut self) {
        if self.armed && self.created {
            if let Err(e) = std::fs::remove_dir(&self.path) {
                tracing::warn!(mount_point = %self.path.display(), error = %e, "failed to remove mount point");
            }
        }
    }
}

/// Disconnects a device unless disarmed.
struct DeviceGuard<'a> {
    allocator: &'a DeviceAllocator,
    device: PathBuf,
    armed: bool,
}

impl<'a> DeviceGuard<'a> {
    fn new(allocator: &'a DeviceAllocator, device: &Path) -> Self {
        Self {
            allocator,
            device: device.to_path_buf(),
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for DeviceGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!(device = %self.device.display(), "rolling back device connection");
            self.allocator.disconnect(&self.device);
        }
    }
}

/// Unmounts a filesystem unless disarmed.
struct MountedGuard<'a> {
    runner: &'a dyn CommandRunner,
    mount_point: PathBuf,
    armed: bool,
}

impl<'a> MountedGuard<'a> {
    fn new(runner: &'a dyn CommandRunner, mount_point: &Path) -> Self {
        Self {
            runner,
            mount_point: mount_point.to_path_buf(),
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for MountedGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let inv = Invocation::new("umount").arg(&self.mount_point);
        if let Err(e) = self.runner.output(&inv).and_then(|out| out.check(&inv)) {
            tracing::warn!(mount_point = %self.mount_point.display(), error = %e, "rollback unmount failed");
        }
    }
}
