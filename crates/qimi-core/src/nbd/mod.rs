//! NBD device pool management.
//!
//! Owns the lifecycle of `/dev/nbdN` slots: dependency checks, free-slot
//! discovery, image attach/detach through `qemu-nbd`, partition-table
//! rescans, and root-partition selection.
//!
//! Slot ownership is decided from the kernel's per-device `pid` marker.
//! Nothing locks the pool across processes: two concurrent invocations can
//! both see the same slot as free and race to connect it.

pub mod lsblk;
pub mod select;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use qimi_common::config::DevicePoolConfig;
use qimi_common::error::{QimiError, Result};
use qimi_common::types::{DeviceSlot, PartitionDescriptor, SlotState};

use crate::command::{CommandRunner, Invocation};

/// Decides whether a process id names a running process.
pub type LivenessProbe = Arc<dyn Fn(i32) -> bool + Send + Sync>;

/// Default liveness check: signal 0 delivery. `EPERM` still means the
/// process exists, it just belongs to someone else.
#[must_use]
pub fn process_alive(pid: i32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Allocates pool slots and attaches images to them.
pub struct DeviceAllocator {
    pool: DevicePoolConfig,
    runner: Arc<dyn CommandRunner>,
    alive: LivenessProbe,
}

impl std::fmt::Debug for DeviceAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceAllocator")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl DeviceAllocator {
    /// Creates an allocator over `pool` using signal-0 liveness checks.
    pub fn new(pool: DevicePoolConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            pool,
            runner,
            alive: Arc::new(process_alive),
        }
    }

    /// Replaces the process-liveness predicate.
    #[must_use]
    pub fn with_liveness(mut self, probe: impl Fn(i32) -> bool + Send + Sync + 'static) -> Self {
        self.alive = Arc::new(probe);
        self
    }

    /// Pool layout this allocator scans.
    #[must_use]
    pub const fn pool(&self) -> &DevicePoolConfig {
        &self.pool
    }

    /// Verifies the nbd module is loaded (loading it if needed) and that
    /// `qemu-nbd`, `partprobe` and `lsblk` are installed.
    ///
    /// # Errors
    ///
    /// Returns `QimiError::DependencyMissing` naming everything absent.
    pub fn check_dependencies(&self) -> Result<()> {
        self.ensure_module()?;

        let missing: Vec<&str> = [
            ("qemu-nbd", "qemu-nbd (install qemu-utils)"),
            ("partprobe", "partprobe (install parted)"),
            ("lsblk", "lsblk (install util-linux)"),
        ]
        .into_iter()
        .filter(|(tool, _)| !self.runner.locate(tool))
        .map(|(_, hint)| hint)
        .collect();

        if !missing.is_empty() {
            return Err(QimiError::DependencyMissing {
                what: missing.join(", "),
            });
        }
        tracing::debug!("system dependencies satisfied");
        Ok(())
    }

    fn ensure_module(&self) -> Result<()> {
        let modules_file = &self.pool.modules_file;
        let listing =
            std::fs::read_to_string(modules_file).map_err(|e| QimiError::DependencyMissing {
                what: format!("nbd kernel module (cannot read {}: {e})", modules_file.display()),
            })?;
        if listing
            .lines()
            .any(|line| line.split_whitespace().next() == Some("nbd"))
        {
            return Ok(());
        }

        tracing::info!("nbd module not loaded, running modprobe");
        let inv = Invocation::new("modprobe").args(["nbd", "max_part=16"]);
        let out = self.runner.output(&inv)?;
        if !out.success() {
            return Err(QimiError::DependencyMissing {
                what: format!("nbd kernel module (modprobe nbd failed: {})", out.combined()),
            });
        }
        Ok(())
    }

    /// Returns the owner-marker path for a device.
    fn marker_path(&self, slot: &DeviceSlot) -> PathBuf {
        self.pool.sysfs_dir.join(slot.name()).join("pid")
    }

    /// Reports whether `slot` is owned by a live process.
    ///
    /// A slot is free when its marker is absent, empty, or names a process
    /// that no longer exists. An unreadable or malformed marker counts as
    /// owned.
    #[must_use]
    pub fn slot_state(&self, slot: &DeviceSlot) -> SlotState {
        let marker = self.marker_path(slot);
        let raw = match std::fs::read_to_string(&marker) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return SlotState::Free,
            Err(e) => {
                tracing::debug!(device = %slot, error = %e, "owner marker unreadable");
                return SlotState::Connected;
            }
        };
        let pid = raw.trim();
        if pid.is_empty() {
            return SlotState::Free;
        }
        match pid.parse::<i32>() {
            Ok(pid) if pid > 0 => {
                if (self.alive)(pid) {
                    SlotState::Connected
                } else {
                    tracing::debug!(device = %slot, pid, "owner process gone, slot is stale");
                    SlotState::Free
                }
            }
            _ => {
                tracing::debug!(device = %slot, marker = pid, "malformed owner marker");
                SlotState::Connected
            }
        }
    }

    /// Returns the lowest-index free slot.
    ///
    /// # Errors
    ///
    /// Returns `QimiError::DeviceExhausted` if every slot is owned.
    pub fn find_free_device(&self) -> Result<DeviceSlot> {
        (0..self.pool.size)
            .map(|index| DeviceSlot {
                index,
                path: self.pool.slot_path(index),
            })
            .find(|slot| self.slot_state(slot) == SlotState::Free)
            .inspect(|slot| tracing::debug!(device = %slot, "found free device"))
            .ok_or(QimiError::DeviceExhausted {
                pool_size: self.pool.size,
            })
    }

    /// Attaches `image` to `slot`.
    ///
    /// # Errors
    ///
    /// Returns `QimiError::ExternalTool` if `qemu-nbd` fails.
    pub fn connect(&self, image: &Path, slot: &DeviceSlot, read_only: bool) -> Result<()> {
        tracing::debug!(image = %image.display(), device = %slot, read_only, "connecting image");
        let mut inv = Invocation::new("qemu-nbd").arg("--connect").arg(&slot.path);
        if read_only {
            inv = inv.arg("--read-only");
        }
        let inv = inv.arg(image);
        let _ = self.runner.output(&inv)?.check(&inv)?;
        tracing::info!(image = %image.display(), device = %slot, "image connected");
        Ok(())
    }

    /// Detaches whatever is attached to `device`. Failures are logged.
    pub fn disconnect(&self, device: &Path) {
        let inv = Invocation::new("qemu-nbd").arg("--disconnect").arg(device);
        match self.runner.output(&inv).and_then(|out| out.check(&inv)) {
            Ok(_) => tracing::info!(device = %device.display(), "device disconnected"),
            Err(e) => tracing::warn!(device = %device.display(), error = %e, "disconnect failed"),
        }
    }

    /// Rescans the partition table of `device`, then waits the configured
    /// settle delay for partition nodes to appear. The delay is a timing
    /// assumption; the kernel gives no completion signal here.
    ///
    /// # Errors
    ///
    /// Returns `QimiError::ExternalTool` if `partprobe` fails.
    pub fn probe_partitions(&self, device: &Path) -> Result<()> {
        let inv = Invocation::new("partprobe").arg(device);
        let _ = self.runner.output(&inv)?.check(&inv)?;
        std::thread::sleep(Duration::from_millis(self.pool.settle_delay_ms));
        tracing::debug!(device = %device.display(), "partition table rescanned");
        Ok(())
    }

    /// Resolves the device node to mount.
    ///
    /// With `requested`, the matching `{device}p{n}` node must exist.
    /// Without it, partitions are discovered and ranked by
    /// [`select::choose_partition`].
    ///
    /// # Errors
    ///
    /// Returns `QimiError::NotFound` for a missing requested partition,
    /// `QimiError::AmbiguousSelection` when auto-detection cannot decide,
    /// or the discovery error.
    pub fn select_partition(
        &self,
        device: &Path,
        requested: Option<u32>,
    ) -> Result<PartitionDescriptor> {
        if let Some(number) = requested {
            let path = partition_path(device, number);
            if !path.exists() {
                return Err(QimiError::NotFound {
                    kind: "partition",
                    id: path.display().to_string(),
                });
            }
            return Ok(PartitionDescriptor {
                number: Some(number),
                path,
                fstype: None,
                size_bytes: None,
            });
        }

        let (base, partitions) = self.discover(device)?;
        let chosen = select::choose_partition(&base, &partitions)?;
        tracing::info!(
            partition = %chosen.path.display(),
            fstype = chosen.fstype.as_deref().unwrap_or("-"),
            "selected partition"
        );
        Ok(chosen)
    }

    /// Lists the base device and its partitions as reported by `lsblk`.
    ///
    /// If `lsblk` itself fails but the device node exists, the device is
    /// reported without partitions so the caller can try it directly.
    ///
    /// # Errors
    ///
    /// Returns the `lsblk` failure when the device node is also missing.
    pub fn discover(
        &self,
        device: &Path,
    ) -> Result<(PartitionDescriptor, Vec<PartitionDescriptor>)> {
        let mut base = PartitionDescriptor {
            number: None,
            path: device.to_path_buf(),
            fstype: None,
            size_bytes: None,
        };

        let inv = Invocation::new("lsblk")
            .args(["-b", "-P", "-n", "-o", "NAME,FSTYPE,SIZE"])
            .arg(device);
        let output = match self.runner.output(&inv).and_then(|out| out.check(&inv)) {
            Ok(out) => out,
            Err(e) if device.exists() => {
                tracing::warn!(device = %device.display(), error = %e, "lsblk failed, using device directly");
                return Ok((base, Vec::new()));
            }
            Err(e) => return Err(e),
        };

        let base_name = device
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut partitions = Vec::new();
        for entry in lsblk::parse_pairs(&output.stdout) {
            if entry.name == base_name {
                base.fstype = entry.fstype;
                base.size_bytes = entry.size_bytes;
                continue;
            }
            let Some(number) = entry
                .name
                .strip_prefix(&base_name)
                .and_then(|rest| rest.strip_prefix('p'))
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            tracing::debug!(
                partition = %entry.name,
                fstype = entry.fstype.as_deref().unwrap_or("-"),
                size = entry.size_bytes,
                "found partition"
            );
            partitions.push(PartitionDescriptor {
                number: Some(number),
                path: device.with_file_name(&entry.name),
                fstype: entry.fstype,
                size_bytes: entry.size_bytes,
            });
        }
        Ok((base, partitions))
    }
}

/// Device node of partition `number` on `device` (`/dev/nbd0` → `/dev/nbd0p2`).
#[must_use]
pub fn partition_path(device: &Path, number: u32) -> PathBuf {
    let mut raw = device.as_os_str().to_os_string();
    raw.push(format!("p{number}"));
    PathBuf::from(raw)
}
