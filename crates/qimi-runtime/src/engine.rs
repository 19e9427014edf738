//! Engine that ties mounting, execution and the mount table together.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use qimi_common::config::QimiConfig;
use qimi_common::error::{QimiError, Result};
use qimi_common::types::MountRecord;
use qimi_core::command::{CommandRunner, SystemRunner};
use qimi_core::namespace::ops::{MountOps, SyscallMounts};
use qimi_core::nbd::select::parse_partition_number;

use crate::exec::{ExecRequest, Executor};
use crate::mounter::MountManager;
use crate::state::MountStore;

/// A mount table entry with its liveness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountStatus {
    /// The persisted record.
    pub record: MountRecord,
    /// Whether the mount is still live.
    pub active: bool,
}

/// Options for [`Engine::exec`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOptions {
    /// Program to run inside the guest.
    pub command: String,
    /// Its arguments.
    pub args: Vec<String>,
    /// Attach stdin.
    pub interactive: bool,
    /// Mount read-only when the image is mounted just for this run.
    pub read_only: bool,
    /// Nameservers for the guest's resolv.conf.
    pub nameservers: Vec<String>,
}

/// Coordinates every qimi operation.
///
/// Built once per invocation from the configuration, a command runner and
/// the namespace mount calls; these are the only ways any component
/// reaches the host.
#[derive(Debug)]
pub struct Engine {
    config: QimiConfig,
    mounter: MountManager,
    executor: Executor,
    store: MountStore,
}

impl Engine {
    /// Creates an engine that runs real host tools.
    ///
    /// # Errors
    ///
    /// Returns an error if the mount table cannot be opened.
    pub fn new(config: QimiConfig) -> Result<Self> {
        Self::with_host(config, Arc::new(SystemRunner), Arc::new(SyscallMounts))
    }

    /// Creates an engine around a custom command runner and mount calls.
    ///
    /// # Errors
    ///
    /// Returns an error if the mount table cannot be opened.
    pub fn with_host(
        config: QimiConfig,
        runner: Arc<dyn CommandRunner>,
        mounts: Arc<dyn MountOps>,
    ) -> Result<Self> {
        let store = MountStore::open(&config)?;
        Ok(Self {
            mounter: MountManager::new(&config, Arc::clone(&runner)),
            executor: Executor::new(&config, runner, mounts),
            store,
            config,
        })
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &QimiConfig {
        &self.config
    }

    /// The mount table.
    #[must_use]
    pub const fn store(&self) -> &MountStore {
        &self.store
    }

    /// Verifies the nbd module and the external tools are available.
    ///
    /// # Errors
    ///
    /// Returns `QimiError::DependencyMissing` naming what is absent.
    pub fn check_dependencies(&self) -> Result<()> {
        self.mounter.allocator().check_dependencies()
    }

    /// Mounts `image` and records it, under `name` if given.
    ///
    /// `partition` accepts `"2"`, `"p2"` or `"partition2"`; anything
    /// without a number auto-detects. If the record cannot be saved the
    /// image is unmounted again.
    ///
    /// # Errors
    ///
    /// Returns `QimiError::AlreadyExists` for a taken alias, or any
    /// mount or persistence error.
    pub fn mount(
        &self,
        image: &Path,
        name: Option<&str>,
        read_only: bool,
        partition: Option<&str>,
    ) -> Result<MountRecord> {
        if let Some(name) = name {
            if self.store.get(name).is_some_and(|r| r.name.as_deref() == Some(name)) {
                return Err(QimiError::AlreadyExists {
                    kind: "mount name",
                    id: name.to_string(),
                });
            }
        }
        let number = partition.and_then(parse_partition_number);
        let mount_point = self.mounter.mount(image, read_only, number)?;

        let record = MountRecord {
            image_path: absolute_display(image),
            mount_point,
            name: name.map(str::to_string),
            read_only,
            mounted_at: chrono::Utc::now().to_rfc3339(),
        };
        if let Err(e) = self.store.add(record.clone()) {
            tracing::error!(error = %e, "failed to record mount, undoing it");
            if let Err(undo) = self.mounter.unmount(&record.mount_point) {
                tracing::warn!(error = %undo, "failed to undo mount");
            }
            return Err(e);
        }
        Ok(record)
    }

    /// Unmounts the image known as `target` (alias or image path) and
    /// forgets it.
    ///
    /// # Errors
    ///
    /// Returns `QimiError::NotFound` for an unknown target, or the unmount
    /// failure, in which case the record is kept.
    pub fn unmount(&self, target: &str) -> Result<MountRecord> {
        let record = self.lookup(target).ok_or_else(|| QimiError::NotFound {
            kind: "mount",
            id: target.to_string(),
        })?;
        self.mounter.unmount(&record.mount_point)?;
        self.store.remove(record.key())
    }

    /// Every recorded mount with its liveness.
    #[must_use]
    pub fn list(&self) -> Vec<MountStatus> {
        self.store
            .list()
            .into_iter()
            .map(|record| MountStatus {
                active: self.store.is_valid(&record),
                record,
            })
            .collect()
    }

    /// Runs a command inside `target` and returns its exit code.
    ///
    /// `target` is a recorded alias or image path, or an image file that
    /// is then mounted just for this run. Afterwards the namespace mounts
    /// are torn down and a temporary mount is unmounted; failures there
    /// are logged and do not change the result.
    ///
    /// # Errors
    ///
    /// Returns `QimiError::NotFound` if `target` is neither recorded nor
    /// an existing file, a mount error for a temporary mount, or the
    /// execution error.
    pub fn exec(&self, target: &str, options: &ExecOptions) -> Result<i32> {
        let (mount_point, temporary) = match self.lookup(target) {
            Some(record) => (record.mount_point, false),
            None if Path::new(target).is_file() => {
                tracing::debug!(image = target, "not mounted, mounting for this run");
                (
                    self.mounter
                        .mount(Path::new(target), options.read_only, None)?,
                    true,
                )
            }
            None => {
                return Err(QimiError::NotFound {
                    kind: "mount",
                    id: target.to_string(),
                });
            }
        };

        let result = self.executor.execute(&ExecRequest {
            mount_point: mount_point.clone(),
            command: options.command.clone(),
            args: options.args.clone(),
            interactive: options.interactive,
            nameservers: options.nameservers.clone(),
        });

        if let Err(e) = self.executor.cleanup_namespace(&mount_point) {
            tracing::warn!(error = %e, "failed to clean up namespace mounts");
        }
        if temporary {
            if let Err(e) = self.mounter.unmount(&mount_point) {
                tracing::warn!(error = %e, "failed to unmount temporary mount");
            }
        }
        result
    }

    /// Drops stale mount table entries and returns how many went.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be saved.
    pub fn cleanup(&self) -> Result<usize> {
        self.store.cleanup_stale()
    }

    /// Finds a record by the string given, then by its absolute form.
    fn lookup(&self, target: &str) -> Option<MountRecord> {
        self.store.get(target).or_else(|| {
            let absolute = absolute_display(Path::new(target));
            (absolute != target)
                .then(|| self.store.get(&absolute))
                .flatten()
        })
    }
}

fn absolute_display(path: &Path) -> String {
    std::path::absolute(path)
        .unwrap_or_else(|_| PathBuf::from(path))
        .display()
        .to_string()
}
