//! Running commands chrooted into a mounted image.
//!
//! One [`Executor::execute`] call walks a fixed sequence: check the mount
//! point, mount the namespace set, swap in a resolv.conf, run the command,
//! restore resolv.conf. Restoring is armed before the command starts and
//! happens on every way out. Namespace teardown is a separate step the
//! caller drives with [`Executor::cleanup_namespace`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use qimi_common::config::QimiConfig;
use qimi_common::error::{QimiError, Result};
use qimi_core::command::{CommandRunner, Invocation};
use qimi_core::dns::{self, ResolvConfGuard, ResolvConfManager};
use qimi_core::namespace::NamespaceManager;
use qimi_core::namespace::ops::MountOps;

/// What to run and how.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecRequest {
    /// Guest root.
    pub mount_point: PathBuf,
    /// Program to run, resolved inside the guest.
    pub command: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Attach our stdin to the program.
    pub interactive: bool,
    /// Nameservers for the guest's resolv.conf; empty copies the host's.
    pub nameservers: Vec<String>,
}

/// Runs commands inside mounted images.
pub struct Executor {
    runner: Arc<dyn CommandRunner>,
    namespace: NamespaceManager,
    dns: ResolvConfManager,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("namespace", &self.namespace)
            .field("dns", &self.dns)
            .finish_non_exhaustive()
    }
}

impl Executor {
    /// Creates an executor using the configured mount set and paths.
    /// `mounts` issues the namespace mounts; `runner` runs the guest.
    pub fn new(
        config: &QimiConfig,
        runner: Arc<dyn CommandRunner>,
        mounts: Arc<dyn MountOps>,
    ) -> Self {
        Self {
            namespace: NamespaceManager::new(
                mounts,
                config.namespace_mounts.clone(),
                config.teardown_prefixes.clone(),
                config.mount_table.clone(),
            ),
            dns: ResolvConfManager::new(&config.backup_dir, &config.host_resolv_conf),
            runner,
        }
    }

    /// Runs `request.command` chrooted into `request.mount_point` and
    /// returns its exit code.
    ///
    /// Namespace mounts and the resolv.conf swap are best-effort: their
    /// failures are logged and the command still runs. Nameservers are
    /// checked before anything is touched, so a bad entry fails the call
    /// with the guest unchanged.
    ///
    /// # Errors
    ///
    /// Returns `QimiError::NotFound` if the mount point is missing,
    /// `QimiError::InvalidNameserver` for a non-IP nameserver, or an error
    /// if `chroot` cannot be started.
    pub fn execute(&self, request: &ExecRequest) -> Result<i32> {
        let root = request.mount_point.as_path();
        tracing::debug!(
            mount_point = %root.display(),
            command = %request.command,
            args = ?request.args,
            interactive = request.interactive,
            nameservers = ?request.nameservers,
            "starting execution"
        );

        if !root.is_dir() {
            tracing::error!(mount_point = %root.display(), "mount point validation failed");
            return Err(QimiError::NotFound {
                kind: "mount point",
                id: root.display().to_string(),
            });
        }
        dns::validate_nameservers(&request.nameservers)?;

        let mounted = self.namespace.setup(root);
        tracing::debug!(mounted, "namespace ready");

        let _restore = ResolvConfGuard::new(&self.dns, root);
        match self.dns.install(root, &request.nameservers) {
            Ok(()) => tracing::debug!("resolv.conf set up"),
            Err(e) => tracing::warn!(error = %e, "failed to set up resolv.conf"),
        }

        let inv = Invocation::new("chroot")
            .arg(root)
            .arg(&request.command)
            .args(&request.args);
        tracing::debug!(command = %inv, "running in chroot");
        let code = self.runner.attached(&inv, request.interactive)?;
        if code == 0 {
            tracing::debug!("command completed");
        } else {
            tracing::info!(code, "command exited with nonzero status");
        }
        Ok(code)
    }

    /// Tears down the namespace mount set under `mount_point`.
    ///
    /// # Errors
    ///
    /// Returns `QimiError::SafetyRejected` if `mount_point` fails the
    /// host-protection checks; no unmount is issued in that case.
    pub fn cleanup_namespace(&self, mount_point: &Path) -> Result<()> {
        self.namespace.teardown(mount_point)
    }
}
