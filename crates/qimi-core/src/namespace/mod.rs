//! Namespace mount set for chroot execution.
//!
//! Mounts the configured virtual filesystems (proc, sysfs, a recursive
//! bind of `/dev`, tmpfs) under a guest root so ordinary programs work
//! inside the chroot, and removes them again in reverse order.

pub mod ops;
pub mod safety;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use qimi_common::error::Result;
use qimi_common::types::NamespaceMount;

use crate::mount_table;
use ops::MountOps;

/// Sets up and tears down the namespace mount set under guest roots.
pub struct NamespaceManager {
    ops: Arc<dyn MountOps>,
    mounts: Vec<NamespaceMount>,
    teardown_prefixes: Vec<String>,
    mount_table: PathBuf,
}

impl std::fmt::Debug for NamespaceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespaceManager")
            .field("mounts", &self.mounts)
            .field("teardown_prefixes", &self.teardown_prefixes)
            .field("mount_table", &self.mount_table)
            .finish_non_exhaustive()
    }
}

impl NamespaceManager {
    /// Creates a manager for the given mount set.
    pub fn new(
        ops: Arc<dyn MountOps>,
        mounts: Vec<NamespaceMount>,
        teardown_prefixes: Vec<String>,
        mount_table: PathBuf,
    ) -> Self {
        Self {
            ops,
            mounts,
            teardown_prefixes,
            mount_table,
        }
    }

    /// The mount set, in setup order.
    #[must_use]
    pub fn mounts(&self) -> &[NamespaceMount] {
        &self.mounts
    }

    /// Mounts every entry under `root`.
    ///
    /// Nothing here is fatal: an entry whose target directory cannot be
    /// created is skipped, and a failed mount is logged. The guest command
    /// still runs, possibly without some of these filesystems. Returns the
    /// number of entries mounted.
    pub fn setup(&self, root: &Path) -> usize {
        let total = self.mounts.len();
        let mut mounted = 0;
        for (i, entry) in self.mounts.iter().enumerate() {
            let target = entry.target_under(root);
            tracing::debug!(
                step = i + 1,
                total,
                source = %entry.source,
                target = %target.display(),
                kind = %entry.kind,
                "preparing namespace mount"
            );
            if let Err(e) = std::fs::create_dir_all(&target) {
                tracing::debug!(target = %target.display(), error = %e, "cannot create target, skipping");
                continue;
            }

            match self.ops.mount(entry, &target) {
                Ok(()) => {
                    mounted += 1;
                    tracing::debug!(target = %target.display(), "namespace mount ready");
                }
                Err(e) => tracing::warn!(
                    call = %ops::render_mount(entry, &target),
                    error = %e,
                    "namespace mount failed"
                ),
            }
        }
        tracing::debug!(mounted, total, "namespace setup finished");
        mounted
    }

    /// Unmounts the mount set under `root` in reverse order.
    ///
    /// The root is validated first; if it fails any host-protection check
    /// no unmount is issued at all. Individual entries that would escape
    /// the root or are not in the live mount table are skipped. Each
    /// remaining entry gets a normal unmount, then a lazy one; a failure of
    /// both is logged and teardown moves on to the next entry.
    ///
    /// # Errors
    ///
    /// Returns `QimiError::SafetyRejected` if `root` is unsafe.
    pub fn teardown(&self, root: &Path) -> Result<()> {
        let root = safety::validate_teardown_root(root, &self.teardown_prefixes).inspect_err(
            |e| tracing::error!(error = %e, "namespace teardown refused"),
        )?;

        let total = self.mounts.len();
        for (i, entry) in self.mounts.iter().rev().enumerate() {
            let Some(target) = safety::contained_target(&root, entry) else {
                tracing::warn!(root = %root, entry = %entry.target, "skipping unmount target outside the guest root");
                continue;
            };
            tracing::debug!(step = i + 1, total, target = %target, "namespace cleanup");

            if !mount_table::is_mounted(&self.mount_table, Path::new(&target)) {
                tracing::debug!(target = %target, "not mounted, skipping");
                continue;
            }
            self.unmount(Path::new(&target));
        }
        tracing::debug!(root = %root, "namespace teardown finished");
        Ok(())
    }

    fn unmount(&self, target: &Path) {
        let first = match self.ops.unmount(target, false) {
            Ok(()) => {
                tracing::debug!(target = %target.display(), "unmounted");
                return;
            }
            Err(e) => e,
        };
        tracing::debug!(target = %target.display(), error = %first, "standard unmount failed, trying lazy unmount");

        match self.ops.unmount(target, true) {
            Ok(()) => tracing::debug!(target = %target.display(), "lazy unmount succeeded"),
            Err(e) => tracing::warn!(target = %target.display(), error = %e, "failed to unmount"),
        }
    }
}
