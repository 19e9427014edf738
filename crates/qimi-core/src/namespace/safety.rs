//! Host-protection checks applied before any namespace unmount.
//!
//! Teardown builds unmount targets by string concatenation, so a bad
//! mount point (empty, `/`, a host pseudo-filesystem) or a traversal
//! component would point `umount` at the host itself. Every target is
//! checked here first.

use std::path::{Component, Path};

use qimi_common::constants::PROTECTED_PATHS;
use qimi_common::error::{QimiError, Result};
use qimi_common::types::NamespaceMount;

fn rejected(path: &str, reason: impl Into<String>) -> QimiError {
    QimiError::SafetyRejected {
        path: path.to_string(),
        reason: reason.into(),
    }
}

fn has_parent_component(path: &Path) -> bool {
    path.components().any(|c| matches!(c, Component::ParentDir))
}

/// Validates a guest root for teardown and returns it slash-terminated.
///
/// # Errors
///
/// Returns `QimiError::SafetyRejected` if the path is empty, is one of the
/// protected host paths, contains `..`, or lies outside every allowed
/// prefix.
pub fn validate_teardown_root(mount_point: &Path, allowed_prefixes: &[String]) -> Result<String> {
    let Some(raw) = mount_point.to_str() else {
        return Err(rejected(
            &mount_point.to_string_lossy(),
            "mount point is not valid UTF-8",
        ));
    };
    let trimmed = raw.trim_end_matches('/');
    let normalized = if trimmed.is_empty() && !raw.is_empty() {
        "/"
    } else {
        trimmed
    };

    if normalized.is_empty() {
        return Err(rejected(raw, "mount point is empty"));
    }
    if PROTECTED_PATHS.contains(&normalized) {
        return Err(rejected(raw, "mount point is a protected host path"));
    }
    if has_parent_component(mount_point) {
        return Err(rejected(raw, "mount point contains '..'"));
    }
    if !allowed_prefixes
        .iter()
        .any(|p| normalized.starts_with(p.as_str()))
    {
        return Err(rejected(
            raw,
            format!("mount point is outside the allowed areas {allowed_prefixes:?}"),
        ));
    }
    Ok(format!("{normalized}/"))
}

/// Computes the unmount target for `entry` under the slash-terminated
/// `root`, or `None` if it would escape the root.
#[must_use]
pub fn contained_target(root: &str, entry: &NamespaceMount) -> Option<String> {
    let relative = entry.relative_target();
    if relative.is_empty() || has_parent_component(Path::new(relative)) {
        return None;
    }
    let target = format!("{root}{relative}");
    target.starts_with(root).then_some(target)
}

#[cfg(test)]
mod tests {
    use qimi_common::types::MountKind;

    use super::*;

    fn prefixes() -> Vec<String> {
        vec!["/tmp/".into(), "/mnt/".into()]
    }

    fn entry(target: &str) -> NamespaceMount {
        NamespaceMount {
            source: "none".into(),
            target: target.into(),
            kind: MountKind::Filesystem {
                fstype: "proc".into(),
            },
        }
    }

    #[test]
    fn protected_paths_are_rejected() {
        for bad in ["", "/", "/dev", "/proc", "/sys", "/sys/", "//"] {
            let err = validate_teardown_root(Path::new(bad), &prefixes()).expect_err(bad);
            assert!(matches!(err, QimiError::SafetyRejected { .. }), "{bad}");
        }
    }

    #[test]
    fn paths_outside_prefixes_are_rejected() {
        for bad in ["/home/user/img.mount", "/tmp", "/tmpfoo/x", "/var/tmp/x", "relative/x"] {
            assert!(validate_teardown_root(Path::new(bad), &prefixes()).is_err(), "{bad}");
        }
    }

    #[test]
    fn traversal_is_rejected() {
        assert!(validate_teardown_root(Path::new("/tmp/../etc"), &prefixes()).is_err());
    }

    #[test]
    fn accepted_root_is_slash_terminated() {
        let root =
            validate_teardown_root(Path::new("/tmp/qimi/mounts/a.mount"), &prefixes()).unwrap();
        assert_eq!(root, "/tmp/qimi/mounts/a.mount/");
        let root = validate_teardown_root(Path::new("/mnt/x/"), &prefixes()).unwrap();
        assert_eq!(root, "/mnt/x/");
    }

    #[test]
    fn targets_stay_inside_root() {
        let root = "/tmp/qimi/mounts/a.mount/";
        assert_eq!(
            contained_target(root, &entry("/proc")).as_deref(),
            Some("/tmp/qimi/mounts/a.mount/proc")
        );
        assert_eq!(contained_target(root, &entry("/../../etc")), None);
        assert_eq!(contained_target(root, &entry("/")), None);
    }
}
