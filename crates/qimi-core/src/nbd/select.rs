//! Root-partition selection.
//!
//! Pure functions over an already-discovered partition set, so the
//! heuristics are deterministic and testable without a block device.

use qimi_common::constants::{PREFERRED_FILESYSTEMS, ROOT_FILESYSTEMS};
use qimi_common::error::{QimiError, Result};
use qimi_common::types::PartitionDescriptor;

/// Position of `fstype` in the preference list; lower is better.
fn preference_rank(part: &PartitionDescriptor) -> Option<usize> {
    let fstype = part.normalized_fstype()?;
    PREFERRED_FILESYSTEMS.iter().position(|t| *t == fstype)
}

fn is_root_like(part: &PartitionDescriptor) -> bool {
    part.normalized_fstype()
        .is_some_and(|t| ROOT_FILESYSTEMS.contains(&t.as_str()))
}

/// Picks the partition to mount from `partitions`, the children of `base`
/// in discovery order.
///
/// 1. No partitions: the base device.
/// 2. Otherwise narrow to partitions with a recognized filesystem, and
///    further to root-like ones when any exist.
/// 3. Among the survivors keep the most preferred filesystem type; if
///    several remain, the largest wins. Unknown sizes make that tie
///    unbreakable and the call fails with `AmbiguousSelection`.
/// 4. No recognized filesystem: the first partition reporting any
///    filesystem type, else the first discovered partition.
///
/// # Errors
///
/// Returns `QimiError::AmbiguousSelection` when several equally preferred
/// partitions cannot be ranked by size.
pub fn choose_partition(
    base: &PartitionDescriptor,
    partitions: &[PartitionDescriptor],
) -> Result<PartitionDescriptor> {
    let Some(first) = partitions.first() else {
        if base.normalized_fstype().is_some() {
            tracing::debug!(device = %base.path.display(), "unpartitioned image, using base device");
        } else {
            tracing::debug!(device = %base.path.display(), "no partitions and no filesystem signature, trying base device");
        }
        return Ok(base.clone());
    };

    let typed: Vec<&PartitionDescriptor> = partitions
        .iter()
        .filter(|p| preference_rank(p).is_some())
        .collect();
    let root_like: Vec<&PartitionDescriptor> =
        typed.iter().copied().filter(|p| is_root_like(p)).collect();
    let pool = if root_like.is_empty() { typed } else { root_like };

    let Some(best_rank) = pool.iter().filter_map(|p| preference_rank(p)).min() else {
        if let Some(other) = partitions.iter().find(|p| p.normalized_fstype().is_some()) {
            tracing::debug!(
                partition = %other.path.display(),
                fstype = ?other.fstype,
                "no recognized filesystem, using first partition with any filesystem"
            );
            return Ok(other.clone());
        }
        tracing::debug!(
            partition = %first.path.display(),
            "no recognized filesystem, using first partition"
        );
        return Ok(first.clone());
    };

    let contenders: Vec<&PartitionDescriptor> = pool
        .into_iter()
        .filter(|p| preference_rank(p) == Some(best_rank))
        .collect();
    match contenders.as_slice() {
        [only] => Ok((*only).clone()),
        _ => largest(base, &contenders),
    }
}

fn largest(
    base: &PartitionDescriptor,
    contenders: &[&PartitionDescriptor],
) -> Result<PartitionDescriptor> {
    let mut best: Option<(&PartitionDescriptor, u64)> = None;
    for part in contenders {
        let Some(size) = part.size_bytes else {
            return Err(QimiError::AmbiguousSelection {
                device: base.path.clone(),
                candidates: contenders
                    .iter()
                    .map(|p| p.path.display().to_string())
                    .collect(),
            });
        };
        if best.is_none_or(|(_, s)| size > s) {
            best = Some((part, size));
        }
    }
    best.map(|(p, _)| p.clone())
        .ok_or_else(|| QimiError::AmbiguousSelection {
            device: base.path.clone(),
            candidates: Vec::new(),
        })
}

/// Extracts a partition number from an operator-supplied partition argument.
///
/// `"2"`, `"p2"` and `"partition2"` all yield 2. Blank arguments, arguments
/// without digits, and `0` mean "auto-detect" and yield `None`.
#[must_use]
pub fn parse_partition_number(arg: &str) -> Option<u32> {
    let arg = arg.trim();
    if let Ok(n) = arg.parse::<u32>() {
        return (n > 0).then_some(n);
    }
    let digits: String = arg
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse::<u32>().ok().filter(|n| *n > 0)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn base(fstype: Option<&str>) -> PartitionDescriptor {
        PartitionDescriptor {
            number: None,
            path: PathBuf::from("/dev/nbd0"),
            fstype: fstype.map(str::to_string),
            size_bytes: Some(40 * GIB),
        }
    }

    fn part(n: u32, fstype: Option<&str>, size: Option<u64>) -> PartitionDescriptor {
        PartitionDescriptor {
            number: Some(n),
            path: PathBuf::from(format!("/dev/nbd0p{n}")),
            fstype: fstype.map(str::to_string),
            size_bytes: size,
        }
    }

    #[test]
    fn larger_of_two_xfs_roots_wins() {
        let parts = [part(1, Some("xfs"), Some(10 * GIB)), part(2, Some("xfs"), Some(20 * GIB))];
        let chosen = choose_partition(&base(None), &parts).expect("select");
        assert_eq!(chosen.number, Some(2));
    }

    #[test]
    fn ext4_beats_fat32() {
        let parts = [part(1, Some("fat32"), Some(GIB)), part(2, Some("ext4"), Some(GIB))];
        let chosen = choose_partition(&base(None), &parts).expect("select");
        assert_eq!(chosen.path, PathBuf::from("/dev/nbd0p2"));
    }

    #[test]
    fn unpartitioned_device_with_filesystem_uses_base() {
        let chosen = choose_partition(&base(Some("ext4")), &[]).expect("select");
        assert_eq!(chosen.path, PathBuf::from("/dev/nbd0"));
        assert_eq!(chosen.number, None);
    }

    #[test]
    fn bare_device_without_filesystem_still_uses_base() {
        let chosen = choose_partition(&base(None), &[]).expect("select");
        assert_eq!(chosen.path, PathBuf::from("/dev/nbd0"));
    }

    #[test]
    fn single_root_among_boot_partitions() {
        let parts = [
            part(1, Some("vfat"), Some(GIB / 2)),
            part(2, Some("swap"), Some(2 * GIB)),
            part(3, Some("btrfs"), Some(30 * GIB)),
        ];
        assert_eq!(choose_partition(&base(None), &parts).unwrap().number, Some(3));
    }

    #[test]
    fn same_type_roots_without_sizes_are_ambiguous() {
        let parts = [part(1, Some("ext4"), None), part(2, Some("ext4"), Some(GIB))];
        let err = choose_partition(&base(None), &parts).expect_err("ambiguous");
        match err {
            QimiError::AmbiguousSelection { device, candidates } => {
                assert_eq!(device, PathBuf::from("/dev/nbd0"));
                assert_eq!(candidates, ["/dev/nbd0p1", "/dev/nbd0p2"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn differing_root_types_follow_preference() {
        let parts = [
            part(1, Some("btrfs"), Some(50 * GIB)),
            part(2, Some("ext3"), Some(5 * GIB)),
            part(3, Some("xfs"), None),
        ];
        assert_eq!(choose_partition(&base(None), &parts).unwrap().number, Some(2));
    }

    #[test]
    fn preferred_type_tie_uses_size_even_with_other_types_unsized() {
        let parts = [
            part(1, Some("xfs"), None),
            part(2, Some("ext4"), Some(GIB)),
            part(3, Some("ext4"), Some(3 * GIB)),
        ];
        assert_eq!(choose_partition(&base(None), &parts).unwrap().number, Some(3));
    }

    #[test]
    fn non_root_types_fall_back_to_preference() {
        let parts = [part(1, Some("vfat"), Some(GIB)), part(2, Some("ntfs"), Some(GIB))];
        assert_eq!(choose_partition(&base(None), &parts).unwrap().number, Some(2));
    }

    #[test]
    fn unrecognized_filesystem_beats_untyped_partition() {
        let parts = [
            part(1, None, Some(GIB)),
            part(2, Some("-"), Some(GIB)),
            part(3, Some("squashfs"), Some(GIB)),
        ];
        assert_eq!(choose_partition(&base(None), &parts).unwrap().number, Some(3));
    }

    #[test]
    fn untyped_partitions_use_first() {
        let parts = [part(1, None, Some(GIB)), part(2, Some(""), Some(GIB))];
        assert_eq!(choose_partition(&base(None), &parts).unwrap().number, Some(1));
    }

    #[test]
    fn equal_sizes_keep_discovery_order() {
        let parts = [part(4, Some("ext4"), Some(GIB)), part(5, Some("ext4"), Some(GIB))];
        assert_eq!(choose_partition(&base(None), &parts).unwrap().number, Some(4));
    }

    #[test]
    fn fstype_matching_is_case_insensitive() {
        let parts = [part(1, Some("VFAT"), Some(GIB)), part(2, Some("EXT4"), Some(GIB))];
        assert_eq!(choose_partition(&base(None), &parts).unwrap().number, Some(2));
    }

    #[test]
    fn selection_is_deterministic() {
        let parts = [
            part(1, Some("xfs"), Some(7 * GIB)),
            part(2, Some("xfs"), Some(9 * GIB)),
            part(3, Some("vfat"), Some(GIB)),
        ];
        let first = choose_partition(&base(None), &parts).unwrap();
        for _ in 0..10 {
            assert_eq!(choose_partition(&base(None), &parts).unwrap(), first);
        }
    }

    #[test]
    fn partition_argument_parsing() {
        assert_eq!(parse_partition_number("2"), Some(2));
        assert_eq!(parse_partition_number("p3"), Some(3));
        assert_eq!(parse_partition_number("partition12"), Some(12));
        assert_eq!(parse_partition_number(""), None);
        assert_eq!(parse_partition_number("root"), None);
        assert_eq!(parse_partition_number("0"), None);
    }
}
