//! Scratch host layout shared by this crate's unit tests.

use std::path::{Path, PathBuf};

use qimi_common::config::QimiConfig;

/// A temporary directory laid out like the host paths qimi touches.
///
/// Lives under `/tmp` so namespace teardown accepts its mount points.
pub struct FakeHost {
    _dir: tempfile::TempDir,
    pub root: PathBuf,
    pub config: QimiConfig,
}

impl FakeHost {
    pub fn new() -> Self {
        let dir = tempfile::Builder::new()
            .prefix("qimi-rt")
            .tempdir_in("/tmp")
            .expect("tempdir");
        let root = dir.path().to_path_buf();

        let mut config = QimiConfig::rooted_at(&root.join("data"));
        config.device_pool.device_prefix = root.join("dev/nbd").display().to_string();
        config.device_pool.size = 4;
        config.device_pool.sysfs_dir = root.join("sys/block");
        config.device_pool.modules_file = root.join("modules");
        config.device_pool.settle_delay_ms = 0;
        config.host_resolv_conf = root.join("host-resolv.conf");
        config.mount_table = root.join("mounts");

        std::fs::create_dir_all(root.join("dev")).expect("dev");
        std::fs::create_dir_all(&config.device_pool.sysfs_dir).expect("sysfs");
        std::fs::write(&config.device_pool.modules_file, "nbd 45056 0 - Live 0x0\n")
            .expect("modules");
        std::fs::write(&config.host_resolv_conf, "nameserver 10.0.0.53\n").expect("resolv");
        std::fs::write(&config.mount_table, "").expect("mount table");

        Self {
            _dir: dir,
            root,
            config,
        }
    }

    /// Creates an image file and returns its path.
    pub fn image(&self, name: &str) -> PathBuf {
        let path = self.root.join(name);
        std::fs::write(&path, b"QFI\xfb").expect("image");
        path
    }

    /// Marks slot `index` as owned by `pid`.
    pub fn claim_slot(&self, index: usize, pid: i32) {
        let dir = self
            .config
            .device_pool
            .sysfs_dir
            .join(format!("nbd{index}"));
        std::fs::create_dir_all(&dir).expect("slot dir");
        std::fs::write(dir.join("pid"), format!("{pid}\n")).expect("pid");
    }

    /// Adds `target` to the fake live mount table.
    pub fn mark_mounted(&self, target: &Path) {
        let mut table = std::fs::read_to_string(&self.config.mount_table).expect("read table");
        table.push_str(&format!("/dev/nbd0p1 {} ext4 rw 0 0\n", target.display()));
        std::fs::write(&self.config.mount_table, table).expect("write table");
    }

    /// `lsblk -P` output for slot 0 with one ext4 partition.
    pub fn single_partition_listing() -> &'static str {
        "NAME=\"nbd0\" FSTYPE=\"\" SIZE=\"10737418240\"\nNAME=\"nbd0p1\" FSTYPE=\"ext4\" SIZE=\"10736369664\"\n"
    }
}
