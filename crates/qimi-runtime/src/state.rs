//! Persistent mount table.
//!
//! A JSON map from alias (or image path, for unnamed mounts) to
//! [`MountRecord`]. One mutex serializes read/modify/write inside this
//! process; nothing coordinates separate `qimi` processes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use qimi_common::config::QimiConfig;
use qimi_common::error::{QimiError, Result};
use qimi_common::types::MountRecord;
use qimi_core::mount_table::MountTable;

use crate::mounter::device_record_path;

/// The persisted alias/path → mount record table.
#[derive(Debug)]
pub struct MountStore {
    path: PathBuf,
    metadata_dir: PathBuf,
    mount_table: PathBuf,
    mounts: Mutex<BTreeMap<String, MountRecord>>,
}

impl MountStore {
    /// Opens the store described by `config`, creating its directory.
    /// A missing state file is an empty store.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file
    /// exists but cannot be read or parsed.
    pub fn open(config: &QimiConfig) -> Result<Self> {
        let path = config.state_file.clone();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| QimiError::io(dir, e))?;
        }
        let mounts = match std::fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => BTreeMap::new(),
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(QimiError::io(&path, e)),
        };
        tracing::debug!(path = %path.display(), entries = mounts.len(), "mount table loaded");
        Ok(Self {
            path,
            metadata_dir: config.metadata_dir.clone(),
            mount_table: config.mount_table.clone(),
            mounts: Mutex::new(mounts),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, MountRecord>> {
        self.mounts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a mount under its alias, or its image path if unnamed.
    ///
    /// # Errors
    ///
    /// Returns `QimiError::AlreadyExists` if the alias is taken, or an
    /// error from persisting the table.
    pub fn add(&self, record: MountRecord) -> Result<()> {
        let mut mounts = self.lock();
        let key = record.key().to_string();
        if record.name.is_some() && mounts.contains_key(&key) {
            return Err(QimiError::AlreadyExists {
                kind: "mount name",
                id: key,
            });
        }
        tracing::debug!(key = %key, mount_point = %record.mount_point.display(), "recording mount");
        let _ = mounts.insert(key, record);
        self.save(&mounts)
    }

    /// Removes the record answering to `alias_or_path` and returns it.
    ///
    /// # Errors
    ///
    /// Returns `QimiError::NotFound` if nothing matches, or an error from
    /// persisting the table.
    pub fn remove(&self, alias_or_path: &str) -> Result<MountRecord> {
        let mut mounts = self.lock();
        let key = find_key(&mounts, alias_or_path).ok_or_else(|| QimiError::NotFound {
            kind: "mount",
            id: alias_or_path.to_string(),
        })?;
        let record = mounts.remove(&key).ok_or_else(|| QimiError::NotFound {
            kind: "mount",
            id: alias_or_path.to_string(),
        })?;
        self.save(&mounts)?;
        Ok(record)
    }

    /// Looks a record up by alias, then by image path.
    #[must_use]
    pub fn get(&self, alias_or_path: &str) -> Option<MountRecord> {
        let mounts = self.lock();
        find_key(&mounts, alias_or_path).and_then(|k| mounts.get(&k).cloned())
    }

    /// Every record, ordered by key.
    #[must_use]
    pub fn list(&self) -> Vec<MountRecord> {
        self.lock().values().cloned().collect()
    }

    /// Whether `record` still describes a live mount: its directory
    /// exists, its device record exists, and the live mount table lists it.
    #[must_use]
    pub fn is_valid(&self, record: &MountRecord) -> bool {
        if !record.mount_point.exists() {
            return false;
        }
        if !device_record_path(&self.metadata_dir, &record.mount_point).exists() {
            return false;
        }
        MountTable::read(&self.mount_table).is_ok_and(|t| t.contains(&record.mount_point))
    }

    /// Drops every record that fails [`MountStore::is_valid`] and returns
    /// how many were dropped.
    ///
    /// # Errors
    ///
    /// Returns an error from persisting the table.
    pub fn cleanup_stale(&self) -> Result<usize> {
        let mut mounts = self.lock();
        let before = mounts.len();
        mounts.retain(|key, record| {
            let keep = self.is_valid(record);
            if !keep {
                tracing::info!(key = %key, mount_point = %record.mount_point.display(), "dropping stale mount");
            }
            keep
        });
        let removed = before - mounts.len();
        if removed > 0 {
            self.save(&mounts)?;
        }
        Ok(removed)
    }

    /// Writes the table to a sibling temp file, then renames it over the
    /// state file.
    fn save(&self, mounts: &BTreeMap<String, MountRecord>) -> Result<()> {
        let json = serde_json::to_string_pretty(mounts)?;
        let tmp = temp_path(&self.path);
        std::fs::write(&tmp, json).map_err(|e| QimiError::io(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| QimiError::io(&self.path, e))?;
        tracing::debug!(path = %self.path.display(), entries = mounts.len(), "mount table saved");
        Ok(())
    }
}

fn find_key(mounts: &BTreeMap<String, MountRecord>, alias_or_path: &str) -> Option<String> {
    if mounts.contains_key(alias_or_path) {
        return Some(alias_or_path.to_string());
    }
    mounts
        .iter()
        .find(|(_, r)| r.matches(alias_or_path))
        .map(|(k, _)| k.clone())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(std::ffi::OsStr::to_os_string).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHost;

    fn record(image: &str, name: Option<&str>, host: &FakeHost) -> MountRecord {
        let base = Path::new(image).file_name().unwrap().to_string_lossy().into_owned();
        MountRecord {
            image_path: image.to_string(),
            mount_point: host.config.mount_dir.join(format!("{base}.mount")),
            name: name.map(str::to_string),
            read_only: false,
            mounted_at: "2026-10-16T08:00:00+00:00".into(),
        }
    }

    fn make_live(host: &FakeHost, rec: &MountRecord) {
        std::fs::create_dir_all(&rec.mount_point).unwrap();
        std::fs::create_dir_all(&host.config.metadata_dir).unwrap();
        std::fs::write(
            device_record_path(&host.config.metadata_dir, &rec.mount_point),
            "/dev/nbd0",
        )
        .unwrap();
        host.mark_mounted(&rec.mount_point);
    }

    #[test]
    fn missing_file_is_empty_store() {
        let host = FakeHost::new();
        let store = MountStore::open(&host.config).expect("open");
        assert!(store.list().is_empty());
    }

    #[test]
    fn records_persist_across_reopen() {
        let host = FakeHost::new();
        let store = MountStore::open(&host.config).unwrap();
        store.add(record("/img/a.qcow2", Some("web"), &host)).unwrap();
        store.add(record("/img/b.raw", None, &host)).unwrap();
        drop(store);

        let store = MountStore::open(&host.config).unwrap();
        let keys: Vec<String> = store.list().iter().map(|r| r.key().to_string()).collect();
        assert_eq!(keys, ["/img/b.raw", "web"]);
        assert!(!temp_path(&host.config.state_file).exists());
    }

    #[test]
    fn lookup_by_alias_or_path() {
        let host = FakeHost::new();
        let store = MountStore::open(&host.config).unwrap();
        store.add(record("/img/a.qcow2", Some("web"), &host)).unwrap();
        assert_eq!(store.get("web").unwrap().image_path, "/img/a.qcow2");
        assert_eq!(store.get("/img/a.qcow2").unwrap().name.as_deref(), Some("web"));
        assert!(store.get("nope").is_none());
    }

    #[test]
    fn duplicate_alias_is_rejected() {
        let host = FakeHost::new();
        let store = MountStore::open(&host.config).unwrap();
        store.add(record("/img/a.qcow2", Some("web"), &host)).unwrap();
        let err = store
            .add(record("/img/b.qcow2", Some("web"), &host))
            .expect_err("duplicate");
        assert!(matches!(err, QimiError::AlreadyExists { .. }));
        assert_eq!(store.get("web").unwrap().image_path, "/img/a.qcow2");
    }

    #[test]
    fn remove_by_path_finds_named_record() {
        let host = FakeHost::new();
        let store = MountStore::open(&host.config).unwrap();
        store.add(record("/img/a.qcow2", Some("web"), &host)).unwrap();
        let removed = store.remove("/img/a.qcow2").unwrap();
        assert_eq!(removed.name.as_deref(), Some("web"));
        assert!(store.list().is_empty());
        assert!(matches!(
            store.remove("web"),
            Err(QimiError::NotFound { kind: "mount", .. })
        ));
    }

    #[test]
    fn validity_needs_directory_record_and_table_entry() {
        let host = FakeHost::new();
        let store = MountStore::open(&host.config).unwrap();
        let rec = record("/img/a.qcow2", None, &host);
        assert!(!store.is_valid(&rec));

        std::fs::create_dir_all(&rec.mount_point).unwrap();
        assert!(!store.is_valid(&rec), "no device record yet");

        make_live(&host, &rec);
        assert!(store.is_valid(&rec));
    }

    #[test]
    fn cleanup_drops_only_stale_records() {
        let host = FakeHost::new();
        let store = MountStore::open(&host.config).unwrap();
        let live = record("/img/live.qcow2", Some("live"), &host);
        make_live(&host, &live);
        store.add(live).unwrap();
        store.add(record("/img/gone.qcow2", None, &host)).unwrap();

        assert_eq!(store.cleanup_stale().unwrap(), 1);
        assert_eq!(store.cleanup_stale().unwrap(), 0);
        let reopened = MountStore::open(&host.config).unwrap();
        assert_eq!(reopened.list().len(), 1);
        assert!(reopened.get("live").is_some());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let host = FakeHost::new();
        std::fs::create_dir_all(host.config.state_file.parent().unwrap()).unwrap();
        std::fs::write(&host.config.state_file, "{not json").unwrap();
        assert!(matches!(
            MountStore::open(&host.config),
            Err(QimiError::Serialization { .. })
        ));
    }
}
