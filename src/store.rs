//! Persistence of scan results (the DAO layer).
//!
//! A [`Snapshot`] holds every tracked reparse point of one volume together
//! with the journal cursor the next incremental update starts from.

use crate::{
    Fid, GhostResult, Usn,
    errors::DaoError,
    reparse::ReparseKind,
};
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

pub const SNAPSHOT_VERSION: u32 = 1;

/// Position in a specific journal instance. A cursor is only meaningful for
/// the journal id it was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalCursor {
    pub journal_id: u64,
    pub next_usn: Usn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReparsePointRecord {
    pub fid: Fid,
    pub parent_fid: Fid,
    pub path: PathBuf,
    pub kind: ReparseKind,
    pub tag: u32,
    /// Absolute target, `None` for tags without a path.
    pub target: Option<PathBuf>,
    /// Target is relative to the link's directory.
    #[serde(default)]
    pub relative: bool,
    pub is_dir: bool,
    pub ghost: bool,
    pub last_usn: Usn,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub volume: String,
    pub cursor: JournalCursor,
    pub scanned_at: DateTime<Utc>,
    pub points: BTreeMap<Fid, ReparsePointRecord>,
}

impl Snapshot {
    pub fn new(volume: impl Into<String>, cursor: JournalCursor) -> Self {
        Snapshot {
            version: SNAPSHOT_VERSION,
            volume: volume.into(),
            cursor,
            scanned_at: Utc::now(),
            points: BTreeMap::new(),
        }
    }

    pub fn ghosts(&self) -> impl Iterator<Item = &ReparsePointRecord> {
        self.points.values().filter(|point| point.ghost)
    }

    pub fn ghost_count(&self) -> usize {
        self.ghosts().count()
    }

    /// Checks that the snapshot can be used for `volume` by this build.
    pub fn check(&self, volume: &str) -> Result<(), DaoError> {
        if self.version != SNAPSHOT_VERSION {
            return Err(DaoError::UnsupportedVersion {
                found: self.version,
                expected: SNAPSHOT_VERSION,
            });
        }
        if !self.volume.eq_ignore_ascii_case(volume) {
            return Err(DaoError::VolumeMismatch {
                found: self.volume.clone(),
                expected: volume.to_string(),
            });
        }
        Ok(())
    }
}

/// Storage for the snapshot of one volume.
pub trait ReparseStore {
    /// Returns `None` if nothing was saved yet.
    fn load(&self, volume: &str) -> GhostResult<Option<Snapshot>>;

    fn save(&mut self, snapshot: &Snapshot) -> GhostResult<()>;

    fn clear(&mut self) -> GhostResult<()>;
}

/// Pretty-printed JSON file.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        JsonFileStore {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io_error(&self, path: &Path, source: io::Error) -> DaoError {
        DaoError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

impl ReparseStore for JsonFileStore {
    fn load(&self, volume: &str) -> GhostResult<Option<Snapshot>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("No snapshot at {}", self.path.display());
                return Ok(None);
            }
            Err(err) => return Err(self.io_error(&self.path, err).into()),
        };

        let snapshot: Snapshot = serde_json::from_str(&content).map_err(DaoError::from)?;
        snapshot.check(volume)?;
        debug!(
            "Loaded snapshot of {} with {} reparse points from {}",
            snapshot.volume,
            snapshot.points.len(),
            self.path.display()
        );
        Ok(Some(snapshot))
    }

    fn save(&mut self, snapshot: &Snapshot) -> GhostResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| self.io_error(parent, err))?;
        }

        let json = serde_json::to_string_pretty(snapshot).map_err(DaoError::from)?;
        // A crash mid-write leaves the previous snapshot intact.
        let temp_path = self.temp_path();
        fs::write(&temp_path, json).map_err(|err| self.io_error(&temp_path, err))?;
        fs::rename(&temp_path, &self.path).map_err(|err| self.io_error(&self.path, err))?;

        info!(
            "Saved {} reparse points to {}",
            snapshot.points.len(),
            self.path.display()
        );
        Ok(())
    }

    fn clear(&mut self) -> GhostResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(self.io_error(&self.path, err).into()),
        }
    }
}

/// Keeps the snapshot in memory only.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    snapshot: Option<Snapshot>,
    saves: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    /// Number of successful `save` calls.
    pub fn saves(&self) -> usize {
        self.saves
    }
}

impl ReparseStore for MemoryStore {
    fn load(&self, volume: &str) -> GhostResult<Option<Snapshot>> {
        match &self.snapshot {
            Some(snapshot) => {
                snapshot.check(volume)?;
                Ok(Some(snapshot.clone()))
            }
            None => Ok(None),
        }
    }

    fn save(&mut self, snapshot: &Snapshot) -> GhostResult<()> {
        self.snapshot = Some(snapshot.clone());
        self.saves += 1;
        Ok(())
    }

    fn clear(&mut self) -> GhostResult<()> {
        self.snapshot = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ErrorKind, GhostDirError, reparse::IO_REPARSE_TAG_MOUNT_POINT};
    use tempfile::TempDir;

    fn sample_snapshot() -> Snapshot {
        let mut snapshot = Snapshot::new(
            "C:",
            JournalCursor {
                journal_id: 0x1d9_0000_0000_0001,
                next_usn: 0x2000,
            },
        );
        for (fid, ghost) in [(0x40u64, false), (0x41, true)] {
            snapshot.points.insert(
                fid,
                ReparsePointRecord {
                    fid,
                    parent_fid: 0x0005_0000_0000_0005,
                    path: PathBuf::from(format!(r"C:\links\{:x}", fid)),
                    kind: ReparseKind::Junction,
                    tag: IO_REPARSE_TAG_MOUNT_POINT,
                    target: Some(PathBuf::from(r"D:\data")),
                    relative: false,
                    is_dir: true,
                    ghost,
                    last_usn: 0x1800,
                    observed_at: Utc::now(),
                },
            );
        }
        snapshot
    }

    #[test]
    fn json_store_round_trips_snapshot() {
        let dir = TempDir::new().unwrap();
        let mut store = JsonFileStore::new(dir.path().join("state").join("ghosts.json"));

        assert!(store.load("C:").unwrap().is_none());

        let snapshot = sample_snapshot();
        store.save(&snapshot).unwrap();
        assert!(!store.temp_path().exists());

        let loaded = store.load("c:").unwrap().unwrap();
        assert_eq!(loaded, snapshot);
        assert_eq!(loaded.ghost_count(), 1);
        assert_eq!(loaded.ghosts().next().map(|p| p.fid), Some(0x41));
    }

    #[test]
    fn json_store_overwrites_previous_snapshot() {
        let dir = TempDir::new().unwrap();
        let mut store = JsonFileStore::new(dir.path().join("ghosts.json"));

        let mut snapshot = sample_snapshot();
        store.save(&snapshot).unwrap();
        snapshot.points.remove(&0x40);
        snapshot.cursor.next_usn = 0x3000;
        store.save(&snapshot).unwrap();

        let loaded = store.load("C:").unwrap().unwrap();
        assert_eq!(loaded.points.len(), 1);
        assert_eq!(loaded.cursor.next_usn, 0x3000);
    }

    #[test]
    fn json_store_rejects_other_volume_and_version() {
        let dir = TempDir::new().unwrap();
        let mut store = JsonFileStore::new(dir.path().join("ghosts.json"));
        let mut snapshot = sample_snapshot();
        store.save(&snapshot).unwrap();

        let err = store.load("D:").unwrap_err();
        assert!(matches!(
            err,
            GhostDirError::Dao(DaoError::VolumeMismatch { .. })
        ));

        snapshot.version = 99;
        store.save(&snapshot).unwrap();
        let err = store.load("C:").unwrap_err();
        assert!(matches!(
            err,
            GhostDirError::Dao(DaoError::UnsupportedVersion { found: 99, .. })
        ));
    }

    #[test]
    fn json_store_reports_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ghosts.json");
        fs::write(&path, "{ not json").unwrap();

        let err = JsonFileStore::new(&path).load("C:").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Dao);
        assert!(matches!(err, GhostDirError::Dao(DaoError::Serialization(_))));
    }

    #[test]
    fn json_store_clear_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut store = JsonFileStore::new(dir.path().join("ghosts.json"));
        store.save(&sample_snapshot()).unwrap();

        store.clear().unwrap();
        assert!(!store.path().exists());
        store.clear().unwrap();
    }

    #[test]
    fn memory_store_checks_volume() {
        let mut store = MemoryStore::new();
        assert!(store.load("C:").unwrap().is_none());

        store.save(&sample_snapshot()).unwrap();
        assert_eq!(store.saves(), 1);
        assert!(store.load("C:").unwrap().is_some());
        assert_eq!(store.load("E:").unwrap_err().kind(), ErrorKind::Dao);

        store.clear().unwrap();
        assert!(store.snapshot().is_none());
    }
}
