//! Full scans and incremental journal updates of the reparse point set.

use crate::{
    Fid, GhostDirError, GhostResult, Usn,
    config::ScanConfig,
    driver::{JournalInfo, JournalRead, VolumeDriver},
    errors::{DaoError, DriverError, ServiceError},
    index::DirectoryIndex,
    path::PathResolver,
    record::{
        USN_REASON_BASIC_INFO_CHANGE, USN_REASON_FILE_CREATE, USN_REASON_FILE_DELETE,
        USN_REASON_RENAME_NEW_NAME, USN_REASON_RENAME_OLD_NAME, USN_REASON_REPARSE_POINT_CHANGE,
        UsnEntry,
    },
    store::{JournalCursor, ReparsePointRecord, ReparseStore, Snapshot},
};
use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

/// Journal reasons that can add, remove or move a reparse point.
pub const UPDATE_REASON_MASK: u32 = USN_REASON_FILE_CREATE
    | USN_REASON_FILE_DELETE
    | USN_REASON_RENAME_OLD_NAME
    | USN_REASON_RENAME_NEW_NAME
    | USN_REASON_REPARSE_POINT_CHANGE
    | USN_REASON_BASIC_INFO_CHANGE;

const RENAME_REASONS: u32 = USN_REASON_RENAME_OLD_NAME | USN_REASON_RENAME_NEW_NAME;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    Full,
    Incremental,
    Recheck,
}

/// Outcome of a scan, update or recheck.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub mode: ScanMode,
    /// MFT entries enumerated (full) or distinct files changed (incremental).
    pub scanned: u64,
    pub reparse_points: usize,
    pub ghosts: usize,
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    /// Entries that could not be read and were left as they were.
    pub skipped: usize,
    pub next_usn: Usn,
}

impl ScanReport {
    fn new(mode: ScanMode) -> Self {
        ScanReport {
            mode,
            scanned: 0,
            reparse_points: 0,
            ghosts: 0,
            added: 0,
            updated: 0,
            removed: 0,
            skipped: 0,
            next_usn: 0,
        }
    }
}

enum Inspection {
    Keep(ReparsePointRecord),
    /// Filtered out by kind or path.
    Ignored,
    /// No longer a reparse point.
    Gone,
    Skipped,
}

/// Keeps the stored reparse point set of one volume in step with the volume.
pub struct GhostDirService<D: VolumeDriver, S: ReparseStore> {
    driver: D,
    store: S,
    options: ScanConfig,
}

impl<D: VolumeDriver, S: ReparseStore> GhostDirService<D, S> {
    pub fn new(driver: D, store: S, options: ScanConfig) -> Self {
        GhostDirService {
            driver,
            store,
            options,
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Enumerates the whole MFT and replaces the stored snapshot.
    pub fn full_scan(&mut self) -> GhostResult<ScanReport> {
        self.check_store_volume()?;

        // Capture the cursor first so changes made during the scan are
        // replayed by the next update. The MFT is read without a USN bound:
        // a directory touched mid-scan must still reach the index.
        let journal = self
            .driver
            .query_journal(self.options.create_journal_if_inactive)?;
        let cursor = JournalCursor {
            journal_id: journal.journal_id,
            next_usn: journal.next_usn,
        };
        info!(
            "Full scan of {} from journal position {}",
            self.driver.volume_id(),
            journal.next_usn
        );

        let mut index = DirectoryIndex::new(self.driver.root());
        let mut candidates: Vec<UsnEntry> = Vec::new();
        let scanned = self
            .driver
            .enumerate_mft(Usn::MAX, &mut |entry: UsnEntry| {
                index.insert(&entry);
                if entry.is_reparse_point() {
                    candidates.push(entry);
                }
                Ok(())
            })?;
        if scanned == 0 {
            return Err(ServiceError::Aborted(format!(
                "MFT enumeration of {} returned no entries",
                self.driver.volume_id()
            ))
            .into());
        }
        debug!(
            "Enumerated {} entries, {} directories, {} reparse candidates",
            scanned,
            index.len(),
            candidates.len()
        );

        let mut snapshot = Snapshot::new(self.driver.volume_id(), cursor);
        let mut report = ScanReport::new(ScanMode::Full);
        report.scanned = scanned;

        for entry in &candidates {
            let path = match index.path_of(entry) {
                Some(path) => path,
                None => match self.driver.fid_to_path(entry.fid) {
                    Ok(path) => path,
                    Err(err) if err.is_recoverable() => {
                        warn!(
                            "Cannot rebuild the path of {:?} ({:#x}), skipping: {}",
                            entry.file_name, entry.fid, err
                        );
                        report.skipped += 1;
                        continue;
                    }
                    Err(err) => return Err(err),
                },
            };
            match self.inspect(entry, path)? {
                Inspection::Keep(record) => {
                    snapshot.points.insert(entry.fid, record);
                    report.added += 1;
                }
                Inspection::Skipped => report.skipped += 1,
                Inspection::Ignored | Inspection::Gone => {}
            }
        }

        self.finish(snapshot, report)
    }

    /// Applies the journal records written since the stored cursor, or runs a
    /// full scan when that is not possible.
    pub fn update(&mut self) -> GhostResult<ScanReport> {
        let volume = self.driver.volume_id();
        let Some(mut snapshot) = self.store.load(&volume)? else {
            info!("No snapshot of {} yet, running a full scan", volume);
            return self.full_scan();
        };

        let journal = self
            .driver
            .query_journal(self.options.create_journal_if_inactive)?;
        if let Err(err) = validate_cursor(&snapshot.cursor, &journal) {
            warn!("{}, running a full scan", err);
            return self.full_scan();
        }

        let read = JournalRead {
            journal_id: journal.journal_id,
            start_usn: snapshot.cursor.next_usn,
            reason_mask: UPDATE_REASON_MASK,
        };
        let mut changes: BTreeMap<Fid, UsnEntry> = BTreeMap::new();
        let mut dir_renamed = false;
        let next_usn = match self.driver.read_journal(&read, &mut |entry: UsnEntry| {
            if entry.is_dir() && entry.has_reason(RENAME_REASONS) {
                dir_renamed = true;
            }
            collapse(&mut changes, entry);
            Ok(())
        }) {
            Ok(next_usn) => next_usn,
            Err(GhostDirError::Driver(DriverError::JournalEntryDeleted)) => {
                warn!(
                    "Journal records after USN {} were purged, running a full scan",
                    read.start_usn
                );
                return self.full_scan();
            }
            Err(err) => return Err(err),
        };
        info!(
            "Read {} changed files from USN {} to {}",
            changes.len(),
            read.start_usn,
            next_usn
        );
        if dir_renamed && !self.options.exclude.is_empty() {
            // A moved directory can cross an exclusion in either direction.
            info!("Directory renamed with exclusions configured, running a full scan");
            return self.full_scan();
        }

        let mut report = ScanReport::new(ScanMode::Incremental);
        report.scanned = changes.len() as u64;
        self.apply_changes(&mut snapshot, changes, &mut report)?;
        if dir_renamed {
            self.reresolve_paths(&mut snapshot, &mut report)?;
        }

        snapshot.cursor.next_usn = next_usn;
        self.finish(snapshot, report)
    }

    /// Runs [`update`](Self::update) and logs the outcome.
    pub fn sync(&mut self) -> GhostResult<ScanReport> {
        let report = self.update()?;
        info!(
            "{:?} sync: {} reparse points, {} ghosts (+{} ~{} -{}, {} skipped)",
            report.mode,
            report.reparse_points,
            report.ghosts,
            report.added,
            report.updated,
            report.removed,
            report.skipped
        );
        Ok(report)
    }

    /// Re-evaluates ghost status of every stored record without reading the
    /// journal.
    pub fn recheck(&mut self) -> GhostResult<ScanReport> {
        let snapshot = self.load_snapshot()?;
        let mut report = ScanReport::new(ScanMode::Recheck);
        report.scanned = snapshot.points.len() as u64;
        self.finish(snapshot, report)
    }

    pub fn points(&self) -> GhostResult<Vec<ReparsePointRecord>> {
        Ok(self.load_snapshot()?.points.into_values().collect())
    }

    pub fn ghosts(&self) -> GhostResult<Vec<ReparsePointRecord>> {
        Ok(self
            .load_snapshot()?
            .points
            .into_values()
            .filter(|point| point.ghost)
            .collect())
    }

    pub fn journal_info(&self) -> GhostResult<JournalInfo> {
        self.driver.query_journal(false)
    }

    pub fn create_journal(&self, max_size: u64, allocation_delta: u64) -> GhostResult<JournalInfo> {
        self.driver.create_journal(max_size, allocation_delta)?;
        self.driver.query_journal(false)
    }

    /// Deletes the journal and the snapshot whose cursor pointed into it.
    pub fn delete_journal(&mut self) -> GhostResult<()> {
        self.check_store_volume()?;
        let journal = self.driver.query_journal(false)?;
        self.driver.delete_journal(journal.journal_id)?;
        self.store.clear()?;
        info!(
            "Deleted journal {:#x} of {}",
            journal.journal_id,
            self.driver.volume_id()
        );
        Ok(())
    }

    /// Fails if the store holds the snapshot of another volume. An unreadable
    /// snapshot is left to be replaced.
    fn check_store_volume(&self) -> GhostResult<()> {
        match self.store.load(&self.driver.volume_id()) {
            Ok(_) => Ok(()),
            Err(err @ GhostDirError::Dao(DaoError::VolumeMismatch { .. })) => Err(err),
            Err(err) => {
                warn!("Replacing unusable snapshot: {}", err);
                Ok(())
            }
        }
    }

    fn load_snapshot(&self) -> GhostResult<Snapshot> {
        self.store
            .load(&self.driver.volume_id())?
            .ok_or_else(|| ServiceError::NoSnapshot.into())
    }

    /// Reads and classifies the reparse point behind `entry`, found at `path`.
    fn inspect(&self, entry: &UsnEntry, path: PathBuf) -> GhostResult<Inspection> {
        if self.options.is_excluded(&path) {
            debug!("Excluded: {}", path.display());
            return Ok(Inspection::Ignored);
        }

        let target = match self.driver.read_reparse_point(entry.fid) {
            Ok(Some(target)) => target,
            Ok(None) => return Ok(Inspection::Gone),
            Err(err) if err.is_recoverable() => {
                warn!("Skipping {}: {}", path.display(), err);
                return Ok(Inspection::Skipped);
            }
            Err(err) => return Err(err),
        };
        if !self.options.wants(target.kind) {
            return Ok(Inspection::Ignored);
        }

        let resolved = target.resolve_against(&path);
        let ghost = self.is_ghost(resolved.as_deref());
        if ghost {
            debug!("Ghost {} -> {:?}", path.display(), resolved);
        }
        Ok(Inspection::Keep(ReparsePointRecord {
            fid: entry.fid,
            parent_fid: entry.parent_fid,
            path,
            kind: target.kind,
            tag: target.tag,
            target: resolved,
            relative: target.relative,
            is_dir: entry.is_dir(),
            ghost,
            last_usn: entry.usn,
            observed_at: Utc::now(),
        }))
    }

    fn is_ghost(&self, target: Option<&Path>) -> bool {
        self.options.check_targets && target.is_some_and(|target| !self.driver.target_exists(target))
    }

    fn apply_changes(
        &self,
        snapshot: &mut Snapshot,
        changes: BTreeMap<Fid, UsnEntry>,
        report: &mut ScanReport,
    ) -> GhostResult<()> {
        let mut resolver = PathResolver::new_with_cache(&self.driver);

        for entry in changes.into_values() {
            if entry.has_reason(USN_REASON_FILE_DELETE) || !entry.is_reparse_point() {
                if snapshot.points.remove(&entry.fid).is_some() {
                    debug!("Removed {:?} ({:#x})", entry.file_name, entry.fid);
                    report.removed += 1;
                }
                continue;
            }

            let Some(path) = resolver.resolve_path(&entry) else {
                warn!(
                    "Cannot resolve the path of {:?} ({:#x}), skipping",
                    entry.file_name, entry.fid
                );
                report.skipped += 1;
                continue;
            };
            match self.inspect(&entry, path)? {
                Inspection::Keep(record) => {
                    if snapshot.points.insert(entry.fid, record).is_some() {
                        report.updated += 1;
                    } else {
                        report.added += 1;
                    }
                }
                Inspection::Ignored | Inspection::Gone => {
                    if snapshot.points.remove(&entry.fid).is_some() {
                        report.removed += 1;
                    }
                }
                Inspection::Skipped => report.skipped += 1,
            }
        }
        Ok(())
    }

    /// A renamed directory moves every reparse point below it without a
    /// journal record of their own, so all stored paths are rebuilt.
    fn reresolve_paths(&self, snapshot: &mut Snapshot, report: &mut ScanReport) -> GhostResult<()> {
        let mut moved = 0usize;

        for record in snapshot.points.values_mut() {
            let path = match self.driver.fid_to_path(record.fid) {
                Ok(path) => path,
                Err(err) if err.is_recoverable() => {
                    debug!("Keeping old path of {:#x}: {}", record.fid, err);
                    continue;
                }
                Err(err) => return Err(err),
            };
            if path == record.path {
                continue;
            }
            debug!("Moved {} -> {}", record.path.display(), path.display());
            if record.relative {
                match self.driver.read_reparse_point(record.fid) {
                    Ok(Some(target)) => record.target = target.resolve_against(&path),
                    Ok(None) => {}
                    Err(err) if err.is_recoverable() => {
                        warn!("Cannot re-read {}: {}", path.display(), err);
                    }
                    Err(err) => return Err(err),
                }
            }
            record.path = path;
            moved += 1;
        }

        report.updated += moved;
        Ok(())
    }

    /// Refreshes ghost status, fills in the totals and saves the snapshot.
    fn finish(&mut self, mut snapshot: Snapshot, mut report: ScanReport) -> GhostResult<ScanReport> {
        for record in snapshot.points.values_mut() {
            let ghost = self.is_ghost(record.target.as_deref());
            if ghost != record.ghost {
                info!(
                    "{} {}",
                    if ghost { "Ghost:" } else { "Target restored:" },
                    record.path.display()
                );
                record.ghost = ghost;
            }
        }

        snapshot.scanned_at = Utc::now();
        report.reparse_points = snapshot.points.len();
        report.ghosts = snapshot.ghost_count();
        report.next_usn = snapshot.cursor.next_usn;
        self.store.save(&snapshot)?;
        Ok(report)
    }
}

/// Last record wins; reasons accumulate.
fn collapse(changes: &mut BTreeMap<Fid, UsnEntry>, entry: UsnEntry) {
    match changes.get_mut(&entry.fid) {
        Some(existing) => {
            let reason = existing.reason | entry.reason;
            *existing = entry;
            existing.reason = reason;
        }
        None => {
            changes.insert(entry.fid, entry);
        }
    }
}

/// A cursor is usable if it belongs to the live journal and points inside
/// the range of records the journal still holds.
pub fn validate_cursor(cursor: &JournalCursor, journal: &JournalInfo) -> Result<(), ServiceError> {
    if cursor.journal_id != journal.journal_id {
        return Err(ServiceError::CursorInvalid(format!(
            "journal id changed from {:#x} to {:#x}",
            cursor.journal_id, journal.journal_id
        )));
    }
    if cursor.next_usn < journal.first_usn {
        return Err(ServiceError::CursorInvalid(format!(
            "cursor USN {} precedes the first record {}",
            cursor.next_usn, journal.first_usn
        )));
    }
    if cursor.next_usn > journal.next_usn {
        return Err(ServiceError::CursorInvalid(format!(
            "cursor USN {} is ahead of the journal end {}",
            cursor.next_usn, journal.next_usn
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ErrorKind,
        reparse::{IO_REPARSE_TAG_APPEXECLINK, ReparseKind},
        store::MemoryStore,
        tests::{FAKE_JOURNAL_ID, FakeVolume, ROOT_FID, ReparseBuilder, wide},
    };

    const LINKS: Fid = 0x0001_0000_0000_0020;
    const DATA: Fid = 0x0001_0000_0000_0021;
    const JUNCTION: Fid = 0x0001_0000_0000_0030;
    const DANGLING: Fid = 0x0001_0000_0000_0031;
    const SYMLINK: Fid = 0x0001_0000_0000_0032;

    fn vol(parts: &[&str]) -> PathBuf {
        parts.iter().fold(PathBuf::from("vol"), |path, part| path.join(part))
    }

    /// vol\links\{app, old, rel}, where `old` dangles and `rel` points at
    /// vol\data through a relative symlink.
    fn sample_volume() -> FakeVolume {
        let volume = FakeVolume::new();
        volume.add_dir(LINKS, ROOT_FID, "links");
        volume.add_dir(DATA, ROOT_FID, "data");
        volume.add_file(0x0001_0000_0000_0022, DATA, "readme.txt");
        volume.add_junction(JUNCTION, LINKS, "app", r"C:\Apps\Tool");
        volume.add_junction(DANGLING, LINKS, "old", r"C:\Removed");
        volume.add_symlink(SYMLINK, LINKS, "rel", "../data", true);
        volume.add_target(r"C:\Apps\Tool");
        volume.add_target(vol(&["data"]));
        volume
    }

    fn service(volume: FakeVolume) -> GhostDirService<FakeVolume, MemoryStore> {
        GhostDirService::new(volume, MemoryStore::new(), ScanConfig::default())
    }

    fn stored(service: &GhostDirService<FakeVolume, MemoryStore>) -> &Snapshot {
        service.store().snapshot().unwrap()
    }

    #[test]
    fn full_scan_finds_reparse_points_and_ghosts() {
        let mut service = service(sample_volume());
        let report = service.full_scan().unwrap();

        assert_eq!(report.mode, ScanMode::Full);
        assert_eq!(report.scanned, 6);
        assert_eq!(report.reparse_points, 3);
        assert_eq!(report.added, 3);
        assert_eq!(report.ghosts, 1);
        assert_eq!(report.skipped, 0);

        let snapshot = stored(&service);
        assert_eq!(snapshot.cursor.journal_id, FAKE_JOURNAL_ID);
        assert_eq!(snapshot.volume, "T:");

        let junction = &snapshot.points[&JUNCTION];
        assert_eq!(junction.path, vol(&["links", "app"]));
        assert_eq!(junction.kind, ReparseKind::Junction);
        assert_eq!(junction.target, Some(PathBuf::from(r"C:\Apps\Tool")));
        assert!(junction.is_dir);
        assert!(!junction.ghost);

        let symlink = &snapshot.points[&SYMLINK];
        assert!(symlink.relative);
        assert!(!symlink.is_dir);
        assert!(!symlink.ghost);

        let ghosts = service.ghosts().unwrap();
        assert_eq!(ghosts.len(), 1);
        assert_eq!(ghosts[0].path, vol(&["links", "old"]));
    }

    #[test]
    fn full_scan_applies_kind_filter_and_exclusions() {
        let volume = sample_volume();
        let mut body = 3u32.to_le_bytes().to_vec();
        for s in ["Pkg", "Pkg!App", r"C:\WindowsApps\app.exe"] {
            body.extend(wide(s));
            body.extend([0, 0]);
        }
        let data = ReparseBuilder::raw(IO_REPARSE_TAG_APPEXECLINK, body).build();
        volume.add_reparse(0x0001_0000_0000_0040, DATA, "app.exe", 0, &data);

        let options = ScanConfig {
            exclude: vec![vol(&["links", "old"])],
            ..ScanConfig::default()
        };
        let mut service = GhostDirService::new(volume, MemoryStore::new(), options);
        let report = service.full_scan().unwrap();

        assert_eq!(report.reparse_points, 2);
        assert_eq!(report.ghosts, 0);
        let points = service.points().unwrap();
        assert!(points.iter().all(|p| p.kind != ReparseKind::AppExecLink));
        assert!(points.iter().all(|p| p.fid != DANGLING));
    }

    #[test]
    fn unreadable_points_are_skipped_not_fatal() {
        let volume = sample_volume();
        volume.make_unreadable(JUNCTION);
        let mut service = service(volume);

        let report = service.full_scan().unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.reparse_points, 2);
    }

    #[test]
    fn disabled_target_checks_report_no_ghosts() {
        let options = ScanConfig {
            check_targets: false,
            ..ScanConfig::default()
        };
        let mut service = GhostDirService::new(sample_volume(), MemoryStore::new(), options);
        assert_eq!(service.full_scan().unwrap().ghosts, 0);
    }

    #[test]
    fn update_without_snapshot_runs_full_scan() {
        let mut service = service(sample_volume());
        let report = service.update().unwrap();
        assert_eq!(report.mode, ScanMode::Full);
        assert_eq!(service.driver().mft_scans(), 1);
    }

    #[test]
    fn incremental_update_applies_changes() {
        let mut service = service(sample_volume());
        service.full_scan().unwrap();

        let volume = service.driver();
        volume.create_junction(0x0001_0000_0000_0050, LINKS, "new", r"C:\Missing");
        volume.delete(JUNCTION);
        volume.remove_reparse(SYMLINK);
        volume.touch(0x0001_0000_0000_0051, DATA, "notes.txt");

        let report = service.update().unwrap();
        assert_eq!(report.mode, ScanMode::Incremental);
        assert_eq!(service.driver().mft_scans(), 1);
        assert_eq!(report.scanned, 3);
        assert_eq!(report.added, 1);
        assert_eq!(report.removed, 2);
        assert_eq!(report.reparse_points, 2);
        assert_eq!(report.ghosts, 2);

        let snapshot = stored(&service);
        assert_eq!(snapshot.points[&0x0001_0000_0000_0050].path, vol(&["links", "new"]));
        assert!(!snapshot.points.contains_key(&JUNCTION));
        assert_eq!(snapshot.cursor.next_usn, report.next_usn);
        assert_eq!(
            report.next_usn,
            service.driver().query_journal(false).unwrap().next_usn
        );
    }

    #[test]
    fn update_with_no_changes_keeps_snapshot() {
        let mut service = service(sample_volume());
        let full = service.full_scan().unwrap();
        let report = service.sync().unwrap();

        assert_eq!(report.mode, ScanMode::Incremental);
        assert_eq!(report.scanned, 0);
        assert_eq!(report.reparse_points, full.reparse_points);
        assert_eq!(report.next_usn, full.next_usn);
    }

    #[test]
    fn directory_rename_moves_stored_paths() {
        let mut service = service(sample_volume());
        service.full_scan().unwrap();

        service.driver().rename(LINKS, ROOT_FID, "shortcuts");
        let report = service.update().unwrap();

        assert_eq!(report.updated, 3);
        let snapshot = stored(&service);
        assert_eq!(snapshot.points[&JUNCTION].path, vol(&["shortcuts", "app"]));
        assert_eq!(snapshot.points[&SYMLINK].path, vol(&["shortcuts", "rel"]));
        // the relative target still lands on vol\data
        assert_eq!(snapshot.points[&SYMLINK].target, Some(vol(&["data"])));
    }

    #[test]
    fn directory_rename_with_exclusions_rescans() {
        let options = ScanConfig {
            exclude: vec![vol(&["links"])],
            ..ScanConfig::default()
        };
        let mut service = GhostDirService::new(sample_volume(), MemoryStore::new(), options);
        assert_eq!(service.full_scan().unwrap().reparse_points, 0);

        // vol\links leaves the excluded prefix along with everything below it
        service.driver().rename(LINKS, ROOT_FID, "shortcuts");
        let report = service.update().unwrap();

        assert_eq!(report.mode, ScanMode::Full);
        assert_eq!(report.reparse_points, 3);
        assert_eq!(
            stored(&service).points[&JUNCTION].path,
            vol(&["shortcuts", "app"])
        );
    }

    #[test]
    fn directory_changed_during_scan_keeps_its_points() {
        let volume = sample_volume();
        volume.change_during_next_scan(LINKS);
        let mut service = service(volume);

        let report = service.full_scan().unwrap();
        assert_eq!(report.reparse_points, 3);
        assert_eq!(report.skipped, 0);
        let live = service.driver().query_journal(false).unwrap();
        assert!(report.next_usn < live.next_usn);

        let report = service.update().unwrap();
        assert_eq!(report.mode, ScanMode::Incremental);
        assert_eq!(report.reparse_points, 3);
        assert_eq!(report.next_usn, live.next_usn);
    }

    #[test]
    fn snapshot_of_another_volume_is_kept() {
        let mut store = MemoryStore::new();
        let cursor = JournalCursor {
            journal_id: 1,
            next_usn: 0,
        };
        store.save(&Snapshot::new("C:", cursor)).unwrap();
        let mut service = GhostDirService::new(sample_volume(), store, ScanConfig::default());

        let err = service.full_scan().unwrap_err();
        assert!(matches!(
            err,
            GhostDirError::Dao(DaoError::VolumeMismatch { .. })
        ));
        assert!(service.delete_journal().is_err());
        assert!(service.journal_info().is_ok());
        assert_eq!(service.driver().mft_scans(), 0);
        assert_eq!(stored(&service).volume, "C:");
        assert_eq!(service.store().saves(), 1);
    }

    #[test]
    fn renamed_reparse_point_is_updated() {
        let mut service = service(sample_volume());
        service.full_scan().unwrap();

        service.driver().rename(DANGLING, DATA, "moved");
        let report = service.update().unwrap();

        assert_eq!(report.updated, 1);
        assert_eq!(stored(&service).points[&DANGLING].path, vol(&["data", "moved"]));
    }

    #[test]
    fn ghost_status_follows_targets() {
        let mut service = service(sample_volume());
        service.full_scan().unwrap();

        service.driver().add_target(r"C:\Removed");
        service.driver().remove_target(r"C:\Apps\Tool");
        let report = service.recheck().unwrap();

        assert_eq!(report.mode, ScanMode::Recheck);
        assert_eq!(report.ghosts, 1);
        let ghosts = service.ghosts().unwrap();
        assert_eq!(ghosts[0].fid, JUNCTION);
        assert_eq!(service.driver().journal_reads(), 0);
    }

    #[test]
    fn recreated_journal_forces_full_scan() {
        let mut service = service(sample_volume());
        service.full_scan().unwrap();

        service.driver().recreate_journal();
        let report = service.update().unwrap();
        assert_eq!(report.mode, ScanMode::Full);
        assert_eq!(stored(&service).cursor.journal_id, FAKE_JOURNAL_ID + 1);
    }

    #[test]
    fn purged_records_force_full_scan() {
        let mut service = service(sample_volume());
        service.full_scan().unwrap();

        service.driver().touch(0x0001_0000_0000_0060, DATA, "a.txt");
        service.driver().purge_journal();
        let report = service.update().unwrap();
        assert_eq!(report.mode, ScanMode::Full);
        assert_eq!(service.driver().journal_reads(), 0);
    }

    #[test]
    fn entry_deleted_mid_read_falls_back() {
        let mut service = service(sample_volume());
        service.full_scan().unwrap();

        service.driver().purge_during_next_read();
        let report = service.update().unwrap();
        assert_eq!(report.mode, ScanMode::Full);
        assert_eq!(service.driver().journal_reads(), 1);
        assert_eq!(service.driver().mft_scans(), 2);
    }

    #[test]
    fn inactive_journal_is_created_when_allowed() {
        let volume = sample_volume();
        volume.deactivate_journal();
        let mut service = service(volume);
        assert_eq!(service.full_scan().unwrap().reparse_points, 3);

        let volume = sample_volume();
        volume.deactivate_journal();
        let options = ScanConfig {
            create_journal_if_inactive: false,
            ..ScanConfig::default()
        };
        let mut service = GhostDirService::new(volume, MemoryStore::new(), options);
        let err = service.full_scan().unwrap_err();
        assert!(matches!(err, GhostDirError::Driver(DriverError::JournalNotActive)));
    }

    #[test]
    fn empty_volume_aborts_scan() {
        let mut service = service(FakeVolume::new());
        let err = service.full_scan().unwrap_err();
        assert!(matches!(err, GhostDirError::Service(ServiceError::Aborted(_))));
        assert!(service.store().snapshot().is_none());
    }

    #[test]
    fn reads_without_snapshot_fail() {
        let mut service = service(sample_volume());
        assert!(matches!(
            service.ghosts().unwrap_err(),
            GhostDirError::Service(ServiceError::NoSnapshot)
        ));
        assert_eq!(service.recheck().unwrap_err().kind(), ErrorKind::Service);
    }

    #[test]
    fn deleting_journal_clears_snapshot() {
        let mut service = service(sample_volume());
        service.full_scan().unwrap();

        service.delete_journal().unwrap();
        assert!(service.store().snapshot().is_none());
        assert!(service.journal_info().is_err());

        let info = service.create_journal(1 << 20, 1 << 16).unwrap();
        assert_eq!(info.maximum_size, 1 << 20);
    }

    #[test]
    fn cursor_validation() {
        let journal = JournalInfo {
            journal_id: 7,
            first_usn: 100,
            next_usn: 500,
            lowest_valid_usn: 100,
            max_usn: i64::MAX,
            maximum_size: 0,
            allocation_delta: 0,
        };
        let cursor = |journal_id, next_usn| JournalCursor {
            journal_id,
            next_usn,
        };

        assert!(validate_cursor(&cursor(7, 100), &journal).is_ok());
        assert!(validate_cursor(&cursor(7, 500), &journal).is_ok());
        assert!(validate_cursor(&cursor(8, 200), &journal).is_err());
        assert!(validate_cursor(&cursor(7, 99), &journal).is_err());
        assert!(validate_cursor(&cursor(7, 501), &journal).is_err());
    }

    #[test]
    fn collapse_keeps_last_record_and_all_reasons() {
        let mut changes = BTreeMap::new();
        let mut first = crate::tests::dir_entry(1, ROOT_FID, "old");
        first.reason = USN_REASON_RENAME_OLD_NAME;
        let mut second = crate::tests::dir_entry(1, ROOT_FID, "new");
        second.reason = USN_REASON_RENAME_NEW_NAME;

        collapse(&mut changes, first);
        collapse(&mut changes, second);

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[&1].file_name, "new");
        assert_eq!(changes[&1].reason, RENAME_REASONS);
    }
}
