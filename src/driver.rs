//! The volume I/O seam.
//!
//! [`VolumeDriver`] is everything the service needs from an NTFS volume. The
//! Windows implementation issues the change-journal and MFT control codes;
//! tests substitute an in-memory volume.

use crate::{
    Fid, GhostResult, Usn,
    config::Config,
    path::FidLookup,
    record::UsnEntry,
    reparse::ReparseTarget,
};
use std::path::{Path, PathBuf};

/// State of the USN change journal, as returned by `FSCTL_QUERY_USN_JOURNAL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalInfo {
    pub journal_id: u64,
    pub first_usn: Usn,
    pub next_usn: Usn,
    pub lowest_valid_usn: Usn,
    pub max_usn: Usn,
    pub maximum_size: u64,
    pub allocation_delta: u64,
}

/// Parameters for reading the journal forward from a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalRead {
    pub journal_id: u64,
    pub start_usn: Usn,
    pub reason_mask: u32,
}

/// Receives entries one at a time so a whole volume never has to sit in memory.
pub type EntrySink<'a> = dyn FnMut(UsnEntry) -> GhostResult<()> + 'a;

/// File ids resolve to paths through the [`FidLookup`] supertrait.
pub trait VolumeDriver: FidLookup {
    /// Stable identifier of the volume (`C:` or the mount point).
    fn volume_id(&self) -> String;

    /// Path the volume root maps to.
    fn root(&self) -> PathBuf;

    fn query_journal(&self, create_if_inactive: bool) -> GhostResult<JournalInfo>;

    fn create_journal(&self, max_size: u64, allocation_delta: u64) -> GhostResult<()>;

    fn delete_journal(&self, journal_id: u64) -> GhostResult<()>;

    /// Feeds every MFT entry with a USN at or below `high_usn` to `sink`.
    /// Returns the number of entries delivered.
    fn enumerate_mft(&self, high_usn: Usn, sink: &mut EntrySink<'_>) -> GhostResult<u64>;

    /// Feeds journal records from `read.start_usn` up to the current end of
    /// the journal to `sink`. Returns the USN to resume from.
    fn read_journal(&self, read: &JournalRead, sink: &mut EntrySink<'_>) -> GhostResult<Usn>;

    /// Reparse data of `fid`, or `None` if it is not (or no longer) a reparse
    /// point.
    fn read_reparse_point(&self, fid: Fid) -> GhostResult<Option<ReparseTarget>>;

    fn target_exists(&self, path: &Path) -> bool {
        path_exists(path)
    }
}

/// Whether `path` currently exists. Errors other than "not found" count as
/// existing, so a permission problem never produces a ghost.
pub fn path_exists(path: &Path) -> bool {
    path.try_exists().unwrap_or(true)
}

/// Feeds `entries` to `sink` and returns how many were delivered. Any error
/// ends the walk: a failed buffer drops the records behind it, so a partial
/// enumeration must never look complete.
#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) fn feed_entries(
    entries: impl Iterator<Item = GhostResult<UsnEntry>>,
    sink: &mut EntrySink<'_>,
) -> GhostResult<u64> {
    let mut count = 0u64;
    for entry in entries {
        sink(entry?)?;
        count += 1;
    }
    Ok(count)
}

impl<T: FidLookup + ?Sized> FidLookup for Box<T> {
    fn fid_to_path(&self, fid: Fid) -> GhostResult<PathBuf> {
        (**self).fid_to_path(fid)
    }
}

impl<T: VolumeDriver + ?Sized> VolumeDriver for Box<T> {
    fn volume_id(&self) -> String {
        (**self).volume_id()
    }
    fn root(&self) -> PathBuf {
        (**self).root()
    }
    fn query_journal(&self, create_if_inactive: bool) -> GhostResult<JournalInfo> {
        (**self).query_journal(create_if_inactive)
    }
    fn create_journal(&self, max_size: u64, allocation_delta: u64) -> GhostResult<()> {
        (**self).create_journal(max_size, allocation_delta)
    }
    fn delete_journal(&self, journal_id: u64) -> GhostResult<()> {
        (**self).delete_journal(journal_id)
    }
    fn enumerate_mft(&self, high_usn: Usn, sink: &mut EntrySink<'_>) -> GhostResult<u64> {
        (**self).enumerate_mft(high_usn, sink)
    }
    fn read_journal(&self, read: &JournalRead, sink: &mut EntrySink<'_>) -> GhostResult<Usn> {
        (**self).read_journal(read, sink)
    }
    fn read_reparse_point(&self, fid: Fid) -> GhostResult<Option<ReparseTarget>> {
        (**self).read_reparse_point(fid)
    }
    fn target_exists(&self, path: &Path) -> bool {
        (**self).target_exists(path)
    }
}

/// Opens the volume named by `config`.
#[cfg(windows)]
pub fn open_driver(config: &Config) -> GhostResult<Box<dyn VolumeDriver>> {
    Ok(Box::new(windows_driver::WindowsDriver::open(config)?))
}

/// Opens the volume named by `config`.
#[cfg(not(windows))]
pub fn open_driver(config: &Config) -> GhostResult<Box<dyn VolumeDriver>> {
    use crate::errors::DriverError;
    // Still surface configuration mistakes before the platform error.
    config.volume_source()?;
    Err(DriverError::Unsupported(
        "NTFS change journal access requires Windows".to_string(),
    )
    .into())
}

#[cfg(windows)]
pub mod windows_driver {
    use super::*;
    use crate::{
        config::VolumeSource,
        journal::{self, EnumOptions, UsnJournal},
        mft::{Mft, MftEnumOptions},
        volume::Volume,
    };
    use log::debug;

    /// [`VolumeDriver`] over a live NTFS volume handle.
    #[derive(Debug)]
    pub struct WindowsDriver {
        volume: Volume,
        max_size: u64,
        allocation_delta: u64,
        buffer_size: usize,
    }

    impl WindowsDriver {
        pub fn open(config: &Config) -> GhostResult<Self> {
            let volume = match config.volume_source()? {
                VolumeSource::DriveLetter(letter) => Volume::from_drive_letter(letter)?,
                VolumeSource::MountPoint(mount_point) => Volume::from_mount_point(&mount_point)?,
            };
            debug!("Opened volume {}", volume.id());
            Ok(WindowsDriver {
                volume,
                max_size: config.journal.max_size,
                allocation_delta: config.journal.allocation_delta,
                buffer_size: config.journal.buffer_size,
            })
        }
    }

    impl VolumeDriver for WindowsDriver {
        fn volume_id(&self) -> String {
            self.volume.id()
        }

        fn root(&self) -> PathBuf {
            self.volume.root()
        }

        fn query_journal(&self, create_if_inactive: bool) -> GhostResult<JournalInfo> {
            journal::query(
                &self.volume,
                create_if_inactive,
                self.max_size,
                self.allocation_delta,
            )
        }

        fn create_journal(&self, max_size: u64, allocation_delta: u64) -> GhostResult<()> {
            journal::create_or_update(&self.volume, max_size, allocation_delta)
        }

        fn delete_journal(&self, journal_id: u64) -> GhostResult<()> {
            journal::delete(&self.volume, journal_id)
        }

        fn enumerate_mft(&self, high_usn: Usn, sink: &mut EntrySink<'_>) -> GhostResult<u64> {
            let mft = Mft::new_with_options(
                &self.volume,
                MftEnumOptions {
                    high_usn,
                    buffer_size: self.buffer_size,
                    ..Default::default()
                },
            );
            feed_entries(mft.iter(), sink)
        }

        fn read_journal(&self, read: &JournalRead, sink: &mut EntrySink<'_>) -> GhostResult<Usn> {
            let journal = UsnJournal::with_id(&self.volume, read.journal_id);
            let mut iter = journal.iter_with_options(EnumOptions {
                start_usn: read.start_usn,
                reason_mask: read.reason_mask,
                buffer_size: self.buffer_size,
                ..Default::default()
            });
            let count = feed_entries(iter.by_ref(), sink)?;
            debug!("Read {} journal records up to USN {}", count, iter.next_usn());
            Ok(iter.next_usn())
        }

        fn read_reparse_point(&self, fid: Fid) -> GhostResult<Option<ReparseTarget>> {
            self.volume.read_reparse_point(fid)
        }
    }

    impl FidLookup for WindowsDriver {
        fn fid_to_path(&self, fid: Fid) -> GhostResult<PathBuf> {
            self.volume.file_id_to_path(fid)
        }
    }
}
