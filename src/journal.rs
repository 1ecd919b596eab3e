//! Provides access to the Windows NTFS USN change journal.
//!
//! Querying, creating, deleting and reading the journal through
//! `DeviceIoControl`. Raw output buffers are decoded by [`crate::record`].

use crate::{
    DEFAULT_BUFFER_SIZE, GhostResult, USN_REASON_MASK_ALL, Usn,
    driver::JournalInfo,
    errors::DriverError,
    record::{RecordBuffer, UsnEntry},
    volume::Volume,
};
use log::{debug, warn};
use std::{collections::VecDeque, mem::size_of};
use windows::Win32::{
    Foundation::{ERROR_HANDLE_EOF, ERROR_JOURNAL_NOT_ACTIVE},
    System::{
        IO::DeviceIoControl,
        Ioctl::{
            CREATE_USN_JOURNAL_DATA, DELETE_USN_JOURNAL_DATA, FSCTL_CREATE_USN_JOURNAL,
            FSCTL_DELETE_USN_JOURNAL, FSCTL_QUERY_USN_JOURNAL, FSCTL_READ_USN_JOURNAL,
            READ_USN_JOURNAL_DATA_V0, USN_DELETE_FLAG_DELETE, USN_DELETE_FLAG_NOTIFY,
            USN_DELETE_FLAGS, USN_JOURNAL_DATA_V0,
        },
    },
};

#[derive(Debug, Clone)]
/// Options for reading the USN journal.
pub struct EnumOptions {
    pub start_usn: Usn,
    pub reason_mask: u32,
    pub only_on_close: bool,
    pub timeout: u64,
    pub wait_for_more: bool,
    pub buffer_size: usize,
}

impl Default for EnumOptions {
    fn default() -> Self {
        EnumOptions {
            start_usn: 0,
            reason_mask: USN_REASON_MASK_ALL,
            only_on_close: false,
            timeout: 0,
            wait_for_more: false,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// The change journal of one volume, identified by its journal id.
#[derive(Debug)]
pub struct UsnJournal<'a> {
    volume: &'a Volume,
    pub journal_id: u64,
}

impl<'a> UsnJournal<'a> {
    /// Queries the live journal, creating it with the default size if needed.
    pub fn new(volume: &'a Volume) -> GhostResult<Self> {
        let info = query(
            volume,
            true,
            crate::DEFAULT_JOURNAL_MAX_SIZE,
            crate::DEFAULT_JOURNAL_ALLOCATION_DELTA,
        )?;
        Ok(Self::with_id(volume, info.journal_id))
    }

    /// Binds to a journal id already known to the caller, e.g. a stored cursor.
    pub fn with_id(volume: &'a Volume, journal_id: u64) -> Self {
        UsnJournal { volume, journal_id }
    }

    pub fn iter(&self) -> UsnJournalIter<'_> {
        self.iter_with_options(EnumOptions::default())
    }

    pub fn iter_with_options(&self, options: EnumOptions) -> UsnJournalIter<'_> {
        UsnJournalIter {
            journal: self,
            buffer: vec![0u8; options.buffer_size],
            pending: VecDeque::new(),
            next_start_usn: options.start_usn,
            reason_mask: options.reason_mask,
            return_only_on_close: options.only_on_close as u32,
            timeout: options.timeout,
            bytes_to_wait_for: options.wait_for_more as u64,
            finished: false,
        }
    }
}

/// Iterates over journal records, one `FSCTL_READ_USN_JOURNAL` call per
/// buffer.
pub struct UsnJournalIter<'a> {
    journal: &'a UsnJournal<'a>,
    buffer: Vec<u8>,
    pending: VecDeque<GhostResult<UsnEntry>>,
    next_start_usn: Usn,
    reason_mask: u32,
    return_only_on_close: u32,
    timeout: u64,
    bytes_to_wait_for: u64,
    finished: bool,
}

impl UsnJournalIter<'_> {
    /// The USN the next read starts at; after exhausting the iterator this is
    /// the cursor to persist.
    pub fn next_usn(&self) -> Usn {
        self.next_start_usn
    }

    /// Reads the next buffer. Returns `Ok(false)` when nothing new is
    /// available.
    fn fill(&mut self) -> GhostResult<bool> {
        let read_data = READ_USN_JOURNAL_DATA_V0 {
            StartUsn: self.next_start_usn,
            ReasonMask: self.reason_mask,
            ReturnOnlyOnClose: self.return_only_on_close,
            Timeout: self.timeout,
            BytesToWaitFor: self.bytes_to_wait_for,
            UsnJournalID: self.journal.journal_id,
        };
        let mut bytes_read = 0u32;

        if let Err(err) = unsafe {
            DeviceIoControl(
                self.journal.volume.handle,
                FSCTL_READ_USN_JOURNAL,
                Some(&read_data as *const _ as _),
                size_of::<READ_USN_JOURNAL_DATA_V0>() as u32,
                Some(self.buffer.as_mut_ptr() as _),
                self.buffer.len() as u32,
                Some(&mut bytes_read),
                None,
            )
        } {
            if err.code() == ERROR_HANDLE_EOF.into() {
                return Ok(false);
            }
            warn!("FSCTL_READ_USN_JOURNAL failed at USN {}: {}", self.next_start_usn, err);
            return Err(DriverError::from(err).into());
        }

        // https://learn.microsoft.com/en-us/windows/win32/fileio/walking-a-buffer-of-change-journal-records
        // The first USN in the output buffer is where the next read continues.
        let records = RecordBuffer::new(&self.buffer[..bytes_read as usize])?;
        self.next_start_usn = records.next_usn();
        if records.is_empty() {
            return Ok(false);
        }
        self.pending
            .extend(records.map(|result| result.map_err(Into::into)));
        Ok(true)
    }
}

impl Iterator for UsnJournalIter<'_> {
    type Item = GhostResult<UsnEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Some(item);
            }
            if self.finished {
                return None;
            }
            match self.fill() {
                Ok(true) => continue,
                Ok(false) => {
                    self.finished = true;
                    return None;
                }
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

/// Queries the journal state, optionally creating the journal if it is not
/// active.
pub fn query(
    volume: &Volume,
    create_if_not_active: bool,
    max_size: u64,
    allocation_delta: u64,
) -> GhostResult<JournalInfo> {
    match query_core(volume) {
        Err(err) if err.code() == ERROR_JOURNAL_NOT_ACTIVE.into() => {
            if !create_if_not_active {
                return Err(DriverError::JournalNotActive.into());
            }
            create_or_update(volume, max_size, allocation_delta)?;
            Ok(query_core(volume).map_err(DriverError::from)?)
        }
        Err(err) => {
            warn!("FSCTL_QUERY_USN_JOURNAL failed: {}", err);
            Err(DriverError::from(err).into())
        }
        Ok(info) => {
            debug!("USN journal data: {:?}", info);
            Ok(info)
        }
    }
}

fn query_core(volume: &Volume) -> windows::core::Result<JournalInfo> {
    let mut journal_data = USN_JOURNAL_DATA_V0::default();
    let mut bytes_returned = 0u32;

    // https://learn.microsoft.com/en-us/windows/win32/fileio/using-the-change-journal-identifier
    // FSCTL_QUERY_USN_JOURNAL returns the identifier of the current journal.
    unsafe {
        DeviceIoControl(
            volume.handle,
            FSCTL_QUERY_USN_JOURNAL,
            None,
            0,
            Some(&mut journal_data as *mut _ as _),
            size_of::<USN_JOURNAL_DATA_V0>() as u32,
            Some(&mut bytes_returned),
            None,
        )
    }?;

    Ok(JournalInfo {
        journal_id: journal_data.UsnJournalID,
        first_usn: journal_data.FirstUsn,
        next_usn: journal_data.NextUsn,
        lowest_valid_usn: journal_data.LowestValidUsn,
        max_usn: journal_data.MaxUsn,
        maximum_size: journal_data.MaximumSize,
        allocation_delta: journal_data.AllocationDelta,
    })
}

/// Creates the journal, or resizes an existing one.
pub fn create_or_update(volume: &Volume, max_size: u64, allocation_delta: u64) -> GhostResult<()> {
    let create_data = CREATE_USN_JOURNAL_DATA {
        MaximumSize: max_size,
        AllocationDelta: allocation_delta,
    };

    unsafe {
        DeviceIoControl(
            volume.handle,
            FSCTL_CREATE_USN_JOURNAL,
            Some(&create_data as *const _ as _),
            size_of::<CREATE_USN_JOURNAL_DATA>() as u32,
            None,
            0,
            None,
            None,
        )
    }
    .map_err(DriverError::from)?;

    debug!(
        "Created USN journal, max_size={}, allocation_delta={}",
        max_size, allocation_delta
    );
    Ok(())
}

/// Deletes the journal. Any stored cursor becomes invalid.
pub fn delete(volume: &Volume, journal_id: u64) -> GhostResult<()> {
    let delete_flags: USN_DELETE_FLAGS = USN_DELETE_FLAG_DELETE | USN_DELETE_FLAG_NOTIFY;
    let delete_data = DELETE_USN_JOURNAL_DATA {
        UsnJournalID: journal_id,
        DeleteFlags: delete_flags,
    };

    unsafe {
        DeviceIoControl(
            volume.handle,
            FSCTL_DELETE_USN_JOURNAL,
            Some(&delete_data as *const _ as _),
            size_of::<DELETE_USN_JOURNAL_DATA>() as u32,
            None,
            0,
            None,
            None,
        )
    }
    .map_err(DriverError::from)?;

    debug!("Deleted USN journal {:#x}", journal_id);
    Ok(())
}
