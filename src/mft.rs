//! Enumeration of the Master File Table through `FSCTL_ENUM_USN_DATA`.
//!
//! Every call returns a buffer of `USN_RECORD_V2` entries, one per file or
//! directory, prefixed with the file reference number to start the next call
//! from. Entries produced this way have a zero `reason`.

use crate::{
    DEFAULT_BUFFER_SIZE, GhostResult, Usn,
    errors::DriverError,
    record::{RecordBuffer, UsnEntry},
    volume::Volume,
};
use log::warn;
use std::{collections::VecDeque, mem::size_of};
use windows::Win32::{
    Foundation::ERROR_HANDLE_EOF,
    System::{
        IO::DeviceIoControl,
        Ioctl::{FSCTL_ENUM_USN_DATA, MFT_ENUM_DATA_V0},
    },
};

/// Options for enumerating the MFT.
#[derive(Debug, Clone)]
pub struct MftEnumOptions {
    pub low_usn: Usn,
    pub high_usn: Usn,
    pub buffer_size: usize,
}

impl Default for MftEnumOptions {
    fn default() -> Self {
        MftEnumOptions {
            low_usn: 0,
            high_usn: i64::MAX,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

pub struct Mft<'a> {
    volume: &'a Volume,
    options: MftEnumOptions,
}

impl<'a> Mft<'a> {
    pub fn new(volume: &'a Volume) -> Self {
        Self::new_with_options(volume, MftEnumOptions::default())
    }

    pub fn new_with_options(volume: &'a Volume, options: MftEnumOptions) -> Self {
        Mft { volume, options }
    }

    pub fn iter(&self) -> MftIter<'_> {
        MftIter {
            volume: self.volume,
            buffer: vec![0u8; self.options.buffer_size],
            pending: VecDeque::new(),
            next_start_fid: 0,
            low_usn: self.options.low_usn,
            high_usn: self.options.high_usn,
            finished: false,
        }
    }
}

pub struct MftIter<'a> {
    volume: &'a Volume,
    buffer: Vec<u8>,
    pending: VecDeque<GhostResult<UsnEntry>>,
    next_start_fid: u64,
    low_usn: Usn,
    high_usn: Usn,
    finished: bool,
}

impl MftIter<'_> {
    /// Reads the next chunk of MFT data. Returns `Ok(false)` at the end of
    /// the table.
    fn fill(&mut self) -> GhostResult<bool> {
        // On the first call StartFileReferenceNumber is 0; afterwards it is
        // the value returned at the head of the previous buffer.
        let mft_enum_data = MFT_ENUM_DATA_V0 {
            StartFileReferenceNumber: self.next_start_fid,
            LowUsn: self.low_usn,
            HighUsn: self.high_usn,
        };
        let mut bytes_read = 0u32;

        if let Err(err) = unsafe {
            DeviceIoControl(
                self.volume.handle,
                FSCTL_ENUM_USN_DATA,
                Some(&mft_enum_data as *const _ as _),
                size_of::<MFT_ENUM_DATA_V0>() as u32,
                Some(self.buffer.as_mut_ptr() as _),
                self.buffer.len() as u32,
                Some(&mut bytes_read),
                None,
            )
        } {
            if err.code() == ERROR_HANDLE_EOF.into() {
                return Ok(false);
            }
            warn!("FSCTL_ENUM_USN_DATA failed at FRN {:#x}: {}", self.next_start_fid, err);
            return Err(DriverError::from(err).into());
        }

        let records = RecordBuffer::new(&self.buffer[..bytes_read as usize])?;
        let next = records.continuation();
        if records.is_empty() || next == self.next_start_fid {
            return Ok(false);
        }
        self.next_start_fid = next;
        self.pending
            .extend(records.map(|result| result.map_err(Into::into)));
        Ok(true)
    }
}

impl Iterator for MftIter<'_> {
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
