//! Decoding of USN records as returned by `FSCTL_ENUM_USN_DATA` and
//! `FSCTL_READ_USN_JOURNAL`.
//!
//! The codec works on raw little-endian bytes, so it does not depend on the
//! Windows headers and can be exercised on any platform.

use crate::{Fid, Usn, errors::DriverError, time};
use byteorder::{LittleEndian, ReadBytesExt};
use std::{io::Cursor, time::SystemTime};

pub const USN_REASON_DATA_OVERWRITE: u32 = 0x0000_0001;
pub const USN_REASON_DATA_EXTEND: u32 = 0x0000_0002;
pub const USN_REASON_DATA_TRUNCATION: u32 = 0x0000_0004;
pub const USN_REASON_NAMED_DATA_OVERWRITE: u32 = 0x0000_0010;
pub const USN_REASON_NAMED_DATA_EXTEND: u32 = 0x0000_0020;
pub const USN_REASON_NAMED_DATA_TRUNCATION: u32 = 0x0000_0040;
pub const USN_REASON_FILE_CREATE: u32 = 0x0000_0100;
pub const USN_REASON_FILE_DELETE: u32 = 0x0000_0200;
pub const USN_REASON_EA_CHANGE: u32 = 0x0000_0400;
pub const USN_REASON_SECURITY_CHANGE: u32 = 0x0000_0800;
pub const USN_REASON_RENAME_OLD_NAME: u32 = 0x0000_1000;
pub const USN_REASON_RENAME_NEW_NAME: u32 = 0x0000_2000;
pub const USN_REASON_INDEXABLE_CHANGE: u32 = 0x0000_4000;
pub const USN_REASON_BASIC_INFO_CHANGE: u32 = 0x0000_8000;
pub const USN_REASON_HARD_LINK_CHANGE: u32 = 0x0001_0000;
pub const USN_REASON_COMPRESSION_CHANGE: u32 = 0x0002_0000;
pub const USN_REASON_ENCRYPTION_CHANGE: u32 = 0x0004_0000;
pub const USN_REASON_OBJECT_ID_CHANGE: u32 = 0x0008_0000;
pub const USN_REASON_REPARSE_POINT_CHANGE: u32 = 0x0010_0000;
pub const USN_REASON_STREAM_CHANGE: u32 = 0x0020_0000;
pub const USN_REASON_TRANSACTED_CHANGE: u32 = 0x0040_0000;
pub const USN_REASON_INTEGRITY_CHANGE: u32 = 0x0080_0000;
pub const USN_REASON_DESIRED_STORAGE_CLASS_CHANGE: u32 = 0x0100_0000;
pub const USN_REASON_CLOSE: u32 = 0x8000_0000;

pub const FILE_ATTRIBUTE_HIDDEN: u32 = 0x0000_0002;
pub const FILE_ATTRIBUTE_SYSTEM: u32 = 0x0000_0004;
pub const FILE_ATTRIBUTE_DIRECTORY: u32 = 0x0000_0010;
pub const FILE_ATTRIBUTE_REPARSE_POINT: u32 = 0x0000_0400;

/// Smallest possible `USN_RECORD_V2`: the fixed header with an empty name.
pub const USN_RECORD_V2_HEADER_LEN: usize = 60;
pub const USN_RECORD_V3_HEADER_LEN: usize = 76;

/// The file record number occupies the low 48 bits of a file reference;
/// the high 16 bits are the sequence number.
pub const FILE_RECORD_NUMBER_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

const REASON_NAMES: [(u32, &str); 24] = [
    (USN_REASON_DATA_OVERWRITE, "DATA_OVERWRITE"),
    (USN_REASON_DATA_EXTEND, "DATA_EXTEND"),
    (USN_REASON_DATA_TRUNCATION, "DATA_TRUNCATION"),
    (USN_REASON_NAMED_DATA_OVERWRITE, "NAMED_DATA_OVERWRITE"),
    (USN_REASON_NAMED_DATA_EXTEND, "NAMED_DATA_EXTEND"),
    (USN_REASON_NAMED_DATA_TRUNCATION, "NAMED_DATA_TRUNCATION"),
    (USN_REASON_FILE_CREATE, "FILE_CREATE"),
    (USN_REASON_FILE_DELETE, "FILE_DELETE"),
    (USN_REASON_EA_CHANGE, "EA_CHANGE"),
    (USN_REASON_SECURITY_CHANGE, "SECURITY_CHANGE"),
    (USN_REASON_RENAME_OLD_NAME, "RENAME_OLD_NAME"),
    (USN_REASON_RENAME_NEW_NAME, "RENAME_NEW_NAME"),
    (USN_REASON_INDEXABLE_CHANGE, "INDEXABLE_CHANGE"),
    (USN_REASON_BASIC_INFO_CHANGE, "BASIC_INFO_CHANGE"),
    (USN_REASON_HARD_LINK_CHANGE, "HARD_LINK_CHANGE"),
    (USN_REASON_COMPRESSION_CHANGE, "COMPRESSION_CHANGE"),
    (USN_REASON_ENCRYPTION_CHANGE, "ENCRYPTION_CHANGE"),
    (USN_REASON_OBJECT_ID_CHANGE, "OBJECT_ID_CHANGE"),
    (USN_REASON_REPARSE_POINT_CHANGE, "REPARSE_POINT_CHANGE"),
    (USN_REASON_STREAM_CHANGE, "STREAM_CHANGE"),
    (USN_REASON_TRANSACTED_CHANGE, "TRANSACTED_CHANGE"),
    (USN_REASON_INTEGRITY_CHANGE, "INTEGRITY_CHANGE"),
    (
        USN_REASON_DESIRED_STORAGE_CLASS_CHANGE,
        "DESIRED_STORAGE_CLASS_CHANGE",
    ),
    (USN_REASON_CLOSE, "CLOSE"),
];

/// Converts a USN reason bitfield to a human-readable string.
pub fn reason_to_string(reason: u32) -> String {
    let reasons: Vec<&str> = REASON_NAMES
        .iter()
        .filter(|(bit, _)| reason & bit != 0)
        .map(|(_, name)| *name)
        .collect();
    if reasons.is_empty() {
        return "UNKNOWN".to_string();
    }
    reasons.join(" | ")
}

/// Represents one USN record, either from the change journal or from an MFT
/// enumeration (where `reason` is always zero).
#[derive(Debug, Clone, PartialEq)]
pub struct UsnEntry {
    pub usn: Usn,
    pub time: SystemTime,
    pub fid: Fid,
    pub parent_fid: Fid,
    pub reason: u32,
    pub source_info: u32,
    pub file_name: String,
    pub file_attributes: u32,
}

impl UsnEntry {
    /// Decodes a single `USN_RECORD_V2` or `USN_RECORD_V3`.
    ///
    /// `data` must start at the record; it may extend past it. V3 records
    /// carry 128-bit file ids, which NTFS fills with the 64-bit reference in
    /// the low half, so only the low 64 bits are kept.
    pub fn parse(data: &[u8]) -> Result<Self, DriverError> {
        if data.len() < 8 {
            return Err(DriverError::Malformed(format!(
                "record header truncated: {} bytes",
                data.len()
            )));
        }

        let mut cursor = Cursor::new(data);
        let record_length = cursor.read_u32::<LittleEndian>()? as usize;
        let major_version = cursor.read_u16::<LittleEndian>()?;
        let _minor_version = cursor.read_u16::<LittleEndian>()?;

        let header_len = match major_version {
            2 => USN_RECORD_V2_HEADER_LEN,
            3 => USN_RECORD_V3_HEADER_LEN,
            other => {
                return Err(DriverError::Malformed(format!(
                    "unsupported USN record version {}",
                    other
                )));
            }
        };

        if record_length < header_len || record_length > data.len() {
            return Err(DriverError::Malformed(format!(
                "record length {} out of range (header {}, available {})",
                record_length,
                header_len,
                data.len()
            )));
        }

        let (fid, parent_fid) = if major_version == 3 {
            let fid = cursor.read_u64::<LittleEndian>()?;
            cursor.read_u64::<LittleEndian>()?;
            let parent_fid = cursor.read_u64::<LittleEndian>()?;
            cursor.read_u64::<LittleEndian>()?;
            (fid, parent_fid)
        } else {
            (
                cursor.read_u64::<LittleEndian>()?,
                cursor.read_u64::<LittleEndian>()?,
            )
        };

        let usn = cursor.read_i64::<LittleEndian>()?;
        let timestamp = cursor.read_i64::<LittleEndian>()?;
        let reason = cursor.read_u32::<LittleEndian>()?;
        let source_info = cursor.read_u32::<LittleEndian>()?;
        let _security_id = cursor.read_u32::<LittleEndian>()?;
        let file_attributes = cursor.read_u32::<LittleEndian>()?;
        let file_name_length = cursor.read_u16::<LittleEndian>()? as usize;
        let file_name_offset = cursor.read_u16::<LittleEndian>()? as usize;

        // https://learn.microsoft.com/en-us/windows/win32/api/winioctl/ns-winioctl-usn_record_v2
        // Do not count on a trailing '\0'; use FileNameLength and FileNameOffset.
        let name_end = file_name_offset + file_name_length;
        let name_bytes = data
            .get(file_name_offset..name_end)
            .filter(|_| name_end <= record_length && file_name_length % 2 == 0)
            .ok_or_else(|| {
                DriverError::Malformed(format!(
                    "file name at {}+{} exceeds record length {}",
                    file_name_offset, file_name_length, record_length
                ))
            })?;

        let wide: Vec<u16> = name_bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        Ok(UsnEntry {
            usn,
            time: time::filetime_to_systemtime(timestamp),
            fid,
            parent_fid,
            reason,
            source_info,
            file_name: String::from_utf16_lossy(&wide),
            file_attributes,
        })
    }

    /// Returns true if this entry represents a directory.
    pub fn is_dir(&self) -> bool {
        self.file_attributes & FILE_ATTRIBUTE_DIRECTORY != 0
    }

    /// Returns true if this entry represents a hidden file or directory.
    pub fn is_hidden(&self) -> bool {
        self.file_attributes & FILE_ATTRIBUTE_HIDDEN != 0
    }

    pub fn is_reparse_point(&self) -> bool {
        self.file_attributes & FILE_ATTRIBUTE_REPARSE_POINT != 0
    }

    pub fn has_reason(&self, mask: u32) -> bool {
        self.reason & mask != 0
    }

    pub fn record_number(&self) -> u64 {
        self.fid & FILE_RECORD_NUMBER_MASK
    }

    pub fn reason_to_string(&self) -> String {
        reason_to_string(self.reason)
    }
}

/// Walks the output buffer of `FSCTL_ENUM_USN_DATA` or
/// `FSCTL_READ_USN_JOURNAL`.
///
/// Both control codes put the continuation point in the first 8 bytes
/// (the next file reference number or the next USN), followed by packed
/// records each `RecordLength` bytes long.
pub struct RecordBuffer<'a> {
    data: &'a [u8],
    offset: usize,
    next: u64,
}

impl<'a> RecordBuffer<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self, DriverError> {
        let head = data.get(..8).ok_or_else(|| {
            DriverError::Malformed(format!("output buffer too short: {} bytes", data.len()))
        })?;
        let next = u64::from_le_bytes([
            head[0], head[1], head[2], head[3], head[4], head[5], head[6], head[7],
        ]);
        Ok(RecordBuffer {
            data,
            offset: 8,
            next,
        })
    }

    /// Continuation value for the next control-code call.
    pub fn continuation(&self) -> u64 {
        self.next
    }

    pub fn next_usn(&self) -> Usn {
        self.next as Usn
    }

    pub fn is_empty(&self) -> bool {
        self.data.len() <= 8
    }
}

impl Iterator for RecordBuffer<'_> {
    type Item = Result<UsnEntry, DriverError>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.data.get(self.offset..).filter(|r| !r.is_empty())?;

        let result = rest
            .get(..4)
            .map(|len| u32::from_le_bytes([len[0], len[1], len[2], len[3]]) as usize)
            .filter(|&len| len >= 8 && len <= rest.len())
            .ok_or_else(|| {
                DriverError::Malformed(format!("bad record length at offset {}", self.offset))
            })
            .and_then(|len| UsnEntry::parse(&rest[..len]).map(|entry| (len, entry)));

        match result {
            Ok((len, entry)) => {
                self.offset += len;
                Some(Ok(entry))
            }
            Err(err) => {
                // A broken length makes the rest of the buffer unreadable.
                self.offset = self.data.len();
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{RecordBuilder, enum_buffer};

    #[test]
    fn parse_v2_record() {
        let bytes = RecordBuilder::new(0x0001_0000_0000_0040, 0x0005_0000_0000_0005, "link")
            .usn(4096)
            .reason(USN_REASON_REPARSE_POINT_CHANGE | USN_REASON_CLOSE)
            .attributes(FILE_ATTRIBUTE_DIRECTORY | FILE_ATTRIBUTE_REPARSE_POINT)
            .v2();

        let entry = UsnEntry::parse(&bytes).unwrap();
        assert_eq!(entry.usn, 4096);
        assert_eq!(entry.fid, 0x0001_0000_0000_0040);
        assert_eq!(entry.record_number(), 0x40);
        assert_eq!(entry.parent_fid, 0x0005_0000_0000_0005);
        assert_eq!(entry.file_name, "link");
        assert!(entry.is_dir());
        assert!(entry.is_reparse_point());
        assert!(!entry.is_hidden());
        assert_eq!(entry.reason_to_string(), "REPARSE_POINT_CHANGE | CLOSE");
    }

    #[test]
    fn parse_v3_record_keeps_low_file_id() {
        let bytes = RecordBuilder::new(77, 5, "Ünïcode").v3();
        let entry = UsnEntry::parse(&bytes).unwrap();
        assert_eq!(entry.fid, 77);
        assert_eq!(entry.parent_fid, 5);
        assert_eq!(entry.file_name, "Ünïcode");
    }

    #[test]
    fn parse_rejects_unknown_version() {
        let mut bytes = RecordBuilder::new(1, 5, "a").v2();
        bytes[4] = 4;
        assert!(matches!(
            UsnEntry::parse(&bytes),
            Err(DriverError::Malformed(_))
        ));
    }

    #[test]
    fn parse_rejects_name_past_record_end() {
        let mut bytes = RecordBuilder::new(1, 5, "abc").v2();
        // FileNameLength = 200 bytes
        bytes[56..58].copy_from_slice(&200u16.to_le_bytes());
        assert!(UsnEntry::parse(&bytes).is_err());
    }

    #[test]
    fn parse_rejects_truncated_header() {
        let bytes = RecordBuilder::new(1, 5, "abc").v2();
        assert!(UsnEntry::parse(&bytes[..40]).is_err());
        assert!(UsnEntry::parse(&bytes[..4]).is_err());
    }

    #[test]
    fn reason_string_unknown_when_empty() {
        assert_eq!(reason_to_string(0), "UNKNOWN");
        assert_eq!(
            reason_to_string(USN_REASON_FILE_CREATE | USN_REASON_FILE_DELETE),
            "FILE_CREATE | FILE_DELETE"
        );
    }

    #[test]
    fn record_buffer_walks_all_records() {
        let data = enum_buffer(
            0x99,
            &[
                RecordBuilder::new(10, 5, "a").v2(),
                RecordBuilder::new(11, 10, "bb").v2(),
                RecordBuilder::new(12, 10, "ccc").v3(),
            ],
        );

        let buffer = RecordBuffer::new(&data).unwrap();
        assert_eq!(buffer.continuation(), 0x99);
        let names: Vec<String> = buffer.map(|r| r.unwrap().file_name).collect();
        assert_eq!(names, vec!["a", "bb", "ccc"]);
    }

    #[test]
    fn record_buffer_stops_on_zero_length() {
        let mut data = enum_buffer(1, &[RecordBuilder::new(10, 5, "a").v2()]);
        data.extend_from_slice(&[0u8; 16]);

        let results: Vec<_> = RecordBuffer::new(&data).unwrap().collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }

    #[test]
    fn record_buffer_with_only_cursor_is_empty() {
        let data = 42u64.to_le_bytes();
        let mut buffer = RecordBuffer::new(&data).unwrap();
        assert!(buffer.is_empty());
        assert_eq!(buffer.next_usn(), 42);
        assert!(buffer.next().is_none());
        assert!(RecordBuffer::new(&data[..3]).is_err());
    }
}
