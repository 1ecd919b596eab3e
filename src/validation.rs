use crate::{
    GhostResult, errors::ValidationError, record::USN_RECORD_V3_HEADER_LEN,
};
use std::path::Path;

/// Longest NTFS file name, in UTF-16 units.
const MAX_NAME_UNITS: usize = 255;

/// Smallest buffer that can hold the 8-byte continuation value plus the
/// largest record: a V3 header and a 255-character name, 8-byte aligned.
pub const MIN_BUFFER_SIZE: usize =
    8 + (USN_RECORD_V3_HEADER_LEN + MAX_NAME_UNITS * 2).div_ceil(8) * 8;
pub const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

pub trait Validate {
    fn validate(&self) -> GhostResult<()>;
}

pub fn validate_drive_letter(field_name: &str, drive_letter: char) -> GhostResult<()> {
    if !drive_letter.is_ascii_alphabetic() {
        return Err(ValidationError::new(
            field_name,
            drive_letter,
            "drive letter must be a single ASCII letter A-Z",
        )
        .into());
    }
    Ok(())
}

pub fn validate_path(field_name: &str, path: &Path) -> GhostResult<()> {
    let display = path.to_string_lossy();
    if display.is_empty() {
        return Err(ValidationError::new(field_name, "", "path cannot be empty").into());
    }
    if display.contains('\0') {
        return Err(
            ValidationError::new(field_name, display, "path contains null bytes").into(),
        );
    }
    Ok(())
}

/// A mount point must be an absolute directory path.
pub fn validate_mount_point(field_name: &str, mount_point: &Path) -> GhostResult<()> {
    validate_path(field_name, mount_point)?;
    let display = mount_point.to_string_lossy();
    // `C:\mnt\vol` is absolute on Windows only; accept its shape everywhere.
    let looks_absolute = mount_point.is_absolute()
        || display.starts_with(r"\\")
        || (display.as_bytes().first().is_some_and(u8::is_ascii_alphabetic)
            && display.get(1..3) == Some(r":\"));
    if !looks_absolute {
        return Err(
            ValidationError::new(field_name, display, "mount point must be absolute").into(),
        );
    }
    Ok(())
}

pub fn validate_buffer_size(field_name: &str, size: usize) -> GhostResult<()> {
    if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&size) {
        return Err(ValidationError::new(
            field_name,
            size,
            format!(
                "buffer size must be between {} and {} bytes",
                MIN_BUFFER_SIZE, MAX_BUFFER_SIZE
            ),
        )
        .into());
    }
    Ok(())
}

pub fn validate_journal_sizes(max_size: u64, allocation_delta: u64) -> GhostResult<()> {
    if max_size == 0 {
        return Err(ValidationError::new(
            "journal.max_size",
            max_size,
            "journal size must be greater than zero",
        )
        .into());
    }
    if allocation_delta == 0 || allocation_delta > max_size {
        return Err(ValidationError::new(
            "journal.allocation_delta",
            allocation_delta,
            format!("allocation delta must be between 1 and max_size ({})", max_size),
        )
        .into());
    }
    Ok(())
}
