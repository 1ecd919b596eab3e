//! Volume handle management for NTFS volumes, plus the per-file operations
//! that go through the volume handle (open by file id).

use crate::{
    Fid, GhostResult,
    errors::DriverError,
    privilege,
    reparse::{MAXIMUM_REPARSE_DATA_BUFFER_SIZE, ReparseTarget},
};
use log::{debug, warn};
use std::{
    ffi::{OsString, c_void},
    mem::size_of,
    os::windows::ffi::OsStringExt,
    path::{Path, PathBuf},
};
use windows::{
    Win32::{
        Foundation::{
            CloseHandle, ERROR_ACCESS_DENIED, ERROR_FILE_NOT_FOUND, ERROR_INVALID_PARAMETER,
            ERROR_MORE_DATA, ERROR_NOT_A_REPARSE_POINT, HANDLE, MAX_PATH,
        },
        Storage::FileSystem::{
            self, CreateFileW, FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OPEN_REPARSE_POINT,
            FILE_FLAGS_AND_ATTRIBUTES, FILE_GENERIC_READ, FILE_ID_DESCRIPTOR, FILE_READ_ATTRIBUTES,
            FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE,
            GetVolumeNameForVolumeMountPointW, OPEN_EXISTING,
        },
        System::{IO::DeviceIoControl, Ioctl::FSCTL_GET_REPARSE_POINT},
    },
    core::HSTRING,
};

/// An open NTFS volume, addressed by drive letter or mount point.
/// The handle is closed on drop.
#[derive(Debug)]
pub struct Volume {
    pub(crate) handle: HANDLE,
    pub drive_letter: Option<char>,
    pub mount_point: Option<PathBuf>,
}

impl Volume {
    pub fn from_drive_letter(drive_letter: char) -> GhostResult<Self> {
        let drive_letter = drive_letter.to_ascii_uppercase();
        let handle = get_volume_handle_from_drive_letter(drive_letter)?;
        Ok(Volume {
            handle,
            drive_letter: Some(drive_letter),
            mount_point: None,
        })
    }

    pub fn from_mount_point(mount_point: &Path) -> GhostResult<Self> {
        let handle = get_volume_handle_from_mount_point(mount_point)?;
        Ok(Volume {
            handle,
            drive_letter: None,
            mount_point: Some(mount_point.to_path_buf()),
        })
    }

    pub fn id(&self) -> String {
        match (&self.drive_letter, &self.mount_point) {
            (Some(letter), _) => format!("{}:", letter),
            (None, Some(mount_point)) => mount_point.to_string_lossy().into_owned(),
            (None, None) => String::new(),
        }
    }

    /// `C:\` for drive letters, the mount point otherwise.
    pub fn root(&self) -> PathBuf {
        match (&self.drive_letter, &self.mount_point) {
            (Some(letter), _) => PathBuf::from(format!("{}:\\", letter)),
            (None, Some(mount_point)) => mount_point.clone(),
            (None, None) => PathBuf::new(),
        }
    }

    fn open_by_id(&self, fid: Fid, access: u32, flags: FILE_FLAGS_AND_ATTRIBUTES) -> GhostResult<HANDLE> {
        let file_id_desc = FILE_ID_DESCRIPTOR {
            Type: FileSystem::FileIdType,
            dwSize: size_of::<FILE_ID_DESCRIPTOR>() as u32,
            Anonymous: FileSystem::FILE_ID_DESCRIPTOR_0 { FileId: fid as i64 },
        };

        let handle = unsafe {
            FileSystem::OpenFileById(
                self.handle,
                &file_id_desc,
                access,
                FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
                None,
                flags,
            )
        };

        match handle {
            Ok(handle) => Ok(handle),
            // A stale file reference (sequence number mismatch) or a deleted
            // record reports one of these.
            Err(err)
                if err.code() == ERROR_INVALID_PARAMETER.into()
                    || err.code() == ERROR_FILE_NOT_FOUND.into() =>
            {
                Err(DriverError::FileNotFound(fid).into())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Resolves a file ID to its full path on this volume.
    pub fn file_id_to_path(&self, fid: Fid) -> GhostResult<PathBuf> {
        let file_handle = self.open_by_id(
            fid,
            FILE_READ_ATTRIBUTES.0,
            FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OPEN_REPARSE_POINT,
        )?;

        let init_len = size_of::<u32>() + (MAX_PATH as usize) * size_of::<u16>();
        let mut info_buffer = vec![0u8; init_len];

        let result = loop {
            if let Err(err) = unsafe {
                FileSystem::GetFileInformationByHandleEx(
                    file_handle,
                    FileSystem::FileNameInfo,
                    info_buffer.as_mut_ptr() as *mut c_void,
                    info_buffer.len() as u32,
                )
            } {
                if err.code() == ERROR_MORE_DATA.into() {
                    // Long path: FileNameLength tells how much room is needed.
                    let name_info = unsafe {
                        std::ptr::read_unaligned(
                            info_buffer.as_ptr() as *const FileSystem::FILE_NAME_INFO
                        )
                    };
                    let needed_len = name_info.FileNameLength as usize + size_of::<u32>();
                    info_buffer.resize(needed_len, 0);
                    continue;
                }
                break Err(err);
            }
            break Ok(());
        };

        unsafe { CloseHandle(file_handle)? };
        result?;

        // SAFETY: GetFileInformationByHandleEx filled the buffer with a
        // FILE_NAME_INFO whose name fits in the buffer.
        let info = unsafe { &*(info_buffer.as_ptr() as *const FileSystem::FILE_NAME_INFO) };
        let name_len = info.FileNameLength as usize / size_of::<u16>();
        let name_u16 = unsafe { std::slice::from_raw_parts(info.FileName.as_ptr(), name_len) };
        let sub_path = OsString::from_wide(name_u16);

        // FileNameInfo is volume-relative and starts with a backslash.
        let mut full_path = self.root();
        full_path.push(PathBuf::from(sub_path).strip_prefix("\\").unwrap_or(Path::new("")));
        Ok(full_path)
    }

    /// Reads and decodes the reparse data of `fid`. Returns `None` when the
    /// file is not a reparse point.
    pub fn read_reparse_point(&self, fid: Fid) -> GhostResult<Option<ReparseTarget>> {
        let file_handle = self.open_by_id(
            fid,
            FILE_READ_ATTRIBUTES.0,
            FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OPEN_REPARSE_POINT,
        )?;

        let mut buffer = vec![0u8; MAXIMUM_REPARSE_DATA_BUFFER_SIZE];
        let mut bytes_returned = 0u32;

        let result = unsafe {
            // https://learn.microsoft.com/en-us/windows/win32/api/winioctl/ni-winioctl-fsctl_get_reparse_point
            DeviceIoControl(
                file_handle,
                FSCTL_GET_REPARSE_POINT,
                None,
                0,
                Some(buffer.as_mut_ptr() as _),
                buffer.len() as u32,
                Some(&mut bytes_returned),
                None,
            )
        };
        unsafe { CloseHandle(file_handle)? };

        if let Err(err) = result {
            if err.code() == ERROR_NOT_A_REPARSE_POINT.into() {
                debug!("File {:#x} is no longer a reparse point", fid);
                return Ok(None);
            }
            warn!("FSCTL_GET_REPARSE_POINT failed for {:#x}: {}", fid, err);
            return Err(err.into());
        }

        let data = buffer.get(..bytes_returned as usize).unwrap_or_default();
        Ok(Some(ReparseTarget::parse(data)?))
    }
}

impl Drop for Volume {
    fn drop(&mut self) {
        if let Err(err) = unsafe { CloseHandle(self.handle) } {
            warn!("Failed to close volume handle: {}", err);
        }
    }
}

fn open_volume(path: &str) -> GhostResult<HANDLE> {
    match unsafe {
        CreateFileW(
            &HSTRING::from(path),
            FILE_GENERIC_READ.0,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            None,
            OPEN_EXISTING,
            FILE_FLAGS_AND_ATTRIBUTES::default(),
            None,
        )
    } {
        Ok(handle) => Ok(handle),
        Err(err) if err.code() == ERROR_ACCESS_DENIED.into() => {
            Err(DriverError::PermissionDenied.into())
        }
        Err(err) => Err(err.into()),
    }
}

/// Opens a handle to an NTFS volume using a drive letter.
fn get_volume_handle_from_drive_letter(drive_letter: char) -> GhostResult<HANDLE> {
    privilege::require_elevation()?;

    // https://learn.microsoft.com/en-us/windows/win32/fileio/obtaining-a-volume-handle-for-change-journal-operations
    // Change journal operations need a handle to \\.\X: where X is the drive letter.
    open_volume(&format!(r"\\.\{}:", drive_letter))
}

/// Opens a handle to an NTFS volume using a mount point path.
fn get_volume_handle_from_mount_point(mount_point: &Path) -> GhostResult<HANDLE> {
    privilege::require_elevation()?;

    // GetVolumeNameForVolumeMountPointW requires a trailing backslash
    let mut mount_path = mount_point.to_string_lossy().into_owned();
    if !mount_path.ends_with('\\') {
        mount_path.push('\\');
    }

    let mut volume_name = [0u16; 64]; // Enough space for volume GUID path
    if let Err(err) =
        unsafe { GetVolumeNameForVolumeMountPointW(&HSTRING::from(&mount_path), &mut volume_name) }
    {
        warn!(
            "GetVolumeNameForVolumeMountPointW failed, mount_point={}, error={:?}",
            mount_path, err
        );
        return Err(DriverError::InvalidMountPoint(mount_path).into());
    }

    let end = volume_name
        .iter()
        .position(|&c| c == 0)
        .unwrap_or(volume_name.len());
    let volume_guid = String::from_utf16_lossy(&volume_name[..end]);
    debug!("Volume GUID: {}", volume_guid);

    // CreateFileW wants the GUID path without the trailing backslash
    open_volume(volume_guid.trim_end_matches('\\'))
}
