//! Elevation check for the change journal control codes.

use crate::{GhostResult, errors::DriverError};
use log::{debug, warn};
use std::mem::size_of;
use windows::Win32::{
    Foundation::{CloseHandle, HANDLE},
    Security::{GetTokenInformation, TOKEN_ELEVATION, TOKEN_QUERY, TokenElevation},
    System::Threading::{GetCurrentProcess, OpenProcessToken},
};

/// Access token of the current process, closed on drop.
struct ProcessToken(HANDLE);

impl ProcessToken {
    fn open() -> windows::core::Result<Self> {
        let mut handle = HANDLE::default();
        unsafe { OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut handle)? };
        Ok(ProcessToken(handle))
    }

    fn is_elevated(&self) -> windows::core::Result<bool> {
        let mut elevation = TOKEN_ELEVATION::default();
        let mut returned_length = 0;
        unsafe {
            GetTokenInformation(
                self.0,
                TokenElevation,
                Some(&mut elevation as *mut _ as *mut _),
                size_of::<TOKEN_ELEVATION>() as u32,
                &mut returned_length,
            )?
        };
        Ok(elevation.TokenIsElevated != 0)
    }
}

impl Drop for ProcessToken {
    fn drop(&mut self) {
        if let Err(err) = unsafe { CloseHandle(self.0) } {
            warn!("Failed to close process token: {}", err);
        }
    }
}

/// Volume handles for FSCTL_*_USN_* need an elevated token; fails with
/// [`DriverError::PermissionDenied`] otherwise.
pub(crate) fn require_elevation() -> GhostResult<()> {
    let elevated = ProcessToken::open()
        .and_then(|token| token.is_elevated())
        .map_err(DriverError::from)?;
    if !elevated {
        debug!("Process token is not elevated");
        return Err(DriverError::PermissionDenied.into());
    }
    Ok(())
}
