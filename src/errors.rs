//! Error taxonomy, partitioned by the layer that raised the failure.

use std::fmt;
use thiserror::Error;

/// The layer a [`GhostDirError`] originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Driver,
    Dao,
    Service,
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Driver => "driver",
            ErrorKind::Dao => "dao",
            ErrorKind::Service => "service",
            ErrorKind::Config => "config",
        };
        f.write_str(name)
    }
}

/// Root error type for every fallible operation in this crate.
#[derive(Debug, Error)]
pub enum GhostDirError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Dao(#[from] DaoError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl GhostDirError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GhostDirError::Validation(_) => ErrorKind::Validation,
            GhostDirError::Driver(_) => ErrorKind::Driver,
            GhostDirError::Dao(_) => ErrorKind::Dao,
            GhostDirError::Service(_) => ErrorKind::Service,
            GhostDirError::Config(_) => ErrorKind::Config,
        }
    }

    /// Returns true for driver failures scoped to a single file, which a scan
    /// logs and skips.
    pub fn is_recoverable(&self) -> bool {
        match self {
            GhostDirError::Driver(err) => err.is_recoverable(),
            _ => false,
        }
    }
}

#[cfg(windows)]
impl From<windows::core::Error> for GhostDirError {
    fn from(err: windows::core::Error) -> Self {
        GhostDirError::Driver(DriverError::from(err))
    }
}

#[derive(Debug, Error)]
#[error("Invalid value for `{field}` ({value:?}): {reason}")]
pub struct ValidationError {
    pub field: String,
    pub value: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: &str, value: impl ToString, reason: impl Into<String>) -> Self {
        ValidationError {
            field: field.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Access denied: Administrator privileges required. Please run the application as Administrator to access the USN journal.")]
    PermissionDenied,

    #[error("Invalid mount point: {0}")]
    InvalidMountPoint(String),

    #[error("USN journal is not active on this volume")]
    JournalNotActive,

    #[error("USN journal records at the requested position were deleted")]
    JournalEntryDeleted,

    #[error("File {0:#x} no longer exists")]
    FileNotFound(u64),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Malformed record: {0}")]
    Malformed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(windows)]
    #[error("Windows error: {0}")]
    WinApi(windows::core::Error),
}

impl DriverError {
    /// Applies to per-file calls only (reparse data, id to path). Errors out
    /// of an MFT or journal enumeration always abort it.
    pub fn is_recoverable(&self) -> bool {
        match self {
            DriverError::FileNotFound(_) | DriverError::Malformed(_) => true,
            #[cfg(windows)]
            DriverError::WinApi(err) => {
                use windows::Win32::Foundation::{
                    ERROR_ACCESS_DENIED, ERROR_FILE_NOT_FOUND, ERROR_INVALID_PARAMETER,
                    ERROR_SHARING_VIOLATION,
                };
                [
                    ERROR_ACCESS_DENIED,
                    ERROR_FILE_NOT_FOUND,
                    ERROR_INVALID_PARAMETER,
                    ERROR_SHARING_VIOLATION,
                ]
                .iter()
                .any(|code| err.code() == (*code).into())
            }
            _ => false,
        }
    }
}

#[cfg(windows)]
impl From<windows::core::Error> for DriverError {
    fn from(err: windows::core::Error) -> Self {
        use windows::Win32::Foundation::{ERROR_JOURNAL_ENTRY_DELETED, ERROR_JOURNAL_NOT_ACTIVE};
        if err.code() == ERROR_JOURNAL_ENTRY_DELETED.into() {
            DriverError::JournalEntryDeleted
        } else if err.code() == ERROR_JOURNAL_NOT_ACTIVE.into() {
            DriverError::JournalNotActive
        } else {
            // Access denied stays WinApi here: per-file it is recoverable, the
            // volume module maps volume-level denial to PermissionDenied.
            DriverError::WinApi(err)
        }
    }
}

#[derive(Debug, Error)]
pub enum DaoError {
    #[error("Store IO error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unsupported snapshot version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("Snapshot belongs to volume {found}, not {expected}")]
    VolumeMismatch { found: String, expected: String },
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Journal cursor is no longer valid: {0}")]
    CursorInvalid(String),

    #[error("No snapshot stored yet; run a full scan first")]
    NoSnapshot,

    #[error("Operation aborted: {0}")]
    Aborted(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Missing configuration value: {0}")]
    Missing(&'static str),

    #[error("Conflicting configuration: {0}")]
    Conflict(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_category_converts_into_root() {
        let errors: Vec<GhostDirError> = vec![
            ValidationError::new("drive_letter", '1', "not a letter").into(),
            DriverError::JournalNotActive.into(),
            DaoError::UnsupportedVersion {
                found: 9,
                expected: 1,
            }
            .into(),
            ServiceError::NoSnapshot.into(),
            ConfigError::Missing("volume").into(),
        ];

        let kinds: Vec<ErrorKind> = errors.iter().map(GhostDirError::kind).collect();
        assert_eq!(
            kinds,
            vec![
                ErrorKind::Validation,
                ErrorKind::Driver,
                ErrorKind::Dao,
                ErrorKind::Service,
                ErrorKind::Config,
            ]
        );
    }

    #[test]
    fn categories_are_distinguishable() {
        let err: GhostDirError = ServiceError::Aborted("stop".into()).into();
        assert!(matches!(err, GhostDirError::Service(_)));
        assert!(!matches!(err, GhostDirError::Driver(_)));
        assert_eq!(err.kind().to_string(), "service");
    }

    #[test]
    fn display_is_transparent() {
        let err: GhostDirError = ValidationError::new("buffer_size", 3, "too small").into();
        assert_eq!(
            err.to_string(),
            "Invalid value for `buffer_size` (\"3\"): too small"
        );
    }

    #[test]
    fn recoverable_only_for_per_file_driver_errors() {
        assert!(GhostDirError::from(DriverError::FileNotFound(42)).is_recoverable());
        assert!(GhostDirError::from(DriverError::Malformed("x".into())).is_recoverable());
        assert!(!GhostDirError::from(DriverError::PermissionDenied).is_recoverable());
        assert!(!GhostDirError::from(ServiceError::NoSnapshot).is_recoverable());
    }
}
