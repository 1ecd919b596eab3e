//! # ghost-dir
//!
//! Finds NTFS reparse points (junctions, symbolic links and other redirects)
//! across a volume and tracks which of them have become *ghosts*: links whose
//! target no longer exists.
//!
//! A first run enumerates the Master File Table through `FSCTL_ENUM_USN_DATA`,
//! decodes every reparse point and stores the result together with a USN
//! change journal cursor. Later runs read only the journal records written
//! since that cursor and patch the stored set.
//!
//! The crate is layered:
//! - [`record`], [`reparse`], [`index`], [`path`]: portable decoding and path
//!   reconstruction
//! - [`driver`]: the volume I/O seam, implemented over the Windows API
//! - [`store`]: persistence of snapshots (the DAO layer)
//! - [`service`]: full scans and incremental journal updates
//! - [`config`] and [`validation`]: user input
//!
//! ## Example: scan a volume
//! ```no_run
//! use ghost_dir::{config::Config, driver, service::GhostDirService, store::JsonFileStore};
//!
//! # fn main() -> ghost_dir::GhostResult<()> {
//! let config = Config::for_drive('C');
//! let driver = driver::open_driver(&config)?;
//! let store = JsonFileStore::new(&config.store.path);
//! let mut service = GhostDirService::new(driver, store, config.scan.clone());
//! let report = service.sync()?;
//! println!("{} reparse points, {} ghosts", report.reparse_points, report.ghosts);
//! # Ok(())
//! # }
//! ```
//!
//! ## Platform
//! - Volume access requires Windows, an NTFS volume and administrator
//!   privileges. On other platforms [`driver::open_driver`] returns
//!   [`errors::DriverError::Unsupported`]; every other layer is portable.

pub mod config;
pub mod driver;
pub mod errors;
pub mod index;
pub mod path;
pub mod record;
pub mod reparse;
pub mod service;
pub mod store;
pub mod validation;

#[cfg(windows)]
pub mod journal;
#[cfg(windows)]
pub mod mft;
#[cfg(windows)]
mod privilege;
#[cfg(windows)]
pub mod volume;

mod time;

pub use errors::{ErrorKind, GhostDirError};

/// A convenient type alias for Results with GhostDirError.
pub type GhostResult<T> = std::result::Result<T, GhostDirError>;


pub type Usn = i64;

/// 64-bit NTFS file reference: record number plus sequence number.
pub type Fid = u64;

pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024; // 64KB

pub const DEFAULT_JOURNAL_MAX_SIZE: u64 = 32 * 1024 * 1024; // 32MB
pub const DEFAULT_JOURNAL_ALLOCATION_DELTA: u64 = 8 * 1024 * 1024; // 8MB
pub const USN_REASON_MASK_ALL: u32 = 0xFFFFFFFF;
