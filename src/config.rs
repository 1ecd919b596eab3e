//! TOML configuration.
//!
//! ```toml
//! [volume]
//! drive_letter = "C"          # or: mount_point = 'C:\mnt\data'
//!
//! [journal]
//! create_if_inactive = true
//! max_size = 33554432
//! allocation_delta = 8388608
//! buffer_size = 65536
//!
//! [scan]
//! kinds = ["junction", "symlink"]
//! exclude = ['C:\Windows\WinSxS']
//! check_targets = true
//!
//! [store]
//! path = "ghost-dir.json"
//! ```

use crate::{
    DEFAULT_BUFFER_SIZE, DEFAULT_JOURNAL_ALLOCATION_DELTA, DEFAULT_JOURNAL_MAX_SIZE, GhostResult,
    errors::ConfigError,
    reparse::ReparseKind,
    validation::{self, Validate},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_STORE_PATH: &str = "ghost-dir.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub volume: VolumeConfig,
    pub journal: JournalConfig,
    pub scan: ScanConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    pub drive_letter: Option<char>,
    pub mount_point: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    pub create_if_inactive: bool,
    pub max_size: u64,
    pub allocation_delta: u64,
    pub buffer_size: usize,
}

impl Default for JournalConfig {
    fn default() -> Self {
        JournalConfig {
            create_if_inactive: true,
            max_size: DEFAULT_JOURNAL_MAX_SIZE,
            allocation_delta: DEFAULT_JOURNAL_ALLOCATION_DELTA,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Which reparse points a scan keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KindFilter {
    Junction,
    Symlink,
    AppExecLink,
    Other,
}

impl KindFilter {
    pub fn matches(&self, kind: ReparseKind) -> bool {
        matches!(
            (self, kind),
            (KindFilter::Junction, ReparseKind::Junction)
                | (KindFilter::Symlink, ReparseKind::Symlink)
                | (KindFilter::AppExecLink, ReparseKind::AppExecLink)
                | (KindFilter::Other, ReparseKind::Other(_))
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub kinds: Vec<KindFilter>,
    /// Path prefixes whose reparse points are ignored, compared
    /// case-insensitively.
    pub exclude: Vec<PathBuf>,
    /// When false, targets are not probed and nothing is reported as a ghost.
    pub check_targets: bool,
    #[serde(skip)]
    pub create_journal_if_inactive: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        ScanConfig {
            kinds: vec![KindFilter::Junction, KindFilter::Symlink],
            exclude: Vec::new(),
            check_targets: true,
            create_journal_if_inactive: true,
        }
    }
}

impl ScanConfig {
    pub fn wants(&self, kind: ReparseKind) -> bool {
        self.kinds.iter().any(|filter| filter.matches(kind))
    }

    /// True if `path` is an excluded directory or lies below one. Matches
    /// whole components, so `C:\Temp` does not exclude `C:\Temporary`.
    pub fn is_excluded(&self, path: &Path) -> bool {
        let candidate = path.to_string_lossy().to_lowercase();
        self.exclude.iter().any(|prefix| {
            let prefix = prefix.to_string_lossy().to_lowercase();
            let prefix = prefix.trim_end_matches(SEPARATORS);
            !prefix.is_empty()
                && candidate
                    .strip_prefix(prefix)
                    .is_some_and(|rest| rest.is_empty() || rest.starts_with(SEPARATORS))
        })
    }
}

/// Exclusions are written Windows style but must also match paths joined on
/// other hosts.
const SEPARATORS: [char; 2] = ['\\', '/'];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            path: PathBuf::from(DEFAULT_STORE_PATH),
        }
    }
}

/// How the volume is addressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeSource {
    DriveLetter(char),
    MountPoint(PathBuf),
}

impl Config {
    pub fn for_drive(drive_letter: char) -> Self {
        let mut config = Config::default();
        config.volume.drive_letter = Some(drive_letter);
        config.sync_scan_options();
        config
    }

    pub fn from_file(path: &Path) -> GhostResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> GhostResult<Self> {
        let mut config: Config = toml::from_str(content).map_err(ConfigError::from)?;
        config.sync_scan_options();
        Ok(config)
    }

    /// Copies journal settings the service needs into the scan options.
    pub fn sync_scan_options(&mut self) {
        self.scan.create_journal_if_inactive = self.journal.create_if_inactive;
    }

    pub fn volume_source(&self) -> GhostResult<VolumeSource> {
        match (&self.volume.drive_letter, &self.volume.mount_point) {
            (Some(letter), None) => Ok(VolumeSource::DriveLetter(letter.to_ascii_uppercase())),
            (None, Some(mount_point)) => Ok(VolumeSource::MountPoint(mount_point.clone())),
            (Some(_), Some(_)) => Err(ConfigError::Conflict(
                "set either volume.drive_letter or volume.mount_point, not both".into(),
            )
            .into()),
            (None, None) => Err(ConfigError::Missing("volume.drive_letter or volume.mount_point").into()),
        }
    }
}

impl Validate for Config {
    fn validate(&self) -> GhostResult<()> {
        match self.volume_source()? {
            VolumeSource::DriveLetter(letter) => {
                validation::validate_drive_letter("volume.drive_letter", letter)?
            }
            VolumeSource::MountPoint(mount_point) => {
                validation::validate_mount_point("volume.mount_point", &mount_point)?
            }
        }
        validation::validate_journal_sizes(self.journal.max_size, self.journal.allocation_delta)?;
        validation::validate_buffer_size("journal.buffer_size", self.journal.buffer_size)?;
        validation::validate_path("store.path", &self.store.path)?;
        if self.scan.kinds.is_empty() {
            return Err(ConfigError::Missing("scan.kinds").into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ErrorKind, reparse::IO_REPARSE_TAG_APPEXECLINK};
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn parses_full_file() {
        let config = Config::from_toml_str(
            r#"
            [volume]
            drive_letter = "d"

            [journal]
            create_if_inactive = false
            max_size = 1048576
            allocation_delta = 65536
            buffer_size = 131072

            [scan]
            kinds = ["junction", "app_exec_link"]
            exclude = ['D:\Windows']
            check_targets = false

            [store]
            path = 'D:\state\ghosts.json'
            "#,
        )
        .unwrap();

        assert_eq!(config.volume_source().unwrap(), VolumeSource::DriveLetter('D'));
        assert!(!config.journal.create_if_inactive);
        assert!(!config.scan.create_journal_if_inactive);
        assert_eq!(config.journal.buffer_size, 131072);
        assert!(config.scan.wants(ReparseKind::Junction));
        assert!(config.scan.wants(ReparseKind::from_tag(IO_REPARSE_TAG_APPEXECLINK)));
        assert!(!config.scan.wants(ReparseKind::Symlink));
        assert!(!config.scan.check_targets);
        assert_eq!(config.store.path, PathBuf::from(r"D:\state\ghosts.json"));
        config.validate().unwrap();
    }

    #[test]
    fn defaults_fill_missing_sections() {
        let config = Config::from_toml_str("[volume]\ndrive_letter = \"C\"\n").unwrap();
        assert_eq!(config.journal.max_size, DEFAULT_JOURNAL_MAX_SIZE);
        assert_eq!(config.journal.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(config.store.path, PathBuf::from(DEFAULT_STORE_PATH));
        assert!(config.scan.wants(ReparseKind::Symlink));
        assert!(config.scan.check_targets);
        config.validate().unwrap();
    }

    #[test]
    fn volume_must_be_set_exactly_once() {
        let none = Config::default();
        assert_eq!(none.volume_source().unwrap_err().kind(), ErrorKind::Config);

        let both = Config::from_toml_str(
            "[volume]\ndrive_letter = \"C\"\nmount_point = 'C:\\mnt'\n",
        )
        .unwrap();
        let err = both.validate().unwrap_err();
        assert!(matches!(err, crate::GhostDirError::Config(ConfigError::Conflict(_))));
    }

    #[test]
    fn invalid_values_are_validation_errors() {
        let mut config = Config::for_drive('C');
        config.journal.allocation_delta = config.journal.max_size + 1;
        assert_eq!(config.validate().unwrap_err().kind(), ErrorKind::Validation);

        let config = Config::for_drive('7');
        assert_eq!(config.validate().unwrap_err().kind(), ErrorKind::Validation);
    }

    #[test]
    fn malformed_toml_is_config_error() {
        let err = Config::from_toml_str("[volume\n").unwrap_err();
        assert!(matches!(err, crate::GhostDirError::Config(ConfigError::Parse(_))));
    }

    #[test]
    fn reads_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[volume]\nmount_point = 'C:\\mnt\\vhd'").unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(
            config.volume_source().unwrap(),
            VolumeSource::MountPoint(PathBuf::from(r"C:\mnt\vhd"))
        );

        let missing = Config::from_file(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(missing, crate::GhostDirError::Config(ConfigError::Read { .. })));
    }

    #[test]
    fn exclusion_is_case_insensitive_prefix() {
        let scan = ScanConfig {
            exclude: vec![PathBuf::from(r"C:\Windows\WinSxS")],
            ..ScanConfig::default()
        };
        assert!(scan.is_excluded(Path::new(r"c:\windows\winsxs\amd64_x\link")));
        assert!(scan.is_excluded(Path::new(r"C:\Windows\WinSxS")));
        assert!(!scan.is_excluded(Path::new(r"C:\Users\link")));
        assert!(!scan.is_excluded(Path::new(r"C:\Windows\WinSxSBackup\link")));
    }

    #[test]
    fn exclusion_matches_whole_components() {
        let scan = ScanConfig {
            exclude: vec![PathBuf::from("vol/links/old/"), PathBuf::from(r"D:\")],
            ..ScanConfig::default()
        };
        assert!(scan.is_excluded(Path::new("vol/links/old")));
        assert!(scan.is_excluded(Path::new("vol/links/old/inner")));
        assert!(!scan.is_excluded(Path::new("vol/links/older")));
        assert!(scan.is_excluded(Path::new(r"d:\Apps\link")));
        assert!(!scan.is_excluded(Path::new(r"DATA\link")));
    }
}
