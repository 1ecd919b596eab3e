//! Decoding of `REPARSE_DATA_BUFFER` as returned by `FSCTL_GET_REPARSE_POINT`.

use crate::errors::DriverError;
use byteorder::{LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    io::Cursor,
    path::{Component, Path, PathBuf},
};

pub const IO_REPARSE_TAG_MOUNT_POINT: u32 = 0xA000_0003;
pub const IO_REPARSE_TAG_SYMLINK: u32 = 0xA000_000C;
pub const IO_REPARSE_TAG_APPEXECLINK: u32 = 0x8000_001B;

pub const SYMLINK_FLAG_RELATIVE: u32 = 0x0000_0001;

/// `FSCTL_GET_REPARSE_POINT` never returns more than 16 KiB.
pub const MAXIMUM_REPARSE_DATA_BUFFER_SIZE: usize = 16 * 1024;

const REPARSE_HEADER_LEN: usize = 8;
const MICROSOFT_TAG_BIT: u32 = 0x8000_0000;
const NAME_SURROGATE_BIT: u32 = 0x2000_0000;

/// Returns true if the tag is owned by Microsoft.
pub fn is_microsoft_tag(tag: u32) -> bool {
    tag & MICROSOFT_TAG_BIT != 0
}

/// Returns true if the tag redirects to another named entity
/// (junctions and symlinks are name surrogates).
pub fn is_name_surrogate(tag: u32) -> bool {
    tag & NAME_SURROGATE_BIT != 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReparseKind {
    Junction,
    Symlink,
    AppExecLink,
    Other(u32),
}

impl ReparseKind {
    pub fn from_tag(tag: u32) -> Self {
        match tag {
            IO_REPARSE_TAG_MOUNT_POINT => ReparseKind::Junction,
            IO_REPARSE_TAG_SYMLINK => ReparseKind::Symlink,
            IO_REPARSE_TAG_APPEXECLINK => ReparseKind::AppExecLink,
            other => ReparseKind::Other(other),
        }
    }

    /// Returns true for kinds that point at a filesystem path.
    pub fn has_target(&self) -> bool {
        !matches!(self, ReparseKind::Other(_))
    }
}

impl fmt::Display for ReparseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReparseKind::Junction => f.write_str("junction"),
            ReparseKind::Symlink => f.write_str("symlink"),
            ReparseKind::AppExecLink => f.write_str("appexeclink"),
            ReparseKind::Other(tag) => write!(f, "tag:{:#010x}", tag),
        }
    }
}

/// Decoded reparse point data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReparseTarget {
    pub tag: u32,
    pub kind: ReparseKind,
    pub substitute_name: String,
    pub print_name: String,
    /// Only symlinks can be relative.
    pub relative: bool,
}

impl ReparseTarget {
    pub fn parse(data: &[u8]) -> Result<Self, DriverError> {
        if data.len() < REPARSE_HEADER_LEN {
            return Err(DriverError::Malformed(format!(
                "reparse header truncated: {} bytes",
                data.len()
            )));
        }

        let mut cursor = Cursor::new(data);
        let tag = cursor.read_u32::<LittleEndian>()?;
        let data_length = cursor.read_u16::<LittleEndian>()? as usize;
        let _reserved = cursor.read_u16::<LittleEndian>()?;

        let body = data
            .get(REPARSE_HEADER_LEN..REPARSE_HEADER_LEN + data_length)
            .ok_or_else(|| {
                DriverError::Malformed(format!(
                    "reparse data length {} exceeds buffer of {} bytes",
                    data_length,
                    data.len()
                ))
            })?;

        let kind = ReparseKind::from_tag(tag);
        let mut target = ReparseTarget {
            tag,
            kind,
            substitute_name: String::new(),
            print_name: String::new(),
            relative: false,
        };

        match kind {
            ReparseKind::Junction => {
                let (substitute_name, print_name) = parse_names(body, 8)?;
                target.substitute_name = substitute_name;
                target.print_name = print_name;
            }
            ReparseKind::Symlink => {
                let flags = body
                    .get(8..12)
                    .map(|f| u32::from_le_bytes([f[0], f[1], f[2], f[3]]))
                    .ok_or_else(|| DriverError::Malformed("symlink flags truncated".into()))?;
                let (substitute_name, print_name) = parse_names(body, 12)?;
                target.substitute_name = substitute_name;
                target.print_name = print_name;
                target.relative = flags & SYMLINK_FLAG_RELATIVE != 0;
            }
            ReparseKind::AppExecLink => {
                // Version (u32), then NUL-terminated package id, app user model
                // id and target executable.
                let strings = body
                    .get(4..)
                    .map(split_wide_strings)
                    .unwrap_or_default();
                if let Some(exe) = strings.get(2) {
                    target.substitute_name = exe.clone();
                    target.print_name = exe.clone();
                }
            }
            ReparseKind::Other(_) => {}
        }

        Ok(target)
    }

    /// The target as a DOS path, with NT namespace prefixes removed.
    ///
    /// The print name is preferred; tools such as `mklink` fill it with the
    /// user-facing path. Returns `None` for tags without a path.
    pub fn target_path(&self) -> Option<PathBuf> {
        if !self.kind.has_target() {
            return None;
        }
        let name = if self.print_name.is_empty() {
            &self.substitute_name
        } else {
            &self.print_name
        };
        if name.is_empty() {
            return None;
        }
        Some(PathBuf::from(normalize_nt_path(name)))
    }

    /// Absolute target path, resolving relative symlinks against the
    /// directory containing the link.
    pub fn resolve_against(&self, link_path: &Path) -> Option<PathBuf> {
        let target = self.target_path()?;
        if !self.relative {
            return Some(target);
        }
        let base = link_path.parent()?;
        Some(lexical_normalize(&base.join(target)))
    }
}

/// Reads the four name fields shared by mount point and symlink buffers.
/// `path_buffer_start` is where `PathBuffer` begins within `body`; the name
/// offsets are relative to it.
fn parse_names(body: &[u8], path_buffer_start: usize) -> Result<(String, String), DriverError> {
    let mut cursor = Cursor::new(body);
    let substitute_offset = cursor.read_u16::<LittleEndian>()? as usize;
    let substitute_length = cursor.read_u16::<LittleEndian>()? as usize;
    let print_offset = cursor.read_u16::<LittleEndian>()? as usize;
    let print_length = cursor.read_u16::<LittleEndian>()? as usize;

    let path_buffer = body.get(path_buffer_start..).unwrap_or_default();
    let substitute_name = read_wide(path_buffer, substitute_offset, substitute_length)?;
    let print_name = read_wide(path_buffer, print_offset, print_length)?;
    Ok((substitute_name, print_name))
}

fn read_wide(buffer: &[u8], offset: usize, length: usize) -> Result<String, DriverError> {
    let bytes = buffer.get(offset..offset + length).ok_or_else(|| {
        DriverError::Malformed(format!(
            "name at {}+{} exceeds path buffer of {} bytes",
            offset,
            length,
            buffer.len()
        ))
    })?;
    Ok(decode_wide(bytes))
}

fn decode_wide(bytes: &[u8]) -> String {
    let wide: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&wide)
}

fn split_wide_strings(bytes: &[u8]) -> Vec<String> {
    let wide: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    wide.split(|&c| c == 0)
        .filter(|s| !s.is_empty())
        .map(String::from_utf16_lossy)
        .collect()
}

/// `\??\C:\x` and `\\?\C:\x` become `C:\x`; `\??\UNC\srv\share` becomes
/// `\\srv\share`. Volume GUID paths keep their `\\?\` form.
pub fn normalize_nt_path(path: &str) -> String {
    for prefix in [r"\??\", r"\\?\"] {
        if let Some(rest) = path.strip_prefix(prefix) {
            if let Some(unc) = rest.strip_prefix(r"UNC\") {
                return format!(r"\\{}", unc);
            }
            if rest.starts_with("Volume{") {
                return format!(r"\\?\{}", rest);
            }
            return rest.to_string();
        }
    }
    path.to_string()
}

fn lexical_normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}
