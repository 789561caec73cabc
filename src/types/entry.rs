use std::path::PathBuf;

use crate::types::Xattr;

/// entry type of a single archive record
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink,
    /// link to a path created earlier in the same layer
    Hardlink,
    CharDevice {
        major: u32,
        minor: u32,
    },
    BlockDevice {
        major: u32,
        minor: u32,
    },
    Fifo,
    /// `<dir>/.wh.<name>`: delete `<dir>/<name>`
    Whiteout {
        target: PathBuf,
    },
    /// `<dir>/.wh..wh..opq`: drop everything lower layers put in `<dir>`
    OpaqueWhiteout {
        dir: PathBuf,
    },
}

impl EntryKind {
    /// human readable type name
    pub fn type_name(&self) -> &'static str {
        match self {
            EntryKind::Regular => "regular",
            EntryKind::Directory => "directory",
            EntryKind::Symlink => "symlink",
            EntryKind::Hardlink => "hardlink",
            EntryKind::CharDevice { .. } => "char-device",
            EntryKind::BlockDevice { .. } => "block-device",
            EntryKind::Fifo => "fifo",
            EntryKind::Whiteout { .. } => "whiteout",
            EntryKind::OpaqueWhiteout { .. } => "opaque-whiteout",
        }
    }

    /// markers are resolved, never materialized
    pub fn is_whiteout(&self) -> bool {
        matches!(
            self,
            EntryKind::Whiteout { .. } | EntryKind::OpaqueWhiteout { .. }
        )
    }
}

/// modification time with sub-second precision
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Mtime {
    pub secs: i64,
    pub nanos: u32,
}

impl Mtime {
    pub fn from_secs(secs: i64) -> Self {
        Self { secs, nanos: 0 }
    }

    /// parse a pax `mtime` record such as `1506748273.2666225`
    pub fn parse_pax(value: &str) -> Option<Self> {
        let (whole, frac) = match value.split_once('.') {
            Some((w, f)) => (w, f),
            None => (value, ""),
        };
        let secs: i64 = whole.parse().ok()?;
        if !frac.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        // keep nanosecond precision, pad or truncate to 9 digits
        let digits: String = frac.chars().chain(std::iter::repeat('0')).take(9).collect();
        let nanos: u32 = digits.parse().ok()?;
        if whole.starts_with('-') && nanos > 0 {
            // -1.25 means 1.25 seconds before the epoch
            return Some(Self {
                secs: secs - 1,
                nanos: 1_000_000_000 - nanos,
            });
        }
        Some(Self { secs, nanos })
    }
}

/// one archive record, consumed and discarded while the layer streams past
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// path relative to the bundle root, normalized (no `.`/leading `/`)
    pub path: PathBuf,
    pub kind: EntryKind,
    /// symlink target or hardlink referent
    pub link_target: Option<PathBuf>,
    pub size: u64,
    pub mode: u32,
    /// owner in the image's (container) namespace
    pub uid: u32,
    pub gid: u32,
    pub mtime: Mtime,
    pub xattrs: Vec<Xattr>,
}
