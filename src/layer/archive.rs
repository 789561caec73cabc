use std::io::Read;
use std::path::Path;

use tar::EntryType;
use tracing::debug;

use crate::error::{Error, Result};
use crate::layer::path::normalize;
use crate::layer::whiteout::{classify, Marker};
use crate::types::{ArchiveEntry, EntryKind, Mtime, Xattr};

const PAX_XATTR_PREFIX: &str = "SCHILY.xattr.";
const PAX_MTIME: &str = "mtime";

/// turn the header of a tar entry into an `ArchiveEntry`
///
/// returns None for records that carry nothing to apply (pax global
/// headers, aufs metadata). the entry's content is left unread.
pub fn read_entry<R: Read>(entry: &mut tar::Entry<'_, R>) -> Result<Option<ArchiveEntry>> {
    let raw_path = entry.path().map_err(Error::from_stream)?.into_owned();
    let entry_type = entry.header().entry_type();

    if entry_type == EntryType::XGlobalHeader {
        debug!(path = ?raw_path, "skipping pax global header");
        return Ok(None);
    }

    let path = normalize(&raw_path)?;
    let header = entry.header();
    let mode = header.mode().map_err(malformed(&raw_path))?;
    let uid = id(header.uid().map_err(malformed(&raw_path))?, &raw_path)?;
    let gid = id(header.gid().map_err(malformed(&raw_path))?, &raw_path)?;
    let header_mtime = header.mtime().map_err(malformed(&raw_path))?;
    // device numbers are blank (all NUL) on everything but device nodes
    let (major, minor) = match entry_type {
        EntryType::Char | EntryType::Block => (
            header.device_major().map_err(malformed(&raw_path))?.unwrap_or(0),
            header.device_minor().map_err(malformed(&raw_path))?.unwrap_or(0),
        ),
        _ => (0, 0),
    };

    let size = entry.size();
    let mut mtime = Mtime::from_secs(i64::try_from(header_mtime).unwrap_or(i64::MAX));
    let mut xattrs = Vec::new();
    if let Some(extensions) = entry.pax_extensions().map_err(Error::from_stream)? {
        for ext in extensions {
            let ext = ext.map_err(Error::from_stream)?;
            let Ok(key) = ext.key() else { continue };
            if let Some(name) = key.strip_prefix(PAX_XATTR_PREFIX) {
                xattrs.push(Xattr::new(name, ext.value_bytes().to_vec()));
            } else if key == PAX_MTIME {
                if let Some(precise) = ext.value().ok().and_then(Mtime::parse_pax) {
                    mtime = precise;
                }
            }
        }
    }

    let kind = match classify(&path)? {
        Some(Marker::Remove(target)) => EntryKind::Whiteout { target },
        Some(Marker::Opaque(dir)) => EntryKind::OpaqueWhiteout { dir },
        Some(Marker::Internal) => {
            debug!(path = ?path, "ignoring aufs metadata entry");
            return Ok(None);
        }
        None => match entry_type {
            EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => {
                EntryKind::Regular
            }
            EntryType::Directory => EntryKind::Directory,
            EntryType::Symlink => EntryKind::Symlink,
            EntryType::Link => EntryKind::Hardlink,
            EntryType::Char => EntryKind::CharDevice { major, minor },
            EntryType::Block => EntryKind::BlockDevice { major, minor },
            EntryType::Fifo => EntryKind::Fifo,
            other => {
                return Err(Error::MalformedArchive(format!(
                    "unsupported entry type {:?} for {}",
                    other,
                    raw_path.display()
                )))
            }
        },
    };

    let link_target = match kind {
        EntryKind::Symlink | EntryKind::Hardlink => {
            let target = entry
                .link_name()
                .map_err(Error::from_stream)?
                .ok_or_else(|| {
                    Error::MalformedArchive(format!("link without target: {}", raw_path.display()))
                })?
                .into_owned();
            // hardlinks name another entry of this layer
            if kind == EntryKind::Hardlink {
                Some(normalize(&target)?)
            } else {
                Some(target)
            }
        }
        _ => None,
    };

    Ok(Some(ArchiveEntry {
        path,
        kind,
        link_target,
        size,
        mode,
        uid,
        gid,
        mtime,
        xattrs,
    }))
}

fn id(value: u64, path: &Path) -> Result<u32> {
    u32::try_from(value).map_err(|_| {
        Error::MalformedArchive(format!("owner id {} out of range for {}", value, path.display()))
    })
}

fn malformed(path: &Path) -> impl Fn(std::io::Error) -> Error + '_ {
    move |e| Error::MalformedArchive(format!("bad header for {}: {}", path.display(), e))
}

/// list the entries of a decoded layer stream without touching the disk
pub fn list_entries<R: Read>(reader: R) -> Result<Vec<ArchiveEntry>> {
    let mut archive = tar::Archive::new(reader);
    let mut out = Vec::new();
    for entry in archive.entries().map_err(Error::from_stream)? {
        let mut entry = entry.map_err(Error::from_stream)?;
        if let Some(e) = read_entry(&mut entry)? {
            out.push(e);
        }
    }
    Ok(out)
}
