use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, IoResultExt, Result};
use crate::fs::{remove_all, WritableDir};

/// prefix marking an entry as a whiteout
pub const WHITEOUT_PREFIX: &str = ".wh.";
/// prefix of aufs metadata names
pub const WHITEOUT_META_PREFIX: &str = ".wh..wh.";
/// marks a directory as opaque
pub const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";

/// what a whiteout-named entry asks for
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Marker {
    /// delete this path
    Remove(PathBuf),
    /// drop lower-layer children of this directory
    Opaque(PathBuf),
    /// other aufs metadata, nothing to do
    Internal,
}

/// classify a normalized entry path, None when it is not a whiteout
pub fn classify(path: &Path) -> Result<Option<Marker>> {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return Ok(None);
    };
    let Some(stripped) = name.strip_prefix(WHITEOUT_PREFIX) else {
        return Ok(None);
    };
    let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();

    if name == WHITEOUT_OPAQUE {
        return Ok(Some(Marker::Opaque(parent)));
    }
    if name.starts_with(WHITEOUT_META_PREFIX) {
        return Ok(Some(Marker::Internal));
    }
    if stripped.is_empty() || stripped == "." || stripped == ".." {
        return Err(Error::MalformedArchive(format!(
            "whiteout without a target: {}",
            path.display()
        )));
    }
    Ok(Some(Marker::Remove(parent.join(stripped))))
}

/// delete a whiteout target; an absent target is fine
pub fn remove_target(full: &Path, rootless: bool) -> Result<bool> {
    match fs::symlink_metadata(full) {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e).with_path(full),
    }
    remove_all(full, rootless)?;
    Ok(true)
}

/// remove every child of `dir` the current layer did not create
///
/// `upper` holds the root-relative paths written by this layer so far;
/// directories among them are kept and searched for lower-layer children.
pub fn make_opaque(
    root: &Path,
    dir_rel: &Path,
    upper: &HashSet<PathBuf>,
    rootless: bool,
) -> Result<u64> {
    let dir = root.join(dir_rel);
    match fs::symlink_metadata(&dir) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => return Ok(0),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).with_path(&dir),
    }

    let _guard = if rootless {
        WritableDir::open_up(&dir)?
    } else {
        None
    };

    let mut removed = 0;
    for child in fs::read_dir(&dir).with_path(&dir)? {
        let child = child.with_path(&dir)?;
        let child_rel = dir_rel.join(child.file_name());
        let file_type = child.file_type().with_path(child.path())?;

        if upper.contains(&child_rel) {
            if file_type.is_dir() {
                removed += make_opaque(root, &child_rel, upper, rootless)?;
            }
            continue;
        }

        debug!(path = ?child_rel, "opaque whiteout removes lower entry");
        remove_all(&child.path(), rootless)?;
        removed += 1;
    }
    Ok(removed)
}
