use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// symlinks followed while resolving one path, same as the kernel's limit
pub const MAX_SYMLINKS: usize = 40;

/// lexically clean an archive path into a path relative to the bundle root
///
/// leading `/` and `.` components are dropped, so absolute entry paths land
/// inside the root. a `..` that would climb above the root is an escape.
/// the empty path is the root itself.
pub fn normalize(raw: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return Err(Error::PathEscape(raw.to_path_buf()));
                }
            }
            Component::Normal(name) => out.push(name),
        }
    }
    Ok(out)
}

/// an entry path resolved against what is on disk
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolved {
    /// symlink-free path relative to the bundle root
    pub rel: PathBuf,
    /// absolute path to operate on
    pub full: PathBuf,
}

impl Resolved {
    /// directory the object lives in
    pub fn parent(&self) -> Option<&Path> {
        if self.rel.as_os_str().is_empty() {
            return None;
        }
        self.full.parent()
    }
}

/// resolve a normalized path inside `root`
///
/// every component but the last is resolved against the filesystem. a
/// component that is a symlink is replaced by its target: absolute targets
/// restart at the root, relative ones continue from the link's directory.
/// climbing above the root fails with `PathEscape`. the last component is
/// never followed, so it can be replaced safely.
pub fn resolve(root: &Path, rel: &Path) -> Result<Resolved> {
    let mut components: Vec<OsString> = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(name) => components.push(name.to_os_string()),
            _ => return Err(Error::PathEscape(rel.to_path_buf())),
        }
    }
    let Some(last) = components.pop() else {
        return Ok(Resolved {
            rel: PathBuf::new(),
            full: root.to_path_buf(),
        });
    };

    let mut names: VecDeque<OsString> = components.into_iter().collect();
    let mut resolved = PathBuf::new();
    let mut followed = 0;

    while let Some(name) = names.pop_front() {
        if name == ".." {
            if !resolved.pop() {
                return Err(Error::PathEscape(rel.to_path_buf()));
            }
            continue;
        }

        let candidate = resolved.join(&name);
        let on_disk = root.join(&candidate);
        match fs::symlink_metadata(&on_disk) {
            Ok(meta) if meta.file_type().is_symlink() => {
                followed += 1;
                if followed > MAX_SYMLINKS {
                    return Err(Error::TooManySymlinks(rel.to_path_buf()));
                }
                let target = fs::read_link(&on_disk).map_err(|source| Error::Io {
                    path: on_disk.clone(),
                    source,
                })?;
                if target.is_absolute() {
                    resolved.clear();
                }
                // splice the target's components in front of what is left
                let mut spliced: Vec<OsString> = Vec::new();
                for component in target.components() {
                    match component {
                        Component::Normal(n) => spliced.push(n.to_os_string()),
                        Component::ParentDir => spliced.push(OsString::from("..")),
                        _ => {}
                    }
                }
                for n in spliced.into_iter().rev() {
                    names.push_front(n);
                }
            }
            // directories, missing components (created later) and anything
            // else are taken as they are
            _ => resolved = candidate,
        }
    }

    resolved.push(&last);
    Ok(Resolved {
        full: root.join(&resolved),
        rel: resolved,
    })
}
