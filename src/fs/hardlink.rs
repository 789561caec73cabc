use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// tracker for recreating hardlinks during unpack
///
/// a hardlink entry may only refer to something an earlier entry of the
/// same layer created. we remember where each created object landed and
/// which inode it got, so a link to a path that was since replaced or
/// removed is caught instead of linking to the wrong file.
#[derive(Default)]
pub struct LayerHardlinkTracker {
    /// maps logical path (in the layer) to filesystem path and (dev, ino)
    created: HashMap<PathBuf, (PathBuf, u64, u64)>,
}

impl LayerHardlinkTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// record that the entry at logical path was written to fs_path
    pub fn record(&mut self, logical: &Path, fs_path: &Path) -> Result<()> {
        let meta = std::fs::symlink_metadata(fs_path).map_err(|source| Error::Io {
            path: fs_path.to_path_buf(),
            source,
        })?;
        self.created.insert(
            logical.to_path_buf(),
            (fs_path.to_path_buf(), meta.dev(), meta.ino()),
        );
        Ok(())
    }

    /// forget a logical path (whiteout or replacement in this layer)
    pub fn forget(&mut self, logical: &Path) {
        self.created.retain(|p, _| !p.starts_with(logical));
    }

    /// resolve the filesystem path a hardlink entry should point at
    ///
    /// fails with `BrokenHardlink` when the target was never created in this
    /// layer or no longer is the object that was created.
    pub fn resolve(&self, link: &Path, target: &Path) -> Result<&Path> {
        let broken = || Error::BrokenHardlink {
            link: link.to_path_buf(),
            target: target.to_path_buf(),
        };
        let (fs_path, dev, ino) = self.created.get(target).ok_or_else(broken)?;
        match std::fs::symlink_metadata(fs_path) {
            Ok(meta) if meta.dev() == *dev && meta.ino() == *ino && !meta.is_dir() => {
                Ok(fs_path.as_path())
            }
            _ => Err(broken()),
        }
    }

    /// number of tracked paths
    pub fn len(&self) -> usize {
        self.created.len()
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
    }
}
