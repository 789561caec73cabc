use std::fs::File;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};

use crate::digest::{Algorithm, Digest};
use crate::error::{Error, IoResultExt, Result};

const LAYOUT_FILE: &str = "oci-layout";
const LAYOUT_CONTENT: &str = "{\"imageLayoutVersion\":\"1.0.0\"}";
const EMPTY_INDEX: &str = "{\"schemaVersion\":2,\"manifests\":[]}";

/// a content-addressable blob store in OCI image-layout form
///
/// blobs live at `blobs/<algorithm>/<hex>`; writes are staged in `.tmp`
/// and renamed into place.
pub struct Store {
    path: PathBuf,
}

impl Store {
    /// initialize a new store at the given path
    pub fn init(path: &Path) -> Result<Self> {
        let layout_path = path.join(LAYOUT_FILE);
        if layout_path.exists() {
            return Err(Error::StoreExists(path.to_path_buf()));
        }

        let store = Self {
            path: path.to_path_buf(),
        };

        std::fs::create_dir_all(store.algorithm_path(Algorithm::Sha256)).with_path(path)?;
        std::fs::create_dir_all(store.tmp_path()).with_path(path)?;

        let index_path = path.join("index.json");
        if !index_path.exists() {
            std::fs::write(&index_path, EMPTY_INDEX).with_path(&index_path)?;
        }
        // written last: its presence marks a complete store
        std::fs::write(&layout_path, LAYOUT_CONTENT).with_path(&layout_path)?;

        Ok(store)
    }

    /// open an existing store
    pub fn open(path: &Path) -> Result<Self> {
        if !path.join(LAYOUT_FILE).is_file() {
            return Err(Error::NoStore(path.to_path_buf()));
        }

        let store = Self {
            path: path.to_path_buf(),
        };
        std::fs::create_dir_all(store.tmp_path()).with_path(store.tmp_path())?;
        Ok(store)
    }

    /// store root path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// path to blobs directory
    pub fn blobs_path(&self) -> PathBuf {
        self.path.join("blobs")
    }

    /// directory holding blobs of one algorithm
    pub fn algorithm_path(&self, algorithm: Algorithm) -> PathBuf {
        self.blobs_path().join(algorithm.as_str())
    }

    /// filesystem path of a blob
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.algorithm_path(digest.algorithm()).join(digest.hex())
    }

    /// path to tmp directory (for atomic writes)
    pub fn tmp_path(&self) -> PathBuf {
        self.path.join(".tmp")
    }

    /// path to lock file
    pub fn lock_path(&self) -> PathBuf {
        self.path.join(".lock")
    }

    /// acquire exclusive lock on the store
    /// returns a guard that releases the lock on drop
    pub fn lock(&self) -> Result<StoreLock> {
        let lock_path = self.lock_path();
        let file = File::create(&lock_path).with_path(&lock_path)?;

        let flock = Flock::lock(file, FlockArg::LockExclusiveNonblock)
            .map_err(|_| Error::LockContention)?;

        Ok(StoreLock { _flock: flock })
    }

    /// try to acquire exclusive lock, returning None if already locked
    pub fn try_lock(&self) -> Result<Option<StoreLock>> {
        let lock_path = self.lock_path();
        let file = File::create(&lock_path).with_path(&lock_path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => Ok(Some(StoreLock { _flock: flock })),
            Err((_, nix::errno::Errno::EWOULDBLOCK)) => Ok(None),
            Err(_) => Err(Error::LockContention),
        }
    }
}

/// guard that holds the store lock until dropped
pub struct StoreLock {
    _flock: Flock<File>,
}
