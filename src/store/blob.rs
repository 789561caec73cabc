use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::digest::{Algorithm, Digest, DigestHasher};
use crate::error::{Error, IoResultExt, Result};
use crate::store::Store;
use crate::types::Descriptor;

/// a blob being read back from the store
///
/// every byte handed out is hashed; hitting end of stream with a digest
/// (or size) other than the requested one is an error, never silent success.
pub struct BlobReader<R> {
    inner: R,
    path: PathBuf,
    hasher: Option<DigestHasher>,
    actual: Option<Digest>,
    expected: Digest,
    expected_size: Option<u64>,
    read: u64,
}

impl<R: Read> BlobReader<R> {
    pub fn new(inner: R, path: PathBuf, expected: Digest, expected_size: Option<u64>) -> Self {
        Self {
            inner,
            path,
            hasher: Some(DigestHasher::new(expected.algorithm())),
            actual: None,
            expected,
            expected_size,
            read: 0,
        }
    }

    /// the digest this blob must hash to
    pub fn digest(&self) -> &Digest {
        &self.expected
    }

    /// bytes consumed so far
    pub fn bytes_read(&self) -> u64 {
        self.read
    }

    /// drain whatever is left and verify digest and size
    ///
    /// a parser that stops early (tar stops at its end-of-archive blocks)
    /// still gets the whole blob checked this way.
    pub fn finish(mut self) -> Result<u64> {
        io::copy(&mut self, &mut io::sink())
            .map_err(|e| Error::take_typed(e).unwrap_or_else(|e| Error::Io {
                path: self.path.clone(),
                source: e,
            }))?;
        self.verify()?;
        Ok(self.read)
    }

    // called at end of stream; the verdict sticks for later calls
    fn verify(&mut self) -> Result<()> {
        if let Some(hasher) = self.hasher.take() {
            self.actual = Some(hasher.finalize());
        }
        if let Some(expected) = self.expected_size {
            if expected != self.read {
                return Err(Error::SizeMismatch {
                    digest: self.expected.clone(),
                    expected,
                    actual: self.read,
                });
            }
        }
        match &self.actual {
            Some(actual) if *actual != self.expected => Err(Error::DigestMismatch {
                expected: self.expected.clone(),
                actual: actual.clone(),
            }),
            _ => Ok(()),
        }
    }
}

impl<R: Read> Read for BlobReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 {
            if !buf.is_empty() {
                self.verify().map_err(Error::into_io)?;
            }
            return Ok(0);
        }

        self.read += n as u64;
        if let Some(expected) = self.expected_size {
            if self.read > expected {
                return Err(Error::SizeMismatch {
                    digest: self.expected.clone(),
                    expected,
                    actual: self.read,
                }
                .into_io());
            }
        }
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(&buf[..n]);
        }
        Ok(n)
    }
}

/// write a blob, returning its sha256 digest and length
pub fn put_blob<R: Read>(store: &Store, reader: &mut R) -> Result<(Digest, u64)> {
    let tmp_path = store.tmp_path().join(uuid::Uuid::new_v4().to_string());

    let (digest, size) = match write_tmp(&tmp_path, reader) {
        Ok(written) => written,
        Err(e) => {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }
    };
    let blob_path = store.blob_path(&digest);

    // deduplication: identical content is already there
    if blob_path.exists() {
        fs::remove_file(&tmp_path).with_path(&tmp_path)?;
        return Ok((digest, size));
    }

    let blob_dir = store.algorithm_path(digest.algorithm());
    let stored = fs::create_dir_all(&blob_dir)
        .with_path(&blob_dir)
        .and_then(|()| fs::rename(&tmp_path, &blob_path).with_path(&blob_path));
    if let Err(e) = stored {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }
    fsync_dir(&blob_dir)?;

    debug!(digest = %digest, size, "stored blob");
    Ok((digest, size))
}

/// copy content to a temp file while hashing it
fn write_tmp<R: Read>(tmp_path: &Path, reader: &mut R) -> Result<(Digest, u64)> {
    let mut hasher = DigestHasher::new(Algorithm::Sha256);
    let mut size = 0u64;
    let mut tmp_file = File::create(tmp_path).with_path(tmp_path)?;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).with_path(tmp_path)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        tmp_file.write_all(&buf[..n]).with_path(tmp_path)?;
        size += n as u64;
    }
    tmp_file.sync_all().with_path(tmp_path)?;
    Ok((hasher.finalize(), size))
}

/// write a value as canonical json (sorted keys, no whitespace)
pub fn put_blob_json<T: Serialize>(store: &Store, value: &T) -> Result<(Digest, u64)> {
    // going through Value sorts object keys
    let canonical = serde_json::to_vec(&serde_json::to_value(value)?)?;
    put_blob(store, &mut canonical.as_slice())
}

/// check if a blob exists in the store
pub fn blob_exists(store: &Store, digest: &Digest) -> bool {
    store.blob_path(digest).is_file()
}

/// open a blob for verified streaming
pub fn get_blob(store: &Store, digest: &Digest) -> Result<BlobReader<File>> {
    open_blob(store, digest, None)
}

/// open the blob a descriptor names, verifying digest and size
pub fn open_descriptor(store: &Store, desc: &Descriptor) -> Result<BlobReader<File>> {
    open_blob(store, &desc.digest, Some(desc.size))
}

fn open_blob(store: &Store, digest: &Digest, size: Option<u64>) -> Result<BlobReader<File>> {
    let path = store.blob_path(digest);
    let file = File::open(&path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            Error::BlobNotFound(digest.clone())
        } else {
            Error::Io {
                path: path.clone(),
                source: e,
            }
        }
    })?;
    Ok(BlobReader::new(file, path, digest.clone(), size))
}

/// read a whole blob into memory, verified
pub fn read_blob(store: &Store, digest: &Digest) -> Result<Vec<u8>> {
    let mut reader = get_blob(store, digest)?;
    let mut data = Vec::new();
    reader
        .read_to_end(&mut data)
        .map_err(|e| Error::take_typed(e).unwrap_or_else(|e| Error::Io {
            path: store.blob_path(digest),
            source: e,
        }))?;
    reader.finish()?;
    Ok(data)
}

/// read and parse a json blob named by a descriptor
pub fn get_blob_json<T: DeserializeOwned>(store: &Store, desc: &Descriptor) -> Result<T> {
    let mut reader = open_descriptor(store, desc)?;
    let mut data = Vec::new();
    reader
        .read_to_end(&mut data)
        .map_err(|e| Error::take_typed(e).unwrap_or_else(|e| Error::Io {
            path: store.blob_path(&desc.digest),
            source: e,
        }))?;
    reader.finish()?;
    Ok(serde_json::from_slice(&data)?)
}

/// describe a stored blob, taking its size from disk
pub fn blob_descriptor(store: &Store, digest: &Digest, media_type: &str) -> Result<Descriptor> {
    let path = store.blob_path(digest);
    let meta = fs::metadata(&path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            Error::BlobNotFound(digest.clone())
        } else {
            Error::Io {
                path: path.clone(),
                source: e,
            }
        }
    })?;
    Ok(Descriptor::new(media_type, digest.clone(), meta.len()))
}

/// hash a blob end to end without keeping its content
pub fn verify_blob(store: &Store, desc: &Descriptor) -> Result<()> {
    open_descriptor(store, desc)?.finish().map(|_| ())
}

/// a blob whose content does not match its name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptBlob {
    pub path: PathBuf,
    pub reason: String,
}

/// verify every blob in the store
pub fn fsck(store: &Store) -> Result<Vec<CorruptBlob>> {
    let mut corrupt = Vec::new();
    let blobs = store.blobs_path();

    for entry in WalkDir::new(&blobs).min_depth(2).max_depth(2) {
        let entry = entry.map_err(|e| Error::Io {
            path: blobs.clone(),
            source: e.into(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let algorithm = entry
            .path()
            .parent()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = format!("{}:{}", algorithm, entry.file_name().to_string_lossy());

        let result = Digest::parse(&name).and_then(|digest| get_blob(store, &digest)?.finish());
        if let Err(e) = result {
            warn!(path = ?entry.path(), error = %e, "corrupt blob");
            corrupt.push(CorruptBlob {
                path: entry.path().to_path_buf(),
                reason: e.to_string(),
            });
        }
    }

    Ok(corrupt)
}

/// fsync a directory
fn fsync_dir(path: &Path) -> Result<()> {
    let dir = File::open(path).with_path(path)?;
    dir.sync_all().with_path(path)?;
    Ok(())
}
