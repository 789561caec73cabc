use std::io;
use std::path::PathBuf;

use crate::Digest;

/// error type for unlayer operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no blob store at {0}")]
    NoStore(PathBuf),

    #[error("blob store already exists at {0}")]
    StoreExists(PathBuf),

    #[error("lock contention on blob store")]
    LockContention,

    #[error("blob not found: {0}")]
    BlobNotFound(Digest),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: Digest, actual: Digest },

    #[error("size mismatch for {digest}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        digest: Digest,
        expected: u64,
        actual: u64,
    },

    #[error("diff id mismatch for layer {index}: expected {expected}, got {actual}")]
    DiffIdMismatch {
        index: usize,
        expected: Digest,
        actual: Digest,
    },

    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("unsupported image os: {0}")]
    UnsupportedOs(String),

    #[error("malformed archive: {0}")]
    MalformedArchive(String),

    #[error("path escapes bundle root: {0}")]
    PathEscape(PathBuf),

    #[error("too many levels of symbolic links resolving {0}")]
    TooManySymlinks(PathBuf),

    #[error("hardlink target not found: {target} (link {link})")]
    BrokenHardlink { link: PathBuf, target: PathBuf },

    #[error("{kind} {id} is not covered by any mapping range")]
    UnmappableId { kind: &'static str, id: u32 },

    #[error("operation requires privileges: {0}")]
    PrivilegeRequired(PathBuf),

    #[error("unpack cancelled")]
    Cancelled,

    #[error("layer callback failed: {0}")]
    Callback(String),

    #[error("layer {index} ({digest}){}: {source}", .entry.as_ref().map(|e| format!(" entry {}", e.display())).unwrap_or_default())]
    Layer {
        index: usize,
        digest: Digest,
        entry: Option<PathBuf>,
        #[source]
        source: Box<Error>,
    },

    #[error("failed to parse id mapping: {0}")]
    MappingParse(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("config serialization error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("{0} corrupt blobs in store")]
    CorruptStore(usize),

    #[error("xattr error on {path}: {message}")]
    Xattr { path: PathBuf, message: String },
}

impl Error {
    /// strip layer context, returning the error that caused the abort
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Layer { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// is this a permission failure that rootless mode may degrade
    pub(crate) fn is_permission(&self) -> bool {
        match self {
            Error::PrivilegeRequired(_) => true,
            Error::Io { source, .. } => is_permission_io(source),
            _ => false,
        }
    }

    /// recover an error that travelled through an `io::Read` boundary
    ///
    /// readers in this crate smuggle typed errors (digest mismatches) inside
    /// `io::Error`; anything else coming out of the archive stream is a
    /// structural problem with the layer.
    pub fn from_stream(err: io::Error) -> Self {
        match Self::take_typed(err) {
            Ok(typed) => typed,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                Error::MalformedArchive(format!("truncated stream: {err}"))
            }
            Err(err) => Error::MalformedArchive(err.to_string()),
        }
    }

    /// pull a typed error back out of an io::Error, or hand the io::Error back
    pub(crate) fn take_typed(err: io::Error) -> std::result::Result<Self, io::Error> {
        match err.get_ref().map(|inner| inner.is::<Error>()) {
            Some(true) => match err.into_inner().map(|inner| inner.downcast::<Error>()) {
                Some(Ok(typed)) => Ok(*typed),
                Some(Err(other)) => Err(io::Error::new(io::ErrorKind::InvalidData, other)),
                None => Err(io::Error::from(io::ErrorKind::InvalidData)),
            },
            _ => Err(err),
        }
    }

    /// wrap into an io::Error so it can cross a Read impl
    pub(crate) fn into_io(self) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, self)
    }
}

pub(crate) fn is_permission_io(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::PermissionDenied
        || matches!(err.raw_os_error(), Some(code) if code == nix::libc::EPERM)
}

pub type Result<T> = std::result::Result<T, Error>;

/// helper to wrap io errors with path context
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.into(),
            source,
        })
    }
}
