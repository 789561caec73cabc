//! unlayer - verified OCI layer unpacking
//!
//! replays the ordered layer stack of an OCI image manifest onto a bundle
//! root directory, the way a container runtime expects its rootfs.
//!
//! # Core concepts
//!
//! - **Store**: an OCI image-layout directory; blobs are addressed by digest
//!   and verified (digest and size) while they stream out
//! - **Layer**: a tar diff, plain, gzip or zstd compressed, applied strictly in
//!   manifest order
//! - **Whiteout**: `.wh.<name>` deletes a lower-layer path, `.wh..wh..opq`
//!   hides everything lower layers put in a directory
//! - **Id mapping**: uid/gid ranges translating image owners to host owners
//! - **Rootless**: what an unprivileged user cannot do (chown, mknod) is
//!   recorded as a degradation in the report instead of failing the unpack
//!
//! # Example usage
//!
//! ```no_run
//! use unlayer::{unpack_manifest, Digest, Manifest, Store, UnpackOptions};
//! use std::path::Path;
//!
//! let store = Store::open(Path::new("/var/lib/images/alpine")).unwrap();
//! let digest: Digest = "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
//!     .parse()
//!     .unwrap();
//! let manifest: Manifest =
//!     serde_json::from_slice(&unlayer::read_blob(&store, &digest).unwrap()).unwrap();
//!
//! let report = unpack_manifest(
//!     &store,
//!     &manifest,
//!     Path::new("/run/bundle/rootfs"),
//!     &UnpackOptions::default(),
//!     |_, desc, layer| {
//!         println!("{} applied ({} entries)", desc.digest, layer.entries);
//!         Ok(())
//!     },
//! )
//! .unwrap();
//! assert!(report.is_full_fidelity());
//! ```

mod cancel;
mod config;
mod digest;
mod error;
mod report;

pub mod fs;
pub mod layer;
pub mod namespace;
pub mod store;
pub mod types;

#[cfg(test)]
mod test_util;

pub use cancel::CancelToken;
pub use config::{Config, UnpackSettings};
pub use digest::{Algorithm, Digest, DigestHasher};
pub use error::{Error, Result};
pub use layer::{compute_diff_id, unpack_layer, unpack_manifest, UnpackOptions};
pub use namespace::{map_to_container, map_to_host, IdMapping, MapOptions, UnmappedPolicy};
pub use report::{Degradation, DegradationKind, LayerReport, UnpackReport};
pub use store::{
    blob_descriptor, blob_exists, fsck, get_blob, get_blob_json, open_descriptor, put_blob,
    put_blob_json, read_blob, verify_blob, CorruptBlob, Store,
};
pub use types::{media_type, ArchiveEntry, Descriptor, EntryKind, ImageConfig, Manifest, Xattr};
