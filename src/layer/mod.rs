//! applying OCI layer blobs to a bundle root

pub mod archive;
pub mod compression;
pub mod path;
pub mod unpack;
pub mod whiteout;

pub use archive::{list_entries, read_entry};
pub use compression::{compute_diff_id, decompress, Compression, DiffIdReader};
pub use path::{normalize, resolve, Resolved};
pub use unpack::{unpack_layer, unpack_manifest, UnpackOptions};
