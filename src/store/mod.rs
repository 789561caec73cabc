mod blob;
mod layout;

pub use blob::{
    blob_descriptor, blob_exists, fsck, get_blob, get_blob_json, open_descriptor, put_blob, put_blob_json,
    read_blob, verify_blob, BlobReader, CorruptBlob,
};
pub use layout::{Store, StoreLock};
