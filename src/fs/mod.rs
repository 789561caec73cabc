pub mod hardlink;
pub mod write;

pub use hardlink::LayerHardlinkTracker;
pub use write::{
    apply_metadata, create_device, create_directory, create_fifo, create_hardlink,
    create_regular, create_symlink, remove_all, set_mtime, ApplyContext, Attrs, WritableDir,
};
