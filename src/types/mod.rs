mod descriptor;
mod entry;
mod metadata;

pub use descriptor::{media_type, Descriptor, ImageConfig, Manifest, RootFs};
pub use entry::{ArchiveEntry, EntryKind, Mtime};
pub use metadata::Xattr;
