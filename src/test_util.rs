//! fixtures shared by the unit tests

use std::io::Write;

use flate2::write::GzEncoder;
use tar::{EntryType, Header};
use tempfile::TempDir;

use crate::digest::Digest;
use crate::namespace::{IdMapping, MapOptions};
use crate::store::{put_blob, put_blob_json, Store};
use crate::types::{media_type, Descriptor, ImageConfig, Manifest};

/// builds layer tars entry by entry
///
/// names are written into the header verbatim, so tests can produce the
/// hostile archives the tar crate refuses to build (`..` paths and such).
pub struct LayerBuilder {
    builder: tar::Builder<Vec<u8>>,
    uid: u64,
    gid: u64,
    mtime: u64,
}

impl LayerBuilder {
    pub fn new() -> Self {
        Self {
            builder: tar::Builder::new(Vec::new()),
            uid: 0,
            gid: 0,
            mtime: 1_500_000_000,
        }
    }

    /// owner for the entries that follow
    pub fn owner(mut self, uid: u64, gid: u64) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    fn header(&self, path: &str, kind: EntryType, mode: u32, size: u64) -> Header {
        let mut header = Header::new_gnu();
        let name = path.as_bytes();
        assert!(name.len() < 100, "test path too long: {path}");
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.set_entry_type(kind);
        header.set_mode(mode);
        header.set_size(size);
        header.set_uid(self.uid);
        header.set_gid(self.gid);
        header.set_mtime(self.mtime);
        header
    }

    fn link_header(&self, path: &str, kind: EntryType, target: &str) -> Header {
        let mut header = self.header(path, kind, 0o777, 0);
        let target = target.as_bytes();
        header.as_old_mut().linkname[..target.len()].copy_from_slice(target);
        header
    }

    fn push(mut self, mut header: Header, data: &[u8]) -> Self {
        header.set_cksum();
        self.builder.append(&header, data).unwrap();
        self
    }

    pub fn dir(self, path: &str, mode: u32) -> Self {
        let header = self.header(path, EntryType::Directory, mode, 0);
        self.push(header, &[])
    }

    pub fn file(self, path: &str, data: &[u8], mode: u32) -> Self {
        let header = self.header(path, EntryType::Regular, mode, data.len() as u64);
        self.push(header, data)
    }

    /// regular file preceded by a pax extended header
    pub fn file_with_pax(mut self, path: &str, data: &[u8], mode: u32, pax: &[(&str, &[u8])]) -> Self {
        self.builder
            .append_pax_extensions(pax.iter().copied())
            .unwrap();
        self.file(path, data, mode)
    }

    pub fn symlink(self, path: &str, target: &str) -> Self {
        let header = self.link_header(path, EntryType::Symlink, target);
        self.push(header, &[])
    }

    pub fn hardlink(self, path: &str, target: &str) -> Self {
        let header = self.link_header(path, EntryType::Link, target);
        self.push(header, &[])
    }

    pub fn fifo(self, path: &str) -> Self {
        let header = self.header(path, EntryType::Fifo, 0o644, 0);
        self.push(header, &[])
    }

    pub fn char_device(self, path: &str, major: u32, minor: u32) -> Self {
        let mut header = self.header(path, EntryType::Char, 0o666, 0);
        header.set_device_major(major).unwrap();
        header.set_device_minor(minor).unwrap();
        self.push(header, &[])
    }

    /// whiteout marker for `path`
    pub fn whiteout(self, path: &str) -> Self {
        let (dir, name) = match path.rsplit_once('/') {
            Some((dir, name)) => (format!("{dir}/"), name),
            None => (String::new(), path),
        };
        self.file(&format!("{dir}.wh.{name}"), &[], 0o644)
    }

    /// opaque marker for directory `dir`
    pub fn opaque(self, dir: &str) -> Self {
        self.file(&format!("{dir}/.wh..wh..opq"), &[], 0o644)
    }

    pub fn into_tar(self) -> Vec<u8> {
        self.builder.into_inner().unwrap()
    }

    pub fn into_gzip(self) -> Vec<u8> {
        gzip(&self.into_tar())
    }
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

/// a fresh store in a temp directory
pub fn test_store() -> (TempDir, Store) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::init(&dir.path().join("store")).unwrap();
    (dir, store)
}

/// store a gzip layer, returning its descriptor and diff id
pub fn put_gzip_layer(store: &Store, tar: &[u8]) -> (Descriptor, Digest) {
    let blob = gzip(tar);
    let (digest, size) = put_blob(store, &mut blob.as_slice()).unwrap();
    (
        Descriptor::new(media_type::LAYER_TAR_GZIP, digest, size),
        Digest::sha256_of(tar),
    )
}

/// store a linux config listing `diff_ids` and return a manifest for `layers`
pub fn put_manifest(store: &Store, layers: Vec<Descriptor>, diff_ids: Vec<Digest>) -> Manifest {
    let (digest, size) = put_blob_json(store, &ImageConfig::linux(diff_ids)).unwrap();
    let config = Descriptor::new(media_type::IMAGE_CONFIG, digest, size);
    Manifest::new(config, layers)
}

/// one manifest with a gzip layer per tar
pub fn image(store: &Store, tars: &[Vec<u8>]) -> Manifest {
    let (layers, diff_ids) = tars.iter().map(|t| put_gzip_layer(store, t)).unzip();
    put_manifest(store, layers, diff_ids)
}

/// image root maps onto the user running the tests
pub fn current_user_map() -> MapOptions {
    let uid = nix::unistd::geteuid().as_raw();
    let gid = nix::unistd::getegid().as_raw();
    MapOptions {
        uid_map: vec![IdMapping::new(0, uid, 1)],
        gid_map: vec![IdMapping::new(0, gid, 1)],
        rootless: uid != 0,
        ..Default::default()
    }
}
