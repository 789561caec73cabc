use std::collections::HashSet;
use std::io::Read;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::digest::Digest;
use crate::error::{Error, IoResultExt, Result};
use crate::fs::{
    apply_metadata, create_device, create_directory, create_fifo, create_hardlink,
    create_regular, create_symlink, remove_all, ApplyContext, Attrs, LayerHardlinkTracker,
    WritableDir,
};
use crate::layer::archive::read_entry;
use crate::layer::compression::{decompress, Compression, DiffIdReader};
use crate::layer::path::{resolve, Resolved};
use crate::layer::whiteout::{make_opaque, remove_target};
use crate::namespace::MapOptions;
use crate::report::{DegradationKind, LayerReport, UnpackReport};
use crate::store::{get_blob_json, open_descriptor, verify_blob, Store};
use crate::types::{ArchiveEntry, Descriptor, EntryKind, ImageConfig, Manifest};

/// options for unpacking
#[derive(Clone, Debug)]
pub struct UnpackOptions {
    /// ownership remapping and rootless behaviour
    pub map: MapOptions,
    /// hash each layer blob completely before extracting any of it
    pub verify_before_extract: bool,
    /// compare decompressed layer digests with the config's diff_ids
    pub verify_diff_ids: bool,
    /// checked before every layer and every entry
    pub cancel: CancelToken,
}

impl Default for UnpackOptions {
    fn default() -> Self {
        Self {
            map: MapOptions::default(),
            verify_before_extract: true,
            verify_diff_ids: true,
            cancel: CancelToken::new(),
        }
    }
}

/// unpack every layer of a manifest into `bundle`, in order
///
/// `on_layer` runs once after each layer is fully applied, with that layer's
/// report; an error from it stops the unpack. nothing is rolled back on
/// failure: the bundle keeps whatever the failed layer already wrote.
pub fn unpack_manifest<F>(
    store: &Store,
    manifest: &Manifest,
    bundle: &Path,
    opts: &UnpackOptions,
    mut on_layer: F,
) -> Result<UnpackReport>
where
    F: FnMut(&Manifest, &Descriptor, &LayerReport) -> Result<()>,
{
    opts.cancel.check()?;
    info!(
        layers = manifest.layers.len(),
        bundle = ?bundle,
        rootless = opts.map.rootless,
        "unpacking manifest"
    );

    let config: ImageConfig = get_blob_json(store, &manifest.config)?;
    if config.os != "linux" {
        return Err(Error::UnsupportedOs(config.os));
    }

    let diff_ids = &config.rootfs.diff_ids;
    let check_diff_ids = opts.verify_diff_ids && !diff_ids.is_empty();
    if check_diff_ids && diff_ids.len() != manifest.layers.len() {
        return Err(Error::MalformedArchive(format!(
            "image config lists {} diff ids for {} layers",
            diff_ids.len(),
            manifest.layers.len()
        )));
    }

    std::fs::create_dir_all(bundle).with_path(bundle)?;

    let mut report = UnpackReport::default();
    for (index, desc) in manifest.layers.iter().enumerate() {
        let expected = if check_diff_ids {
            diff_ids.get(index)
        } else {
            None
        };
        let layer = unpack_layer(store, desc, index, bundle, opts, expected)?;

        on_layer(manifest, desc, &layer).map_err(|e| Error::Layer {
            index,
            digest: desc.digest.clone(),
            entry: None,
            source: Box::new(match e {
                Error::Callback(_) => e,
                other => Error::Callback(other.to_string()),
            }),
        })?;
        report.layers.push(layer);
    }

    info!(
        entries = report.entries(),
        degraded = report.degradations().count(),
        "unpack complete"
    );
    Ok(report)
}

/// apply a single layer blob on top of `bundle`
///
/// errors come back wrapped in `Error::Layer`, naming the entry being
/// applied when there was one.
pub fn unpack_layer(
    store: &Store,
    desc: &Descriptor,
    index: usize,
    bundle: &Path,
    opts: &UnpackOptions,
    diff_id: Option<&Digest>,
) -> Result<LayerReport> {
    let wrap = |entry: Option<PathBuf>, e: Error| Error::Layer {
        index,
        digest: desc.digest.clone(),
        entry,
        source: Box::new(e),
    };

    opts.cancel.check().map_err(|e| wrap(None, e))?;
    let compression = Compression::from_media_type(&desc.media_type).map_err(|e| wrap(None, e))?;
    info!(
        layer = index,
        digest = %desc.digest,
        size = desc.size,
        compression = compression.as_str(),
        "applying layer"
    );

    // a corrupt blob must not reach the bundle at all
    if opts.verify_before_extract {
        verify_blob(store, desc).map_err(|e| wrap(None, e))?;
    }

    let mut applier = LayerApplier::new(bundle, opts, LayerReport::new(index, desc.digest.clone()));
    let mut blob = open_descriptor(store, desc).map_err(|e| wrap(None, e))?;
    let actual = {
        let decoded = decompress(&desc.media_type, &mut blob).map_err(|e| wrap(None, e))?;
        let mut archive = tar::Archive::new(DiffIdReader::new(decoded));
        applier
            .apply_all(&mut archive, &opts.cancel)
            .map_err(|(entry, e)| wrap(entry, e))?;

        // tar stops at its end-of-archive blocks; hash the rest as well
        let (actual, _) = archive.into_inner().finish().map_err(|e| wrap(None, e))?;
        actual
    };
    blob.finish().map_err(|e| wrap(None, e))?;

    if let Some(expected) = diff_id {
        if actual != *expected {
            return Err(wrap(
                None,
                Error::DiffIdMismatch {
                    index,
                    expected: expected.clone(),
                    actual,
                },
            ));
        }
    }

    let report = applier.finish().map_err(|(entry, e)| wrap(entry, e))?;
    info!(
        layer = index,
        entries = report.entries,
        whiteouts = report.whiteouts,
        bytes = report.bytes_written,
        degraded = report.degradations.len(),
        "layer applied"
    );
    Ok(report)
}

/// directory whose metadata waits until the layer is done
///
/// dev and ino pin the directory that was created, so metadata never lands
/// on whatever took its place later in the layer.
struct PendingDir {
    rel: PathBuf,
    dev: u64,
    ino: u64,
    attrs: Attrs,
}

impl PendingDir {
    fn new(resolved: &Resolved, attrs: Attrs) -> Result<Self> {
        let meta = std::fs::symlink_metadata(&resolved.full).with_path(&resolved.full)?;
        Ok(Self {
            rel: resolved.rel.clone(),
            dev: meta.dev(),
            ino: meta.ino(),
            attrs,
        })
    }
}

type EntryResult<T> = std::result::Result<T, (Option<PathBuf>, Error)>;

/// per-layer state while entries stream past
struct LayerApplier<'a> {
    root: &'a Path,
    opts: &'a UnpackOptions,
    report: LayerReport,
    /// root-relative paths this layer created, ancestors included
    upper: HashSet<PathBuf>,
    links: LayerHardlinkTracker,
    dirs: Vec<PendingDir>,
}

impl<'a> LayerApplier<'a> {
    fn new(root: &'a Path, opts: &'a UnpackOptions, report: LayerReport) -> Self {
        Self {
            root,
            opts,
            report,
            upper: HashSet::new(),
            links: LayerHardlinkTracker::new(),
            dirs: Vec::new(),
        }
    }

    fn rootless(&self) -> bool {
        self.opts.map.rootless
    }

    fn apply_all<R: Read>(
        &mut self,
        archive: &mut tar::Archive<R>,
        cancel: &CancelToken,
    ) -> EntryResult<()> {
        let entries = archive
            .entries()
            .map_err(|e| (None, Error::from_stream(e)))?;
        for entry in entries {
            cancel.check().map_err(|e| (None, e))?;
            let mut entry = entry.map_err(|e| (None, Error::from_stream(e)))?;
            let raw = entry.path().ok().map(|p| p.into_owned());
            let Some(parsed) = read_entry(&mut entry).map_err(|e| (raw.clone(), e))? else {
                continue;
            };
            let path = parsed.path.clone();
            self.apply(parsed, &mut entry).map_err(|e| (Some(path), e))?;
        }
        Ok(())
    }

    fn apply<R: Read>(&mut self, entry: ArchiveEntry, content: &mut R) -> Result<()> {
        self.report.entries += 1;
        match &entry.kind {
            EntryKind::Whiteout { target } => self.whiteout(target),
            EntryKind::OpaqueWhiteout { dir } => self.opaque(dir),
            _ => self.create(entry, content),
        }
    }

    fn whiteout(&mut self, target: &Path) -> Result<()> {
        let resolved = resolve(self.root, target)?;
        if self.upper.iter().any(|p| p.starts_with(&resolved.rel)) {
            return Err(Error::MalformedArchive(format!(
                "whiteout of {} after this layer created it",
                target.display()
            )));
        }

        let _guard = self.writable_parent(&resolved)?;
        if remove_target(&resolved.full, self.rootless())? {
            debug!(path = ?resolved.rel, "whiteout removed path");
        } else {
            debug!(path = ?resolved.rel, "whiteout target already absent");
        }
        self.report.whiteouts += 1;
        Ok(())
    }

    fn opaque(&mut self, dir: &Path) -> Result<()> {
        let resolved = resolve(self.root, dir)?;
        let removed = make_opaque(self.root, &resolved.rel, &self.upper, self.rootless())?;
        debug!(dir = ?resolved.rel, removed, "opaque whiteout");
        self.report.whiteouts += 1;
        Ok(())
    }

    fn create<R: Read>(&mut self, entry: ArchiveEntry, content: &mut R) -> Result<()> {
        let resolved = resolve(self.root, &entry.path)?;
        let attrs = Attrs {
            uid: entry.uid,
            gid: entry.gid,
            mode: entry.mode,
            mtime: entry.mtime,
            xattrs: entry.xattrs.clone(),
        };

        // the bundle root itself
        let Some(parent) = resolved.parent() else {
            if entry.kind != EntryKind::Directory {
                return Err(Error::MalformedArchive(format!(
                    "{} entry for the bundle root",
                    entry.kind.type_name()
                )));
            }
            self.dirs.push(PendingDir::new(&resolved, attrs)?);
            return Ok(());
        };

        std::fs::create_dir_all(parent).with_path(parent)?;
        let _guard = self.writable_parent(&resolved)?;

        if entry.kind != EntryKind::Directory {
            // whatever is there goes, including directories from lower layers
            remove_all(&resolved.full, self.rootless())?;
            self.forget_subtree(&entry.path, &resolved.rel);
        }

        let full = &resolved.full;
        match &entry.kind {
            EntryKind::Directory => {
                create_directory(full, entry.mode)?;
                self.dirs.push(PendingDir::new(&resolved, attrs)?);
            }
            EntryKind::Regular => {
                let written = create_regular(full, content)?;
                self.report.bytes_written += written;
                self.apply_metadata(full, &resolved.rel, &attrs)?;
            }
            EntryKind::Symlink => {
                let target = link_target(&entry)?;
                create_symlink(full, target)?;
                self.apply_metadata(full, &resolved.rel, &attrs)?;
            }
            EntryKind::Hardlink => {
                let target = link_target(&entry)?;
                let source = self.links.resolve(&entry.path, target)?.to_path_buf();
                // the inode already carries its metadata
                create_hardlink(full, &source)?;
            }
            EntryKind::Fifo => {
                create_fifo(full, entry.mode)?;
                self.apply_metadata(full, &resolved.rel, &attrs)?;
            }
            EntryKind::CharDevice { major, minor } | EntryKind::BlockDevice { major, minor } => {
                if self.rootless() {
                    warn!(path = ?resolved.rel, "skipping device node in rootless mode");
                    self.report.degrade(&resolved.rel, DegradationKind::DeviceNode);
                    return Ok(());
                }
                let block = matches!(entry.kind, EntryKind::BlockDevice { .. });
                create_device(full, block, *major, *minor, entry.mode)?;
                self.apply_metadata(full, &resolved.rel, &attrs)?;
            }
            EntryKind::Whiteout { .. } | EntryKind::OpaqueWhiteout { .. } => {
                return Err(Error::MalformedArchive(format!(
                    "whiteout {} reached object creation",
                    entry.path.display()
                )));
            }
        }

        if entry.kind != EntryKind::Directory {
            self.links.record(&entry.path, full)?;
        }
        self.mark_upper(&resolved.rel);
        Ok(())
    }

    fn apply_metadata(&mut self, full: &Path, rel: &Path, attrs: &Attrs) -> Result<()> {
        let mut ctx = ApplyContext {
            map: &self.opts.map,
            report: &mut self.report,
        };
        apply_metadata(full, rel, attrs, &mut ctx)
    }

    fn writable_parent(&self, resolved: &Resolved) -> Result<Option<WritableDir>> {
        match resolved.parent() {
            Some(parent) if self.rootless() => WritableDir::open_up(parent),
            _ => Ok(None),
        }
    }

    /// drop what this layer knew about a path that was just replaced
    fn forget_subtree(&mut self, logical: &Path, rel: &Path) {
        self.links.forget(logical);
        self.dirs.retain(|d| !d.rel.starts_with(rel));
        self.upper.retain(|p| !p.starts_with(rel));
    }

    fn mark_upper(&mut self, rel: &Path) {
        for ancestor in rel.ancestors() {
            // ancestors of a known path are known too
            if ancestor.as_os_str().is_empty() || !self.upper.insert(ancestor.to_path_buf()) {
                break;
            }
        }
    }

    /// where a pending directory lives now, if it is still the one created
    fn pending_dir_path(&self, dir: &PendingDir) -> Option<PathBuf> {
        let resolved = resolve(self.root, &dir.rel).ok()?;
        if resolved.rel != dir.rel {
            return None;
        }
        let meta = std::fs::symlink_metadata(&resolved.full).ok()?;
        (meta.is_dir() && meta.dev() == dir.dev && meta.ino() == dir.ino).then_some(resolved.full)
    }

    /// apply deferred directory metadata, deepest first
    fn finish(mut self) -> EntryResult<LayerReport> {
        let mut dirs = std::mem::take(&mut self.dirs);
        dirs.sort_by_key(|d| std::cmp::Reverse(d.rel.components().count()));
        for dir in &dirs {
            let Some(full) = self.pending_dir_path(dir) else {
                debug!(path = ?dir.rel, "directory replaced, skipping its metadata");
                continue;
            };
            self.apply_metadata(&full, &dir.rel, &dir.attrs)
                .map_err(|e| (Some(dir.rel.clone()), e))?;
        }
        Ok(self.report)
    }
}

fn link_target(entry: &ArchiveEntry) -> Result<&Path> {
    entry.link_target.as_deref().ok_or_else(|| {
        Error::MalformedArchive(format!("link without target: {}", entry.path.display()))
    })
}
