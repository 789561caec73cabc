use std::fs::{self, DirBuilder, OpenOptions, Permissions};
use std::io::{self, Read};
use std::os::unix::fs::{lchown, symlink, DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::sys::stat::{lutimes, makedev, mknod, Mode, SFlag};
use nix::sys::time::TimeVal;
use tracing::warn;
use walkdir::WalkDir;

use crate::error::{is_permission_io, Error, IoResultExt, Result};
use crate::namespace::{MapOptions, UnmappedPolicy};
use crate::report::{DegradationKind, LayerReport};
use crate::types::{Mtime, Xattr};

/// owner bits we need on a directory to create entries inside it
const OWNER_WX: u32 = 0o300;

/// metadata to apply to one created object, owner still in image ids
#[derive(Clone, Debug)]
pub struct Attrs {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub mtime: Mtime,
    pub xattrs: Vec<Xattr>,
}

/// where degradations go while applying metadata
pub struct ApplyContext<'a> {
    pub map: &'a MapOptions,
    pub report: &'a mut LayerReport,
}

/// create a directory for a layer to populate
///
/// existing directories are kept (layers merge into them). the final mode is
/// applied later; until then the owner can always write into it.
pub fn create_directory(path: &Path, mode: u32) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => return Ok(()),
        Ok(_) => remove_all(path, false)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_path(path),
    }

    DirBuilder::new()
        .mode((mode & 0o777) | 0o700)
        .create(path)
        .with_path(path)
}

/// create a regular file with content streamed from the archive
///
/// never writes through an existing path: whatever was there is removed and
/// the file is created exclusively.
pub fn create_regular<R: Read>(path: &Path, content: &mut R) -> Result<u64> {
    remove_all(path, false)?;

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .with_path(path)?;
    let written = io::copy(content, &mut file).map_err(|e| match Error::take_typed(e) {
        Ok(typed) => typed,
        Err(e) => Error::Io {
            path: path.to_path_buf(),
            source: e,
        },
    })?;
    Ok(written)
}

/// create a symlink, replacing whatever is there
pub fn create_symlink(path: &Path, target: &Path) -> Result<()> {
    remove_all(path, false)?;
    symlink(target, path).with_path(path)
}

/// create a hardlink, replacing whatever is there
pub fn create_hardlink(link_path: &Path, target_path: &Path) -> Result<()> {
    if link_path == target_path {
        return Ok(());
    }
    remove_all(link_path, false)?;
    fs::hard_link(target_path, link_path).with_path(link_path)
}

/// create a fifo (named pipe)
pub fn create_fifo(path: &Path, mode: u32) -> Result<()> {
    remove_all(path, false)?;
    nix::unistd::mkfifo(path, Mode::from_bits_truncate(mode & 0o777))
        .map_err(io::Error::from)
        .with_path(path)
}

/// create a block or character device node
///
/// fails with `PrivilegeRequired` when the kernel refuses mknod.
pub fn create_device(path: &Path, block: bool, major: u32, minor: u32, mode: u32) -> Result<()> {
    remove_all(path, false)?;

    let kind = if block { SFlag::S_IFBLK } else { SFlag::S_IFCHR };
    let dev = makedev(u64::from(major), u64::from(minor));

    mknod(path, kind, Mode::from_bits_truncate(mode & 0o777), dev).map_err(|e| {
        if e == nix::errno::Errno::EPERM {
            Error::PrivilegeRequired(path.to_path_buf())
        } else {
            Error::Io {
                path: path.to_path_buf(),
                source: e.into(),
            }
        }
    })
}

/// remove a path and everything below it; absent paths are fine
///
/// with `rootless`, directories we cannot descend into are opened up first.
pub fn remove_all(path: &Path, rootless: bool) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_path(path),
    };

    if !meta.is_dir() {
        return fs::remove_file(path).with_path(path);
    }

    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if rootless && is_permission_io(&e) => {
            for entry in WalkDir::new(path).into_iter().filter_map(|e| e.ok()) {
                if entry.file_type().is_dir() {
                    let p = entry.path();
                    fs::set_permissions(p, Permissions::from_mode(0o700)).with_path(p)?;
                }
            }
            fs::remove_dir_all(path).with_path(path)
        }
        Err(e) => Err(e).with_path(path),
    }
}

/// apply ownership, mode, xattrs and mtime, in that order
///
/// mtime goes last because every earlier step can bump it. symlinks get
/// no chmod. permission failures degrade in rootless mode and are fatal
/// otherwise.
pub fn apply_metadata(path: &Path, rel: &Path, attrs: &Attrs, ctx: &mut ApplyContext<'_>) -> Result<()> {
    let meta = fs::symlink_metadata(path).with_path(path)?;
    let is_symlink = meta.file_type().is_symlink();

    apply_ownership(path, rel, attrs, ctx)?;

    if !is_symlink {
        fs::set_permissions(path, Permissions::from_mode(attrs.mode & 0o7777)).with_path(path)?;
    }

    for xattr in &attrs.xattrs {
        if let Err(e) = xattr::set(path, &xattr.name, &xattr.value) {
            let denied = is_permission_io(&e) || e.raw_os_error() == Some(nix::libc::ENOTSUP);
            if ctx.map.rootless && (denied || xattr.is_privileged()) {
                warn!(path = ?rel, xattr = %xattr.name, error = %e, "xattr not applied");
                ctx.report.degrade(
                    rel,
                    DegradationKind::Xattr {
                        name: xattr.name.clone(),
                    },
                );
                continue;
            }
            if is_permission_io(&e) {
                return Err(Error::PrivilegeRequired(path.to_path_buf()));
            }
            return Err(Error::Xattr {
                path: path.to_path_buf(),
                message: format!("failed to set {}: {}", xattr.name, e),
            });
        }
    }

    set_mtime(path, attrs.mtime)
}

fn apply_ownership(path: &Path, rel: &Path, attrs: &Attrs, ctx: &mut ApplyContext<'_>) -> Result<()> {
    let mapped = ctx
        .map
        .map_uid(attrs.uid)
        .and_then(|uid| ctx.map.map_gid(attrs.gid).map(|gid| (uid, gid)));
    let (uid, gid) = match mapped {
        Ok(ids) => ids,
        Err(Error::UnmappableId { .. }) if ctx.map.unmapped == UnmappedPolicy::Ignore => {
            warn!(path = ?rel, uid = attrs.uid, gid = attrs.gid, "owner outside id mapping");
            ctx.report.degrade(
                rel,
                DegradationKind::UnmappedOwner {
                    uid: attrs.uid,
                    gid: attrs.gid,
                },
            );
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    // skip if it already matches the extracting user
    let current_uid = nix::unistd::geteuid().as_raw();
    let current_gid = nix::unistd::getegid().as_raw();
    if uid == current_uid && gid == current_gid {
        return Ok(());
    }

    match lchown(path, Some(uid), Some(gid)) {
        Ok(()) => Ok(()),
        Err(e) if is_permission_io(&e) || e.raw_os_error() == Some(nix::libc::EINVAL) => {
            if ctx.map.rootless {
                warn!(path = ?rel, uid, gid, "cannot chown without privileges");
                ctx.report.degrade(rel, DegradationKind::Ownership { uid, gid });
                Ok(())
            } else {
                Err(Error::PrivilegeRequired(path.to_path_buf()))
            }
        }
        Err(e) => Err(e).with_path(path),
    }
}

/// set atime and mtime without following symlinks
pub fn set_mtime(path: &Path, mtime: Mtime) -> Result<()> {
    let micros = i64::from(mtime.nanos / 1000);
    let tv = TimeVal::new(mtime.secs as _, micros as _);
    lutimes(path, &tv, &tv)
        .map_err(io::Error::from)
        .with_path(path)
}

/// temporarily grants the owner write+search on a directory
///
/// rootless extraction cannot bypass permission bits, so writing into a
/// read-only directory left by an earlier layer needs this. the original mode
/// comes back on drop.
pub struct WritableDir {
    path: PathBuf,
    mode: u32,
}

impl WritableDir {
    /// returns None when the directory is already writable
    pub fn open_up(path: &Path) -> Result<Option<Self>> {
        let meta = match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => meta,
            _ => return Ok(None),
        };
        let mode = meta.permissions().mode() & 0o7777;
        if mode & OWNER_WX == OWNER_WX {
            return Ok(None);
        }
        fs::set_permissions(path, Permissions::from_mode(mode | OWNER_WX)).with_path(path)?;
        Ok(Some(Self {
            path: path.to_path_buf(),
            mode,
        }))
    }
}

impl Drop for WritableDir {
    fn drop(&mut self) {
        if let Err(e) = fs::set_permissions(&self.path, Permissions::from_mode(self.mode)) {
            warn!(path = ?self.path, error = %e, "failed to restore directory mode");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;
    use crate::namespace::IdMapping;
    use std::os::unix::fs::{FileTypeExt, MetadataExt};
    use tempfile::tempdir;

    fn attrs(mode: u32) -> Attrs {
        Attrs {
            uid: 0,
            gid: 0,
            mode,
            mtime: Mtime::from_secs(1_500_000_000),
            xattrs: vec![],
        }
    }

    /// maps image root onto whoever runs the tests
    fn self_map() -> MapOptions {
        let uid = nix::unistd::geteuid().as_raw();
        let gid = nix::unistd::getegid().as_raw();
        MapOptions {
            uid_map: vec![IdMapping::new(0, uid, 1)],
            gid_map: vec![IdMapping::new(0, gid, 1)],
            rootless: uid != 0,
            ..Default::default()
        }
    }

    fn report() -> LayerReport {
        LayerReport::new(0, Digest::sha256_of(b"test"))
    }

    #[test]
    fn test_create_directory_keeps_existing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("subdir");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("child"), "x").unwrap();

        create_directory(&path, 0o755).unwrap();
        assert!(path.join("child").exists());
    }

    #[test]
    fn test_create_directory_replaces_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("was-file");
        fs::write(&path, "x").unwrap();

        create_directory(&path, 0o500).unwrap();
        let meta = fs::metadata(&path).unwrap();
        assert!(meta.is_dir());
        // owner keeps write access until deferred metadata lands
        assert_eq!(meta.mode() & 0o700, 0o700);
    }

    #[test]
    fn test_create_regular_does_not_follow_symlink() {
        let dir = tempdir().unwrap();
        let outside = dir.path().join("outside");
        fs::write(&outside, "keep me").unwrap();
        let path = dir.path().join("file");
        symlink(&outside, &path).unwrap();

        let written = create_regular(&path, &mut &b"new"[..]).unwrap();
        assert_eq!(written, 3);
        assert_eq!(fs::read_to_string(&outside).unwrap(), "keep me");
        assert!(!fs::symlink_metadata(&path).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_to_string(&path).unwrap(), "new");
    }

    #[test]
    fn test_create_symlink_replaces() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("link");
        fs::write(&path, "old").unwrap();

        create_symlink(&path, Path::new("/target/path")).unwrap();
        assert_eq!(fs::read_link(&path).unwrap(), Path::new("/target/path"));
    }

    #[test]
    fn test_create_fifo() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fifo");

        create_fifo(&path, 0o644).unwrap();
        assert!(fs::symlink_metadata(&path).unwrap().file_type().is_fifo());
    }

    #[test]
    fn test_create_hardlink() {
        let dir = tempdir().unwrap();
        let original = dir.path().join("original");
        let link = dir.path().join("link");
        fs::write(&original, "content").unwrap();
        fs::write(&link, "stale").unwrap();

        create_hardlink(&link, &original).unwrap();
        assert_eq!(
            fs::metadata(&original).unwrap().ino(),
            fs::metadata(&link).unwrap().ino()
        );
    }

    #[test]
    fn test_device_node_needs_privilege() {
        if nix::unistd::geteuid().is_root() {
            return;
        }
        let dir = tempdir().unwrap();
        let result = create_device(&dir.path().join("null"), false, 1, 3, 0o666);
        assert!(matches!(result, Err(Error::PrivilegeRequired(_))));
    }

    #[test]
    fn test_apply_metadata_mode_and_mtime() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file");
        fs::write(&path, "content").unwrap();

        let map = self_map();
        let mut report = report();
        let mut ctx = ApplyContext {
            map: &map,
            report: &mut report,
        };
        apply_metadata(&path, Path::new("file"), &attrs(0o4755), &mut ctx).unwrap();

        let meta = fs::metadata(&path).unwrap();
        assert_eq!(meta.mode() & 0o7777, 0o4755);
        assert_eq!(meta.mtime(), 1_500_000_000);
        assert!(report.is_full_fidelity());
    }

    #[test]
    fn test_apply_metadata_symlink_mtime() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("link");
        symlink("nowhere", &path).unwrap();

        let map = self_map();
        let mut report = report();
        let mut ctx = ApplyContext {
            map: &map,
            report: &mut report,
        };
        apply_metadata(&path, Path::new("link"), &attrs(0o777), &mut ctx).unwrap();
        assert_eq!(fs::symlink_metadata(&path).unwrap().mtime(), 1_500_000_000);
    }

    #[test]
    fn test_unmappable_owner_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file");
        fs::write(&path, "x").unwrap();

        let map = self_map();
        let mut report = report();
        let mut ctx = ApplyContext {
            map: &map,
            report: &mut report,
        };
        let mut a = attrs(0o644);
        a.uid = 4242;
        let result = apply_metadata(&path, Path::new("file"), &a, &mut ctx);
        assert!(matches!(result, Err(Error::UnmappableId { kind: "uid", id: 4242 })));
    }

    #[test]
    fn test_unmappable_owner_ignored_is_recorded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file");
        fs::write(&path, "x").unwrap();

        let mut map = self_map();
        map.unmapped = UnmappedPolicy::Ignore;
        let mut report = report();
        let mut ctx = ApplyContext {
            map: &map,
            report: &mut report,
        };
        let mut a = attrs(0o640);
        a.gid = 4242;
        apply_metadata(&path, Path::new("file"), &a, &mut ctx).unwrap();

        assert_eq!(fs::metadata(&path).unwrap().mode() & 0o777, 0o640);
        assert_eq!(
            report.degradations[0].kind,
            DegradationKind::UnmappedOwner { uid: 0, gid: 4242 }
        );
    }

    #[test]
    fn test_rootless_chown_degrades() {
        if nix::unistd::geteuid().is_root() {
            return;
        }
        let dir = tempdir().unwrap();
        let path = dir.path().join("file");
        fs::write(&path, "x").unwrap();

        // identity map: image root stays uid 0, which we cannot chown to
        let map = MapOptions {
            rootless: true,
            ..Default::default()
        };
        let mut report = report();
        let mut ctx = ApplyContext {
            map: &map,
            report: &mut report,
        };
        apply_metadata(&path, Path::new("file"), &attrs(0o600), &mut ctx).unwrap();
        assert!(matches!(
            report.degradations[0].kind,
            DegradationKind::Ownership { uid: 0, gid: 0 }
        ));

        // the same without rootless is fatal
        let strict = MapOptions::default();
        let mut report2 = LayerReport::default();
        let mut ctx = ApplyContext {
            map: &strict,
            report: &mut report2,
        };
        let result = apply_metadata(&path, Path::new("file"), &attrs(0o600), &mut ctx);
        assert!(matches!(result, Err(Error::PrivilegeRequired(_))));
    }

    #[test]
    fn test_remove_all_variants() {
        let dir = tempdir().unwrap();
        let tree = dir.path().join("tree");
        fs::create_dir_all(tree.join("a/b")).unwrap();
        fs::write(tree.join("a/b/c"), "x").unwrap();

        remove_all(&tree, false).unwrap();
        assert!(!tree.exists());

        // absent is a no-op
        remove_all(&tree, false).unwrap();
    }

    #[test]
    fn test_remove_all_rootless_read_only_dirs() {
        let dir = tempdir().unwrap();
        let tree = dir.path().join("tree");
        fs::create_dir_all(tree.join("locked")).unwrap();
        fs::write(tree.join("locked/file"), "x").unwrap();
        fs::set_permissions(tree.join("locked"), Permissions::from_mode(0o500)).unwrap();

        remove_all(&tree, true).unwrap();
        assert!(!tree.exists());
    }

    #[test]
    fn test_writable_dir_guard_restores_mode() {
        let dir = tempdir().unwrap();
        let locked = dir.path().join("locked");
        fs::create_dir(&locked).unwrap();
        fs::set_permissions(&locked, Permissions::from_mode(0o555)).unwrap();

        {
            let guard = WritableDir::open_up(&locked).unwrap();
            assert!(guard.is_some());
            fs::write(locked.join("inside"), "x").unwrap();
        }
        assert_eq!(fs::metadata(&locked).unwrap().mode() & 0o777, 0o555);
        assert!(locked.join("inside").exists());

        fs::set_permissions(&locked, Permissions::from_mode(0o755)).unwrap();
        assert!(WritableDir::open_up(&locked).unwrap().is_none());
    }
}
