//! outcome records for an unpack
//!
//! full fidelity vs degraded is part of the result, never a swallowed error.

use std::fmt;
use std::path::PathBuf;

use crate::digest::Digest;

/// why an entry was applied with less than full fidelity
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DegradationKind {
    /// lchown failed for lack of privilege
    Ownership { uid: u32, gid: u32 },
    /// owner not covered by the mapping and policy is ignore
    UnmappedOwner { uid: u32, gid: u32 },
    /// device node skipped
    DeviceNode,
    /// extended attribute could not be set
    Xattr { name: String },
}

impl fmt::Display for DegradationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DegradationKind::Ownership { uid, gid } => write!(f, "ownership {uid}:{gid} not applied"),
            DegradationKind::UnmappedOwner { uid, gid } => {
                write!(f, "owner {uid}:{gid} outside id mapping, left unchanged")
            }
            DegradationKind::DeviceNode => write!(f, "device node skipped"),
            DegradationKind::Xattr { name } => write!(f, "xattr {name} not applied"),
        }
    }
}

/// a single recorded degradation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Degradation {
    /// path relative to the bundle root
    pub path: PathBuf,
    pub kind: DegradationKind,
}

impl fmt::Display for Degradation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.kind)
    }
}

/// counters and degradations for one applied layer
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LayerReport {
    pub index: usize,
    pub digest: Option<Digest>,
    pub entries: u64,
    pub whiteouts: u64,
    pub bytes_written: u64,
    pub degradations: Vec<Degradation>,
}

impl LayerReport {
    pub fn new(index: usize, digest: Digest) -> Self {
        Self {
            index,
            digest: Some(digest),
            ..Self::default()
        }
    }

    pub fn is_full_fidelity(&self) -> bool {
        self.degradations.is_empty()
    }

    pub(crate) fn degrade(&mut self, path: impl Into<PathBuf>, kind: DegradationKind) {
        self.degradations.push(Degradation {
            path: path.into(),
            kind,
        });
    }
}

/// result of a successful `unpack_manifest`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UnpackReport {
    pub layers: Vec<LayerReport>,
}

impl UnpackReport {
    pub fn is_full_fidelity(&self) -> bool {
        self.layers.iter().all(LayerReport::is_full_fidelity)
    }

    /// all degradations in layer order
    pub fn degradations(&self) -> impl Iterator<Item = &Degradation> {
        self.layers.iter().flat_map(|l| l.degradations.iter())
    }

    pub fn entries(&self) -> u64 {
        self.layers.iter().map(|l| l.entries).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fidelity_tracking() {
        let mut layer = LayerReport::new(0, Digest::sha256_of(b"l0"));
        assert!(layer.is_full_fidelity());

        layer.degrade("dev/null", DegradationKind::DeviceNode);
        assert!(!layer.is_full_fidelity());

        let report = UnpackReport {
            layers: vec![LayerReport::new(1, Digest::sha256_of(b"l1")), layer],
        };
        assert!(!report.is_full_fidelity());
        assert_eq!(report.degradations().count(), 1);
    }

    #[test]
    fn test_degradation_display() {
        let d = Degradation {
            path: PathBuf::from("usr/bin/ping"),
            kind: DegradationKind::Xattr {
                name: "security.capability".into(),
            },
        };
        assert_eq!(d.to_string(), "usr/bin/ping: xattr security.capability not applied");
    }
}
