use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// a single range in a uid/gid mapping
///
/// ids `container_id..container_id+size` in the image map onto
/// `host_id..host_id+size` on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    /// start of range inside the image (as recorded in the archive)
    pub container_id: u32,
    /// start of range for the extracting process
    pub host_id: u32,
    /// number of ids in this range
    pub size: u32,
}

impl IdMapping {
    pub fn new(container_id: u32, host_id: u32, size: u32) -> Self {
        Self {
            container_id,
            host_id,
            size,
        }
    }

    /// check if a container id falls within this range
    pub fn contains_container(&self, id: u32) -> bool {
        id >= self.container_id && u64::from(id) < u64::from(self.container_id) + u64::from(self.size)
    }

    /// check if a host id falls within this range
    pub fn contains_host(&self, id: u32) -> bool {
        id >= self.host_id && u64::from(id) < u64::from(self.host_id) + u64::from(self.size)
    }
}

/// `container:host:size`, the same shape runtimes use on the command line
impl FromStr for IdMapping {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 {
            return Err(Error::MappingParse(format!(
                "expected container:host:size, got {s:?}"
            )));
        }
        let parse = |v: &str| {
            v.trim()
                .parse::<u32>()
                .map_err(|_| Error::MappingParse(format!("invalid id {v:?} in {s:?}")))
        };
        Ok(Self::new(parse(parts[0])?, parse(parts[1])?, parse(parts[2])?))
    }
}

impl fmt::Display for IdMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.container_id, self.host_id, self.size)
    }
}

/// what to do with an owner no mapping range covers
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnmappedPolicy {
    /// fail the entry with `UnmappableId`
    #[default]
    Reject,
    /// leave ownership as created and record a degradation
    Ignore,
}

/// ownership remapping applied to every extracted object
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapOptions {
    #[serde(default)]
    pub uid_map: Vec<IdMapping>,
    #[serde(default)]
    pub gid_map: Vec<IdMapping>,
    /// extracting process lacks privileges, emulate what it cannot do
    #[serde(default)]
    pub rootless: bool,
    #[serde(default)]
    pub unmapped: UnmappedPolicy,
}

impl MapOptions {
    /// identity mapping with privileged extraction
    pub fn identity() -> Self {
        Self::default()
    }

    /// map everything the image owns to the current effective user
    ///
    /// used when the caller has no explicit mapping: image root becomes
    /// the invoking user, and rootless mode is on unless we really are root.
    pub fn rootless_current() -> Self {
        let euid = nix::unistd::geteuid().as_raw();
        let egid = nix::unistd::getegid().as_raw();
        if euid == 0 && !super::running_in_user_namespace() {
            return Self::identity();
        }
        Self {
            uid_map: vec![IdMapping::new(0, euid, 1)],
            gid_map: vec![IdMapping::new(0, egid, 1)],
            rootless: true,
            unmapped: UnmappedPolicy::Reject,
        }
    }

    /// map an image uid to the uid to chown to
    pub fn map_uid(&self, uid: u32) -> Result<u32> {
        map_to_host(uid, &self.uid_map).ok_or(Error::UnmappableId { kind: "uid", id: uid })
    }

    /// map an image gid to the gid to chown to
    pub fn map_gid(&self, gid: u32) -> Result<u32> {
        map_to_host(gid, &self.gid_map).ok_or(Error::UnmappableId { kind: "gid", id: gid })
    }
}

/// convert container (image) id to host id
///
/// an empty map is the identity.
pub fn map_to_host(container: u32, map: &[IdMapping]) -> Option<u32> {
    if map.is_empty() {
        return Some(container);
    }
    map.iter()
        .find(|entry| entry.contains_container(container))
        .and_then(|entry| entry.host_id.checked_add(container - entry.container_id))
}

/// convert host id back to container (image) id, the repack direction
pub fn map_to_container(host: u32, map: &[IdMapping]) -> Option<u32> {
    if map.is_empty() {
        return Some(host);
    }
    map.iter()
        .find(|entry| entry.contains_host(host))
        .and_then(|entry| entry.container_id.checked_add(host - entry.host_id))
}
