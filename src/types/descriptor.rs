use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;

/// OCI media types this crate knows about
pub mod media_type {
    pub const IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const IMAGE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";

    pub const LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";
    pub const LAYER_TAR_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
    pub const LAYER_TAR_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";
    pub const LAYER_NONDISTRIBUTABLE_TAR: &str =
        "application/vnd.oci.image.layer.nondistributable.v1.tar";
    pub const LAYER_NONDISTRIBUTABLE_TAR_GZIP: &str =
        "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip";
    pub const LAYER_NONDISTRIBUTABLE_TAR_ZSTD: &str =
        "application/vnd.oci.image.layer.nondistributable.v1.tar+zstd";

    pub const DOCKER_LAYER_TAR_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
}

/// identifies a blob by media type, digest and size
///
/// digest and size are claims: the store verifies both whenever the blob is read.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: Digest, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            annotations: BTreeMap::new(),
        }
    }
}

/// image manifest: a config blob plus an ordered stack of layers
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    /// applied strictly in order, later layers win
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Manifest {
    pub fn new(config: Descriptor, layers: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: Some(media_type::IMAGE_MANIFEST.to_string()),
            config,
            layers,
            annotations: BTreeMap::new(),
        }
    }
}

/// the subset of the image config the unpacker consults
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub os: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub architecture: String,
    #[serde(default)]
    pub rootfs: RootFs,
}

impl ImageConfig {
    /// linux config listing the given diff ids
    pub fn linux(diff_ids: Vec<Digest>) -> Self {
        Self {
            os: "linux".to_string(),
            architecture: String::new(),
            rootfs: RootFs {
                kind: "layers".to_string(),
                diff_ids,
            },
        }
    }
}

/// digests of the uncompressed layer tars, in layer order
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub diff_ids: Vec<Digest>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_json_field_names() {
        let config = Descriptor::new(media_type::IMAGE_CONFIG, Digest::sha256_of(b"{}"), 2);
        let layer = Descriptor::new(media_type::LAYER_TAR_GZIP, Digest::sha256_of(b"l"), 1);
        let manifest = Manifest::new(config, vec![layer]);

        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json["schemaVersion"], 2);
        assert_eq!(json["layers"][0]["mediaType"], media_type::LAYER_TAR_GZIP);
        assert!(json["layers"][0].get("annotations").is_none());
    }

    #[test]
    fn test_parse_external_manifest() {
        let json = r#"{
            "schemaVersion": 2,
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
                "size": 0
            },
            "layers": []
        }"#;
        let manifest: Manifest = serde_json::from_str(json).unwrap();
        assert!(manifest.layers.is_empty());
        assert!(manifest.media_type.is_none());
    }

    #[test]
    fn test_image_config_diff_ids() {
        let config = ImageConfig::linux(vec![Digest::sha256_of(b"a")]);
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["os"], "linux");
        assert_eq!(json["rootfs"]["type"], "layers");
        assert_eq!(json["rootfs"]["diff_ids"].as_array().unwrap().len(), 1);

        let parsed: ImageConfig = serde_json::from_str(r#"{"os":"linux"}"#).unwrap();
        assert!(parsed.rootfs.diff_ids.is_empty());
    }
}
