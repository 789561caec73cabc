use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{IoResultExt, Result};
use crate::layer::UnpackOptions;
use crate::namespace::MapOptions;

/// unpack configuration stored as toml
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// ownership remapping and rootless behaviour
    #[serde(default)]
    pub mapping: MapOptions,
    #[serde(default)]
    pub unpack: UnpackSettings,
}

/// verification knobs for the unpack pipeline
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnpackSettings {
    /// hash each layer blob completely before extracting any of it
    #[serde(default = "default_true")]
    pub verify_before_extract: bool,
    /// compare decompressed layer digests with the config's diff_ids
    #[serde(default = "default_true")]
    pub verify_diff_ids: bool,
}

fn default_true() -> bool {
    true
}

impl Default for UnpackSettings {
    fn default() -> Self {
        Self {
            verify_before_extract: true,
            verify_diff_ids: true,
        }
    }
}

impl Config {
    /// load config from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_path(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).with_path(path)?;
        Ok(())
    }

    /// options for `unpack_manifest`
    pub fn unpack_options(&self) -> UnpackOptions {
        UnpackOptions {
            map: self.mapping.clone(),
            verify_before_extract: self.unpack.verify_before_extract,
            verify_diff_ids: self.unpack.verify_diff_ids,
            ..UnpackOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::{IdMapping, UnmappedPolicy};
    use tempfile::tempdir;

    #[test]
    fn test_config_toml_roundtrip() {
        let config = Config {
            mapping: MapOptions {
                uid_map: vec![IdMapping::new(0, 1000, 1), IdMapping::new(1, 100000, 65536)],
                gid_map: vec![IdMapping::new(0, 1000, 1)],
                rootless: true,
                unmapped: UnmappedPolicy::Ignore,
            },
            unpack: UnpackSettings {
                verify_before_extract: false,
                verify_diff_ids: true,
            },
        };

        let dir = tempdir().unwrap();
        let path = dir.path().join("unlayer.toml");
        config.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn test_config_minimal_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.mapping.uid_map.is_empty());
        assert!(!config.mapping.rootless);
        assert!(config.unpack.verify_before_extract);
        assert!(config.unpack.verify_diff_ids);
    }

    #[test]
    fn test_config_partial_toml() {
        let toml_str = r#"
[mapping]
rootless = true
uid_map = [{ container_id = 0, host_id = 1000, size = 1 }]

[unpack]
verify_diff_ids = false
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.mapping.uid_map, vec![IdMapping::new(0, 1000, 1)]);
        assert_eq!(config.mapping.unmapped, UnmappedPolicy::Reject);
        assert!(config.unpack.verify_before_extract);

        let opts = config.unpack_options();
        assert!(opts.map.rootless);
        assert!(!opts.verify_diff_ids);
    }
}
