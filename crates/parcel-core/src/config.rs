//! Store configuration loaded from TOML

use crate::error::{ParcelError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Settings for a package store.
///
/// ```toml
/// data_root = "ApplicationData"
/// creator_name = "Level Team"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Root data directory; packages live under `<data_root>/Packages/`
    pub data_root: PathBuf,
    /// Creator name stamped on newly created content
    #[serde(default = "default_creator_name")]
    pub creator_name: String,
}

fn default_creator_name() -> String {
    "Unknown".to_string()
}

impl StoreConfig {
    /// Configuration with defaults for the given data root
    pub fn new<P: AsRef<Path>>(data_root: P) -> Self {
        Self {
            data_root: data_root.as_ref().to_path_buf(),
            creator_name: default_creator_name(),
        }
    }

    pub fn with_creator_name(mut self, name: impl Into<String>) -> Self {
        self.creator_name = name.into();
        self
    }

    /// Load configuration from a TOML file.
    ///
    /// A relative `data_root` is resolved against the file's directory.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ParcelError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut config = Self::parse(&content)?;
        if config.data_root.is_relative() {
            if let Some(dir) = path.parent() {
                config.data_root = dir.join(&config.data_root);
            }
        }
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ParcelError::ConfigError(e.to_string()))
    }

    /// Serialize configuration to a TOML string
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_defaults() {
        let config = StoreConfig::parse(r#"data_root = "/tmp/data""#).unwrap();
        assert_eq!(config.data_root, PathBuf::from("/tmp/data"));
        assert_eq!(config.creator_name, "Unknown");
    }

    #[test]
    fn test_parse_full() {
        let config = StoreConfig::parse(
            r#"
data_root = "data"
creator_name = "Level Team"
"#,
        )
        .unwrap();
        assert_eq!(config.creator_name, "Level Team");
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = StoreConfig::parse("data_root = \"x\"\ncolour = \"red\"").unwrap_err();
        assert!(matches!(err, ParcelError::ConfigError(_)));
    }

    #[test]
    fn test_load_resolves_relative_root() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("parcel.toml");
        fs::write(&file, "data_root = \"ApplicationData\"\n").unwrap();

        let config = StoreConfig::load(&file).unwrap();
        assert_eq!(config.data_root, dir.path().join("ApplicationData"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = StoreConfig::load("/definitely/not/here/parcel.toml").unwrap_err();
        assert!(matches!(err, ParcelError::ConfigError(_)));
    }

    #[test]
    fn test_roundtrip_string() {
        let config = StoreConfig::new("/srv/data").with_creator_name("Ops");
        let text = config.to_toml_string().unwrap();
        assert_eq!(StoreConfig::parse(&text).unwrap(), config);
    }
}
