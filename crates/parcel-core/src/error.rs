//! Error types for Parcel

use crate::id::{ContentId, ContentType};
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for Parcel operations
#[derive(Debug, Error)]
pub enum ParcelError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Corrupt content at {}: {reason}", path.display())]
    CorruptFormat { path: PathBuf, reason: String },

    #[error("Dangling reference: {content_type}:{id} listed in package {package} has no backing file")]
    DanglingReference {
        content_type: ContentType,
        id: ContentId,
        package: ContentId,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParseError(String),

    #[error("TOML serialization error: {0}")]
    TomlSerError(String),

    #[error("Config error: {0}")]
    ConfigError(String),
}

impl ParcelError {
    /// True for errors meaning "nothing usable at this location"
    pub fn is_not_found(&self) -> bool {
        matches!(self, ParcelError::NotFound(_))
    }
}

/// Result type alias for Parcel operations
pub type Result<T> = std::result::Result<T, ParcelError>;

impl From<toml::de::Error> for ParcelError {
    fn from(err: toml::de::Error) -> Self {
        ParcelError::TomlParseError(err.to_string())
    }
}

impl From<toml::ser::Error> for ParcelError {
    fn from(err: toml::ser::Error) -> Self {
        ParcelError::TomlSerError(err.to_string())
    }
}
