//! Encoding content objects to and from files

use crate::content::{ContentBody, ContentObject};
use parcel_core::{ContentType, ParcelError, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

/// Structured encoding of content objects.
///
/// Implementations must round-trip every public field of a
/// [`ContentObject`]. The transient dirty flag is never encoded.
pub trait ContentCodec: Send + Sync {
    /// Encode an object into bytes
    fn encode(&self, object: &ContentObject) -> Result<Vec<u8>>;

    /// Decode bytes read from `source` into an object of type `expected`.
    ///
    /// Fails with [`ParcelError::CorruptFormat`] when the bytes cannot be
    /// decoded or describe a different type.
    fn decode(&self, bytes: &[u8], expected: &ContentType, source: &Path) -> Result<ContentObject>;
}

/// Self-describing TOML records, one table per object
#[derive(Debug, Default, Clone, Copy)]
pub struct TomlCodec;

impl ContentCodec for TomlCodec {
    fn encode(&self, object: &ContentObject) -> Result<Vec<u8>> {
        Ok(toml::to_string_pretty(object)?.into_bytes())
    }

    fn decode(&self, bytes: &[u8], expected: &ContentType, source: &Path) -> Result<ContentObject> {
        let corrupt = |reason: String| ParcelError::CorruptFormat {
            path: source.to_path_buf(),
            reason,
        };
        let text = std::str::from_utf8(bytes).map_err(|e| corrupt(e.to_string()))?;
        let object: ContentObject = toml::from_str(text).map_err(|e| corrupt(e.to_string()))?;
        check_type(&object, expected).map_err(corrupt)?;
        Ok(object)
    }
}

/// Verify that a decoded record is of the requested type and kind
pub(crate) fn check_type(object: &ContentObject, expected: &ContentType) -> std::result::Result<(), String> {
    if object.content_type() != expected {
        return Err(format!(
            "expected type {}, found {}",
            expected,
            object.content_type()
        ));
    }
    let is_manifest_body = matches!(object.body(), ContentBody::Manifest(_));
    if is_manifest_body != expected.is_manifest() {
        return Err(format!("type {} has a mismatched body", expected));
    }
    Ok(())
}

/// Encode `object` to `path`, creating parent directories and replacing any
/// previous contents
pub fn write_object(codec: &dyn ContentCodec, object: &ContentObject, path: &Path) -> Result<()> {
    let bytes = codec.encode(object)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, bytes)?;
    Ok(())
}

/// Decode the object stored at `path`.
///
/// A missing file is [`ParcelError::NotFound`]; an undecodable one is
/// [`ParcelError::CorruptFormat`].
pub fn read_object(codec: &dyn ContentCodec, path: &Path, expected: &ContentType) -> Result<ContentObject> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(ParcelError::NotFound(path.display().to_string()))
        }
        Err(e) => return Err(e.into()),
    };
    codec.decode(&bytes, expected, path)
}

/// Async counterpart of [`read_object`]; suspends on file I/O
pub async fn read_object_async(
    codec: &dyn ContentCodec,
    path: &Path,
    expected: &ContentType,
) -> Result<ContentObject> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(ParcelError::NotFound(path.display().to_string()))
        }
        Err(e) => return Err(e.into()),
    };
    codec.decode(&bytes, expected, path)
}
