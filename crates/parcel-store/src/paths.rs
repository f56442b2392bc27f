//! On-disk layout of packages and their content
//!
//! ```text
//! <root>/Packages/package-<packageId>/manifest.pamf
//! <root>/Packages/package-<packageId>/<TypeName>/<contentId>.<suffix>
//! <root>/Packages/package-<packageId>/<TypeName>/<parentId>/<SubTypeName>/<subId>.<suffix>
//! ```

use crate::content::{ContentBody, ContentObject, ParentRef};
use parcel_core::{ContentId, ContentType, ParcelError, Result};
use std::path::{Path, PathBuf};

/// File suffix shared by every package manifest
pub const MANIFEST_SUFFIX: &str = "pamf";

/// Directory under the data root holding all packages
pub const PACKAGES_DIR: &str = "Packages";

/// File stem of a package manifest
const MANIFEST_STEM: &str = "manifest";

/// File suffix for content of the given type (without the dot).
///
/// The suffix is the acronym of the type name's capital letters, so
/// `SpriteSheet` maps to `SS`. Names without capitals fall back to the
/// lower-cased name. Manifests always use [`MANIFEST_SUFFIX`].
pub fn suffix(content_type: &ContentType) -> String {
    if content_type.is_manifest() {
        return MANIFEST_SUFFIX.to_string();
    }
    let acronym: String = content_type
        .name()
        .chars()
        .filter(|c| c.is_ascii_uppercase())
        .collect();
    if acronym.is_empty() {
        content_type.name().to_ascii_lowercase()
    } else {
        acronym
    }
}

/// Path derivation rooted at a data directory.
///
/// Every function is pure: identical arguments always give identical paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathScheme {
    packages_root: PathBuf,
}

impl PathScheme {
    pub fn new<P: AsRef<Path>>(data_root: P) -> Self {
        Self {
            packages_root: data_root.as_ref().join(PACKAGES_DIR),
        }
    }

    /// Directory containing every package
    pub fn packages_root(&self) -> &Path {
        &self.packages_root
    }

    pub fn package_dir(&self, package_id: ContentId) -> PathBuf {
        self.packages_root.join(format!("package-{}", package_id))
    }

    pub fn manifest_path(&self, package_id: ContentId) -> PathBuf {
        self.package_dir(package_id)
            .join(format!("{}.{}", MANIFEST_STEM, MANIFEST_SUFFIX))
    }

    /// Folder holding all content of one type within a package
    pub fn type_folder(&self, package_id: ContentId, content_type: &ContentType) -> PathBuf {
        self.package_dir(package_id).join(content_type.name())
    }

    pub fn file_path(
        &self,
        package_id: ContentId,
        id: ContentId,
        content_type: &ContentType,
    ) -> PathBuf {
        self.type_folder(package_id, content_type)
            .join(file_name(id, content_type))
    }

    /// Where top-level content of `content_type` is stored. Manifests live
    /// at [`PathScheme::manifest_path`] of their own id.
    pub fn content_path(
        &self,
        package_id: ContentId,
        id: ContentId,
        content_type: &ContentType,
    ) -> PathBuf {
        if content_type.is_manifest() {
            self.manifest_path(id)
        } else {
            self.file_path(package_id, id, content_type)
        }
    }

    /// Folder holding subcontent of `sub_type` for one parent
    pub fn sub_folder(parent_folder: &Path, parent_id: ContentId, sub_type: &ContentType) -> PathBuf {
        parent_folder
            .join(parent_id.to_string())
            .join(sub_type.name())
    }

    pub fn sub_file_path(
        parent_folder: &Path,
        parent_id: ContentId,
        sub_id: ContentId,
        sub_type: &ContentType,
    ) -> PathBuf {
        Self::sub_folder(parent_folder, parent_id, sub_type).join(file_name(sub_id, sub_type))
    }

    /// Type folder of the parent described by `parent`
    pub fn parent_folder(&self, parent: &ParentRef) -> Result<PathBuf> {
        if parent.package_id.is_nil() {
            return Err(ParcelError::NotFound(format!(
                "parent {}:{} has no package",
                parent.content_type, parent.id
            )));
        }
        Ok(self.type_folder(parent.package_id, &parent.content_type))
    }

    /// Canonical location of any content object
    pub fn object_path(&self, object: &ContentObject) -> Result<PathBuf> {
        match object.body() {
            ContentBody::Manifest(_) => Ok(self.manifest_path(object.id())),
            ContentBody::Sub(sub) => {
                let folder = self.parent_folder(&sub.parent)?;
                Ok(Self::sub_file_path(
                    &folder,
                    sub.parent.id,
                    object.id(),
                    object.content_type(),
                ))
            }
            ContentBody::Entry { .. } => {
                if object.package_id.is_nil() {
                    return Err(ParcelError::NotFound(format!(
                        "{}:{} does not belong to a package",
                        object.content_type(),
                        object.id()
                    )));
                }
                Ok(self.file_path(object.package_id, object.id(), object.content_type()))
            }
        }
    }
}

fn file_name(id: ContentId, content_type: &ContentType) -> String {
    format!("{}.{}", id, suffix(content_type))
}
