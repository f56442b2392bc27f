//! Catalog of package manifests found on disk

use crate::codec::{read_object, ContentCodec};
use crate::content::ContentHandle;
use crate::paths::{PathScheme, MANIFEST_SUFFIX};
use parcel_core::{ContentId, ContentType, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;

/// Notification sent after every catalog reload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogReloaded {
    /// Package ids present after the reload
    pub packages: Vec<ContentId>,
}

/// Package manifests indexed by package id
pub struct ManifestCatalog {
    paths: PathScheme,
    manifests: BTreeMap<ContentId, ContentHandle>,
    reloaded: broadcast::Sender<CatalogReloaded>,
}

impl ManifestCatalog {
    /// Create an empty catalog; call [`ManifestCatalog::reload`] to populate it
    pub fn new(paths: PathScheme) -> Self {
        let (reloaded, _) = broadcast::channel(16);
        Self {
            paths,
            manifests: BTreeMap::new(),
            reloaded,
        }
    }

    /// Rescan the packages root and replace the catalog contents.
    ///
    /// Manifests that fail to decode are logged and skipped. A manifest
    /// with unsaved changes keeps its live handle instead of the copy on
    /// disk, and unsaved packages stay cataloged. Returns the number of
    /// cataloged manifests.
    pub fn reload(&mut self, codec: &dyn ContentCodec) -> Result<usize> {
        let root = self.paths.packages_root();
        if !root.exists() {
            fs::create_dir_all(root)?;
        }

        let mut files = Vec::new();
        Self::scan_directory(root, &mut files);

        let manifest_type = ContentType::manifest();
        let mut manifests = BTreeMap::new();
        for path in files {
            match read_object(codec, &path, &manifest_type) {
                Ok(mut manifest) => {
                    manifest.on_load(manifest.id());
                    let id = manifest.id();
                    if manifests.contains_key(&id) {
                        tracing::warn!(path = %path.display(), package = %id, "duplicate manifest skipped");
                        continue;
                    }
                    manifests.insert(id, manifest.into_handle());
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "manifest could not be deserialized");
                }
            }
        }

        for (id, live) in &self.manifests {
            if live.read().is_dirty() {
                tracing::debug!(package = %id, "keeping unsaved manifest");
                manifests.insert(*id, live.clone());
            }
        }

        self.manifests = manifests;
        let packages = self.package_ids();
        tracing::info!(count = packages.len(), root = %root.display(), "manifests reloaded");
        // No subscribers is fine
        let _ = self.reloaded.send(CatalogReloaded { packages });
        Ok(self.manifests.len())
    }

    /// Collect manifest files below `dir`. Unreadable directories are
    /// logged and skipped; symlinked directories are not followed.
    fn scan_directory(dir: &Path, files: &mut Vec<PathBuf>) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(path = %dir.display(), error = %e, "directory could not be scanned");
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);

            if is_dir {
                Self::scan_directory(&path, files);
            } else if path
                .extension()
                .map(|ext| ext == MANIFEST_SUFFIX)
                .unwrap_or(false)
            {
                files.push(path);
            }
        }
    }

    /// Receive a [`CatalogReloaded`] message after each reload.
    ///
    /// Holders of manifest handles should re-fetch them from the catalog
    /// when notified; handles from before the reload are stale.
    pub fn subscribe(&self) -> broadcast::Receiver<CatalogReloaded> {
        self.reloaded.subscribe()
    }

    /// Add a manifest that is not on disk yet.
    ///
    /// If the package is already cataloged the existing manifest is kept
    /// and returned.
    pub fn insert(&mut self, manifest: ContentHandle) -> ContentHandle {
        let id = manifest.read().id();
        self.manifests.entry(id).or_insert(manifest).clone()
    }

    /// Get the manifest of a package
    pub fn get(&self, package_id: ContentId) -> Option<ContentHandle> {
        self.manifests.get(&package_id).cloned()
    }

    pub fn contains(&self, package_id: ContentId) -> bool {
        self.manifests.contains_key(&package_id)
    }

    /// All manifests, ordered by package id
    pub fn manifests(&self) -> Vec<ContentHandle> {
        self.manifests.values().cloned().collect()
    }

    pub fn package_ids(&self) -> Vec<ContentId> {
        self.manifests.keys().copied().collect()
    }

    pub fn paths(&self) -> &PathScheme {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.manifests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifests.is_empty()
    }
}
