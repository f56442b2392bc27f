//! Package store context
//!
//! [`PackageStore`] bundles the path scheme, manifest catalog and resource
//! cache of one data root. Create one at startup and pass it to whatever
//! needs content; there is no global instance.

use crate::cache::ResourceCache;
use crate::catalog::{CatalogReloaded, ManifestCatalog};
use crate::codec::{ContentCodec, TomlCodec};
use crate::content::{ContentBody, ContentHandle, ContentObject, ParentRef};
use crate::paths::PathScheme;
use parcel_core::{ContentId, ContentType, ParcelError, Result, StoreConfig};
use parking_lot::{RwLock, RwLockReadGuard};
use std::fs;
use std::io::ErrorKind;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Content store rooted at one data directory
pub struct PackageStore {
    config: StoreConfig,
    paths: PathScheme,
    codec: Arc<dyn ContentCodec>,
    catalog: RwLock<ManifestCatalog>,
    cache: ResourceCache,
}

impl PackageStore {
    /// Open a store using TOML records and scan for manifests
    pub fn open(config: StoreConfig) -> Result<Self> {
        Self::with_codec(config, Arc::new(TomlCodec))
    }

    /// Open a store with a custom codec and scan for manifests
    pub fn with_codec(config: StoreConfig, codec: Arc<dyn ContentCodec>) -> Result<Self> {
        let paths = PathScheme::new(&config.data_root);
        let store = Self {
            catalog: RwLock::new(ManifestCatalog::new(paths.clone())),
            cache: ResourceCache::new(paths.clone(), codec.clone()),
            config,
            paths,
            codec,
        };
        store.reload_manifests()?;
        Ok(store)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn paths(&self) -> &PathScheme {
        &self.paths
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    /// Read access to the manifest catalog
    pub fn catalog(&self) -> RwLockReadGuard<'_, ManifestCatalog> {
        self.catalog.read()
    }

    // --- packages ---

    /// Rescan manifests from disk and notify subscribers
    pub fn reload_manifests(&self) -> Result<usize> {
        self.catalog.write().reload(self.codec.as_ref())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CatalogReloaded> {
        self.catalog.read().subscribe()
    }

    /// Manifest of a cataloged package
    pub fn manifest(&self, package_id: ContentId) -> Option<ContentHandle> {
        self.catalog.read().get(package_id)
    }

    /// Create a new, empty package. It is written on the next flush.
    pub fn create_package(&self, name: impl Into<String>) -> ContentHandle {
        let mut manifest = ContentObject::new_manifest(name);
        manifest.creator_name = self.config.creator_name.clone();
        let handle = self.catalog.write().insert(manifest.into_handle());
        self.cache.mark_dirty(&handle);
        tracing::info!(package = %handle.read().id(), "package created");
        handle
    }

    /// Write a package's manifest now
    pub fn save_package(&self, package_id: ContentId) -> Result<()> {
        let manifest = self
            .manifest(package_id)
            .ok_or_else(|| ParcelError::NotFound(format!("package {}", package_id)))?;
        self.cache.flush_one(&manifest)
    }

    /// Add an entry to a manifest, marking it dirty if it changed
    pub fn register_entry(&self, manifest: &ContentHandle, content_type: &ContentType, id: ContentId) -> bool {
        let changed = manifest
            .write()
            .manifest_mut()
            .map(|record| record.register_entry(content_type, id))
            .unwrap_or(false);
        if changed {
            self.cache.mark_dirty(manifest);
        }
        changed
    }

    /// Remove an entry from a manifest, marking it dirty if it changed
    pub fn remove_entry(&self, manifest: &ContentHandle, content_type: &ContentType, id: ContentId) -> bool {
        let changed = manifest
            .write()
            .manifest_mut()
            .map(|record| record.remove_entry(content_type, id))
            .unwrap_or(false);
        if changed {
            self.cache.mark_dirty(manifest);
        }
        changed
    }

    // --- content lifecycle ---

    /// Create top-level content in the package of `manifest`.
    ///
    /// The object is registered in the manifest and the cache and queued
    /// for writing.
    pub fn create_content(
        &self,
        manifest: &ContentHandle,
        content_type: ContentType,
        name: impl Into<String>,
        properties: toml::Table,
    ) -> ContentHandle {
        let package_id = manifest.read().id();
        let mut object = ContentObject::new_entry(content_type.clone(), name);
        object.creator_name = self.config.creator_name.clone();
        object.package_id = package_id;
        if let Some(props) = object.properties_mut() {
            *props = properties;
        }
        let id = object.id();

        self.register_entry(manifest, &content_type, id);
        let handle = self.cache.register(object.into_handle());
        self.cache.mark_dirty(&handle);
        tracing::debug!(%content_type, %id, package = %package_id, "content created");
        handle
    }

    /// Create subcontent owned by `parent`. Subcontent is not indexed by any
    /// manifest; it is found through the parent's folder.
    pub fn create_sub_content(
        &self,
        parent: &ContentHandle,
        content_type: ContentType,
        name: impl Into<String>,
        properties: toml::Table,
    ) -> ContentHandle {
        let parent_ref = ParentRef::of(&parent.read());
        let mut object = ContentObject::new_sub(content_type, name, parent_ref);
        object.creator_name = self.config.creator_name.clone();
        if let Some(sub) = object.sub_mut() {
            sub.properties = properties;
            sub.remember_parent(parent);
        }

        let handle = self.cache.register(object.into_handle());
        self.cache.mark_dirty(&handle);
        handle
    }

    /// Move content into a cataloged package.
    ///
    /// Returns `false` if the package is unknown. Subcontent is never
    /// indexed, so registering it is a no-op that reports success.
    pub fn register_to_package(&self, content: &ContentHandle, package_id: ContentId) -> bool {
        let Some(manifest) = self.manifest(package_id) else {
            return false;
        };
        let (content_type, id) = {
            let mut object = content.write();
            match object.body() {
                ContentBody::Sub(_) => return true,
                ContentBody::Manifest(_) => return false,
                ContentBody::Entry { .. } => {}
            }
            object.package_id = package_id;
            (object.content_type().clone(), object.id())
        };
        self.register_entry(&manifest, &content_type, id);
        self.cache.mark_dirty(content);
        true
    }

    /// Delete content: deregister it, evict it and remove its file.
    ///
    /// Returns `false` without touching anything when the owning package is
    /// not cataloged.
    pub fn destroy(&self, content: &ContentHandle) -> Result<bool> {
        let (content_type, id, package_id, path) = {
            let object = content.read();
            (
                object.content_type().clone(),
                object.id(),
                object.package_id,
                self.paths.object_path(&object)?,
            )
        };
        let Some(manifest) = self.manifest(package_id) else {
            return Ok(false);
        };

        self.remove_entry(&manifest, &content_type, id);
        self.cache.remove(&content_type, id);
        self.cache.discard_pending(content);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::debug!(%content_type, %id, "content destroyed");
        Ok(true)
    }

    // --- loading ---

    pub fn load(&self, manifest: &ContentHandle, id: ContentId, content_type: &ContentType) -> Result<ContentHandle> {
        self.cache.load(manifest, id, content_type)
    }

    pub fn load_all_of_type(&self, manifest: &ContentHandle, content_type: &ContentType) -> Vec<ContentHandle> {
        self.cache.load_all_of_type(manifest, content_type)
    }

    pub fn load_sub_asset(
        &self,
        parent: &ContentHandle,
        sub_id: ContentId,
        sub_type: &ContentType,
    ) -> Result<ContentHandle> {
        let catalog = self.catalog.read();
        self.cache.load_sub_asset(&catalog, parent, sub_id, sub_type)
    }

    pub fn load_all_sub_assets(&self, parent: &ContentHandle, sub_type: &ContentType) -> Vec<ContentHandle> {
        let catalog = self.catalog.read();
        self.cache.load_all_sub_assets(&catalog, parent, sub_type)
    }

    /// Resolve the parent of a subcontent object.
    ///
    /// The result is memoized as a weak reference. Returns `None` (with a
    /// warning) when the object is not subcontent or the parent cannot be
    /// found.
    pub fn resolve_parent(&self, sub: &ContentHandle) -> Option<ContentHandle> {
        let (parent_ref, cached, sub_id) = {
            let object = sub.read();
            let body = object.sub()?;
            (body.parent.clone(), body.cached_parent(), object.id())
        };
        if cached.is_some() {
            return cached;
        }

        let Some(manifest) = self.manifest(parent_ref.package_id) else {
            tracing::warn!(
                parent = %parent_ref.id,
                parent_type = %parent_ref.content_type,
                sub = %sub_id,
                package = %parent_ref.package_id,
                "parent package not found"
            );
            return None;
        };

        match self.cache.load(&manifest, parent_ref.id, &parent_ref.content_type) {
            Ok(parent) => {
                if let Some(body) = sub.write().sub_mut() {
                    body.remember_parent(&parent);
                }
                Some(parent)
            }
            Err(e) => {
                tracing::warn!(
                    parent = %parent_ref.id,
                    parent_type = %parent_ref.content_type,
                    sub = %sub_id,
                    error = %e,
                    "parent not found"
                );
                None
            }
        }
    }

    // --- saving ---

    pub fn mark_dirty(&self, content: &ContentHandle) {
        self.cache.mark_dirty(content);
    }

    pub fn flush_one(&self, content: &ContentHandle) -> Result<()> {
        self.cache.flush_one(content)
    }

    /// Write every queued object
    pub fn flush_all(&self) -> Result<usize> {
        self.cache.flush_all()
    }
}
