//! Resource cache: one live instance per content identity
//!
//! The cache owns every loaded [`ContentObject`] through a shared
//! [`ContentHandle`]. Loading an identity that is already cached returns the
//! cached handle and never touches disk. Changes are written back lazily:
//! [`ResourceCache::mark_dirty`] queues an object and
//! [`ResourceCache::flush_all`] drains the queue in enqueue order.
//!
//! A miss is decoded under a per-identity gate, never under the cache lock,
//! and the slot is re-checked right before inserting; the first inserted
//! instance stands. Synchronous and async loads use separate gates, so a
//! racing pair may both decode but still end up sharing one instance.

use crate::catalog::ManifestCatalog;
use crate::codec::{self, ContentCodec};
use crate::content::{ContentHandle, ContentObject, ParentRef};
use crate::paths::{suffix, PathScheme};
use futures::future::join_all;
use parcel_core::{ContentId, ContentType, ParcelError, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::Arc;

type Slots = HashMap<ContentId, ContentHandle>;
type SlotKey = (ContentType, ContentId);
type Gates<G> = Mutex<HashMap<SlotKey, Arc<G>>>;

/// Process-wide cache of loaded content with a pending-write queue
pub struct ResourceCache {
    paths: PathScheme,
    codec: Arc<dyn ContentCodec>,
    loaded: Mutex<HashMap<ContentType, Slots>>,
    pending: Mutex<VecDeque<ContentHandle>>,
    sync_gates: Gates<Mutex<()>>,
    async_gates: Gates<tokio::sync::Mutex<()>>,
}

impl ResourceCache {
    pub fn new(paths: PathScheme, codec: Arc<dyn ContentCodec>) -> Self {
        Self {
            paths,
            codec,
            loaded: Mutex::new(HashMap::new()),
            pending: Mutex::new(VecDeque::new()),
            sync_gates: Mutex::new(HashMap::new()),
            async_gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn paths(&self) -> &PathScheme {
        &self.paths
    }

    pub fn codec(&self) -> &dyn ContentCodec {
        self.codec.as_ref()
    }

    // --- lookups ---

    /// Cached instance of `(content_type, id)`, without touching disk
    pub fn get(&self, content_type: &ContentType, id: ContentId) -> Option<ContentHandle> {
        self.loaded
            .lock()
            .get(content_type)
            .and_then(|slots| slots.get(&id))
            .cloned()
    }

    pub fn contains(&self, content_type: &ContentType, id: ContentId) -> bool {
        self.get(content_type, id).is_some()
    }

    /// Every cached object of a type
    pub fn loaded_of_type(&self, content_type: &ContentType) -> Vec<ContentHandle> {
        self.loaded
            .lock()
            .get(content_type)
            .map(|slots| slots.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Ids of every cached object of a type
    pub fn loaded_ids(&self, content_type: &ContentType) -> Vec<ContentId> {
        self.loaded
            .lock()
            .get(content_type)
            .map(|slots| slots.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Total number of cached objects
    pub fn len(&self) -> usize {
        self.loaded.lock().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // --- manual management ---

    /// Insert `handle` unless its identity is already cached.
    ///
    /// Returns the canonical instance: `handle` itself, or the one that was
    /// already cached (which is left untouched).
    pub fn register(&self, handle: ContentHandle) -> ContentHandle {
        let (content_type, id) = {
            let object = handle.read();
            (object.content_type().clone(), object.id())
        };
        self.loaded
            .lock()
            .entry(content_type)
            .or_default()
            .entry(id)
            .or_insert(handle)
            .clone()
    }

    /// Evict an identity. Queued writes for it are kept.
    pub fn remove(&self, content_type: &ContentType, id: ContentId) -> Option<ContentHandle> {
        self.loaded
            .lock()
            .get_mut(content_type)
            .and_then(|slots| slots.remove(&id))
    }

    // --- loading ---

    /// Load content registered in `manifest`, decoding it on a cache miss.
    ///
    /// Fails with `NotFound` when there is no backing file and with
    /// `CorruptFormat` when it cannot be decoded.
    pub fn load(
        &self,
        manifest: &ContentHandle,
        id: ContentId,
        content_type: &ContentType,
    ) -> Result<ContentHandle> {
        let package_id = manifest.read().id();
        self.load_in_package(package_id, id, content_type)
    }

    /// Load content stored in `package_id`, decoding it on a cache miss
    pub fn load_in_package(
        &self,
        package_id: ContentId,
        id: ContentId,
        content_type: &ContentType,
    ) -> Result<ContentHandle> {
        if let Some(handle) = self.get(content_type, id) {
            return Ok(handle);
        }

        let key = (content_type.clone(), id);
        let gate = open_gate(&self.sync_gates, &key);
        let result = {
            let _permit = gate.lock();
            match self.get(content_type, id) {
                Some(handle) => Ok(handle),
                None => self
                    .decode_in_package(package_id, id, content_type)
                    .map(|object| self.register(object.into_handle())),
            }
        };
        drop(gate);
        release_gate(&self.sync_gates, &key);
        result
    }

    /// Load every id of `content_type` registered in `manifest`.
    ///
    /// Ids whose file is missing or undecodable are skipped and then
    /// removed from the manifest, which is marked dirty. Returns every
    /// cached object of the type, including ones loaded elsewhere.
    pub fn load_all_of_type(
        &self,
        manifest: &ContentHandle,
        content_type: &ContentType,
    ) -> Vec<ContentHandle> {
        let (package_id, ids) = registered_ids(manifest, content_type);
        let mut dangling = Vec::new();
        for id in ids {
            if let Err(e) = self.load_in_package(package_id, id, content_type) {
                tracing::warn!(%content_type, %id, error = %e, "content could not be loaded");
                dangling.push(id);
            }
        }
        self.deregister_dangling(manifest, content_type, &dangling);
        self.loaded_of_type(content_type)
    }

    /// Load one subcontent object of `parent`.
    ///
    /// The sub folder is probed under the parent's own package first and
    /// then under every cataloged package; the first hit wins.
    pub fn load_sub_asset(
        &self,
        catalog: &ManifestCatalog,
        parent: &ContentHandle,
        sub_id: ContentId,
        sub_type: &ContentType,
    ) -> Result<ContentHandle> {
        if let Some(handle) = self.get(sub_type, sub_id) {
            return Ok(handle);
        }
        let parent_ref = ParentRef::of(&parent.read());

        for package_id in candidate_packages(&parent_ref, catalog) {
            let folder = self.paths.type_folder(package_id, &parent_ref.content_type);
            let path = PathScheme::sub_file_path(&folder, parent_ref.id, sub_id, sub_type);
            match self.decode_sub(&path, sub_id, sub_type, &parent_ref) {
                Ok(mut object) => {
                    object.on_load(parent_ref.package_id);
                    return Ok(self.register(object.into_handle()));
                }
                Err(e) if e.is_not_found() => {
                    tracing::debug!(path = %path.display(), "subcontent not at path");
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "subcontent could not be loaded");
                }
            }
        }

        tracing::warn!(%sub_type, %sub_id, parent = %parent_ref.id, "subcontent could not be found");
        Err(ParcelError::NotFound(format!(
            "{}:{} under {}:{}",
            sub_type, sub_id, parent_ref.content_type, parent_ref.id
        )))
    }

    /// Load every subcontent object of `parent` found on disk.
    ///
    /// Discovery scans the sub folders rather than any manifest. Each found
    /// object is registered; when an identity was already cached the cached
    /// instance is returned in its place. Files whose name is not the id
    /// they hold, or that belong to another parent, are skipped.
    pub fn load_all_sub_assets(
        &self,
        catalog: &ManifestCatalog,
        parent: &ContentHandle,
        sub_type: &ContentType,
    ) -> Vec<ContentHandle> {
        let parent_ref = ParentRef::of(&parent.read());
        let wanted_suffix = suffix(sub_type);
        let mut seen = HashSet::new();
        let mut found = Vec::new();

        for package_id in candidate_packages(&parent_ref, catalog) {
            let folder = self.paths.type_folder(package_id, &parent_ref.content_type);
            let sub_folder = PathScheme::sub_folder(&folder, parent_ref.id, sub_type);
            let entries = match fs::read_dir(&sub_folder) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            tracing::debug!(folder = %sub_folder.display(), "scanning subcontent");

            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_file()
                    || path.extension().and_then(|e| e.to_str()) != Some(wanted_suffix.as_str())
                {
                    continue;
                }
                let Some(sub_id) = path
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .and_then(|stem| stem.parse::<ContentId>().ok())
                else {
                    tracing::warn!(path = %path.display(), "subcontent file name is not a content id");
                    continue;
                };
                if seen.contains(&sub_id) {
                    continue;
                }
                if let Some(handle) = self.get(sub_type, sub_id) {
                    seen.insert(sub_id);
                    found.push(handle);
                    continue;
                }
                match self.decode_sub(&path, sub_id, sub_type, &parent_ref) {
                    Ok(mut object) => {
                        seen.insert(sub_id);
                        object.on_load(parent_ref.package_id);
                        found.push(self.register(object.into_handle()));
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "subcontent could not be loaded");
                    }
                }
            }
        }
        found
    }

    // --- async loading ---

    /// Async [`ResourceCache::load`]: suspends on file I/O
    pub async fn load_async(
        &self,
        manifest: &ContentHandle,
        id: ContentId,
        content_type: &ContentType,
    ) -> Result<ContentHandle> {
        let package_id = manifest.read().id();
        self.load_in_package_async(package_id, id, content_type).await
    }

    /// Async [`ResourceCache::load_in_package`].
    ///
    /// Concurrent async loads of one identity are single-flight. A racing
    /// synchronous load may still insert first, in which case its instance
    /// is returned.
    pub async fn load_in_package_async(
        &self,
        package_id: ContentId,
        id: ContentId,
        content_type: &ContentType,
    ) -> Result<ContentHandle> {
        if let Some(handle) = self.get(content_type, id) {
            return Ok(handle);
        }

        let key = (content_type.clone(), id);
        let gate = open_gate(&self.async_gates, &key);
        let result = {
            let _permit = gate.lock().await;
            match self.get(content_type, id) {
                Some(handle) => Ok(handle),
                None => {
                    let path = self.paths.content_path(package_id, id, content_type);
                    let decoded =
                        codec::read_object_async(self.codec.as_ref(), &path, content_type).await;
                    decoded.and_then(|mut object| {
                        check_identity(&object, id, &path)?;
                        object.on_load(package_id);
                        tracing::debug!(%content_type, %id, "loaded");
                        Ok(self.register(object.into_handle()))
                    })
                }
            }
        };
        drop(gate);
        release_gate(&self.async_gates, &key);
        result
    }

    /// Async [`ResourceCache::load_all_of_type`]; misses load concurrently
    pub async fn load_all_of_type_async(
        &self,
        manifest: &ContentHandle,
        content_type: &ContentType,
    ) -> Vec<ContentHandle> {
        let (package_id, ids) = registered_ids(manifest, content_type);
        let misses: Vec<ContentId> = ids
            .into_iter()
            .filter(|id| !self.contains(content_type, *id))
            .collect();

        let results = join_all(
            misses
                .iter()
                .map(|id| self.load_in_package_async(package_id, *id, content_type)),
        )
        .await;

        let dangling: Vec<ContentId> = misses
            .into_iter()
            .zip(results)
            .filter_map(|(id, result)| match result {
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(%content_type, %id, error = %e, "content could not be loaded");
                    Some(id)
                }
            })
            .collect();

        self.deregister_dangling(manifest, content_type, &dangling);
        self.loaded_of_type(content_type)
    }

    // --- dirty tracking ---

    /// Queue `handle` for writing. No-op while it is already dirty.
    pub fn mark_dirty(&self, handle: &ContentHandle) {
        {
            let mut object = handle.write();
            if object.is_dirty() {
                return;
            }
            object.set_dirty(true);
        }
        self.pending.lock().push_back(handle.clone());
    }

    /// Number of queued writes
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether this exact instance is queued for writing
    pub fn is_pending(&self, handle: &ContentHandle) -> bool {
        self.pending
            .lock()
            .iter()
            .any(|queued| Arc::ptr_eq(queued, handle))
    }

    /// Drop a queued write without performing it and mark the object clean
    pub fn discard_pending(&self, handle: &ContentHandle) {
        self.pending
            .lock()
            .retain(|queued| !Arc::ptr_eq(queued, handle));
        handle.write().set_dirty(false);
    }

    /// Write one object now and take it off the queue.
    ///
    /// On failure the object stays dirty and queued.
    pub fn flush_one(&self, handle: &ContentHandle) -> Result<()> {
        self.write_to_disk(handle)?;
        self.pending
            .lock()
            .retain(|queued| !Arc::ptr_eq(queued, handle));
        Ok(())
    }

    /// Write queued objects in enqueue order until the queue is empty.
    ///
    /// Objects queued while draining are written in the same pass. On
    /// failure the failing object is put back at the front of the queue and
    /// the error is returned. Returns the number of objects written.
    pub fn flush_all(&self) -> Result<usize> {
        let mut written = 0;
        loop {
            let next = self.pending.lock().pop_front();
            let Some(handle) = next else {
                break;
            };
            if let Err(e) = self.write_to_disk(&handle) {
                self.pending.lock().push_front(handle);
                return Err(e);
            }
            written += 1;
        }
        Ok(written)
    }

    fn write_to_disk(&self, handle: &ContentHandle) -> Result<()> {
        let mut object = handle.write();
        let path = self.paths.object_path(&object)?;
        codec::write_object(self.codec.as_ref(), &object, &path)?;
        object.set_dirty(false);
        tracing::debug!(name = %object.display_name, path = %path.display(), "saved");
        Ok(())
    }

    // --- helpers ---

    fn decode_in_package(
        &self,
        package_id: ContentId,
        id: ContentId,
        content_type: &ContentType,
    ) -> Result<ContentObject> {
        let path = self.paths.content_path(package_id, id, content_type);
        let mut object = self.decode_at(&path, id, content_type)?;
        object.on_load(package_id);
        tracing::debug!(%content_type, %id, "loaded");
        Ok(object)
    }

    fn decode_at(&self, path: &Path, id: ContentId, content_type: &ContentType) -> Result<ContentObject> {
        let object = codec::read_object(self.codec.as_ref(), path, content_type)?;
        check_identity(&object, id, path)?;
        Ok(object)
    }

    fn decode_sub(
        &self,
        path: &Path,
        sub_id: ContentId,
        sub_type: &ContentType,
        parent: &ParentRef,
    ) -> Result<ContentObject> {
        let object = self.decode_at(path, sub_id, sub_type)?;
        check_parent(&object, parent, path)?;
        Ok(object)
    }

    /// Remove ids without a usable backing file from the manifest
    fn deregister_dangling(&self, manifest: &ContentHandle, content_type: &ContentType, ids: &[ContentId]) {
        if ids.is_empty() {
            return;
        }
        let changed = {
            let mut object = manifest.write();
            let package = object.id();
            match object.manifest_mut() {
                Some(record) => {
                    let mut changed = false;
                    for id in ids {
                        let reference = ParcelError::DanglingReference {
                            content_type: content_type.clone(),
                            id: *id,
                            package,
                        };
                        tracing::info!(error = %reference, "removing entry from manifest");
                        changed |= record.remove_entry(content_type, *id);
                    }
                    changed
                }
                None => false,
            }
        };
        if changed {
            self.mark_dirty(manifest);
        }
    }
}

/// Package id of `manifest` and a copy of its entries for `content_type`
fn registered_ids(manifest: &ContentHandle, content_type: &ContentType) -> (ContentId, Vec<ContentId>) {
    let object = manifest.read();
    let ids = object
        .manifest()
        .map(|record| record.entries(content_type).to_vec())
        .unwrap_or_default();
    (object.id(), ids)
}

/// Packages whose folders may hold subcontent of `parent`: the parent's own
/// package first, then every cataloged package
fn candidate_packages(parent: &ParentRef, catalog: &ManifestCatalog) -> Vec<ContentId> {
    let mut packages = Vec::new();
    if !parent.package_id.is_nil() {
        packages.push(parent.package_id);
    }
    packages.extend(
        catalog
            .package_ids()
            .into_iter()
            .filter(|id| *id != parent.package_id),
    );
    packages
}

fn open_gate<G: Default>(gates: &Gates<G>, key: &SlotKey) -> Arc<G> {
    gates.lock().entry(key.clone()).or_default().clone()
}

/// Forget a gate once nobody else holds it
fn release_gate<G>(gates: &Gates<G>, key: &SlotKey) {
    let mut gates = gates.lock();
    if gates
        .get(key)
        .map(|gate| Arc::strong_count(gate) == 1)
        .unwrap_or(false)
    {
        gates.remove(key);
    }
}

fn check_parent(object: &ContentObject, parent: &ParentRef, path: &Path) -> Result<()> {
    match object.parent_ref() {
        Some(found) if found.id == parent.id && found.content_type == parent.content_type => Ok(()),
        _ => Err(ParcelError::CorruptFormat {
            path: path.to_path_buf(),
            reason: format!("not subcontent of {}:{}", parent.content_type, parent.id),
        }),
    }
}

fn check_identity(object: &ContentObject, id: ContentId, path: &Path) -> Result<()> {
    if object.id() != id {
        return Err(ParcelError::CorruptFormat {
            path: path.to_path_buf(),
            reason: format!("file holds {} instead of {}", object.id(), id),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{write_object, TomlCodec};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// TOML codec that counts decode calls
    #[derive(Default)]
    struct CountingCodec {
        decodes: AtomicUsize,
    }

    impl ContentCodec for CountingCodec {
        fn encode(&self, object: &ContentObject) -> Result<Vec<u8>> {
            TomlCodec.encode(object)
        }

        fn decode(&self, bytes: &[u8], expected: &ContentType, source: &Path) -> Result<ContentObject> {
            self.decodes.fetch_add(1, Ordering::SeqCst);
            TomlCodec.decode(bytes, expected, source)
        }
    }

    fn widget() -> ContentType {
        ContentType::new("Widget")
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        paths: PathScheme,
        codec: Arc<CountingCodec>,
        cache: ResourceCache,
        manifest: ContentHandle,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let paths = PathScheme::new(dir.path());
        let codec = Arc::new(CountingCodec::default());
        let cache = ResourceCache::new(paths.clone(), codec.clone());
        let manifest = ContentObject::new_manifest("pkg").into_handle();
        Fixture {
            _dir: dir,
            paths,
            codec,
            cache,
            manifest,
        }
    }

    /// Write a widget to disk and register it in the manifest
    fn stored_widget(fx: &Fixture, name: &str) -> ContentId {
        let package_id = fx.manifest.read().id();
        let mut object = ContentObject::new_entry(widget(), name);
        object.package_id = package_id;
        write_object(
            &TomlCodec,
            &object,
            &fx.paths.file_path(package_id, object.id(), &widget()),
        )
        .unwrap();
        fx.manifest
            .write()
            .manifest_mut()
            .unwrap()
            .register_entry(&widget(), object.id());
        object.id()
    }

    #[test]
    fn test_get_does_not_touch_disk() {
        let fx = fixture();
        let id = stored_widget(&fx, "knob");
        assert!(fx.cache.get(&widget(), id).is_none());
        assert_eq!(fx.codec.decodes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_load_then_get_same_instance() {
        let fx = fixture();
        let id = stored_widget(&fx, "knob");

        let loaded = fx.cache.load(&fx.manifest, id, &widget()).unwrap();
        let got = fx.cache.get(&widget(), id).unwrap();
        assert!(Arc::ptr_eq(&loaded, &got));

        let again = fx.cache.load(&fx.manifest, id, &widget()).unwrap();
        assert!(Arc::ptr_eq(&loaded, &again));
        assert_eq!(fx.codec.decodes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_load_assigns_package() {
        let fx = fixture();
        let package_id = fx.manifest.read().id();
        let object = ContentObject::new_entry(widget(), "orphan");
        write_object(
            &TomlCodec,
            &object,
            &fx.paths.file_path(package_id, object.id(), &widget()),
        )
        .unwrap();

        let loaded = fx.cache.load(&fx.manifest, object.id(), &widget()).unwrap();
        assert_eq!(loaded.read().package_id, package_id);
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let fx = fixture();
        let err = fx.cache.load(&fx.manifest, ContentId::new(), &widget()).unwrap_err();
        assert!(err.is_not_found());
        assert!(fx.cache.is_empty());
    }

    #[test]
    fn test_load_corrupt() {
        let fx = fixture();
        let id = ContentId::new();
        let path = fx.paths.file_path(fx.manifest.read().id(), id, &widget());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "garbage = [").unwrap();

        let err = fx.cache.load(&fx.manifest, id, &widget()).unwrap_err();
        assert!(matches!(err, ParcelError::CorruptFormat { .. }));
    }

    #[test]
    fn test_register_never_overwrites() {
        let fx = fixture();
        let a = ContentObject::new_entry(widget(), "a");
        let mut b = a.clone();
        b.display_name = "b".to_string();
        let a = a.into_handle();
        let b = b.into_handle();

        assert!(Arc::ptr_eq(&fx.cache.register(a.clone()), &a));
        assert!(Arc::ptr_eq(&fx.cache.register(b), &a));

        let id = a.read().id();
        assert_eq!(fx.cache.get(&widget(), id).unwrap().read().display_name, "a");
    }

    #[test]
    fn test_remove_keeps_pending() {
        let fx = fixture();
        let mut object = ContentObject::new_entry(widget(), "gone");
        object.package_id = fx.manifest.read().id();
        let id = object.id();
        let handle = fx.cache.register(object.into_handle());
        fx.cache.mark_dirty(&handle);

        assert!(fx.cache.remove(&widget(), id).is_some());
        assert!(fx.cache.get(&widget(), id).is_none());
        assert_eq!(fx.cache.pending_len(), 1);

        fx.cache.flush_all().unwrap();
        assert!(fx.paths.file_path(fx.manifest.read().id(), id, &widget()).is_file());
    }

    #[test]
    fn test_load_all_returns_cache_snapshot() {
        let fx = fixture();
        let a = stored_widget(&fx, "a");
        let b = stored_widget(&fx, "b");

        // Cached elsewhere, not listed in this manifest
        let unrelated = fx
            .cache
            .register(ContentObject::new_entry(widget(), "unrelated").into_handle());
        let unrelated_id = unrelated.read().id();

        let all = fx.cache.load_all_of_type(&fx.manifest, &widget());
        let ids: HashSet<ContentId> = all.iter().map(|h| h.read().id()).collect();
        assert_eq!(ids, HashSet::from([a, b, unrelated_id]));
        assert!(!fx
            .manifest
            .read()
            .manifest()
            .unwrap()
            .contains_entry(&widget(), unrelated_id));
    }

    #[test]
    fn test_load_all_self_heals() {
        let fx = fixture();
        let present = stored_widget(&fx, "present");
        let missing = ContentId::new();
        fx.manifest
            .write()
            .manifest_mut()
            .unwrap()
            .register_entry(&widget(), missing);

        let all = fx.cache.load_all_of_type(&fx.manifest, &widget());
        let ids: Vec<ContentId> = all.iter().map(|h| h.read().id()).collect();
        assert_eq!(ids, vec![present]);

        let manifest = fx.manifest.read();
        let record = manifest.manifest().unwrap();
        assert!(!record.contains_entry(&widget(), missing));
        assert!(record.contains_entry(&widget(), present));
        assert!(manifest.is_dirty());
        drop(manifest);
        assert!(fx.cache.is_pending(&fx.manifest));
    }

    #[test]
    fn test_load_all_skips_cached() {
        let fx = fixture();
        let id = stored_widget(&fx, "a");
        let first = fx.cache.load(&fx.manifest, id, &widget()).unwrap();

        let all = fx.cache.load_all_of_type(&fx.manifest, &widget());
        assert_eq!(all.len(), 1);
        assert!(Arc::ptr_eq(&all[0], &first));
        assert_eq!(fx.codec.decodes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_mark_dirty_enqueues_once() {
        let fx = fixture();
        let handle = fx.manifest.clone();

        fx.cache.mark_dirty(&handle);
        fx.cache.mark_dirty(&handle);
        assert!(handle.read().is_dirty());
        assert_eq!(fx.cache.pending_len(), 1);
    }

    #[test]
    fn test_flush_one_clears_dirty() {
        let fx = fixture();
        let handle = fx.manifest.clone();
        fx.cache.mark_dirty(&handle);

        fx.cache.flush_one(&handle).unwrap();
        assert!(!handle.read().is_dirty());
        assert!(!fx.cache.is_pending(&handle));
        assert!(fx.paths.manifest_path(handle.read().id()).is_file());
    }

    #[test]
    fn test_flush_failure_keeps_dirty() {
        let fx = fixture();
        // No owning package, so there is nowhere to write it
        let handle = fx
            .cache
            .register(ContentObject::new_entry(widget(), "homeless").into_handle());
        fx.cache.mark_dirty(&handle);

        assert!(fx.cache.flush_one(&handle).is_err());
        assert!(handle.read().is_dirty());
        assert!(fx.cache.is_pending(&handle));

        assert!(fx.cache.flush_all().is_err());
        assert!(handle.read().is_dirty());
        assert_eq!(fx.cache.pending_len(), 1);

        handle.write().package_id = fx.manifest.read().id();
        assert_eq!(fx.cache.flush_all().unwrap(), 1);
        assert!(!handle.read().is_dirty());
    }

    /// TOML codec that records the ids it encodes, optionally marking
    /// another object dirty while encoding
    #[derive(Default)]
    struct RecordingCodec {
        cache: std::sync::OnceLock<std::sync::Weak<ResourceCache>>,
        follow_up: Mutex<Option<ContentHandle>>,
        encoded: Mutex<Vec<ContentId>>,
    }

    impl ContentCodec for RecordingCodec {
        fn encode(&self, object: &ContentObject) -> Result<Vec<u8>> {
            self.encoded.lock().push(object.id());
            let next = self.follow_up.lock().take();
            if let (Some(next), Some(cache)) = (next, self.cache.get().and_then(|c| c.upgrade())) {
                cache.mark_dirty(&next);
            }
            TomlCodec.encode(object)
        }

        fn decode(&self, bytes: &[u8], expected: &ContentType, source: &Path) -> Result<ContentObject> {
            TomlCodec.decode(bytes, expected, source)
        }
    }

    fn recording_cache(dir: &tempfile::TempDir) -> (Arc<RecordingCodec>, Arc<ResourceCache>) {
        let codec = Arc::new(RecordingCodec::default());
        let cache = Arc::new(ResourceCache::new(PathScheme::new(dir.path()), codec.clone()));
        codec.cache.set(Arc::downgrade(&cache)).unwrap();
        (codec, cache)
    }

    #[test]
    fn test_flush_all_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (codec, cache) = recording_cache(&dir);
        let package_id = ContentId::new();
        let handles: Vec<ContentHandle> = (0..4)
            .map(|i| {
                let mut object = ContentObject::new_entry(widget(), format!("w{}", i));
                object.package_id = package_id;
                cache.register(object.into_handle())
            })
            .collect();

        // Queue in an order unrelated to creation
        let order = [2, 0, 3, 1];
        for i in order {
            cache.mark_dirty(&handles[i]);
        }
        // Already queued, keeps its place
        cache.mark_dirty(&handles[2]);

        assert_eq!(cache.flush_all().unwrap(), 4);
        assert_eq!(cache.pending_len(), 0);
        let expected: Vec<ContentId> = order.iter().map(|&i| handles[i].read().id()).collect();
        assert_eq!(*codec.encoded.lock(), expected);
        for handle in &handles {
            assert!(!handle.read().is_dirty());
        }
    }

    #[test]
    fn test_discard_pending() {
        let fx = fixture();
        fx.cache.mark_dirty(&fx.manifest);
        fx.cache.discard_pending(&fx.manifest);
        assert_eq!(fx.cache.pending_len(), 0);
        assert!(!fx.manifest.read().is_dirty());
    }

    #[test]
    fn test_flush_all_drains_entries_queued_during_flush() {
        let dir = tempfile::tempdir().unwrap();
        let (codec, cache) = recording_cache(&dir);
        let paths = PathScheme::new(dir.path());

        let first = ContentObject::new_manifest("first").into_handle();
        let middle = ContentObject::new_manifest("middle").into_handle();
        let late = ContentObject::new_manifest("late").into_handle();
        *codec.follow_up.lock() = Some(late.clone());

        cache.mark_dirty(&first);
        cache.mark_dirty(&middle);
        assert_eq!(cache.pending_len(), 2);

        assert_eq!(cache.flush_all().unwrap(), 3);
        assert_eq!(cache.pending_len(), 0);
        assert_eq!(
            *codec.encoded.lock(),
            vec![first.read().id(), middle.read().id(), late.read().id()]
        );
        assert!(!late.read().is_dirty());
        assert!(paths.manifest_path(late.read().id()).is_file());
    }

    /// Codec that reads the cache while decoding
    #[derive(Default)]
    struct PeekingCodec {
        cache: std::sync::OnceLock<std::sync::Weak<ResourceCache>>,
        peeks: AtomicUsize,
    }

    impl ContentCodec for PeekingCodec {
        fn encode(&self, object: &ContentObject) -> Result<Vec<u8>> {
            TomlCodec.encode(object)
        }

        fn decode(&self, bytes: &[u8], expected: &ContentType, source: &Path) -> Result<ContentObject> {
            if let Some(cache) = self.cache.get().and_then(|c| c.upgrade()) {
                let _ = cache.len();
                self.peeks.fetch_add(1, Ordering::SeqCst);
            }
            TomlCodec.decode(bytes, expected, source)
        }
    }

    #[test]
    fn test_cache_usable_while_decoding() {
        let fx = fixture();
        let a = stored_widget(&fx, "a");
        let b = stored_widget(&fx, "b");

        let codec = Arc::new(PeekingCodec::default());
        let cache = Arc::new(ResourceCache::new(fx.paths.clone(), codec.clone()));
        codec.cache.set(Arc::downgrade(&cache)).unwrap();

        let loaded = cache.load(&fx.manifest, a, &widget()).unwrap();
        assert_eq!(loaded.read().id(), a);
        assert_eq!(cache.load_all_of_type(&fx.manifest, &widget()).len(), 2);
        assert!(cache.contains(&widget(), b));
        assert_eq!(codec.peeks.load(Ordering::SeqCst), 2);
        assert!(cache.sync_gates.lock().is_empty());
    }

    #[test]
    fn test_load_manifest_type_uses_manifest_path() {
        let fx = fixture();
        let package_id = fx.manifest.read().id();
        write_object(&TomlCodec, &fx.manifest.read(), &fx.paths.manifest_path(package_id)).unwrap();

        let loaded = fx
            .cache
            .load_in_package(package_id, package_id, &ContentType::manifest())
            .unwrap();
        assert_eq!(loaded.read().display_name, "pkg");
        assert!(loaded.read().is_manifest());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_async_and_sync_race_share_one_instance() {
        let fx = fixture();
        let id = stored_widget(&fx, "contested");
        let package_id = fx.manifest.read().id();
        let cache = Arc::new(fx.cache);

        let mut tasks = Vec::new();
        for i in 0..8 {
            let cache = cache.clone();
            if i % 2 == 0 {
                tasks.push(tokio::spawn(async move {
                    cache
                        .load_in_package_async(package_id, id, &widget())
                        .await
                        .unwrap()
                }));
            } else {
                tasks.push(tokio::task::spawn_blocking(move || {
                    cache.load_in_package(package_id, id, &widget()).unwrap()
                }));
            }
        }

        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap());
        }
        let canonical = cache.get(&widget(), id).unwrap();
        assert!(handles.iter().all(|h| Arc::ptr_eq(h, &canonical)));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_load_async_matches_sync_cache() {
        let fx = fixture();
        let id = stored_widget(&fx, "knob");

        let first = fx.cache.load_async(&fx.manifest, id, &widget()).await.unwrap();
        let second = fx.cache.load(&fx.manifest, id, &widget()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(fx.codec.decodes.load(Ordering::SeqCst), 1);
        assert!(fx.cache.async_gates.lock().is_empty());
    }

    #[tokio::test]
    async fn test_load_async_missing() {
        let fx = fixture();
        let err = fx
            .cache
            .load_async(&fx.manifest, ContentId::new(), &widget())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(fx.cache.async_gates.lock().is_empty());
    }

    #[tokio::test]
    async fn test_load_all_async_self_heals() {
        let fx = fixture();
        let a = stored_widget(&fx, "a");
        let b = stored_widget(&fx, "b");
        let missing = ContentId::new();
        fx.manifest
            .write()
            .manifest_mut()
            .unwrap()
            .register_entry(&widget(), missing);

        let all = fx.cache.load_all_of_type_async(&fx.manifest, &widget()).await;
        let ids: HashSet<ContentId> = all.iter().map(|h| h.read().id()).collect();
        assert_eq!(ids, HashSet::from([a, b]));
        assert!(!fx
            .manifest
            .read()
            .manifest()
            .unwrap()
            .contains_entry(&widget(), missing));
    }
}
