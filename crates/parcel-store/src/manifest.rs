//! Package manifest records

use parcel_core::{ContentId, ContentType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Index of a package's content, keyed by type name.
///
/// Entry lists are deduplicated: an id appears at most once per type, so
/// removal of the first match removes the id entirely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestRecord {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    entries: BTreeMap<String, Vec<ContentId>>,
    #[serde(default)]
    dependencies: Vec<ContentId>,
}

impl ManifestRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `id` to the list for `content_type`.
    ///
    /// Returns `false` when the id was already registered.
    pub fn register_entry(&mut self, content_type: &ContentType, id: ContentId) -> bool {
        let ids = self
            .entries
            .entry(content_type.name().to_string())
            .or_default();
        if ids.contains(&id) {
            return false;
        }
        ids.push(id);
        true
    }

    /// Remove `id` from the list for `content_type`, returning whether it was present
    pub fn remove_entry(&mut self, content_type: &ContentType, id: ContentId) -> bool {
        let Some(ids) = self.entries.get_mut(content_type.name()) else {
            return false;
        };
        match ids.iter().position(|existing| *existing == id) {
            Some(index) => {
                ids.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains_entry(&self, content_type: &ContentType, id: ContentId) -> bool {
        self.entries(content_type).contains(&id)
    }

    /// Registered ids of a type in registration order (empty for unknown types)
    pub fn entries(&self, content_type: &ContentType) -> &[ContentId] {
        self.entries
            .get(content_type.name())
            .map(|ids| ids.as_slice())
            .unwrap_or(&[])
    }

    /// Type names that have an entry list
    pub fn content_types(&self) -> Vec<ContentType> {
        self.entries.keys().map(ContentType::new).collect()
    }

    /// Total number of registered entries across all types
    pub fn entry_count(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn dependencies(&self) -> &[ContentId] {
        &self.dependencies
    }

    /// Declare a dependency on another package. Returns `false` if already declared.
    pub fn add_dependency(&mut self, package_id: ContentId) -> bool {
        if self.dependencies.contains(&package_id) {
            return false;
        }
        self.dependencies.push(package_id);
        true
    }

    pub fn remove_dependency(&mut self, package_id: ContentId) -> bool {
        let before = self.dependencies.len();
        self.dependencies.retain(|dep| *dep != package_id);
        self.dependencies.len() != before
    }
}
