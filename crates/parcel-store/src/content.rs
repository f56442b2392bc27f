//! Content object model

use crate::manifest::ManifestRecord;
use chrono::{DateTime, Utc};
use parcel_core::{ContentId, ContentType};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};

/// Shared handle to a live content object.
///
/// The cache hands out clones of one handle per `(type, id)`; compare
/// handles with [`Arc::ptr_eq`] to check instance identity.
pub type ContentHandle = Arc<RwLock<ContentObject>>;

/// A persisted piece of package content.
///
/// Shared identity and metadata live here; what kind of content it is lives
/// in [`ContentBody`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentObject {
    id: ContentId,
    #[serde(rename = "type")]
    content_type: ContentType,
    /// Owning package, nil until the object is registered to a package
    #[serde(default = "ContentId::nil")]
    pub package_id: ContentId,
    #[serde(default = "default_display_name")]
    pub display_name: String,
    #[serde(default = "default_group_name")]
    pub group_name: String,
    #[serde(default = "default_creator_name")]
    pub creator_name: String,
    pub created_at: DateTime<Utc>,
    /// Opaque icon blob, stored as-is
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<Vec<u8>>,
    body: ContentBody,
    #[serde(skip)]
    dirty: bool,
}

fn default_display_name() -> String {
    "Unnamed".to_string()
}

fn default_group_name() -> String {
    "Misc".to_string()
}

fn default_creator_name() -> String {
    "Unknown".to_string()
}

/// The closed set of content kinds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentBody {
    /// A package manifest; its id is the package id
    Manifest(ManifestRecord),
    /// Top-level content indexed by a manifest
    Entry {
        #[serde(default)]
        properties: toml::Table,
    },
    /// Content owned by a parent object, found by path
    Sub(SubContent),
}

/// Identity of the parent a subcontent object belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParentRef {
    #[serde(rename = "type")]
    pub content_type: ContentType,
    pub id: ContentId,
    pub package_id: ContentId,
}

impl ParentRef {
    /// Describe `parent` as a parent reference
    pub fn of(parent: &ContentObject) -> Self {
        Self {
            content_type: parent.content_type.clone(),
            id: parent.id,
            package_id: parent.package_id,
        }
    }
}

/// Body of a subcontent object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubContent {
    pub parent: ParentRef,
    #[serde(default)]
    pub properties: toml::Table,
    /// Memo of the resolved parent; never keeps the parent alive
    #[serde(skip)]
    resolved_parent: Weak<RwLock<ContentObject>>,
}

impl SubContent {
    pub fn new(parent: ParentRef) -> Self {
        Self {
            parent,
            properties: toml::Table::new(),
            resolved_parent: Weak::new(),
        }
    }

    /// The memoized parent, if it was resolved and is still alive
    pub fn cached_parent(&self) -> Option<ContentHandle> {
        self.resolved_parent.upgrade()
    }

    pub(crate) fn remember_parent(&mut self, parent: &ContentHandle) {
        self.resolved_parent = Arc::downgrade(parent);
    }
}

impl ContentObject {
    fn with_body(content_type: ContentType, display_name: impl Into<String>, body: ContentBody) -> Self {
        Self {
            id: ContentId::new(),
            content_type,
            package_id: ContentId::nil(),
            display_name: display_name.into(),
            group_name: default_group_name(),
            creator_name: default_creator_name(),
            created_at: Utc::now(),
            icon: None,
            body,
            dirty: false,
        }
    }

    /// A new package manifest. Its id is also its package id.
    pub fn new_manifest(display_name: impl Into<String>) -> Self {
        let mut object = Self::with_body(
            ContentType::manifest(),
            display_name,
            ContentBody::Manifest(ManifestRecord::default()),
        );
        object.package_id = object.id;
        object
    }

    /// New top-level content of the given type
    pub fn new_entry(content_type: ContentType, display_name: impl Into<String>) -> Self {
        Self::with_body(
            content_type,
            display_name,
            ContentBody::Entry {
                properties: toml::Table::new(),
            },
        )
    }

    /// New subcontent owned by `parent`, stored under the parent's package
    pub fn new_sub(
        content_type: ContentType,
        display_name: impl Into<String>,
        parent: ParentRef,
    ) -> Self {
        let package_id = parent.package_id;
        let mut object = Self::with_body(
            content_type,
            display_name,
            ContentBody::Sub(SubContent::new(parent)),
        );
        object.package_id = package_id;
        object
    }

    pub fn id(&self) -> ContentId {
        self.id
    }

    pub fn content_type(&self) -> &ContentType {
        &self.content_type
    }

    pub fn body(&self) -> &ContentBody {
        &self.body
    }

    /// True while the object has changes not yet written to disk
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    pub fn is_manifest(&self) -> bool {
        matches!(self.body, ContentBody::Manifest(_))
    }

    pub fn manifest(&self) -> Option<&ManifestRecord> {
        match &self.body {
            ContentBody::Manifest(record) => Some(record),
            _ => None,
        }
    }

    pub fn manifest_mut(&mut self) -> Option<&mut ManifestRecord> {
        match &mut self.body {
            ContentBody::Manifest(record) => Some(record),
            _ => None,
        }
    }

    pub fn sub(&self) -> Option<&SubContent> {
        match &self.body {
            ContentBody::Sub(sub) => Some(sub),
            _ => None,
        }
    }

    pub fn sub_mut(&mut self) -> Option<&mut SubContent> {
        match &mut self.body {
            ContentBody::Sub(sub) => Some(sub),
            _ => None,
        }
    }

    pub fn parent_ref(&self) -> Option<&ParentRef> {
        self.sub().map(|sub| &sub.parent)
    }

    /// Free-form properties of entry and subcontent objects
    pub fn properties(&self) -> Option<&toml::Table> {
        match &self.body {
            ContentBody::Entry { properties } => Some(properties),
            ContentBody::Sub(sub) => Some(&sub.properties),
            ContentBody::Manifest(_) => None,
        }
    }

    pub fn properties_mut(&mut self) -> Option<&mut toml::Table> {
        match &mut self.body {
            ContentBody::Entry { properties } => Some(properties),
            ContentBody::Sub(sub) => Some(&mut sub.properties),
            ContentBody::Manifest(_) => None,
        }
    }

    /// Post-load hook: adopt `package_id` unless the object already has one
    pub fn on_load(&mut self, package_id: ContentId) {
        if self.is_manifest() {
            self.package_id = self.id;
        } else if self.package_id.is_nil() {
            self.package_id = package_id;
        }
    }

    /// Wrap into a shared handle
    pub fn into_handle(self) -> ContentHandle {
        Arc::new(RwLock::new(self))
    }
}
