//! Parcel Store - GUID-addressed package content on disk
//!
//! This crate stores content in packages. A package manifest indexes its
//! content by type; every object lives in its own file whose location is
//! derived from the package id, type name and object id. Subcontent belongs
//! to a parent object and is found through the parent's folder instead of a
//! manifest.
//!
//! [`PackageStore`] is the entry point. It owns the [`ManifestCatalog`] and
//! the [`ResourceCache`], which keeps a single live instance per
//! `(type, id)` and writes changes back when flushed.

mod cache;
mod catalog;
mod codec;
mod content;
mod manifest;
mod paths;
mod store;

pub use cache::ResourceCache;
pub use catalog::{CatalogReloaded, ManifestCatalog};
pub use codec::{read_object, read_object_async, write_object, ContentCodec, TomlCodec};
pub use content::{ContentBody, ContentHandle, ContentObject, ParentRef, SubContent};
pub use manifest::ManifestRecord;
pub use paths::{suffix, PathScheme, MANIFEST_SUFFIX, PACKAGES_DIR};
pub use store::PackageStore;

pub use parcel_core::{ContentId, ContentType, ParcelError, Result, StoreConfig};
