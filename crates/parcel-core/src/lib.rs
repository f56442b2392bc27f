//! Parcel Core - Foundational types for the Parcel content store
//!
//! This crate provides the core types that the store crate depends on:
//! - `ContentId` - GUID identifiers for content and packages
//! - `ContentType` - content type names
//! - `StoreConfig` - TOML store configuration
//! - Error types and Result alias

mod config;
mod error;
mod id;

pub use config::StoreConfig;
pub use error::{ParcelError, Result};
pub use id::{ContentId, ContentType};
