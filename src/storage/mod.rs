//! Object storage primitives the durable queue is built on.
//!
//! The queue only needs five operations from its bucket: conditional put,
//! metadata read, prefix listing, delete and conditional delete. [`ObjectStore`] names that
//! contract; [`S3Client`] implements it over any S3-compatible service and
//! [`MemoryStore`] implements it in process with the same conditional-write
//! semantics.

mod client;
mod error;
mod memory;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;

pub use client::{S3Client, S3Config};
pub use error::StorageError;
pub use memory::MemoryStore;

/// User metadata attached to a stored object.
pub type Metadata = HashMap<String, String>;

/// Condition for conditional writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutCondition {
    /// Unconditional write.
    None,
    /// `If-None-Match: *` - create only if the object doesn't exist.
    IfNoneMatch,
    /// `If-Match: "etag"` - replace only if the `ETag` still matches.
    IfMatch(String),
}

/// Attributes of a stored object as last observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectAttrs {
    /// Full object name, including its prefix.
    pub name: String,
    /// Opaque version token used for `If-Match` writes.
    pub etag: String,
    /// User metadata.
    pub metadata: Metadata,
}

impl ObjectAttrs {
    /// Looks up a metadata value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

/// The storage contract the object-store queue backend relies on.
///
/// Every successful write must produce a fresh `ETag`, even when the new
/// metadata equals the old, so that `If-Match` detects any intervening write.
#[async_trait]
pub trait ObjectStore: Send + Sync + fmt::Debug {
    /// Writes `name` with the given metadata under `condition`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::PreconditionFailed` if the condition is not met.
    async fn put(
        &self,
        name: &str,
        metadata: Metadata,
        condition: PutCondition,
    ) -> Result<ObjectAttrs, StorageError>;

    /// Reads the current attributes of `name`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the object doesn't exist.
    async fn attrs(&self, name: &str) -> Result<ObjectAttrs, StorageError>;

    /// Lists every object whose name starts with `prefix`, with attributes.
    ///
    /// Objects deleted while the listing is in flight are omitted.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectAttrs>, StorageError>;

    /// Deletes `name`. Deleting an absent object succeeds.
    async fn delete(&self, name: &str) -> Result<(), StorageError>;

    /// Deletes `name` only if its `ETag` is still `etag`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the object doesn't exist and
    /// `StorageError::PreconditionFailed` if it was rewritten.
    async fn delete_if_match(&self, name: &str, etag: &str) -> Result<(), StorageError>;
}
