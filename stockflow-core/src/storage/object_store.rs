//! Object storage contract.
//!
//! Backends implement plain overwrite semantics: writing the same key twice
//! replaces the object. That is all the pipeline needs for replay safety,
//! since every key is a pure function of the LogicalRun.

use serde::{Deserialize, Serialize};

use super::keys::ObjectKey;
use crate::error::Result;

/// Metadata about a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub key: ObjectKey,
    pub size: u64,
    /// BLAKE3 digest of the content. Identical bytes give identical etags,
    /// so a replayed write is observably a no-op. `None` when the backend
    /// answered from metadata without reading the content.
    pub etag: Option<String>,
}

impl ObjectMeta {
    pub fn for_content(key: ObjectKey, data: &[u8]) -> Self {
        Self {
            key,
            size: data.len() as u64,
            etag: Some(blake3::hash(data).to_hex().to_string()),
        }
    }
}

/// S3-style key/value object storage.
///
/// Errors: transport and I/O failures are `StorageUnavailable` (retryable);
/// reading an absent key is `NotFound`.
pub trait ObjectStore: Send + Sync {
    /// Human-readable backend name for logs.
    fn name(&self) -> &str;

    /// Write (or replace) an object.
    fn put(&self, key: &ObjectKey, data: &[u8]) -> Result<ObjectMeta>;

    /// Read an entire object.
    fn get(&self, key: &ObjectKey) -> Result<Vec<u8>>;

    /// Metadata without the content, `None` when absent.
    fn head(&self, key: &ObjectKey) -> Result<Option<ObjectMeta>>;

    /// All objects in `bucket` whose path starts with `prefix`, sorted by key.
    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectMeta>>;
}
