//! In-memory object store for tests and dry runs.

use std::collections::BTreeMap;
use std::sync::RwLock;

use super::keys::ObjectKey;
use super::object_store::{ObjectMeta, ObjectStore};
use crate::error::{PipelineError, Result};

/// Thread-safe via `RwLock`. Contents vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<ObjectKey, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> PipelineError {
    PipelineError::StorageUnavailable("memory store lock poisoned".into())
}

impl ObjectStore for MemoryObjectStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn put(&self, key: &ObjectKey, data: &[u8]) -> Result<ObjectMeta> {
        let mut objects = self.objects.write().map_err(|_| poisoned())?;
        objects.insert(key.clone(), data.to_vec());
        Ok(ObjectMeta::for_content(key.clone(), data))
    }

    fn get(&self, key: &ObjectKey) -> Result<Vec<u8>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        objects.get(key).cloned().ok_or_else(|| PipelineError::NotFound {
            key: key.to_string(),
        })
    }

    fn head(&self, key: &ObjectKey) -> Result<Option<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects
            .get(key)
            .map(|data| ObjectMeta::for_content(key.clone(), data)))
    }

    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects
            .iter()
            .filter(|(k, _)| k.bucket == bucket && k.path.starts_with(prefix))
            .map(|(k, data)| ObjectMeta::for_content(k.clone(), data))
            .collect())
    }
}
