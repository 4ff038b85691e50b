//! Filesystem object store with an S3-compatible key layout.
//!
//! Layout: `{root}/{bucket}/{path}`
//!
//! Writes are atomic (write to `.tmp`, rename into place), so a reader never
//! observes a half-written object and an interrupted write leaves the
//! previous version intact.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::keys::ObjectKey;
use super::object_store::{ObjectMeta, ObjectStore};
use crate::error::{PipelineError, Result};

const TMP_SUFFIX: &str = "tmp";

pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory holding one sub-directory per bucket.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path of `key`. Keys that would resolve outside their
    /// bucket directory are rejected.
    fn object_path(&self, key: &ObjectKey) -> Result<PathBuf> {
        let mut path = self.bucket_dir(&key.bucket).map_err(|reason| PipelineError::InvalidKey {
            key: key.to_string(),
            reason,
        })?;
        for segment in key.path.split('/') {
            check_segment(segment).map_err(|reason| PipelineError::InvalidKey {
                key: key.to_string(),
                reason,
            })?;
            path.push(segment);
        }
        Ok(path)
    }

    fn bucket_dir(&self, bucket: &str) -> std::result::Result<PathBuf, String> {
        check_segment(bucket)?;
        Ok(self.root.join(bucket))
    }
}

fn check_segment(segment: &str) -> std::result::Result<(), String> {
    match segment {
        "" => Err("empty path segment".into()),
        "." | ".." => Err(format!("relative path segment '{segment}'")),
        s if s.contains('\\') => Err(format!("backslash in path segment '{s}'")),
        _ => Ok(()),
    }
}

fn unavailable(key: &ObjectKey, what: &str, e: io::Error) -> PipelineError {
    PipelineError::StorageUnavailable(format!("{what} {key}: {e}"))
}

impl ObjectStore for LocalObjectStore {
    fn name(&self) -> &str {
        "local"
    }

    fn put(&self, key: &ObjectKey, data: &[u8]) -> Result<ObjectMeta> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| unavailable(key, "create dir for", e))?;
        }

        let tmp_path = path.with_extension(format!(
            "{}.{TMP_SUFFIX}",
            path.extension().and_then(|e| e.to_str()).unwrap_or_default()
        ));
        fs::write(&tmp_path, data).map_err(|e| unavailable(key, "write", e))?;

        // Atomic rename
        fs::rename(&tmp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            unavailable(key, "rename into place", e)
        })?;

        debug!(key = %key, bytes = data.len(), "object written");
        Ok(ObjectMeta::for_content(key.clone(), data))
    }

    fn get(&self, key: &ObjectKey) -> Result<Vec<u8>> {
        match fs::read(self.object_path(key)?) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(PipelineError::NotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(unavailable(key, "read", e)),
        }
    }

    /// Size from filesystem metadata; the content is not read, so `etag`
    /// is `None`.
    fn head(&self, key: &ObjectKey) -> Result<Option<ObjectMeta>> {
        match fs::metadata(self.object_path(key)?) {
            Ok(meta) if meta.is_file() => Ok(Some(ObjectMeta {
                key: key.clone(),
                size: meta.len(),
                etag: None,
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(unavailable(key, "stat", e)),
        }
    }

    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let bucket_dir = self.bucket_dir(bucket).map_err(|reason| PipelineError::InvalidKey {
            key: format!("{bucket}/{prefix}"),
            reason,
        })?;
        if !bucket_dir.exists() {
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        collect_files(&bucket_dir, &bucket_dir, &mut paths).map_err(|e| {
            PipelineError::StorageUnavailable(format!("list {bucket}/{prefix}: {e}"))
        })?;

        let mut metas = Vec::new();
        for rel in paths.into_iter().filter(|p| p.starts_with(prefix)) {
            let key = ObjectKey::new(bucket, rel);
            if let Some(meta) = self.head(&key)? {
                metas.push(meta);
            }
        }
        metas.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(metas)
    }
}

/// Collect `/`-separated paths of all committed files under `dir`.
fn collect_files(base: &Path, dir: &Path, out: &mut Vec<String>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(base, &path, out)?;
            continue;
        }
        // Skip in-flight writes
        if path.extension().and_then(|e| e.to_str()) == Some(TMP_SUFFIX) {
            continue;
        }
        if let Ok(rel) = path.strip_prefix(base) {
            let segments: Vec<String> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            out.push(segments.join("/"));
        }
    }
    Ok(())
}
