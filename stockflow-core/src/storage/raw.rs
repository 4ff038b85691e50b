//! Raw store — fetched payloads persisted under their deterministic key.

use std::sync::Arc;

use tracing::info;

use super::keys::{KeyLayout, ObjectKey};
use super::object_store::ObjectStore;
use crate::domain::{LogicalRun, RawPayload};
use crate::error::{PipelineError, Result};

#[derive(Clone)]
pub struct RawStore {
    store: Arc<dyn ObjectStore>,
    layout: KeyLayout,
}

impl RawStore {
    pub fn new(store: Arc<dyn ObjectStore>, layout: KeyLayout) -> Self {
        Self { store, layout }
    }

    pub fn layout(&self) -> &KeyLayout {
        &self.layout
    }

    /// Persist `payload` for `run`, replacing any previous object.
    pub fn put_raw(&self, run: &LogicalRun, payload: &RawPayload) -> Result<ObjectKey> {
        let key = self.layout.raw_key(run);
        let bytes = payload
            .to_json_bytes()
            .map_err(|e| PipelineError::Schema(format!("serialize payload for {run}: {e}")))?;
        let meta = self.store.put(&key, &bytes)?;
        info!(
            run = %run,
            key = %key,
            samples = payload.samples.len(),
            etag = ?meta.etag,
            "raw payload stored"
        );
        Ok(key)
    }

    /// Read back the payload stored for `run`.
    ///
    /// `NotFound` here means the store node has not run for this date, which
    /// is an ordering bug rather than a transient failure.
    pub fn get_raw(&self, run: &LogicalRun) -> Result<RawPayload> {
        self.get_raw_at(&self.layout.raw_key(run))
    }

    pub fn get_raw_at(&self, key: &ObjectKey) -> Result<RawPayload> {
        let bytes = self.store.get(key)?;
        RawPayload::from_json_bytes(&bytes)
            .map_err(|e| PipelineError::Schema(format!("corrupt raw object {key}: {e}")))
    }
}
