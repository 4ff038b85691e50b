//! Formatted-path resolver.
//!
//! The loader recomputes the formatted key from `(symbol, run_date)` rather
//! than receiving it from the transform node, so a resumed run can start at
//! `load` with no state carried over from earlier attempts.

use std::sync::Arc;

use tracing::debug;

use crate::domain::LogicalRun;
use crate::error::{PipelineError, Result};
use crate::storage::{KeyLayout, ObjectKey, ObjectStore};

#[derive(Clone)]
pub struct FormattedPathResolver {
    store: Arc<dyn ObjectStore>,
    layout: KeyLayout,
}

impl FormattedPathResolver {
    pub fn new(store: Arc<dyn ObjectStore>, layout: KeyLayout) -> Self {
        Self { store, layout }
    }

    /// The key the transform stage writes for `run`. No I/O.
    pub fn resolve_key(&self, run: &LogicalRun) -> ObjectKey {
        self.layout.formatted_key(run)
    }

    /// The key for `run`, confirmed to exist.
    ///
    /// An absent object means transform never ran or lost its output; that
    /// is reported as `MissingArtifact` so the run fails instead of retrying.
    pub fn resolve(&self, run: &LogicalRun) -> Result<ObjectKey> {
        let key = self.resolve_key(run);
        match self.store.head(&key)? {
            Some(meta) => {
                debug!(run = %run, key = %key, size = meta.size, "formatted artifact located");
                Ok(key)
            }
            None => Err(PipelineError::MissingArtifact(format!(
                "formatted output {key} for {run} does not exist"
            ))),
        }
    }
}
