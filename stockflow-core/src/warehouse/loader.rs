use std::sync::Arc;

use tracing::info;

use super::Warehouse;
use crate::domain::RowCount;
use crate::error::{PipelineError, Result};
use crate::storage::{ObjectKey, ObjectStore, Stage};
use crate::transform::codec;

/// Loads formatted CSV objects into the warehouse.
#[derive(Clone)]
pub struct WarehouseLoader {
    store: Arc<dyn ObjectStore>,
    warehouse: Arc<dyn Warehouse>,
}

impl WarehouseLoader {
    pub fn new(store: Arc<dyn ObjectStore>, warehouse: Arc<dyn Warehouse>) -> Self {
        Self { store, warehouse }
    }

    pub fn warehouse(&self) -> &Arc<dyn Warehouse> {
        &self.warehouse
    }

    /// Upsert the rows of `formatted_key` into `table`.
    ///
    /// The whole file lands in one transaction, so a failed load leaves the
    /// previous rows for the span in place and can simply be retried.
    pub fn load(&self, formatted_key: &ObjectKey, table: &str) -> Result<RowCount> {
        let (run, stage) = formatted_key.identity()?;
        if stage != Stage::Formatted {
            return Err(PipelineError::InvalidKey {
                key: formatted_key.to_string(),
                reason: "load input must be a formatted object".into(),
            });
        }

        let bytes = self.store.get(formatted_key)?;
        let records = codec::decode(&bytes)
            .map_err(|e| PipelineError::Load(format!("decode {formatted_key}: {e}")))?;
        if records.is_empty() {
            return Err(PipelineError::MissingArtifact(format!(
                "formatted output {formatted_key} holds no rows"
            )));
        }
        if let Some(stray) = records.iter().find(|r| r.symbol != run.symbol) {
            return Err(PipelineError::Load(format!(
                "{formatted_key} carries rows for {}, expected {}",
                stray.symbol, run.symbol
            )));
        }

        let rows = self.warehouse.upsert_span(table, &records)?;
        info!(run = %run, table, rows = %rows, warehouse = self.warehouse.name(), "rows loaded");
        Ok(rows)
    }
}
