//! Transform stage — raw payload in, formatted CSV out.
//!
//! Contract, independent of the engine that runs it:
//! - samples with a missing or non-numeric required field are dropped and
//!   logged, never written half-null
//! - output is sorted ascending by timestamp with exact-timestamp repeats
//!   removed (first occurrence wins)
//! - zero surviving rows is a `Transform` error, not an empty file
//! - the output key is derived from the input key alone

pub mod canonicalize;
pub mod codec;

use std::sync::Arc;

use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::{FormattedRecord, RawPayload, RawSample};
use crate::error::{PipelineError, Result};
use crate::storage::{ObjectKey, ObjectStore, Stage};

pub use canonicalize::{AnomalyReport, AnomalyType, Canonicalizer};

/// Row accounting for one transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformReport {
    pub input_rows: usize,
    pub dropped_rows: usize,
    pub duplicate_rows: usize,
    pub output_rows: usize,
}

/// Normalise `samples` into formatted records for `symbol`.
pub fn normalize(
    symbol: &str,
    samples: &[RawSample],
) -> Result<(Vec<FormattedRecord>, TransformReport)> {
    let polars_err = |e: PolarsError| PipelineError::Transform(format!("polars: {e}"));

    let df = Canonicalizer::samples_to_frame(samples).map_err(polars_err)?;
    let complete = Canonicalizer::drop_incomplete(df.lazy())
        .collect()
        .map_err(polars_err)?;
    let canonical = Canonicalizer::canonicalize(complete.clone().lazy())
        .collect()
        .map_err(polars_err)?;

    let report = TransformReport {
        input_rows: samples.len(),
        dropped_rows: samples.len() - complete.height(),
        duplicate_rows: complete.height() - canonical.height(),
        output_rows: canonical.height(),
    };

    if report.dropped_rows > 0 {
        let first_bad: Vec<String> = samples
            .iter()
            .filter(|s| !s.is_complete())
            .take(5)
            .map(|s| match s.timestamp {
                Some(ts) => ts.to_string(),
                None => "<no timestamp>".to_string(),
            })
            .collect();
        warn!(
            symbol,
            dropped = report.dropped_rows,
            ?first_bad,
            "dropped samples with missing or non-numeric fields"
        );
    }

    if report.output_rows == 0 {
        return Err(PipelineError::Transform(format!(
            "{symbol}: none of {} samples survived validation",
            report.input_rows
        )));
    }

    for anomaly in Canonicalizer::detect_anomalies(&canonical) {
        warn!(symbol, kind = ?anomaly.anomaly_type, count = anomaly.count, "data anomaly");
    }

    let records = Canonicalizer::frame_to_records(&canonical, symbol).map_err(polars_err)?;
    Ok((records, report))
}

/// Reads raw objects and writes their formatted counterpart.
#[derive(Clone)]
pub struct Transformer {
    store: Arc<dyn ObjectStore>,
}

impl Transformer {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub fn transform(&self, raw_key: &ObjectKey) -> Result<ObjectKey> {
        self.transform_with_report(raw_key).map(|(key, _)| key)
    }

    pub fn transform_with_report(&self, raw_key: &ObjectKey) -> Result<(ObjectKey, TransformReport)> {
        let (run, stage) = raw_key.identity()?;
        if stage != Stage::Raw {
            return Err(PipelineError::InvalidKey {
                key: raw_key.to_string(),
                reason: "transform input must be a raw object".into(),
            });
        }

        let bytes = self.store.get(raw_key)?;
        let payload = RawPayload::from_json_bytes(&bytes)
            .map_err(|e| PipelineError::Schema(format!("corrupt raw object {raw_key}: {e}")))?;

        let (records, report) = normalize(&run.symbol, &payload.samples)?;
        let csv = codec::encode(&records)
            .map_err(|e| PipelineError::Transform(format!("encode csv: {e}")))?;

        let formatted_key = ObjectKey::for_stage(&raw_key.bucket, &run, Stage::Formatted);
        self.store.put(&formatted_key, &csv)?;

        info!(
            run = %run,
            key = %formatted_key,
            rows = report.output_rows,
            dropped = report.dropped_rows,
            duplicates = report.duplicate_rows,
            "formatted output written"
        );
        Ok((formatted_key, report))
    }
}
