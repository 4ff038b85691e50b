//! Polars-backed normalisation of raw samples.
//!
//! Pipeline: samples → DataFrame → drop incomplete → stable sort → dedupe
//! (keep first) → FormattedRecords.

use chrono::DateTime;
use polars::prelude::*;

use crate::domain::{FormattedRecord, RawSample};

/// Columns that must be non-null for a sample to survive.
pub const REQUIRED: [&str; 6] = ["timestamp", "open", "high", "low", "close", "volume"];

pub struct Canonicalizer;

impl Canonicalizer {
    /// Build a frame from raw samples. Non-finite numbers and out-of-range
    /// timestamps become nulls so a single filter handles every defect.
    pub fn samples_to_frame(samples: &[RawSample]) -> PolarsResult<DataFrame> {
        let finite = |v: Option<f64>| v.filter(|x| x.is_finite());

        let timestamps: Vec<Option<i64>> = samples
            .iter()
            .map(|s| s.datetime().map(|dt| dt.timestamp()))
            .collect();
        let opens: Vec<Option<f64>> = samples.iter().map(|s| finite(s.open)).collect();
        let highs: Vec<Option<f64>> = samples.iter().map(|s| finite(s.high)).collect();
        let lows: Vec<Option<f64>> = samples.iter().map(|s| finite(s.low)).collect();
        let closes: Vec<Option<f64>> = samples.iter().map(|s| finite(s.close)).collect();
        let volumes: Vec<Option<f64>> = samples.iter().map(|s| finite(s.volume)).collect();

        DataFrame::new(vec![
            Column::new("timestamp".into(), timestamps),
            Column::new("open".into(), opens),
            Column::new("high".into(), highs),
            Column::new("low".into(), lows),
            Column::new("close".into(), closes),
            Column::new("volume".into(), volumes),
        ])
    }

    /// Keep only rows where every required column is present.
    pub fn drop_incomplete(df: LazyFrame) -> LazyFrame {
        let complete = REQUIRED
            .iter()
            .fold(lit(true), |acc, name| acc.and(col(*name).is_not_null()));
        df.filter(complete)
    }

    /// Sort ascending by timestamp and keep the first row per timestamp.
    ///
    /// The sort maintains input order among equal keys, so "first" means
    /// first as delivered by the provider.
    pub fn canonicalize(df: LazyFrame) -> LazyFrame {
        df.sort(
            ["timestamp"],
            SortMultipleOptions::default()
                .with_order_descending(false)
                .with_maintain_order(true),
        )
        .unique_stable(
            Some(vec!["timestamp".into()]),
            UniqueKeepStrategy::First,
        )
    }

    /// Convert a canonical frame into records for `symbol`.
    pub fn frame_to_records(df: &DataFrame, symbol: &str) -> PolarsResult<Vec<FormattedRecord>> {
        let ts = df.column("timestamp")?.i64()?;
        let open = df.column("open")?.f64()?;
        let high = df.column("high")?.f64()?;
        let low = df.column("low")?.f64()?;
        let close = df.column("close")?.f64()?;
        let volume = df.column("volume")?.f64()?;

        let mut records = Vec::with_capacity(df.height());
        for i in 0..df.height() {
            let (Some(t), Some(o), Some(h), Some(l), Some(c), Some(v)) = (
                ts.get(i),
                open.get(i),
                high.get(i),
                low.get(i),
                close.get(i),
                volume.get(i),
            ) else {
                continue;
            };
            let Some(timestamp) = DateTime::from_timestamp(t, 0) else {
                continue;
            };
            records.push(FormattedRecord {
                symbol: symbol.to_string(),
                timestamp,
                open: o,
                high: h,
                low: l,
                close: c,
                volume: v,
            });
        }
        Ok(records)
    }

    /// Detect anomalies worth a warning (rows are kept either way).
    pub fn detect_anomalies(df: &DataFrame) -> Vec<AnomalyReport> {
        let mut anomalies = Vec::new();

        if let Ok(volume) = df.column("volume").and_then(|c| c.f64()) {
            let zero_volume_count = volume.iter().filter(|v| *v == Some(0.0)).count();
            if zero_volume_count > 0 {
                anomalies.push(AnomalyReport {
                    anomaly_type: AnomalyType::ZeroVolume,
                    count: zero_volume_count,
                });
            }
        }

        if let (Ok(high), Ok(low)) = (
            df.column("high").and_then(|c| c.f64()),
            df.column("low").and_then(|c| c.f64()),
        ) {
            let inverted = high
                .iter()
                .zip(low.iter())
                .filter(|(h, l)| matches!((h, l), (Some(h), Some(l)) if h < l))
                .count();
            if inverted > 0 {
                anomalies.push(AnomalyReport {
                    anomaly_type: AnomalyType::InvertedRange,
                    count: inverted,
                });
            }
        }

        anomalies
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnomalyReport {
    pub anomaly_type: AnomalyType,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyType {
    /// Session reported no traded volume.
    ZeroVolume,
    /// High below low.
    InvertedRange,
}
