//! FormattedRecord — one warehouse-ready row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single normalised OHLCV row.
///
/// Field order is the column order of the formatted CSV and the warehouse
/// table; `csv` serialises struct fields in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormattedRecord {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl FormattedRecord {
    pub const COLUMNS: [&'static str; 7] =
        ["symbol", "timestamp", "open", "high", "low", "close", "volume"];

    /// Timestamp rendered the way the warehouse stores it.
    ///
    /// Fixed-width UTC text, so lexical order equals chronological order.
    pub fn timestamp_key(&self) -> String {
        format_timestamp(&self.timestamp)
    }
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Number of rows written by a warehouse load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowCount(pub usize);

impl fmt::Display for RowCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
