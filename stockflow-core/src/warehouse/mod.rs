//! Analytical store: the warehouse table and the loader that feeds it.

pub mod loader;
pub mod sqlite;

use chrono::{DateTime, Utc};

use crate::domain::{FormattedRecord, RowCount};
use crate::error::{PipelineError, Result};

pub use loader::WarehouseLoader;
pub use sqlite::SqliteWarehouse;

pub const DEFAULT_TABLE: &str = "public.stock_market";

/// A relational table of OHLCV rows keyed by `(symbol, timestamp)`.
pub trait Warehouse: Send + Sync {
    fn name(&self) -> &str;

    /// Replace the rows of `records`' symbol within `records`' timestamp span
    /// with `records`, as one all-or-nothing unit.
    ///
    /// `records` must share a single symbol.
    fn upsert_span(&self, table: &str, records: &[FormattedRecord]) -> Result<RowCount>;

    /// Rows for `symbol` with `from <= timestamp <= to`.
    fn count_span(
        &self,
        table: &str,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<usize>;

    /// Every row for `symbol`, ascending by timestamp.
    fn rows(&self, table: &str, symbol: &str) -> Result<Vec<FormattedRecord>>;
}

/// Validate a table name and strip a `public.` schema qualifier.
///
/// Accepts `name` or `schema.name` where each part is a plain SQL
/// identifier. Only the `public` (or `main`) schema is recognised.
pub fn table_ident(table: &str) -> Result<String> {
    let invalid = |reason: &str| PipelineError::Load(format!("invalid table name '{table}': {reason}"));

    let name = match table.split_once('.') {
        Some(("public" | "main", name)) => name,
        Some((schema, _)) => return Err(invalid(&format!("unknown schema '{schema}'"))),
        None => table,
    };

    let mut chars = name.chars();
    let head_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !head_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(invalid("not a plain identifier"));
    }
    Ok(name.to_string())
}
