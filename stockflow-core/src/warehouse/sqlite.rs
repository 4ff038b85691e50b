//! SQLite-backed warehouse.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tracing::debug;

use super::{table_ident, Warehouse};
use crate::domain::record::format_timestamp;
use crate::domain::{FormattedRecord, RowCount};
use crate::error::{PipelineError, Result};

pub struct SqliteWarehouse {
    conn: Mutex<Connection>,
    label: String,
}

impl SqliteWarehouse {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| PipelineError::Load(format!("create {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self {
            conn: Mutex::new(conn),
            label: path.display().to_string(),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            label: ":memory:".to_string(),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| PipelineError::Load("warehouse connection poisoned".into()))
    }
}

fn ensure_table(conn: &Connection, ident: &str) -> Result<()> {
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS \"{ident}\" (
                symbol TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL,
                PRIMARY KEY (symbol, timestamp)
            )"
        ),
        [],
    )?;
    Ok(())
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PipelineError::Load(format!("bad timestamp '{text}' in warehouse: {e}")))
}

impl Warehouse for SqliteWarehouse {
    fn name(&self) -> &str {
        &self.label
    }

    fn upsert_span(&self, table: &str, records: &[FormattedRecord]) -> Result<RowCount> {
        let ident = table_ident(table)?;
        let Some(first) = records.first() else {
            return Ok(RowCount(0));
        };
        let symbol = first.symbol.as_str();
        if let Some(other) = records.iter().find(|r| r.symbol != symbol) {
            return Err(PipelineError::Load(format!(
                "mixed symbols in one load: {symbol} and {}",
                other.symbol
            )));
        }

        // Fixed-width UTC text: lexical min/max is chronological min/max.
        let keys: Vec<String> = records.iter().map(FormattedRecord::timestamp_key).collect();
        let from = keys.iter().min().cloned().unwrap_or_default();
        let to = keys.iter().max().cloned().unwrap_or_default();

        let mut conn = self.lock()?;
        ensure_table(&conn, &ident)?;

        let tx = conn.transaction()?;
        let replaced = tx.execute(
            &format!("DELETE FROM \"{ident}\" WHERE symbol = ?1 AND timestamp BETWEEN ?2 AND ?3"),
            params![symbol, from, to],
        )?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO \"{ident}\" (symbol, timestamp, open, high, low, close, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(symbol, timestamp) DO UPDATE SET
                    open = excluded.open,
                    high = excluded.high,
                    low = excluded.low,
                    close = excluded.close,
                    volume = excluded.volume"
            ))?;
            for (record, ts) in records.iter().zip(&keys) {
                stmt.execute(params![
                    record.symbol,
                    ts,
                    record.open,
                    record.high,
                    record.low,
                    record.close,
                    record.volume,
                ])?;
            }
        }
        tx.commit()?;

        debug!(table = %ident, symbol, %from, %to, replaced, inserted = records.len(), "span upserted");
        Ok(RowCount(records.len()))
    }

    fn count_span(
        &self,
        table: &str,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<usize> {
        let ident = table_ident(table)?;
        let conn = self.lock()?;
        ensure_table(&conn, &ident)?;
        let count: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM \"{ident}\" WHERE symbol = ?1 AND timestamp BETWEEN ?2 AND ?3"
            ),
            params![symbol, format_timestamp(&from), format_timestamp(&to)],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn rows(&self, table: &str, symbol: &str) -> Result<Vec<FormattedRecord>> {
        let ident = table_ident(table)?;
        let conn = self.lock()?;
        ensure_table(&conn, &ident)?;

        let mut stmt = conn.prepare(&format!(
            "SELECT symbol, timestamp, open, high, low, close, volume
             FROM \"{ident}\" WHERE symbol = ?1 ORDER BY timestamp ASC"
        ))?;
        let mut rows = stmt.query(params![symbol])?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let ts: String = row.get(1)?;
            out.push(FormattedRecord {
                symbol: row.get(0)?,
                timestamp: parse_timestamp(&ts)?,
                open: row.get(2)?,
                high: row.get(3)?,
                low: row.get(4)?,
                close: row.get(5)?,
                volume: row.get(6)?,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::DEFAULT_TABLE;

    const DAY: i64 = 86_400;
    const JAN_2: i64 = 1_704_153_600;

    fn record(ts: i64, close: f64) -> FormattedRecord {
        FormattedRecord {
            symbol: "NVDA".into(),
            timestamp: DateTime::from_timestamp(ts, 0).unwrap(),
            open: 10.0,
            high: 11.0,
            low: 9.0,
            close,
            volume: 1000.0,
        }
    }

    fn at(ts: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(ts, 0).unwrap()
    }

    #[test]
    fn repeated_upsert_does_not_duplicate() {
        let wh = SqliteWarehouse::in_memory().unwrap();
        let batch = vec![record(JAN_2, 10.5), record(JAN_2 + DAY, 11.0)];

        wh.upsert_span(DEFAULT_TABLE, &batch).unwrap();
        wh.upsert_span(DEFAULT_TABLE, &batch).unwrap();

        assert_eq!(
            wh.count_span(DEFAULT_TABLE, "NVDA", at(JAN_2), at(JAN_2 + DAY)).unwrap(),
            2
        );
        assert_eq!(wh.rows(DEFAULT_TABLE, "NVDA").unwrap(), batch);
    }

    #[test]
    fn reload_supersedes_rows_inside_span_only() {
        let wh = SqliteWarehouse::in_memory().unwrap();
        wh.upsert_span(
            DEFAULT_TABLE,
            &[record(JAN_2 - DAY, 9.0), record(JAN_2, 10.0), record(JAN_2 + DAY, 10.0)],
        )
        .unwrap();

        // New span covers JAN_2..=JAN_2+2d and no longer carries JAN_2+1d.
        wh.upsert_span(DEFAULT_TABLE, &[record(JAN_2, 20.0), record(JAN_2 + 2 * DAY, 22.0)])
            .unwrap();

        let closes: Vec<f64> = wh
            .rows(DEFAULT_TABLE, "NVDA")
            .unwrap()
            .iter()
            .map(|r| r.close)
            .collect();
        assert_eq!(closes, vec![9.0, 20.0, 22.0]);
    }

    #[test]
    fn mixed_symbols_are_rejected_atomically() {
        let wh = SqliteWarehouse::in_memory().unwrap();
        let mut other = record(JAN_2 + DAY, 1.0);
        other.symbol = "AAPL".into();

        let err = wh
            .upsert_span(DEFAULT_TABLE, &[record(JAN_2, 10.0), other])
            .unwrap_err();
        assert!(matches!(err, PipelineError::Load(_)));
        assert!(wh.rows(DEFAULT_TABLE, "NVDA").unwrap().is_empty());
    }

    #[test]
    fn file_backed_rows_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wh").join("warehouse.db");
        {
            let wh = SqliteWarehouse::open(&path).unwrap();
            wh.upsert_span("stock_market", &[record(JAN_2, 10.5)]).unwrap();
        }
        let wh = SqliteWarehouse::open(&path).unwrap();
        assert_eq!(wh.rows("public.stock_market", "NVDA").unwrap().len(), 1);
    }
}
