//! LogicalRun — the unit of idempotent work.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{PipelineError, Result};

/// One instrument on one scheduled calendar date.
///
/// `run_date` is the schedule's logical date, never the wall-clock time the
/// run happened to execute. Every artifact the pipeline writes is keyed by
/// this pair, so re-executing a run converges on the same objects and rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogicalRun {
    pub symbol: String,
    pub run_date: NaiveDate,
}

impl LogicalRun {
    /// Build a run, normalising the symbol to upper case.
    ///
    /// Symbols end up as object-key path segments, so separators,
    /// whitespace and dot-only names (`.`, `..`) are rejected.
    pub fn new(symbol: &str, run_date: NaiveDate) -> Result<Self> {
        let symbol = symbol.trim().to_ascii_uppercase();
        if symbol.is_empty()
            || symbol.chars().all(|c| c == '.')
            || symbol.contains(['/', '\\'])
            || symbol.chars().any(char::is_whitespace)
        {
            return Err(PipelineError::InvalidSymbol(symbol));
        }
        Ok(Self { symbol, run_date })
    }
}

impl fmt::Display for LogicalRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.symbol, self.run_date)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn symbol_is_upper_cased() {
        let run = LogicalRun::new(" nvda ", d(2024, 1, 2)).unwrap();
        assert_eq!(run.symbol, "NVDA");
        assert_eq!(run.to_string(), "NVDA@2024-01-02");
    }

    #[test]
    fn path_separators_are_rejected() {
        assert!(LogicalRun::new("NV/DA", d(2024, 1, 2)).is_err());
        assert!(LogicalRun::new("", d(2024, 1, 2)).is_err());
        assert!(LogicalRun::new("BRK B", d(2024, 1, 2)).is_err());
        assert!(LogicalRun::new("NV\\DA", d(2024, 1, 2)).is_err());
        assert!(LogicalRun::new("..", d(2024, 1, 2)).is_err());
        assert!(LogicalRun::new(".", d(2024, 1, 2)).is_err());
        assert!(LogicalRun::new(" ... ", d(2024, 1, 2)).is_err());
    }

    #[test]
    fn dotted_symbols_are_allowed() {
        assert!(LogicalRun::new("BRK.B", d(2024, 1, 2)).is_ok());
        assert!(LogicalRun::new("^GSPC", d(2024, 1, 2)).is_ok());
    }
}
