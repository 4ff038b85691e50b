//! Deterministic object keys.
//!
//! Layout: `{bucket}/{SYMBOL}/{YYYY-MM-DD}.{ext}`
//!
//! The key is the only hand-off between stages. Any stage can recompute
//! another stage's key from `(symbol, run_date)`, and a key can be parsed
//! back into the LogicalRun it belongs to.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::LogicalRun;
use crate::error::{PipelineError, Result};

pub const DEFAULT_BUCKET: &str = "stock-market";

/// Pipeline stage that owns an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Raw,
    Formatted,
}

impl Stage {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Raw => "json",
            Self::Formatted => "csv",
        }
    }

    fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "json" => Some(Self::Raw),
            "csv" => Some(Self::Formatted),
            _ => None,
        }
    }
}

/// Location of one object in storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub bucket: String,
    pub path: String,
}

impl ObjectKey {
    pub fn new(bucket: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            path: path.into(),
        }
    }

    /// Key of `stage`'s artifact for `run`.
    pub fn for_stage(bucket: &str, run: &LogicalRun, stage: Stage) -> Self {
        Self::new(
            bucket,
            format!("{}/{}.{}", run.symbol, run.run_date, stage.extension()),
        )
    }

    /// Parse `bucket/path` as rendered by `Display`.
    pub fn parse(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((bucket, path)) if !bucket.is_empty() && !path.is_empty() => {
                Ok(Self::new(bucket, path))
            }
            _ => Err(PipelineError::InvalidKey {
                key: s.to_string(),
                reason: "expected '<bucket>/<path>'".into(),
            }),
        }
    }

    /// Recover the LogicalRun and stage this key was built from.
    pub fn identity(&self) -> Result<(LogicalRun, Stage)> {
        let invalid = |reason: &str| PipelineError::InvalidKey {
            key: self.to_string(),
            reason: reason.to_string(),
        };

        let (symbol, file) = self
            .path
            .split_once('/')
            .ok_or_else(|| invalid("expected '<symbol>/<run_date>.<ext>'"))?;
        let (date, ext) = file
            .rsplit_once('.')
            .ok_or_else(|| invalid("missing extension"))?;
        let stage = Stage::from_extension(ext).ok_or_else(|| invalid("unknown extension"))?;
        let run_date = NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .map_err(|_| invalid("run date is not YYYY-MM-DD"))?;
        let run = LogicalRun::new(symbol, run_date).map_err(|_| invalid("bad symbol segment"))?;

        Ok((run, stage))
    }

    /// Convenience over [`identity`](Self::identity) when only the run matters.
    pub fn logical_run(&self) -> Result<LogicalRun> {
        self.identity().map(|(run, _)| run)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.path)
    }
}

/// Key scheme bound to one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyLayout {
    pub bucket: String,
}

impl KeyLayout {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
        }
    }

    pub fn raw_key(&self, run: &LogicalRun) -> ObjectKey {
        ObjectKey::for_stage(&self.bucket, run, Stage::Raw)
    }

    pub fn formatted_key(&self, run: &LogicalRun) -> ObjectKey {
        ObjectKey::for_stage(&self.bucket, run, Stage::Formatted)
    }
}

impl Default for KeyLayout {
    fn default() -> Self {
        Self::new(DEFAULT_BUCKET)
    }
}
