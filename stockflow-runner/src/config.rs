//! Pipeline configuration, loaded from TOML.
//!
//! ```toml
//! [pipeline]
//! symbol = "NVDA"
//! start_date = "2024-01-01"
//!
//! [storage]
//! root = "data/objects"
//!
//! [retry]
//! max_retries = 3
//! backoff = "exponential"
//!
//! [retry.overrides.load]
//! max_retries = 5
//! ```
//!
//! Every section except `[pipeline]` is optional.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use stockflow_core::domain::LogicalRun;
use stockflow_core::source::{GateSettings, YahooSettings, DEFAULT_CHART_URL};
use stockflow_core::storage::{KeyLayout, DEFAULT_BUCKET};
use stockflow_core::warehouse::{table_ident, DEFAULT_TABLE};

use crate::retry::{Backoff, RetryPolicies, RetryPolicy};
use crate::task::TaskId;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub source: SourceSection,
    #[serde(default)]
    pub gate: GateSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub warehouse: WarehouseSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub ledger: LedgerSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineSection {
    pub symbol: String,
    /// First logical date the schedule covers.
    pub start_date: NaiveDate,
    /// Accepted only as `false`; missed intervals are never auto-executed.
    #[serde(default)]
    pub catchup: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceSection {
    pub chart_url: String,
    /// Defaults to a one-day chart request for the configured symbol.
    pub health_url: Option<String>,
    pub lookback_days: u32,
    pub request_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for SourceSection {
    fn default() -> Self {
        let yahoo = YahooSettings::default();
        Self {
            chart_url: DEFAULT_CHART_URL.to_string(),
            health_url: None,
            lookback_days: yahoo.lookback_days,
            request_timeout_secs: yahoo.request_timeout.as_secs(),
            user_agent: yahoo.user_agent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GateSection {
    pub poke_interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for GateSection {
    fn default() -> Self {
        Self {
            poke_interval_secs: 30,
            timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageSection {
    pub root: PathBuf,
    pub bucket: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/objects"),
            bucket: DEFAULT_BUCKET.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WarehouseSection {
    pub path: PathBuf,
    pub table: String,
}

impl Default for WarehouseSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/warehouse.db"),
            table: DEFAULT_TABLE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySection {
    pub max_retries: u32,
    pub backoff: BackoffKind,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    pub jitter: bool,
    /// Keyed by node name (`fetch`, `raw_store`, `load`, ...).
    pub overrides: BTreeMap<String, RetryOverride>,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffKind::Exponential,
            base_delay_secs: 10,
            max_delay_secs: 300,
            jitter: true,
            overrides: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryOverride {
    pub max_retries: Option<u32>,
    pub backoff: Option<BackoffKind>,
    pub base_delay_secs: Option<u64>,
    pub max_delay_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LedgerSection {
    pub path: PathBuf,
}

impl Default for LedgerSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/runs.jsonl"),
        }
    }
}

impl PipelineConfig {
    /// Load and validate a config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.pipeline.catchup {
            return invalid(
                "pipeline.catchup = true is not supported; trigger missed dates manually".into(),
            );
        }
        if let Err(e) = LogicalRun::new(&self.pipeline.symbol, self.pipeline.start_date) {
            return invalid(format!("pipeline.symbol: {e}"));
        }
        if self.gate.poke_interval_secs == 0 {
            return invalid("gate.poke_interval_secs must be positive".into());
        }
        if self.gate.timeout_secs == 0 {
            return invalid("gate.timeout_secs must be positive".into());
        }
        if self.source.lookback_days == 0 {
            return invalid("source.lookback_days must be at least 1".into());
        }
        let bucket = self.storage.bucket.as_str();
        if matches!(bucket, "" | "." | "..") || bucket.contains(['/', '\\']) {
            return invalid(format!("storage.bucket '{}' is not a bucket name", self.storage.bucket));
        }
        if let Err(e) = table_ident(&self.warehouse.table) {
            return invalid(format!("warehouse.table: {e}"));
        }
        if self.retry.base_delay_secs > self.retry.max_delay_secs {
            return invalid("retry.base_delay_secs exceeds retry.max_delay_secs".into());
        }
        for name in self.retry.overrides.keys() {
            if let Err(e) = name.parse::<TaskId>() {
                return invalid(format!("retry.overrides: {e}"));
            }
        }
        Ok(())
    }

    /// Symbol as it appears in keys and the warehouse.
    pub fn symbol(&self) -> String {
        self.pipeline.symbol.trim().to_ascii_uppercase()
    }

    pub fn health_url(&self) -> String {
        self.source.health_url.clone().unwrap_or_else(|| {
            format!(
                "{}/{}?range=1d&interval=1d",
                self.source.chart_url.trim_end_matches('/'),
                self.symbol()
            )
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.source.request_timeout_secs)
    }

    pub fn yahoo_settings(&self) -> YahooSettings {
        YahooSettings {
            chart_url: self.source.chart_url.clone(),
            lookback_days: self.source.lookback_days,
            request_timeout: self.request_timeout(),
            user_agent: self.source.user_agent.clone(),
        }
    }

    pub fn gate_settings(&self) -> GateSettings {
        GateSettings {
            poke_interval: Duration::from_secs(self.gate.poke_interval_secs),
            timeout: Duration::from_secs(self.gate.timeout_secs),
        }
    }

    pub fn key_layout(&self) -> KeyLayout {
        KeyLayout::new(self.storage.bucket.clone())
    }

    pub fn retry_policies(&self) -> Result<RetryPolicies, ConfigError> {
        let r = &self.retry;
        let mut policies = RetryPolicies::new(RetryPolicy {
            max_retries: r.max_retries,
            backoff: backoff(r.backoff, r.base_delay_secs, r.max_delay_secs, r.jitter),
        });
        for (name, o) in &r.overrides {
            let task = name.parse::<TaskId>().map_err(ConfigError::Invalid)?;
            let policy = RetryPolicy {
                max_retries: o.max_retries.unwrap_or(r.max_retries),
                backoff: backoff(
                    o.backoff.unwrap_or(r.backoff),
                    o.base_delay_secs.unwrap_or(r.base_delay_secs),
                    o.max_delay_secs.unwrap_or(r.max_delay_secs),
                    r.jitter,
                ),
            };
            policies = policies.with_override(task, policy);
        }
        Ok(policies)
    }
}

fn backoff(kind: BackoffKind, base_secs: u64, max_secs: u64, jitter: bool) -> Backoff {
    match kind {
        BackoffKind::Fixed => Backoff::Fixed(Duration::from_secs(base_secs)),
        BackoffKind::Exponential => Backoff::Exponential {
            base: Duration::from_secs(base_secs),
            max: Duration::from_secs(max_secs),
            jitter,
        },
    }
}
