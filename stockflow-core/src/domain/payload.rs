//! RawPayload — the fetched price series, persisted verbatim.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Instrument metadata carried alongside the samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadMeta {
    pub symbol: String,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub exchange_timezone: Option<String>,
    #[serde(default)]
    pub instrument_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub regular_market_price: Option<f64>,
}

/// One OHLCV sample as the provider reported it.
///
/// Every field is optional: providers emit `null` for halted sessions and
/// occasionally garbage for a single cell. Anything that is not a finite
/// JSON number reads back as `None`; the transform stage decides what to
/// do with incomplete samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    /// Unix seconds (UTC).
    #[serde(default, deserialize_with = "lenient_i64")]
    pub timestamp: Option<i64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub open: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub high: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub low: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub close: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub volume: Option<f64>,
}

impl RawSample {
    /// Sample with every field populated.
    pub fn new(ts: DateTime<Utc>, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            timestamp: Some(ts.timestamp()),
            open: Some(open),
            high: Some(high),
            low: Some(low),
            close: Some(close),
            volume: Some(volume),
        }
    }

    pub fn datetime(&self) -> Option<DateTime<Utc>> {
        self.timestamp.and_then(|ts| DateTime::from_timestamp(ts, 0))
    }

    /// True when every required column carries a usable value.
    pub fn is_complete(&self) -> bool {
        self.datetime().is_some()
            && [self.open, self.high, self.low, self.close, self.volume]
                .iter()
                .all(|v| v.is_some_and(f64::is_finite))
    }
}

/// The unmodified price series for one LogicalRun.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPayload {
    pub meta: PayloadMeta,
    pub samples: Vec<RawSample>,
}

impl RawPayload {
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

fn lenient_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    let value = serde_json::Value::deserialize(d)?;
    Ok(value.as_f64().filter(|v| v.is_finite()))
}

fn lenient_i64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    let value = serde_json::Value::deserialize(d)?;
    Ok(integral_i64(&value))
}

/// Integer value of a JSON number; integral floats such as `1704153600.0`
/// count, fractional or out-of-range ones do not.
pub(crate) fn integral_i64(value: &serde_json::Value) -> Option<i64> {
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|v| v.is_finite() && v.fract() == 0.0)
            .filter(|v| *v >= i64::MIN as f64 && *v < i64::MAX as f64)
            .map(|v| v as i64)
    })
}
