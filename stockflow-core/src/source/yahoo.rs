//! Yahoo Finance chart source.
//!
//! Fetches daily OHLCV samples from Yahoo's v8 chart API. The request window
//! is derived from `run_date` alone (`lookback_days` ending with that day),
//! so replaying a LogicalRun asks for exactly the same window.
//!
//! Yahoo has no official API and is subject to unannounced format changes;
//! shape problems surface as `Schema` errors.

use std::time::Duration;

use chrono::{Days, NaiveDate, NaiveTime};
use serde::Deserialize;
use tracing::{debug, info};

use super::provider::PriceSource;
use crate::domain::payload::integral_i64;
use crate::domain::{LogicalRun, PayloadMeta, RawPayload, RawSample};
use crate::error::{PipelineError, Result};

pub const DEFAULT_CHART_URL: &str = "https://query1.finance.yahoo.com/v8/finance/chart";

/// Yahoo Finance v8 chart API response.
#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    result: Option<Vec<ChartData>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    meta: ChartMeta,
    timestamp: Option<Vec<serde_json::Value>>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChartMeta {
    symbol: Option<String>,
    currency: Option<String>,
    exchange_timezone_name: Option<String>,
    instrument_type: Option<String>,
    regular_market_price: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<QuoteData>,
}

// Cells stay untyped: one garbage cell must not reject the whole document.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct QuoteData {
    open: Vec<serde_json::Value>,
    high: Vec<serde_json::Value>,
    low: Vec<serde_json::Value>,
    close: Vec<serde_json::Value>,
    volume: Vec<serde_json::Value>,
}

/// Connection settings for the chart API.
#[derive(Debug, Clone)]
pub struct YahooSettings {
    pub chart_url: String,
    pub lookback_days: u32,
    pub request_timeout: Duration,
    pub user_agent: String,
}

impl Default for YahooSettings {
    fn default() -> Self {
        Self {
            chart_url: DEFAULT_CHART_URL.to_string(),
            lookback_days: 365,
            request_timeout: Duration::from_secs(30),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36".to_string(),
        }
    }
}

pub struct YahooChartSource {
    client: reqwest::blocking::Client,
    settings: YahooSettings,
}

impl YahooChartSource {
    pub fn new(settings: YahooSettings) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(settings.request_timeout)
            .user_agent(&settings.user_agent)
            .build()
            .map_err(|e| PipelineError::Fetch(format!("build HTTP client: {e}")))?;
        Ok(Self { client, settings })
    }

    /// Build the chart API URL for a LogicalRun.
    pub fn chart_url(&self, run: &LogicalRun) -> String {
        let (start_ts, end_ts) = window(run.run_date, self.settings.lookback_days);
        format!(
            "{}/{}?period1={start_ts}&period2={end_ts}&interval=1d&events=history",
            self.settings.chart_url.trim_end_matches('/'),
            run.symbol,
        )
    }
}

/// Unix-second bounds: midnight `lookback_days - 1` days before `run_date`
/// through the last second of `run_date`.
fn window(run_date: NaiveDate, lookback_days: u32) -> (i64, i64) {
    let first = run_date
        .checked_sub_days(Days::new(u64::from(lookback_days.saturating_sub(1))))
        .unwrap_or(NaiveDate::MIN);
    let start = first.and_time(NaiveTime::MIN).and_utc().timestamp();
    let end = run_date
        .checked_add_days(Days::new(1))
        .map(|d| d.and_time(NaiveTime::MIN).and_utc().timestamp() - 1)
        .unwrap_or(i64::MAX);
    (start, end)
}

/// Parse a chart API body into a RawPayload.
pub fn parse_chart(symbol: &str, body: &str) -> Result<RawPayload> {
    let resp: ChartResponse = serde_json::from_str(body).map_err(|e| {
        PipelineError::Schema(format!("failed to parse chart response for {symbol}: {e}"))
    })?;

    let result = resp.chart.result.ok_or_else(|| match resp.chart.error {
        Some(err) => PipelineError::Schema(format!("{}: {}", err.code, err.description)),
        None => PipelineError::Schema("empty result with no error".into()),
    })?;

    let data = result
        .into_iter()
        .next()
        .ok_or_else(|| PipelineError::Schema("result array is empty".into()))?;

    // No timestamps means no sessions in the window, not a broken document.
    let timestamps = data.timestamp.unwrap_or_default();
    let quote = match data.indicators.quote.into_iter().next() {
        Some(q) => q,
        None if timestamps.is_empty() => QuoteData::default(),
        None => return Err(PipelineError::Schema("no quote data".into())),
    };

    let cell = |col: &[serde_json::Value], i: usize| {
        col.get(i)
            .and_then(serde_json::Value::as_f64)
            .filter(|v| v.is_finite())
    };

    let samples = timestamps
        .iter()
        .enumerate()
        .map(|(i, ts)| RawSample {
            timestamp: integral_i64(ts),
            open: cell(&quote.open, i),
            high: cell(&quote.high, i),
            low: cell(&quote.low, i),
            close: cell(&quote.close, i),
            volume: cell(&quote.volume, i),
        })
        .collect();

    let meta = PayloadMeta {
        symbol: data.meta.symbol.unwrap_or_else(|| symbol.to_string()),
        currency: data.meta.currency,
        exchange_timezone: data.meta.exchange_timezone_name,
        instrument_type: data.meta.instrument_type,
        regular_market_price: data
            .meta
            .regular_market_price
            .as_ref()
            .and_then(serde_json::Value::as_f64),
    };

    Ok(RawPayload { meta, samples })
}

impl PriceSource for YahooChartSource {
    fn name(&self) -> &str {
        "yahoo_chart"
    }

    fn fetch(&self, run: &LogicalRun) -> Result<RawPayload> {
        let url = self.chart_url(run);
        debug!(run = %run, %url, "fetching chart");

        let resp = self
            .client
            .get(&url)
            .send()
            .map_err(|e| PipelineError::Fetch(format!("request for {}: {e}", run.symbol)))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(PipelineError::Fetch(format!("HTTP {status} for {}", run.symbol)));
        }

        let body = resp
            .text()
            .map_err(|e| PipelineError::Fetch(format!("read body for {}: {e}", run.symbol)))?;
        let payload = parse_chart(&run.symbol, &body)?;

        info!(run = %run, samples = payload.samples.len(), "chart fetched");
        Ok(payload)
    }
}
