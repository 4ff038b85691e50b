//! Price source trait.
//!
//! Abstracts over the remote API so the orchestrator can be exercised with
//! scripted sources in tests.

use crate::domain::{LogicalRun, RawPayload};
use crate::error::Result;

/// Fetches the price series for one LogicalRun.
///
/// Implementations call the remote API exactly once per `fetch`. Retrying is
/// the orchestrator's job, so retry counts and backoff stay configurable in
/// one place.
pub trait PriceSource: Send + Sync {
    /// Human-readable name of this source.
    fn name(&self) -> &str;

    /// Fetch the window the API associates with `run.run_date`.
    ///
    /// Errors: `Fetch` on transport failure or non-success status,
    /// `Schema` when the body is not an OHLCV document.
    fn fetch(&self, run: &LogicalRun) -> Result<RawPayload>;
}
