//! StockFlow Core — the stages of the daily price pipeline.
//!
//! Each stage is a plain synchronous function over explicit inputs; the
//! runner crate owns ordering, retries and scheduling.
//! - Availability gate and price source (`source`)
//! - Object storage with a deterministic `(symbol, run_date)` key scheme (`storage`)
//! - Raw → formatted transform (`transform`)
//! - Formatted-path resolution (`resolver`)
//! - Idempotent warehouse load (`warehouse`)

pub mod domain;
pub mod error;
pub mod resolver;
pub mod source;
pub mod storage;
pub mod transform;
pub mod warehouse;

pub use error::{PipelineError, Result};
