//! Pipeline error taxonomy.
//!
//! Every stage reports failures through [`PipelineError`]. The orchestrator
//! decides whether to retry a node purely from [`PipelineError::is_retryable`];
//! stages never retry internally.

use std::time::Duration;
use thiserror::Error;

/// Errors raised by pipeline stages.
///
/// Displayable in both log lines and `stockflow status` output.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("data source unavailable after {pokes} pokes over {waited:?}")]
    AvailabilityTimeout { pokes: u32, waited: Duration },

    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("unexpected response shape: {0}")]
    Schema(String),

    #[error("object storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("object not found: {key}")]
    NotFound { key: String },

    #[error("missing artifact: {0}")]
    MissingArtifact(String),

    #[error("transform failed: {0}")]
    Transform(String),

    #[error("warehouse load failed: {0}")]
    Load(String),

    #[error("invalid object key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("invalid symbol '{0}'")]
    InvalidSymbol(String),
}

impl PipelineError {
    /// Whether the orchestrator may retry the node that raised this error.
    ///
    /// Ordering violations (`NotFound`, `MissingArtifact`) and data-quality
    /// failures (`Transform`) never heal by themselves, and the availability
    /// gate has already spent its whole deadline by the time it fails.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Fetch(_) | Self::Schema(_) | Self::StorageUnavailable(_) | Self::Load(_) => true,
            Self::AvailabilityTimeout { .. }
            | Self::NotFound { .. }
            | Self::MissingArtifact(_)
            | Self::Transform(_)
            | Self::InvalidKey { .. }
            | Self::InvalidSymbol(_) => false,
        }
    }

    /// Short machine-friendly name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AvailabilityTimeout { .. } => "availability_timeout",
            Self::Fetch(_) => "fetch_error",
            Self::Schema(_) => "schema_error",
            Self::StorageUnavailable(_) => "storage_unavailable",
            Self::NotFound { .. } => "not_found",
            Self::MissingArtifact(_) => "missing_artifact",
            Self::Transform(_) => "transform_error",
            Self::Load(_) => "load_error",
            Self::InvalidKey { .. } => "invalid_key",
            Self::InvalidSymbol(_) => "invalid_symbol",
        }
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Load(e.to_string())
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
