//! Domain types shared by every pipeline stage.

pub mod payload;
pub mod record;
pub mod run;

pub use payload::{PayloadMeta, RawPayload, RawSample};
pub use record::{FormattedRecord, RowCount};
pub use run::LogicalRun;
