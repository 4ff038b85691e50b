//! Remote data source: availability gate and price fetching.

pub mod gate;
pub mod provider;
pub mod yahoo;

pub use gate::{
    wait_until_available, Availability, AvailabilityGate, GateSettings, HealthProbe,
    HttpHealthProbe, ProbeOutcome,
};
pub use provider::PriceSource;
pub use yahoo::{parse_chart, YahooChartSource, YahooSettings, DEFAULT_CHART_URL};
