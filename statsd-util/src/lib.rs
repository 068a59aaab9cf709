//! Helper types used by `statsd-collector` to summarize distributions and event rates.
//!
//! None of these types are synchronized: callers are expected to wrap them in whatever lock suits their access
//! pattern.
#![deny(missing_docs)]

mod meter;
pub use meter::{Ewma, Meter, MeterSnapshot, TICK_INTERVAL};

mod quantile;
pub use quantile::{parse_quantiles, Quantile};

mod reservoir;
pub use reservoir::{Reservoir, DEFAULT_RESERVOIR_SIZE};

mod snapshot;
pub use snapshot::Snapshot;
