//! A StatsD-compatible metrics collector.
//!
//! The collector listens for StatsD datagrams over UDP, aggregates them in memory, and periodically forwards the
//! aggregated values to one or more backends: a Graphite server, over the plaintext protocol, and/or an HTTP
//! ingestion API.
//!
//! # Usage
//!
//! ```no_run
//! # use std::time::Duration;
//! # use statsd_collector::StatsdBuilder;
//! // First, create a builder.
//! //
//! // The builder can configure the listen address, the flush intervals, the percentiles reported for timers and
//! // histograms, the backends data points are forwarded to, and more.
//! let builder = StatsdBuilder::default()
//!     .with_downstream_address("graphite.internal:2003")
//!     .with_aggregator_flush_interval(Duration::from_secs(10));
//!
//! // Building the collector creates every component, but starts nothing.
//! let mut statsd = builder.build().expect("failed to build collector");
//!
//! // Starting the collector spawns the backend manager, the aggregator and the UDP receiver, in that order.
//! statsd.start_all().expect("failed to start collector");
//!
//! // ...
//!
//! // Stopping the collector shuts everything down in reverse order, sending any data points still buffered.
//! statsd.stop_all();
//! ```
//!
//! # Pipeline
//!
//! ```text
//! UDP socket ─▶ UdpReceiver ─▶ (packets) ─▶ AggregatorTask ─▶ (data points) ─▶ BackendTask ─▶ sinks
//! ```
//!
//! Each stage runs on its own thread, connected to the next by a bounded channel:
//!
//! - the receiver never blocks: when the packet queue is full, datagrams are dropped and counted
//! - the aggregator parses packets into the [`Registry`], and every flush interval turns the registry into
//!   [`MetricDataPoint`]s
//! - the backend manager buffers data points in a [`BoundedBuffer`], and every flush interval (or as soon as enough
//!   data points are buffered) sends one batch to every sink concurrently
//!
//! # Supported metric types
//!
//! | Wire type | Metric                         | Reported as                                                     |
//! |-----------|--------------------------------|-----------------------------------------------------------------|
//! | `c`       | [`Counter`](metric::Counter)   | `<name>.count`, `<name>.rate`                                   |
//! | `g`       | [`Gauge`](metric::Gauge)       | `<name>.value`                                                  |
//! | `g`       | [`GaugeFloat`](metric::GaugeFloat), when the value has a fractional part | `<name>.value` |
//! | `ms`, `h` | [`Timer`](metric::Timer)       | count, min, max, mean, stddev, percentiles and rates            |
//!
//! Sample rates and tags are accepted on the wire, but ignored.
//!
//! # Self-monitoring
//!
//! The collector tracks its own activity in the same registry, under a configurable prefix (`statsd` by default):
//! packets received, parse errors, and metrics received with a type that does not match the registered one. These are
//! flushed alongside every other metric.
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

pub mod aggregator;
pub use self::aggregator::{Aggregator, AggregatorTask, RateMode};

pub mod backend;
pub use self::backend::{BackendManager, BackendTask, FlushReport};

pub mod buffer;
pub use self::buffer::BoundedBuffer;

mod builder;
pub use self::builder::{BuildError, Statsd, StatsdBuilder};

pub mod config;
pub use self::config::{Config, ConfigError};

pub mod datapoint;
pub use self::datapoint::{MetricDataPoint, Value};

pub mod metric;
pub use self::metric::{Metric, MetricKind};

pub mod protocol;

pub mod receiver;
pub use self::receiver::UdpReceiver;

pub mod registry;
pub use self::registry::{Registry, RegistryError};

pub mod sinks;
pub use self::sinks::{Sink, SinkError};

mod stats;
pub use self::stats::{ErrorTally, SelfStats};

mod worker;
