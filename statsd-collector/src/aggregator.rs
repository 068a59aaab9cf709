//! Applying updates to the registry, and periodically turning the registry into data points.
use std::{
    io,
    sync::Arc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use crossbeam_channel::{select, tick, Receiver, Sender};
use serde::Deserialize;
use statsd_util::{parse_quantiles, Quantile, Snapshot};
use tracing::{debug, trace, warn};

use crate::{
    datapoint::{MetricDataPoint, Value},
    metric::{Counter, Metric, MetricKind, Timer},
    protocol::{parse_packet, MetricUpdate, MetricValue, ParseError},
    registry::{Registry, RegistryError, Storage},
    stats::SelfStats,
    worker::Worker,
};

const NANOS_PER_MILLI: f64 = 1_000_000.0;

/// Percentiles reported for histograms and timers unless configured otherwise.
pub const DEFAULT_PERCENTILES: &[f64] = &[0.5, 0.75, 0.95, 0.99, 0.999];

/// How counter rates are computed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateMode {
    /// The rate is the count divided by the flush interval in whole seconds, using integer division.
    #[default]
    Truncated,

    /// The rate is the count divided by the exact flush interval, as a float.
    Fractional,
}

/// Aggregator configuration.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// How often the registry is flushed into data points.
    pub flush_interval: Duration,

    /// Percentiles reported for histograms and timers.
    pub percentiles: Vec<Quantile>,

    /// How counter rates are computed.
    pub rate_mode: RateMode,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(10),
            percentiles: parse_quantiles(DEFAULT_PERCENTILES),
            rate_mode: RateMode::Truncated,
        }
    }
}

/// Outcome of handling a single packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketSummary {
    /// Number of updates applied to the registry.
    pub applied: usize,

    /// Number of sections rejected because they were malformed or of an unsupported type.
    pub malformed: usize,

    /// Number of updates rejected because the metric was registered with another kind.
    pub mismatched: usize,
}

/// Applies metric updates to a [`Registry`] and turns it into data points.
///
/// The aggregator itself holds no mutable state beyond the registry, so it can be shared freely. In a running
/// pipeline, a single [`AggregatorTask`] is the only caller of both [`handle_packet`](Aggregator::handle_packet) and
/// [`flush`](Aggregator::flush), which serializes updates with flushes.
#[derive(Debug)]
pub struct Aggregator {
    registry: Arc<Registry>,
    stats: SelfStats,
    flush_interval: Duration,
    percentiles: Vec<Quantile>,
    rate_mode: RateMode,
}

impl Aggregator {
    /// Creates a new `Aggregator`.
    pub fn new(config: AggregatorConfig, registry: Arc<Registry>, stats: SelfStats) -> Self {
        Self {
            registry,
            stats,
            flush_interval: config.flush_interval,
            percentiles: config.percentiles,
            rate_mode: config.rate_mode,
        }
    }

    /// Gets the registry this aggregator writes into.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Gets the self stats recorder.
    pub fn stats(&self) -> &SelfStats {
        &self.stats
    }

    /// Gets the flush interval.
    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    /// Parses a packet and applies every valid update in it.
    ///
    /// Invalid UTF-8 is replaced rather than rejected, so a bad byte only affects the line it appears in. Malformed
    /// sections and kind mismatches are logged and counted, and never stop the rest of the packet from being applied.
    pub fn handle_packet(&self, packet: &[u8]) -> PacketSummary {
        let text = String::from_utf8_lossy(packet);
        self.stats.counter_inc("packets_received", 1);

        let mut summary = PacketSummary::default();
        for result in parse_packet(&text) {
            match result {
                Ok(update) => match self.apply(&update) {
                    Ok(()) => {
                        trace!(key = update.key, value = ?update.value, "Applied update.");
                        summary.applied += 1;
                    }
                    Err(e) => {
                        warn!(error = %e, "Dropping update for metric of another kind.");
                        self.stats.on_error("kind_mismatches", &e);
                        summary.mismatched += 1;
                    }
                },
                Err(e @ ParseError::UnsupportedType { .. }) => {
                    debug!(error = %e, "Ignoring update of unsupported type.");
                    self.stats.on_error("parse_errors", &e);
                    summary.malformed += 1;
                }
                Err(e) => {
                    warn!(error = %e, "Dropping malformed update.");
                    self.stats.on_error("parse_errors", &e);
                    summary.malformed += 1;
                }
            }
        }

        summary
    }

    /// Applies a single update.
    ///
    /// An integer gauge update to a metric already registered as a floating-point gauge is widened. Every other update
    /// must match the kind the metric was first registered with.
    ///
    /// # Errors
    ///
    /// If the metric is registered with a kind the update cannot be applied to, an error is returned and the registry
    /// is left untouched.
    pub fn apply(&self, update: &MetricUpdate<'_>) -> Result<(), RegistryError> {
        match update.value {
            MetricValue::Counter(delta) => self.registry.counter(update.key)?.inc(delta),
            MetricValue::Gauge(value) => match self.registry.get_or_register(update.key, Storage::gauge) {
                Metric::Gauge(gauge) => gauge.update(value),
                Metric::GaugeFloat(gauge) => gauge.update(value as f64),
                other => {
                    return Err(RegistryError::KindMismatch {
                        name: update.key.to_owned(),
                        registered: other.kind(),
                        requested: MetricKind::Gauge,
                    })
                }
            },
            MetricValue::GaugeFloat(value) => self.registry.gauge_float(update.key)?.update(value),
            MetricValue::Timer(duration) => self.registry.timer(update.key)?.update(duration),
        }

        Ok(())
    }

    /// Flushes the registry into data points stamped with the current time.
    pub fn flush_now(&self) -> Vec<MetricDataPoint> {
        self.flush(unix_timestamp())
    }

    /// Flushes the registry into data points stamped with `timestamp`.
    ///
    /// Counters are reset by the flush. Gauges, histograms and timers keep their state.
    pub fn flush(&self, timestamp: u64) -> Vec<MetricDataPoint> {
        let mut points = Vec::new();

        self.registry.visit(|name, metric| match metric {
            Metric::Counter(counter) => self.flush_counter(name, counter, timestamp, &mut points),
            Metric::Gauge(gauge) => {
                points.push(MetricDataPoint::new(format!("{}.value", name), gauge.value(), timestamp));
            }
            Metric::GaugeFloat(gauge) => {
                points.push(MetricDataPoint::new(format!("{}.value", name), gauge.value(), timestamp));
            }
            Metric::Histogram(histogram) => {
                self.flush_distribution(name, &histogram.snapshot(), None, timestamp, &mut points);
            }
            Metric::Timer(timer) => self.flush_timer(name, timer, timestamp, &mut points),
        });

        points
    }

    fn flush_counter(&self, name: &str, counter: &Counter, timestamp: u64, points: &mut Vec<MetricDataPoint>) {
        let count = counter.flush();
        let rate = match self.rate_mode {
            RateMode::Truncated => {
                let secs = i64::try_from(self.flush_interval.as_secs()).unwrap_or(i64::MAX).max(1);
                Value::Integer(count / secs)
            }
            RateMode::Fractional => {
                let secs = self.flush_interval.as_secs_f64();
                Value::Float(if secs > 0.0 { count as f64 / secs } else { 0.0 })
            }
        };

        points.push(MetricDataPoint::new(format!("{}.count", name), count, timestamp));
        points.push(MetricDataPoint::new(format!("{}.rate", name), rate, timestamp));
    }

    fn flush_timer(&self, name: &str, timer: &Timer, timestamp: u64, points: &mut Vec<MetricDataPoint>) {
        let snapshot = timer.snapshot();
        self.flush_distribution(name, &snapshot.durations, Some(NANOS_PER_MILLI), timestamp, points);

        let rates = snapshot.rates;
        points.push(MetricDataPoint::new(format!("{}.1-minute", name), rates.rate1, timestamp));
        points.push(MetricDataPoint::new(format!("{}.5-minute", name), rates.rate5, timestamp));
        points.push(MetricDataPoint::new(format!("{}.15-minute", name), rates.rate15, timestamp));
        points.push(MetricDataPoint::new(format!("{}.mean-rate", name), rates.rate_mean, timestamp));
    }

    // With a divisor, every statistic is scaled down and reported as a float.
    fn flush_distribution(
        &self,
        name: &str,
        snapshot: &Snapshot,
        divisor: Option<f64>,
        timestamp: u64,
        points: &mut Vec<MetricDataPoint>,
    ) {
        let extreme = |v: i64| match divisor {
            Some(d) => Value::Float(v as f64 / d),
            None => Value::Integer(v),
        };
        let scaled = |v: f64| Value::Float(divisor.map_or(v, |d| v / d));

        let count = i64::try_from(snapshot.count()).unwrap_or(i64::MAX);
        points.push(MetricDataPoint::new(format!("{}.count", name), count, timestamp));
        points.push(MetricDataPoint::new(format!("{}.min", name), extreme(snapshot.min()), timestamp));
        points.push(MetricDataPoint::new(format!("{}.max", name), extreme(snapshot.max()), timestamp));
        points.push(MetricDataPoint::new(format!("{}.mean", name), scaled(snapshot.mean()), timestamp));
        points.push(MetricDataPoint::new(format!("{}.std-dev", name), scaled(snapshot.std_dev()), timestamp));

        for percentile in &self.percentiles {
            let value = scaled(snapshot.quantile(percentile.value()));
            points.push(MetricDataPoint::new(format!("{}-percentile{}", name, percentile.label()), value, timestamp));
        }
    }
}

/// Runs an [`Aggregator`] on a dedicated thread.
///
/// The thread applies every packet received on the packet channel, and on every flush interval sends the resulting
/// data points, in order, over the data point channel. Sending blocks when the data point channel is full, which in
/// turn holds up packet handling until the backend catches up.
pub struct AggregatorTask {
    aggregator: Arc<Aggregator>,
    packets: Receiver<Bytes>,
    points: Sender<MetricDataPoint>,
    worker: Worker<()>,
}

impl AggregatorTask {
    /// Creates a new `AggregatorTask`.
    pub fn new(aggregator: Arc<Aggregator>, packets: Receiver<Bytes>, points: Sender<MetricDataPoint>) -> Self {
        Self { aggregator, packets, points, worker: Worker::new("statsd-aggregator") }
    }

    /// Gets the aggregator driven by this task.
    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    /// Returns `true` if the task thread is running.
    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    /// Starts the task thread.
    ///
    /// Does nothing if the task is already running.
    ///
    /// # Errors
    ///
    /// If the thread cannot be spawned, an error is returned.
    pub fn start(&mut self) -> io::Result<()> {
        let aggregator = Arc::clone(&self.aggregator);
        let packets = self.packets.clone();
        let points = self.points.clone();
        self.worker.start(move |shutdown| run(&aggregator, &shutdown, &packets, &points))
    }

    /// Stops the task thread and waits for it to exit.
    ///
    /// Once this returns, the aggregator no longer applies packets or emits data points.
    pub fn stop(&mut self) {
        self.worker.stop();
    }
}

fn run(aggregator: &Aggregator, shutdown: &Receiver<()>, packets: &Receiver<Bytes>, points: &Sender<MetricDataPoint>) {
    let ticker = tick(aggregator.flush_interval());

    loop {
        select! {
            recv(shutdown) -> _ => break,
            recv(ticker) -> _ => emit(aggregator, points),
            recv(packets) -> msg => match msg {
                Ok(packet) => {
                    aggregator.handle_packet(&packet);
                }
                Err(_) => {
                    debug!("Packet channel disconnected.");
                    break;
                }
            },
        }
    }
}

fn emit(aggregator: &Aggregator, points_tx: &Sender<MetricDataPoint>) {
    let start = Instant::now();
    let points = aggregator.flush_now();
    let total = points.len();

    let mut sent = 0;
    for point in points {
        trace!(name = point.name(), value = %point.value(), "Emitting data point.");
        if points_tx.send(point).is_err() {
            warn!(dropped = total - sent, "Data point channel disconnected, dropping remaining points.");
            break;
        }
        sent += 1;
    }

    debug!(points = sent, elapsed = ?start.elapsed(), "Flushed aggregated metrics.");
}

pub(crate) fn unix_timestamp() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}
