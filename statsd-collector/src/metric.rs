//! Per-kind aggregation state held by the registry.
use std::{
    fmt,
    sync::{
        atomic::{
            AtomicI64, AtomicU64,
            Ordering::{AcqRel, Acquire, Release},
        },
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use quanta::Clock;
use statsd_util::{Meter, MeterSnapshot, Reservoir, Snapshot};

/// The kind of a registered metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    /// A running sum, reset on every flush.
    Counter,

    /// The last integer value written.
    Gauge,

    /// The last floating-point value written.
    GaugeFloat,

    /// A sampled distribution of integer values.
    Histogram,

    /// A sampled distribution of durations, plus event rates.
    Timer,
}

impl MetricKind {
    /// Gets the lowercase name of this kind.
    pub const fn as_str(self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::GaugeFloat => "gauge_float",
            MetricKind::Histogram => "histogram",
            MetricKind::Timer => "timer",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A counter.
///
/// Increments accumulate until the next flush, which reads and zeroes the accumulator in a single atomic swap.
#[derive(Debug, Default)]
pub struct Counter {
    current: AtomicI64,
    last_absolute: Mutex<Option<i64>>,
}

impl Counter {
    /// Creates a new `Counter`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `delta` to the counter.
    pub fn inc(&self, delta: i64) {
        // Atomic adds wrap on overflow.
        self.current.fetch_add(delta, AcqRel);
    }

    /// Adds the difference between `total` and the last absolute total seen by this counter.
    ///
    /// The first absolute total only records a baseline, so the counter does not jump by the full value of a
    /// long-running external total the first time it is observed.
    pub fn absolute(&self, total: i64) {
        let mut last = self.last_absolute.lock();
        if let Some(previous) = *last {
            self.inc(total.wrapping_sub(previous));
        }
        *last = Some(total);
    }

    /// Gets the current accumulated value without resetting it.
    pub fn value(&self) -> i64 {
        self.current.load(Acquire)
    }

    /// Gets the accumulated value and resets it to zero.
    pub fn flush(&self) -> i64 {
        self.current.swap(0, AcqRel)
    }
}

/// An integer gauge.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    /// Creates a new `Gauge`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the gauge to `value`.
    pub fn update(&self, value: i64) {
        self.value.store(value, Release);
    }

    /// Increases the gauge by `delta`.
    pub fn inc(&self, delta: i64) {
        self.value.fetch_add(delta, AcqRel);
    }

    /// Decreases the gauge by `delta`.
    pub fn dec(&self, delta: i64) {
        self.value.fetch_sub(delta, AcqRel);
    }

    /// Gets the current value.
    pub fn value(&self) -> i64 {
        self.value.load(Acquire)
    }
}

/// A floating-point gauge.
#[derive(Debug)]
pub struct GaugeFloat {
    bits: AtomicU64,
}

impl GaugeFloat {
    /// Creates a new `GaugeFloat`.
    pub fn new() -> Self {
        Self { bits: AtomicU64::new(0.0f64.to_bits()) }
    }

    /// Sets the gauge to `value`.
    pub fn update(&self, value: f64) {
        self.bits.store(value.to_bits(), Release);
    }

    /// Gets the current value.
    pub fn value(&self) -> f64 {
        f64::from_bits(self.bits.load(Acquire))
    }
}

impl Default for GaugeFloat {
    fn default() -> Self {
        Self::new()
    }
}

/// A histogram of integer values, backed by a uniform sampling reservoir.
#[derive(Debug)]
pub struct Histogram {
    reservoir: Mutex<Reservoir>,
}

impl Histogram {
    /// Creates a new `Histogram` holding at most `reservoir_size` samples.
    pub fn new(reservoir_size: usize) -> Self {
        Self { reservoir: Mutex::new(Reservoir::new(reservoir_size)) }
    }

    /// Records `value`.
    pub fn update(&self, value: i64) {
        self.reservoir.lock().update(value);
    }

    /// Gets the number of values recorded so far.
    pub fn count(&self) -> u64 {
        self.reservoir.lock().count()
    }

    /// Takes a snapshot of the sampled values.
    pub fn snapshot(&self) -> Snapshot {
        self.reservoir.lock().snapshot()
    }
}

#[derive(Debug)]
struct TimerState {
    reservoir: Reservoir,
    meter: Meter,
}

/// Point-in-time view of a [`Timer`].
#[derive(Debug, Clone, PartialEq)]
pub struct TimerSnapshot {
    /// Distribution of recorded durations, in nanoseconds.
    pub durations: Snapshot,

    /// Rate at which durations were recorded.
    pub rates: MeterSnapshot,
}

/// A timer.
///
/// Durations are sampled as nanoseconds into a reservoir, and every recording also marks a meter so the timer can
/// report how often it is being updated.
#[derive(Debug)]
pub struct Timer {
    state: Mutex<TimerState>,
}

impl Timer {
    /// Creates a new `Timer` holding at most `reservoir_size` samples.
    pub fn new(reservoir_size: usize) -> Self {
        Self::with_clock(reservoir_size, Clock::new())
    }

    /// Creates a new `Timer` whose rates are driven by `clock`.
    pub fn with_clock(reservoir_size: usize, clock: Clock) -> Self {
        let state = TimerState { reservoir: Reservoir::new(reservoir_size), meter: Meter::with_clock(clock) };
        Self { state: Mutex::new(state) }
    }

    /// Records `duration`.
    pub fn update(&self, duration: Duration) {
        let nanos = i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX);
        let mut state = self.state.lock();
        state.reservoir.update(nanos);
        state.meter.mark(1);
    }

    /// Gets the number of durations recorded so far.
    pub fn count(&self) -> u64 {
        self.state.lock().reservoir.count()
    }

    /// Takes a snapshot of the recorded durations and rates.
    pub fn snapshot(&self) -> TimerSnapshot {
        let mut state = self.state.lock();
        let durations = state.reservoir.snapshot();
        let rates = state.meter.snapshot();
        TimerSnapshot { durations, rates }
    }
}

/// A registered metric.
///
/// Cloning is cheap: every variant is a shared handle to the same aggregation state.
#[derive(Debug, Clone)]
pub enum Metric {
    /// A counter.
    Counter(Arc<Counter>),

    /// An integer gauge.
    Gauge(Arc<Gauge>),

    /// A floating-point gauge.
    GaugeFloat(Arc<GaugeFloat>),

    /// A histogram.
    Histogram(Arc<Histogram>),

    /// A timer.
    Timer(Arc<Timer>),
}

impl Metric {
    /// Gets the kind of this metric.
    pub fn kind(&self) -> MetricKind {
        match self {
            Metric::Counter(_) => MetricKind::Counter,
            Metric::Gauge(_) => MetricKind::Gauge,
            Metric::GaugeFloat(_) => MetricKind::GaugeFloat,
            Metric::Histogram(_) => MetricKind::Histogram,
            Metric::Timer(_) => MetricKind::Timer,
        }
    }
}
