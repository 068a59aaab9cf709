//! Concurrent storage of every metric seen by the collector.
use std::{
    collections::hash_map::RandomState,
    hash::BuildHasher,
    iter::repeat,
    sync::{Arc, PoisonError, RwLock},
};

use hashbrown::HashMap;
use quanta::Clock;
use statsd_util::DEFAULT_RESERVOIR_SIZE;
use thiserror::Error;

use crate::metric::{Counter, Gauge, GaugeFloat, Histogram, Metric, MetricKind, Timer};

type RegistryHashMap = HashMap<String, Metric, RandomState>;

/// Errors that could occur while looking up a metric.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The metric is already registered with a different kind.
    #[error("metric '{name}' is registered as a {registered}, not a {requested}")]
    KindMismatch {
        /// Metric name.
        name: String,
        /// Kind the metric was first registered with.
        registered: MetricKind,
        /// Kind that was requested.
        requested: MetricKind,
    },
}

/// Creates the aggregation state for newly-registered metrics.
#[derive(Debug, Clone)]
pub struct Storage {
    reservoir_size: usize,
    clock: Clock,
}

impl Storage {
    /// Creates a new `Storage` whose histograms and timers hold at most `reservoir_size` samples.
    pub fn new(reservoir_size: usize) -> Self {
        Self::with_clock(reservoir_size, Clock::new())
    }

    /// Creates a new `Storage` whose timers are driven by `clock`.
    pub fn with_clock(reservoir_size: usize, clock: Clock) -> Self {
        Self { reservoir_size: reservoir_size.max(1), clock }
    }

    /// Creates a counter.
    pub fn counter(&self) -> Metric {
        Metric::Counter(Arc::new(Counter::new()))
    }

    /// Creates an integer gauge.
    pub fn gauge(&self) -> Metric {
        Metric::Gauge(Arc::new(Gauge::new()))
    }

    /// Creates a floating-point gauge.
    pub fn gauge_float(&self) -> Metric {
        Metric::GaugeFloat(Arc::new(GaugeFloat::new()))
    }

    /// Creates a histogram.
    pub fn histogram(&self) -> Metric {
        Metric::Histogram(Arc::new(Histogram::new(self.reservoir_size)))
    }

    /// Creates a timer.
    pub fn timer(&self) -> Metric {
        Metric::Timer(Arc::new(Timer::with_clock(self.reservoir_size, self.clock.clone())))
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self::new(DEFAULT_RESERVOIR_SIZE)
    }
}

/// A concurrent map of metric names to their aggregation state.
///
/// Metrics are spread over a power-of-two number of shards, each behind its own lock, so looking up a metric only
/// contends with lookups that hash to the same shard. Metrics are never removed: once a name is registered with a
/// given kind, it keeps that kind for the life of the registry.
///
/// ## Performance
///
/// `Registry` is optimized for reads. Registering a new metric takes a write lock on a single shard.
#[derive(Debug)]
pub struct Registry {
    shards: Vec<RwLock<RegistryHashMap>>,
    shard_mask: usize,
    hasher: RandomState,
    storage: Storage,
}

impl Registry {
    /// Creates a new `Registry`.
    pub fn new(storage: Storage) -> Self {
        let parallelism = std::thread::available_parallelism().map_or(1, |n| n.get());
        let shard_count = parallelism.next_power_of_two();
        let shard_mask = shard_count - 1;
        let shards = repeat(()).take(shard_count).map(|_| RwLock::new(RegistryHashMap::default())).collect();

        Self { shards, shard_mask, hasher: RandomState::new(), storage }
    }

    fn shard_for(&self, name: &str) -> &RwLock<RegistryHashMap> {
        let hash = self.hasher.hash_one(name);
        // Truncation is fine, only the low bits select the shard.
        &self.shards[hash as usize & self.shard_mask]
    }

    /// Gets the metric registered under `name`, if any.
    pub fn get(&self, name: &str) -> Option<Metric> {
        let shard = self.shard_for(name);
        let read = shard.read().unwrap_or_else(PoisonError::into_inner);
        read.get(name).cloned()
    }

    /// Gets the metric registered under `name`, registering the one built by `init` if none exists.
    ///
    /// When several callers race to register the same name, exactly one `init` result is kept and every caller gets
    /// that metric back.
    pub fn get_or_register<F>(&self, name: &str, init: F) -> Metric
    where
        F: FnOnce(&Storage) -> Metric,
    {
        let shard = self.shard_for(name);

        {
            let read = shard.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(metric) = read.get(name) {
                return metric.clone();
            }
        }

        let mut write = shard.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(metric) = write.get(name) {
            return metric.clone();
        }

        let metric = init(&self.storage);
        write.insert(name.to_owned(), metric.clone());
        metric
    }

    /// Gets or registers the counter `name`.
    ///
    /// # Errors
    ///
    /// If `name` is registered with another kind, an error is returned.
    pub fn counter(&self, name: &str) -> Result<Arc<Counter>, RegistryError> {
        match self.get_or_register(name, Storage::counter) {
            Metric::Counter(counter) => Ok(counter),
            other => Err(mismatch(name, &other, MetricKind::Counter)),
        }
    }

    /// Gets or registers the integer gauge `name`.
    ///
    /// # Errors
    ///
    /// If `name` is registered with another kind, an error is returned.
    pub fn gauge(&self, name: &str) -> Result<Arc<Gauge>, RegistryError> {
        match self.get_or_register(name, Storage::gauge) {
            Metric::Gauge(gauge) => Ok(gauge),
            other => Err(mismatch(name, &other, MetricKind::Gauge)),
        }
    }

    /// Gets or registers the floating-point gauge `name`.
    ///
    /// # Errors
    ///
    /// If `name` is registered with another kind, an error is returned.
    pub fn gauge_float(&self, name: &str) -> Result<Arc<GaugeFloat>, RegistryError> {
        match self.get_or_register(name, Storage::gauge_float) {
            Metric::GaugeFloat(gauge) => Ok(gauge),
            other => Err(mismatch(name, &other, MetricKind::GaugeFloat)),
        }
    }

    /// Gets or registers the histogram `name`.
    ///
    /// # Errors
    ///
    /// If `name` is registered with another kind, an error is returned.
    pub fn histogram(&self, name: &str) -> Result<Arc<Histogram>, RegistryError> {
        match self.get_or_register(name, Storage::histogram) {
            Metric::Histogram(histogram) => Ok(histogram),
            other => Err(mismatch(name, &other, MetricKind::Histogram)),
        }
    }

    /// Gets or registers the timer `name`.
    ///
    /// # Errors
    ///
    /// If `name` is registered with another kind, an error is returned.
    pub fn timer(&self, name: &str) -> Result<Arc<Timer>, RegistryError> {
        match self.get_or_register(name, Storage::timer) {
            Metric::Timer(timer) => Ok(timer),
            other => Err(mismatch(name, &other, MetricKind::Timer)),
        }
    }

    /// Visits every metric stored in this registry.
    ///
    /// This operation does not lock the entire registry, but proceeds shard by shard. A metric registered while the
    /// visit is in progress may or may not be observed.
    pub fn visit<F>(&self, mut collect: F)
    where
        F: FnMut(&str, &Metric),
    {
        for shard in &self.shards {
            let read = shard.read().unwrap_or_else(PoisonError::into_inner);
            for (name, metric) in read.iter() {
                collect(name, metric);
            }
        }
    }

    /// Gets the number of registered metrics.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().unwrap_or_else(PoisonError::into_inner).len()).sum()
    }

    /// Returns `true` if no metric has been registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(Storage::default())
    }
}

fn mismatch(name: &str, registered: &Metric, requested: MetricKind) -> RegistryError {
    RegistryError::KindMismatch { name: name.to_owned(), registered: registered.kind(), requested }
}
