//! The collector's own health metrics.
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tracing::warn;

use crate::registry::{Registry, RegistryError};

/// Last error seen for a given key, along with how many errors were seen in total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorTally {
    /// Number of errors recorded.
    pub count: u64,

    /// Message of the most recent error.
    pub last_error: String,
}

/// Records health metrics into a [`Registry`] under a common prefix.
///
/// Self stats flow through the pipeline like any other metric: `packets_received` becomes
/// `<prefix>.packets_received.count` on the next flush, and so on. A self stat whose name clashes with a metric of
/// another kind is skipped with a warning.
#[derive(Debug, Clone)]
pub struct SelfStats {
    prefix: String,
    registry: Arc<Registry>,
    errors: Arc<Mutex<HashMap<String, ErrorTally>>>,
}

impl SelfStats {
    /// Creates a new `SelfStats` recording into `registry` under `prefix`.
    ///
    /// An empty prefix records metrics under their bare names.
    pub fn new<P>(prefix: P, registry: Arc<Registry>) -> Self
    where
        P: Into<String>,
    {
        let prefix = prefix.into().trim_end_matches('.').to_owned();
        Self { prefix, registry, errors: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Gets the full name of the self stat `name`.
    pub fn key(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_owned()
        } else {
            format!("{}.{}", self.prefix, name)
        }
    }

    /// Increments the counter `name` by `delta`.
    pub fn counter_inc(&self, name: &str, delta: i64) {
        let key = self.key(name);
        self.record(&key, self.registry.counter(&key).map(|c| c.inc(delta)));
    }

    /// Feeds the absolute total `total` into the counter `name`.
    ///
    /// The counter advances by the difference from the previous total.
    pub fn counter_inc_total(&self, name: &str, total: i64) {
        let key = self.key(name);
        self.record(&key, self.registry.counter(&key).map(|c| c.absolute(total)));
    }

    /// Sets the gauge `name` to `value`.
    pub fn gauge_update(&self, name: &str, value: i64) {
        let key = self.key(name);
        self.record(&key, self.registry.gauge(&key).map(|g| g.update(value)));
    }

    /// Increases the gauge `name` by `delta`.
    pub fn gauge_inc(&self, name: &str, delta: i64) {
        let key = self.key(name);
        self.record(&key, self.registry.gauge(&key).map(|g| g.inc(delta)));
    }

    /// Decreases the gauge `name` by `delta`.
    pub fn gauge_dec(&self, name: &str, delta: i64) {
        let key = self.key(name);
        self.record(&key, self.registry.gauge(&key).map(|g| g.dec(delta)));
    }

    /// Sets the floating-point gauge `name` to `value`.
    pub fn gauge_float_update(&self, name: &str, value: f64) {
        let key = self.key(name);
        self.record(&key, self.registry.gauge_float(&key).map(|g| g.update(value)));
    }

    /// Records `value` into the histogram `name`.
    pub fn histogram_update(&self, name: &str, value: i64) {
        let key = self.key(name);
        self.record(&key, self.registry.histogram(&key).map(|h| h.update(value)));
    }

    /// Records `duration` into the timer `name`.
    pub fn timer_update(&self, name: &str, duration: Duration) {
        let key = self.key(name);
        self.record(&key, self.registry.timer(&key).map(|t| t.update(duration)));
    }

    /// Tallies an error under `name` and counts it into the `<name>` counter.
    pub fn on_error<E>(&self, name: &str, error: &E)
    where
        E: fmt::Display + ?Sized,
    {
        self.counter_inc(name, 1);

        let key = self.key(name);
        let mut errors = self.errors.lock();
        let tally = errors.entry(key).or_insert_with(|| ErrorTally { count: 0, last_error: String::new() });
        tally.count += 1;
        tally.last_error = error.to_string();
    }

    /// Gets the error tally for `name`, if any error was recorded under it.
    pub fn error_tally(&self, name: &str) -> Option<ErrorTally> {
        self.errors.lock().get(&self.key(name)).cloned()
    }

    /// Gets a copy of every error tally, keyed by full name.
    pub fn error_tallies(&self) -> HashMap<String, ErrorTally> {
        self.errors.lock().clone()
    }

    fn record(&self, key: &str, result: Result<(), RegistryError>) {
        if let Err(e) = result {
            warn!(stat = key, error = %e, "Skipping self stat update.");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use approx::assert_relative_eq;

    use super::SelfStats;
    use crate::registry::Registry;

    #[test]
    fn records_under_prefix() {
        let registry = Arc::new(Registry::default());
        let stats = SelfStats::new("statsd.", Arc::clone(&registry));

        stats.counter_inc("packets_received", 2);
        stats.counter_inc("packets_received", 3);
        stats.gauge_update("queue_depth", 10);
        stats.gauge_inc("queue_depth", 4);
        stats.gauge_dec("queue_depth", 6);
        stats.gauge_float_update("load", 0.5);
        stats.histogram_update("packet_bytes", 120);
        stats.timer_update("flush_time", Duration::from_millis(3));

        assert_eq!(registry.counter("statsd.packets_received").unwrap().value(), 5);
        assert_eq!(registry.gauge("statsd.queue_depth").unwrap().value(), 8);
        assert_relative_eq!(registry.gauge_float("statsd.load").unwrap().value(), 0.5);
        assert_eq!(registry.histogram("statsd.packet_bytes").unwrap().count(), 1);
        assert_eq!(registry.timer("statsd.flush_time").unwrap().count(), 1);
    }

    #[test]
    fn counter_totals_advance_by_difference() {
        let registry = Arc::new(Registry::default());
        let stats = SelfStats::new("", Arc::clone(&registry));

        stats.counter_inc_total("bytes_in", 1000);
        stats.counter_inc_total("bytes_in", 1500);
        stats.counter_inc_total("bytes_in", 1600);

        assert_eq!(registry.counter("bytes_in").unwrap().value(), 600);
    }

    #[test]
    fn mismatched_kinds_are_skipped() {
        let registry = Arc::new(Registry::default());
        let stats = SelfStats::new("statsd", Arc::clone(&registry));

        stats.gauge_update("conflict", 1);
        stats.counter_inc("conflict", 1);

        assert_eq!(registry.gauge("statsd.conflict").unwrap().value(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn error_tallies() {
        let registry = Arc::new(Registry::default());
        let stats = SelfStats::new("statsd", Arc::clone(&registry));

        assert!(stats.error_tally("parse_errors").is_none());

        stats.on_error("parse_errors", "first");
        stats.on_error("parse_errors", "second");

        let tally = stats.error_tally("parse_errors").unwrap();
        assert_eq!(tally.count, 2);
        assert_eq!(tally.last_error, "second");
        assert_eq!(registry.counter("statsd.parse_errors").unwrap().value(), 2);
        assert_eq!(stats.error_tallies().len(), 1);
    }
}
