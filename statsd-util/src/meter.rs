//! Exponentially-weighted moving average rates.

use std::time::Duration;

use quanta::{Clock, Instant};

/// Interval at which moving averages are ticked.
pub const TICK_INTERVAL: Duration = Duration::from_secs(5);

/// An exponentially-weighted moving average of an event rate.
///
/// Events are accumulated with [`Ewma::update`] and folded into the average once per [`TICK_INTERVAL`] by
/// [`Ewma::tick`]. The weight given to each tick is derived from the averaging window, in the same way as the UNIX
/// load average.
#[derive(Debug, Clone)]
pub struct Ewma {
    alpha: f64,
    rate: f64,
    uncounted: u64,
    initialized: bool,
}

impl Ewma {
    /// Creates a new `Ewma` averaging over the given window.
    pub fn with_window(window: Duration) -> Self {
        let window = window.as_secs_f64().max(TICK_INTERVAL.as_secs_f64());
        let alpha = 1.0 - (-TICK_INTERVAL.as_secs_f64() / window).exp();
        Ewma { alpha, rate: 0.0, uncounted: 0, initialized: false }
    }

    /// Creates a new `Ewma` averaging over one minute.
    pub fn one_minute() -> Self {
        Ewma::with_window(Duration::from_secs(60))
    }

    /// Creates a new `Ewma` averaging over five minutes.
    pub fn five_minutes() -> Self {
        Ewma::with_window(Duration::from_secs(5 * 60))
    }

    /// Creates a new `Ewma` averaging over fifteen minutes.
    pub fn fifteen_minutes() -> Self {
        Ewma::with_window(Duration::from_secs(15 * 60))
    }

    /// Adds `n` events to the current tick.
    pub fn update(&mut self, n: u64) {
        self.uncounted += n;
    }

    /// Folds the events of the current tick into the average.
    pub fn tick(&mut self) {
        let instant_rate = self.uncounted as f64 / TICK_INTERVAL.as_secs_f64();
        self.uncounted = 0;

        if self.initialized {
            self.rate += self.alpha * (instant_rate - self.rate);
        } else {
            self.rate = instant_rate;
            self.initialized = true;
        }
    }

    /// Ticks `ticks` times in a row.
    ///
    /// Only the first tick can carry events, so the remaining ones are applied as a single decay step.
    pub fn tick_many(&mut self, ticks: u64) {
        if ticks == 0 {
            return;
        }

        self.tick();
        let idle = ticks - 1;
        if idle > 0 {
            let exponent = i32::try_from(idle).unwrap_or(i32::MAX);
            self.rate *= (1.0 - self.alpha).powi(exponent);
        }
    }

    /// Gets the average rate, in events per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }
}

/// Point-in-time rates of a [`Meter`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MeterSnapshot {
    /// Total number of events marked.
    pub count: u64,
    /// One-minute moving average rate, in events per second.
    pub rate1: f64,
    /// Five-minute moving average rate, in events per second.
    pub rate5: f64,
    /// Fifteen-minute moving average rate, in events per second.
    pub rate15: f64,
    /// Mean rate since the meter was created, in events per second.
    pub rate_mean: f64,
}

/// Tracks the rate of events over one, five and fifteen minute windows, as well as the mean rate since creation.
///
/// Ticking is lazy: every mark or read catches up on the ticks that elapsed since the last one, so no background
/// thread is needed.
#[derive(Debug, Clone)]
pub struct Meter {
    clock: Clock,
    start: Instant,
    last_tick: Instant,
    count: u64,
    m1: Ewma,
    m5: Ewma,
    m15: Ewma,
}

impl Meter {
    /// Creates a new `Meter` using the system clock.
    pub fn new() -> Self {
        Meter::with_clock(Clock::new())
    }

    /// Creates a new `Meter` using the given clock.
    pub fn with_clock(clock: Clock) -> Self {
        let now = clock.now();
        Meter {
            clock,
            start: now,
            last_tick: now,
            count: 0,
            m1: Ewma::one_minute(),
            m5: Ewma::five_minutes(),
            m15: Ewma::fifteen_minutes(),
        }
    }

    /// Marks `n` events.
    pub fn mark(&mut self, n: u64) {
        self.tick_if_necessary();
        self.count += n;
        self.m1.update(n);
        self.m5.update(n);
        self.m15.update(n);
    }

    /// Gets the current rates.
    pub fn snapshot(&mut self) -> MeterSnapshot {
        self.tick_if_necessary();

        let elapsed = self.clock.now().duration_since(self.start).as_secs_f64();
        let rate_mean = if elapsed > 0.0 { self.count as f64 / elapsed } else { 0.0 };

        MeterSnapshot {
            count: self.count,
            rate1: self.m1.rate(),
            rate5: self.m5.rate(),
            rate15: self.m15.rate(),
            rate_mean,
        }
    }

    fn tick_if_necessary(&mut self) {
        let age = self.clock.now().duration_since(self.last_tick);
        let ticks = age.as_nanos() / TICK_INTERVAL.as_nanos();
        if ticks == 0 {
            return;
        }

        let ticks = u64::try_from(ticks).unwrap_or(u64::MAX);
        let advance = u32::try_from(ticks).map_or(age, |t| TICK_INTERVAL * t);
        self.last_tick = self.last_tick + advance;

        self.m1.tick_many(ticks);
        self.m5.tick_many(ticks);
        self.m15.tick_many(ticks);
    }
}

impl Default for Meter {
    fn default() -> Self {
        Meter::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use approx::assert_relative_eq;
    use quanta::Clock;

    use super::{Ewma, Meter, TICK_INTERVAL};

    #[test]
    fn ewma_first_tick_is_instant_rate() {
        let mut ewma = Ewma::one_minute();
        ewma.update(10);
        ewma.tick();
        assert_relative_eq!(ewma.rate(), 2.0);
    }

    #[test]
    fn ewma_decays() {
        let mut ewma = Ewma::one_minute();
        ewma.update(300);
        ewma.tick();
        assert_relative_eq!(ewma.rate(), 60.0);

        // Twelve idle ticks is one full window, which should decay the rate by a factor of e.
        for _ in 0..12 {
            ewma.tick();
        }
        assert_relative_eq!(ewma.rate(), 60.0 / std::f64::consts::E, epsilon = 1e-9);
    }

    #[test]
    fn ewma_tick_many_matches_repeated_ticks() {
        let mut stepped = Ewma::five_minutes();
        let mut batched = Ewma::five_minutes();
        stepped.update(50);
        batched.update(50);

        for _ in 0..7 {
            stepped.tick();
        }
        batched.tick_many(7);

        assert_relative_eq!(stepped.rate(), batched.rate(), epsilon = 1e-12);
    }

    #[test]
    fn meter_rates() {
        let (clock, mock) = Clock::mock();
        let mut meter = Meter::with_clock(clock);

        let snapshot = meter.snapshot();
        assert_eq!(snapshot.count, 0);
        assert_eq!(snapshot.rate_mean, 0.0);

        meter.mark(10);
        mock.increment(TICK_INTERVAL);

        let snapshot = meter.snapshot();
        assert_eq!(snapshot.count, 10);
        assert_relative_eq!(snapshot.rate1, 2.0);
        assert_relative_eq!(snapshot.rate5, 2.0);
        assert_relative_eq!(snapshot.rate15, 2.0);
        assert_relative_eq!(snapshot.rate_mean, 2.0);

        mock.increment(Duration::from_secs(5));
        let snapshot = meter.snapshot();
        assert!(snapshot.rate1 < 2.0);
        assert!(snapshot.rate1 < snapshot.rate5);
        assert!(snapshot.rate5 < snapshot.rate15);
        assert_relative_eq!(snapshot.rate_mean, 1.0);
    }

    #[test]
    fn meter_without_ticks_reports_zero_rates() {
        let (clock, mock) = Clock::mock();
        let mut meter = Meter::with_clock(clock);

        meter.mark(3);
        mock.increment(Duration::from_secs(1));

        let snapshot = meter.snapshot();
        assert_eq!(snapshot.count, 3);
        assert_eq!(snapshot.rate1, 0.0);
        assert_relative_eq!(snapshot.rate_mean, 3.0);
    }
}
