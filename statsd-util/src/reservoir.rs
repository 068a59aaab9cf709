//! A bounded uniform sampling reservoir.

use std::cell::RefCell;

use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256StarStar;

use crate::Snapshot;

/// Default number of samples held by a [`Reservoir`].
pub const DEFAULT_RESERVOIR_SIZE: usize = 1028;

thread_local! {
    static FAST_RNG: RefCell<Xoshiro256StarStar> =
        RefCell::new(Xoshiro256StarStar::from_rng(&mut rand::rng()));
}

fn fastrand(upper: u64) -> u64 {
    FAST_RNG.with(|rng| rng.borrow_mut().random_range(0..upper))
}

/// A sampling reservoir.
///
/// [Reservoir sampling][rs] keeps a statistically representative sample of a stream in a fixed amount of space,
/// without knowing the length of the stream in advance. `Reservoir` is based on Vitter's ["Algorithm R"][vitter_paper]:
/// the first `capacity` values are stored as-is, and each later value replaces a random slot with probability
/// `capacity / count`.
///
/// The reservoir is never cleared by reading it, so a snapshot describes every value seen since creation (or since
/// the last call to [`Reservoir::clear`]).
///
/// Uses a thread-local [Xoshiro256**][xoshiro256starstar] PRNG to keep the per-update cost low.
///
/// [rs]: https://en.wikipedia.org/wiki/Reservoir_sampling
/// [vitter_paper]: https://www.cs.umd.edu/~samir/498/vitter.pdf
/// [xoshiro256starstar]: https://prng.di.unimi.it
#[derive(Debug, Clone)]
pub struct Reservoir {
    values: Vec<i64>,
    capacity: usize,
    count: u64,
}

impl Reservoir {
    /// Creates a new `Reservoir` that holds up to `capacity` samples.
    ///
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { values: Vec::with_capacity(capacity), capacity, count: 0 }
    }

    /// Records a value.
    pub fn update(&mut self, value: i64) {
        self.count += 1;
        if self.values.len() < self.capacity {
            self.values.push(value);
        } else {
            let idx = fastrand(self.count);
            if idx < self.capacity as u64 {
                self.values[idx as usize] = value;
            }
        }
    }

    /// Returns the number of values ever recorded, sampled or not.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Returns the number of samples currently held.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if no values have been recorded.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns the maximum number of samples held.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the sample rate of the reservoir.
    ///
    /// This is `1.0` until the reservoir fills up, and `capacity / count` afterwards.
    pub fn sample_rate(&self) -> f64 {
        if self.count as usize <= self.values.len() {
            1.0
        } else {
            self.values.len() as f64 / self.count as f64
        }
    }

    /// Takes a sorted, point-in-time copy of the samples.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.count, self.values.clone())
    }

    /// Drops every sample and resets the count.
    pub fn clear(&mut self) {
        self.values.clear();
        self.count = 0;
    }
}

impl Default for Reservoir {
    fn default() -> Self {
        Reservoir::new(DEFAULT_RESERVOIR_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::Reservoir;

    #[test]
    fn fills_before_sampling() {
        let mut reservoir = Reservoir::new(4);
        for value in 1..=3 {
            reservoir.update(value);
        }

        assert_eq!(reservoir.len(), 3);
        assert_eq!(reservoir.count(), 3);
        assert_eq!(reservoir.sample_rate(), 1.0);
        assert_eq!(reservoir.snapshot().values(), &[1, 2, 3]);
    }

    #[test]
    fn stays_bounded() {
        let mut reservoir = Reservoir::new(16);
        for value in 0..10_000 {
            reservoir.update(value);
        }

        assert_eq!(reservoir.len(), 16);
        assert_eq!(reservoir.count(), 10_000);
        assert!(reservoir.sample_rate() < 0.01);
        assert!(reservoir.snapshot().values().iter().all(|v| (0..10_000).contains(v)));
    }

    #[test]
    fn zero_capacity_is_raised() {
        let mut reservoir = Reservoir::new(0);
        reservoir.update(7);
        reservoir.update(8);

        assert_eq!(reservoir.capacity(), 1);
        assert_eq!(reservoir.len(), 1);
        assert_eq!(reservoir.count(), 2);
    }

    #[test]
    fn clear_resets() {
        let mut reservoir = Reservoir::default();
        reservoir.update(42);
        reservoir.clear();

        assert!(reservoir.is_empty());
        assert_eq!(reservoir.count(), 0);
    }
}
