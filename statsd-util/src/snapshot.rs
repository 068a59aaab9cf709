/// A point-in-time view of a distribution.
///
/// Holds the sampled values in ascending order, along with the total number of values observed by the source, which
/// may be larger than the number of samples if the source was a sampling reservoir.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    count: u64,
    sorted: Vec<i64>,
}

impl Snapshot {
    /// Creates a new `Snapshot` from the observed `count` and the sampled values.
    pub fn new(count: u64, mut values: Vec<i64>) -> Self {
        values.sort_unstable();
        Snapshot { count, sorted: values }
    }

    /// Gets the number of values observed by the source.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Gets the sampled values, in ascending order.
    pub fn values(&self) -> &[i64] {
        &self.sorted
    }

    /// Gets the smallest sample, or zero if there are no samples.
    pub fn min(&self) -> i64 {
        self.sorted.first().copied().unwrap_or(0)
    }

    /// Gets the largest sample, or zero if there are no samples.
    pub fn max(&self) -> i64 {
        self.sorted.last().copied().unwrap_or(0)
    }

    /// Gets the arithmetic mean of the samples, or zero if there are no samples.
    pub fn mean(&self) -> f64 {
        if self.sorted.is_empty() {
            return 0.0;
        }

        let sum: f64 = self.sorted.iter().map(|v| *v as f64).sum();
        sum / self.sorted.len() as f64
    }

    /// Gets the population variance of the samples, or zero if there are no samples.
    pub fn variance(&self) -> f64 {
        if self.sorted.is_empty() {
            return 0.0;
        }

        let mean = self.mean();
        let sum: f64 = self
            .sorted
            .iter()
            .map(|v| {
                let delta = *v as f64 - mean;
                delta * delta
            })
            .sum();
        sum / self.sorted.len() as f64
    }

    /// Gets the population standard deviation of the samples.
    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Gets the estimated value at the given quantile.
    ///
    /// Quantiles are clamped to `[0.0, 1.0]`. Positions that fall between two samples are linearly interpolated; the
    /// position of quantile `q` is `q * (n + 1)`, so a single-sample snapshot returns that sample for every quantile.
    pub fn quantile(&self, q: f64) -> f64 {
        let len = self.sorted.len();
        if len == 0 {
            return 0.0;
        }

        let q = q.clamp(0.0, 1.0);
        let pos = q * (len + 1) as f64;
        if pos < 1.0 {
            self.sorted[0] as f64
        } else if pos >= len as f64 {
            self.sorted[len - 1] as f64
        } else {
            let lower = self.sorted[pos as usize - 1] as f64;
            let upper = self.sorted[pos as usize] as f64;
            lower + (pos - pos.floor()) * (upper - lower)
        }
    }

    /// Gets the estimated values at each of the given quantiles.
    pub fn quantiles(&self, qs: &[f64]) -> Vec<f64> {
        qs.iter().map(|q| self.quantile(*q)).collect()
    }
}
