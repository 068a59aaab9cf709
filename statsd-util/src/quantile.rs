/// A quantile that has both the raw value and a percentile label.
///
/// We work with quantiles for optimal floating-point precision, but Graphite-style metric names carry percentiles, in
/// an abbreviated form without the decimal point: a quantile of `0.99` is labelled `99`, and a quantile of `0.999` is
/// labelled `999`.
///
/// The label is the percentage with its decimal point removed, so `0.05` is labelled `5` and `0.001` is labelled `01`.
/// It is built by shifting the decimal point of the quantile's own representation rather than from
/// `quantile * 100.0`, so it never picks up floating-point noise such as `99.89999999999999`.
#[derive(Debug, Clone, PartialEq)]
pub struct Quantile(f64, String);

impl Quantile {
    /// Creates a new [`Quantile`] from a floating-point value.
    ///
    /// All values are clamped between 0.0 and 1.0.
    pub fn new(quantile: f64) -> Quantile {
        let clamped = quantile.clamp(0.0, 1.0);

        let raw_label = format!("{}", clamped);
        let label = match raw_label.as_str() {
            "0" => "0".to_string(),
            "1" => "100".to_string(),
            _ => percent_label(raw_label.trim_start_matches("0.")),
        };

        Quantile(clamped, label)
    }

    /// Gets the percentile label.
    pub fn label(&self) -> &str {
        self.1.as_str()
    }

    /// Gets the raw quantile value.
    pub fn value(&self) -> f64 {
        self.0
    }
}

// `digits` are the fractional digits of a quantile below 1. The first two become the whole part of the percentage,
// with leading zeros dropped, and the rest follow as is.
fn percent_label(digits: &str) -> String {
    let padded = format!("{:0<2}", digits);
    let (whole, fraction) = padded.split_at(2);
    let whole = match whole.trim_start_matches('0') {
        "" => "0",
        trimmed => trimmed,
    };

    format!("{}{}", whole, fraction)
}

/// Parses a slice of floating-point values into a vector of [`Quantile`]s.
pub fn parse_quantiles(quantiles: &[f64]) -> Vec<Quantile> {
    quantiles.iter().map(|f| Quantile::new(*f)).collect()
}
