//! Data points, the unit handed from the aggregator to the backends.
use std::fmt;

use bytes::Bytes;

/// The value of a data point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// An integer value.
    Integer(i64),

    /// A floating-point value.
    Float(f64),
}

impl Value {
    /// Gets the value as a float.
    pub fn as_f64(self) -> f64 {
        match self {
            Value::Integer(v) => v as f64,
            Value::Float(v) => v,
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        ValueFormatter::new().format(*self, |s| f.write_str(s))
    }
}

struct ValueFormatter {
    int_writer: itoa::Buffer,
    float_writer: ryu::Buffer,
}

impl ValueFormatter {
    fn new() -> Self {
        Self { int_writer: itoa::Buffer::new(), float_writer: ryu::Buffer::new() }
    }

    // Graphite has no representation for NaN or infinities, so they are written as zero.
    fn format<F, R>(&mut self, value: Value, f: F) -> R
    where
        F: FnOnce(&str) -> R,
    {
        match value {
            Value::Integer(v) => f(self.int_writer.format(v)),
            Value::Float(v) if v.is_finite() => f(self.float_writer.format_finite(v)),
            Value::Float(_) => f("0"),
        }
    }
}

/// A named, timestamped value produced by a flush.
///
/// Serializes to the Graphite plaintext line `<name> <value> <timestamp>\n`.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDataPoint {
    name: String,
    value: Value,
    timestamp: u64,
}

impl MetricDataPoint {
    /// Creates a new `MetricDataPoint`.
    ///
    /// `timestamp` is in seconds since the Unix epoch.
    pub fn new<N, V>(name: N, value: V, timestamp: u64) -> Self
    where
        N: Into<String>,
        V: Into<Value>,
    {
        Self { name: name.into(), value: value.into(), timestamp }
    }

    /// Gets the name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Gets the value.
    pub fn value(&self) -> Value {
        self.value
    }

    /// Gets the timestamp, in seconds since the Unix epoch.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Appends the serialized line, including the trailing newline, to `buf`.
    ///
    /// Whitespace in the name is replaced with `_`, so the line always has exactly three fields.
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        let mut formatter = ValueFormatter::new();
        write_name(&self.name, buf);
        buf.push(b' ');
        formatter.format(self.value, |s| buf.extend_from_slice(s.as_bytes()));
        buf.push(b' ');
        buf.extend_from_slice(formatter.int_writer.format(self.timestamp).as_bytes());
        buf.push(b'\n');
    }

    /// Serializes the data point into a single line.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = Vec::with_capacity(self.name.len() + 32);
        self.write_to(&mut buf);
        Bytes::from(buf)
    }
}

fn write_name(name: &str, buf: &mut Vec<u8>) {
    if !name.contains(char::is_whitespace) {
        buf.extend_from_slice(name.as_bytes());
        return;
    }

    let mut encoded = [0; 4];
    for c in name.chars() {
        let c = if c.is_whitespace() { '_' } else { c };
        buf.extend_from_slice(c.encode_utf8(&mut encoded).as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::{MetricDataPoint, Value};

    #[test]
    fn integer_line() {
        let point = MetricDataPoint::new("requests.count", 42_i64, 1_700_000_000);
        assert_eq!(&point.to_bytes()[..], b"requests.count 42 1700000000\n");
    }

    #[test]
    fn float_line() {
        let point = MetricDataPoint::new("latency.mean", 120.0, 1);
        assert_eq!(&point.to_bytes()[..], b"latency.mean 120.0 1\n");

        let point = MetricDataPoint::new("latency.std-dev", 0.25, 1);
        assert_eq!(&point.to_bytes()[..], b"latency.std-dev 0.25 1\n");
    }

    #[test]
    fn non_finite_floats_are_zero() {
        for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let point = MetricDataPoint::new("broken", value, 7);
            assert_eq!(&point.to_bytes()[..], b"broken 0 7\n");
        }
    }

    #[test]
    fn whitespace_in_name_is_replaced() {
        let point = MetricDataPoint::new("api latency\tp\u{3000}99.count", 3_i64, 9);
        assert_eq!(&point.to_bytes()[..], b"api_latency_p_99.count 3 9\n");
        assert_eq!(point.name(), "api latency\tp\u{3000}99.count");
    }

    #[test]
    fn value_display() {
        assert_eq!(Value::Integer(-5).to_string(), "-5");
        assert_eq!(Value::Float(1.5).to_string(), "1.5");
        assert_eq!(Value::Integer(3).as_f64(), 3.0);
    }
}
