//! Parsing of the StatsD line protocol.
//!
//! A packet holds one or more newline-separated lines. Each line is a key followed by one or more `:`-separated
//! sections, and each section is a `value|type` pair:
//!
//! ```text
//! <key>:<value>|<type>[:<value>|<type>...]
//! ```
//!
//! Supported types are `c` (counter), `g` (gauge), and `ms` or `h` (timer, in milliseconds). Any other type is
//! rejected. Trailing `|` fields, such as sample rates or tags, are accepted but ignored.
use std::time::Duration;

use thiserror::Error;

/// Errors that could occur while parsing a line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The line has no `:` separating the key from its values.
    #[error("missing value separator in line '{line}'")]
    MissingValue {
        /// The offending line.
        line: String,
    },

    /// The key in front of the first `:` is empty.
    #[error("empty metric key in line '{line}'")]
    EmptyKey {
        /// The offending line.
        line: String,
    },

    /// A section has no `|` separating the value from its type.
    #[error("missing type separator in section '{section}' of key '{key}'")]
    MissingType {
        /// Metric key.
        key: String,
        /// The offending section.
        section: String,
    },

    /// The value could not be parsed for the given type.
    #[error("invalid value '{value}' for key '{key}': {reason}")]
    InvalidValue {
        /// Metric key.
        key: String,
        /// The raw value.
        value: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// The type is not one of `c`, `g`, `ms` or `h`.
    #[error("unsupported metric type '{kind}' for key '{key}'")]
    UnsupportedType {
        /// Metric key.
        key: String,
        /// The raw type.
        kind: String,
    },
}

/// A typed value carried by a single section.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    /// A counter delta.
    Counter(i64),

    /// An integer gauge level.
    Gauge(i64),

    /// A floating-point gauge level.
    GaugeFloat(f64),

    /// A timer duration.
    Timer(Duration),
}

/// A single parsed metric update.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricUpdate<'a> {
    /// Metric key, exactly as received.
    pub key: &'a str,

    /// The typed value.
    pub value: MetricValue,
}

/// Parses every line of `packet`.
///
/// Blank lines are skipped. A line with several sections yields one item per section, and an invalid section does not
/// prevent the other sections of the same line from being parsed.
pub fn parse_packet(packet: &str) -> impl Iterator<Item = Result<MetricUpdate<'_>, ParseError>> + '_ {
    packet.split('\n').map(str::trim).filter(|line| !line.is_empty()).flat_map(parse_line)
}

/// Parses a single line.
pub fn parse_line(line: &str) -> Vec<Result<MetricUpdate<'_>, ParseError>> {
    let Some((key, sections)) = line.split_once(':') else {
        return vec![Err(ParseError::MissingValue { line: line.to_owned() })];
    };

    if key.is_empty() {
        return vec![Err(ParseError::EmptyKey { line: line.to_owned() })];
    }

    sections.split(':').map(|section| parse_section(key, section)).collect()
}

fn parse_section<'a>(key: &'a str, section: &str) -> Result<MetricUpdate<'a>, ParseError> {
    let mut fields = section.split('|');
    let raw_value = fields.next().unwrap_or_default();
    let kind = fields.next().ok_or_else(|| ParseError::MissingType {
        key: key.to_owned(),
        section: section.to_owned(),
    })?;

    let invalid = |reason: &dyn std::fmt::Display| ParseError::InvalidValue {
        key: key.to_owned(),
        value: raw_value.to_owned(),
        reason: reason.to_string(),
    };

    let value = match kind {
        "c" => MetricValue::Counter(raw_value.parse::<i64>().map_err(|e| invalid(&e))?),
        "g" => parse_gauge(raw_value).map_err(|e| invalid(&e))?,
        "ms" | "h" => {
            let millis = raw_value.parse::<i64>().map_err(|e| invalid(&e))?;
            let millis = u64::try_from(millis).map_err(|_| invalid(&"timer durations cannot be negative"))?;
            MetricValue::Timer(Duration::from_millis(millis))
        }
        _ => return Err(ParseError::UnsupportedType { key: key.to_owned(), kind: kind.to_owned() }),
    };

    Ok(MetricUpdate { key, value })
}

// A literal with a decimal point is a float gauge, anything else must be an integer.
fn parse_gauge(raw: &str) -> Result<MetricValue, String> {
    if !raw.contains('.') {
        return raw.parse::<i64>().map(MetricValue::Gauge).map_err(|e| e.to_string());
    }

    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(MetricValue::GaugeFloat(value)),
        Ok(_) => Err("gauge values must be finite".to_owned()),
        Err(e) => Err(e.to_string()),
    }
}
