//! Collector configuration, loaded from TOML.
//!
//! Every field is optional. A minimal configuration file only needs the fields that differ from the defaults:
//!
//! ```toml
//! receiver_address = "0.0.0.0:8125"
//! downstream_address = "graphite.internal:2003"
//! aggregator_flush_interval_seconds = 10
//! percentiles = [0.5, 0.9, 0.99]
//!
//! [http]
//! url = "https://api.example.com"
//! license_key = "secret"
//! ```
use std::{
    fs, io,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use statsd_util::DEFAULT_RESERVOIR_SIZE;
use thiserror::Error;
use tracing::debug;

use crate::{
    aggregator::{RateMode, DEFAULT_PERCENTILES},
    sinks::HttpSinkConfig,
};

const MIN_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_QUEUE_CAPACITY: usize = 4096;
const DEFAULT_HTTP_TIMEOUT_SECONDS: u64 = 10;

/// Errors that could occur while loading or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No configuration file was found at any of the searched paths.
    #[error("configuration file not found, searched: {}", display_paths(.searched))]
    NotFound {
        /// Paths that were searched, in order.
        searched: Vec<PathBuf>,
    },

    /// The configuration file could not be read.
    #[error("failed to read configuration file '{}': {source}", .path.display())]
    Io {
        /// Path of the configuration file.
        path: PathBuf,
        /// The underlying I/O error.
        source: io::Error,
    },

    /// The configuration file is not valid TOML, or does not match the expected schema.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A field has an invalid value.
    #[error("invalid value for '{field}': {reason}")]
    Invalid {
        /// Name of the offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", ")
}

/// HTTP backend settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    /// Base URL of the ingestion API.
    pub url: String,

    /// License key sent with every request.
    pub license_key: String,

    /// Request timeout, in seconds.
    #[serde(default = "default_http_timeout")]
    pub timeout_seconds: u64,

    /// HTTP proxy requests are tunneled through, such as `http://proxy.internal:3128`.
    ///
    /// An empty value is the same as no proxy.
    #[serde(default)]
    pub proxy: Option<String>,
}

fn default_http_timeout() -> u64 {
    DEFAULT_HTTP_TIMEOUT_SECONDS
}

impl HttpConfig {
    /// Converts these settings into an [`HttpSinkConfig`].
    pub fn sink_config(&self) -> HttpSinkConfig {
        HttpSinkConfig {
            url: self.url.clone(),
            license_key: self.license_key.clone(),
            timeout: Duration::from_secs(self.timeout_seconds.max(1)),
            proxy: self.proxy.clone().filter(|proxy| !proxy.is_empty()),
        }
    }
}

/// Collector configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Skip the UDP receiver, for when packets are fed in-process.
    pub is_local: bool,

    /// Address the UDP receiver listens on.
    pub receiver_address: String,

    /// Capacity of the channel between the receiver and the aggregator, in packets.
    pub receiver_queue_capacity: usize,

    /// Graphite server to forward data points to. Empty to disable.
    pub downstream_address: String,

    /// Capacity of the channel between the aggregator and the backend manager, in data points.
    pub datapoint_queue_capacity: usize,

    /// How often buffered data points are sent to the backends.
    pub backend_flush_interval_seconds: u64,

    /// Maximum number of data points per batch.
    pub backend_flush_batch_size: usize,

    /// Maximum number of data points buffered by the backend manager.
    pub backend_buffer_capacity: usize,

    /// Number of buffered data points that triggers an immediate flush. Defaults to half the batch size.
    pub backend_flush_threshold: Option<usize>,

    /// How often the registry is flushed into data points.
    pub aggregator_flush_interval_seconds: u64,

    /// Percentiles reported for histograms and timers, each between 0 and 1.
    pub percentiles: Vec<f64>,

    /// How counter rates are computed.
    pub rate_mode: RateMode,

    /// Prefix of the collector's own metrics.
    pub stats_prefix: String,

    /// Number of samples kept per histogram and timer.
    pub reservoir_size: usize,

    /// HTTP backend settings.
    pub http: Option<HttpConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            is_local: false,
            receiver_address: "0.0.0.0:8125".to_owned(),
            receiver_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            downstream_address: "127.0.0.1:2003".to_owned(),
            datapoint_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            backend_flush_interval_seconds: 10,
            backend_flush_batch_size: 128,
            backend_buffer_capacity: 8192,
            backend_flush_threshold: None,
            aggregator_flush_interval_seconds: 10,
            percentiles: DEFAULT_PERCENTILES.to_vec(),
            rate_mode: RateMode::Truncated,
            stats_prefix: "statsd".to_owned(),
            reservoir_size: DEFAULT_RESERVOIR_SIZE,
            http: None,
        }
    }
}

impl Config {
    /// Parses a configuration from TOML.
    ///
    /// # Errors
    ///
    /// If the text is not valid TOML, or contains unknown fields or values of the wrong type, an error is returned.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Loads the configuration from `path`, falling back to the same path under `/etc`.
    ///
    /// # Errors
    ///
    /// If no file exists at either location, or if the file cannot be read or parsed, an error is returned.
    pub fn load<P>(path: P) -> Result<Self, ConfigError>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let mut searched = vec![path.to_path_buf()];
        if path.is_relative() {
            searched.push(Path::new("/etc").join(path));
        }

        let found = searched.iter().find(|p| p.is_file()).cloned();
        let Some(found) = found else {
            return Err(ConfigError::NotFound { searched });
        };

        debug!(path = %found.display(), "Loading configuration.");
        let text = fs::read_to_string(&found).map_err(|source| ConfigError::Io { path: found.clone(), source })?;
        Self::from_toml(&text)
    }

    /// Checks the configuration, raising out-of-range sizes and intervals to their minimums.
    ///
    /// # Errors
    ///
    /// If an address cannot be parsed, a percentile is out of range, or the HTTP settings are incomplete, an error is
    /// returned.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if !self.is_local {
            self.receiver_socket_addr()?;
        }

        if !self.downstream_address.is_empty() {
            validate_host_port(&self.downstream_address)
                .map_err(|reason| ConfigError::Invalid { field: "downstream_address", reason })?;
        }

        if self.receiver_queue_capacity < MIN_QUEUE_CAPACITY {
            self.receiver_queue_capacity = DEFAULT_QUEUE_CAPACITY;
        }
        if self.datapoint_queue_capacity < MIN_QUEUE_CAPACITY {
            self.datapoint_queue_capacity = DEFAULT_QUEUE_CAPACITY;
        }

        self.backend_flush_interval_seconds = self.backend_flush_interval_seconds.max(1);
        self.aggregator_flush_interval_seconds = self.aggregator_flush_interval_seconds.max(1);
        self.backend_flush_batch_size = self.backend_flush_batch_size.max(1);
        self.backend_buffer_capacity = self.backend_buffer_capacity.max(self.backend_flush_batch_size);
        self.backend_flush_threshold =
            self.backend_flush_threshold.map(|threshold| threshold.clamp(1, self.backend_buffer_capacity));
        self.reservoir_size = self.reservoir_size.max(1);

        if let Some(p) = self.percentiles.iter().find(|p| !(0.0..=1.0).contains(*p)) {
            return Err(ConfigError::Invalid {
                field: "percentiles",
                reason: format!("{} is not between 0 and 1", p),
            });
        }

        if let Some(http) = &self.http {
            if http.url.is_empty() {
                return Err(ConfigError::Invalid { field: "http.url", reason: "must not be empty".to_owned() });
            }
            if http.license_key.is_empty() {
                return Err(ConfigError::Invalid {
                    field: "http.license_key",
                    reason: "must not be empty".to_owned(),
                });
            }
        }

        Ok(())
    }

    /// Gets the receiver address as a socket address.
    ///
    /// # Errors
    ///
    /// If the address is empty or not a valid socket address, an error is returned.
    pub fn receiver_socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.receiver_address.is_empty() {
            return Err(ConfigError::Invalid { field: "receiver_address", reason: "must not be empty".to_owned() });
        }

        self.receiver_address.parse().map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
            field: "receiver_address",
            reason: e.to_string(),
        })
    }
}

fn validate_host_port(addr: &str) -> Result<(), String> {
    let (host, port) = addr.rsplit_once(':').ok_or_else(|| "expected '<host>:<port>'".to_owned())?;
    if host.is_empty() {
        return Err("host must not be empty".to_owned());
    }
    port.parse::<u16>().map(|_| ()).map_err(|e| format!("invalid port '{}': {}", port, e))
}

#[cfg(test)]
mod tests {
    use std::{fs, time::Duration};

    use super::{Config, ConfigError};
    use crate::aggregator::RateMode;

    #[test]
    fn defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.receiver_address, "0.0.0.0:8125");
        assert_eq!(config.downstream_address, "127.0.0.1:2003");
        assert_eq!(config.backend_flush_batch_size, 128);
        assert_eq!(config.percentiles, vec![0.5, 0.75, 0.95, 0.99, 0.999]);
        assert_eq!(config.rate_mode, RateMode::Truncated);
    }

    #[test]
    fn full_file() {
        let config = Config::from_toml(
            r#"
            is_local = true
            receiver_address = "127.0.0.1:9125"
            downstream_address = ""
            aggregator_flush_interval_seconds = 5
            percentiles = [0.9]
            rate_mode = "fractional"
            stats_prefix = "collector"

            [http]
            url = "https://api.example.com"
            license_key = "key"
            "#,
        )
        .unwrap();

        assert!(config.is_local);
        assert_eq!(config.aggregator_flush_interval_seconds, 5);
        assert_eq!(config.rate_mode, RateMode::Fractional);
        assert_eq!(config.stats_prefix, "collector");

        let http = config.http.unwrap();
        assert_eq!(http.timeout_seconds, 10);
        let sink = http.sink_config();
        assert_eq!(sink.timeout, Duration::from_secs(10));
        assert_eq!(sink.license_key, "key");
        assert_eq!(sink.proxy, None);
    }

    #[test]
    fn http_proxy() {
        let config = Config::from_toml(
            "[http]\nurl = \"https://api.example.com\"\nlicense_key = \"key\"\nproxy = \"http://proxy.internal:3128\"",
        )
        .unwrap();
        let sink = config.http.unwrap().sink_config();
        assert_eq!(sink.proxy.as_deref(), Some("http://proxy.internal:3128"));

        let config = Config::from_toml("[http]\nurl = \"https://api.example.com\"\nlicense_key = \"key\"\nproxy = \"\"")
            .unwrap();
        assert_eq!(config.http.unwrap().sink_config().proxy, None);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(matches!(Config::from_toml("recever_address = \"x\""), Err(ConfigError::Parse(_))));
        assert!(matches!(Config::from_toml("rate_mode = \"exact\""), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn validate_clamps() {
        let mut config = Config {
            receiver_queue_capacity: 10,
            datapoint_queue_capacity: 2048,
            backend_flush_interval_seconds: 0,
            aggregator_flush_interval_seconds: 0,
            backend_flush_batch_size: 0,
            backend_buffer_capacity: 0,
            backend_flush_threshold: Some(0),
            ..Config::default()
        };
        config.validate().unwrap();

        assert_eq!(config.receiver_queue_capacity, 4096);
        assert_eq!(config.datapoint_queue_capacity, 2048);
        assert_eq!(config.backend_flush_interval_seconds, 1);
        assert_eq!(config.aggregator_flush_interval_seconds, 1);
        assert_eq!(config.backend_flush_batch_size, 1);
        assert_eq!(config.backend_buffer_capacity, 1);
        assert_eq!(config.backend_flush_threshold, Some(1));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = Config { receiver_address: "not-an-address".to_owned(), ..Config::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field: "receiver_address", .. })));

        // A local collector has no receiver to configure.
        config.is_local = true;
        assert!(config.validate().is_ok());

        let mut config = Config { receiver_address: String::new(), ..Config::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field: "receiver_address", .. })));

        let mut config = Config { downstream_address: "graphite".to_owned(), ..Config::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field: "downstream_address", .. })));

        let mut config = Config { percentiles: vec![0.5, 1.5], ..Config::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field: "percentiles", .. })));

        let mut config = Config::from_toml("[http]\nurl = \"https://api.example.com\"\nlicense_key = \"\"").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field: "http.license_key", .. })));
    }

    #[test]
    fn load_from_file() {
        let dir = std::env::temp_dir().join(format!("statsd-collector-config-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("statsd.toml");
        fs::write(&path, "stats_prefix = \"from-file\"\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.stats_prefix, "from-file");

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn load_missing_file() {
        let err = Config::load("statsd-collector-does-not-exist.toml").unwrap_err();
        match err {
            ConfigError::NotFound { searched } => {
                assert_eq!(searched.len(), 2);
                assert!(searched[1].starts_with("/etc"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
