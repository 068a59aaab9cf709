use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use crossbeam_channel::{bounded, Sender};
use statsd_util::{parse_quantiles, DEFAULT_RESERVOIR_SIZE};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    aggregator::{Aggregator, AggregatorConfig, AggregatorTask, RateMode},
    backend::{BackendConfig, BackendManager, BackendTask},
    config::{Config, ConfigError},
    receiver::UdpReceiver,
    registry::{Registry, Storage},
    sinks::{HttpSinkConfig, Sink, SinkError},
    stats::SelfStats,
};

const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Errors that could occur while building or starting the collector.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Failed to spawn one of the background threads.
    #[error("failed to spawn {component} thread: {source}")]
    Spawn {
        /// The component whose thread could not be spawned.
        component: &'static str,
        /// The underlying I/O error.
        source: io::Error,
    },

    /// Failed to bind the UDP receiver.
    #[error("failed to bind receiver to {addr}: {source}")]
    Bind {
        /// The address that could not be bound.
        addr: SocketAddr,
        /// The underlying I/O error.
        source: io::Error,
    },

    /// Failed to create one of the backends.
    #[error("failed to register backend: {0}")]
    Sink(#[from] SinkError),
}

/// Builder for a [`Statsd`] collector.
pub struct StatsdBuilder {
    receiver_address: Option<SocketAddr>,
    receiver_queue_capacity: usize,
    datapoint_queue_capacity: usize,
    downstream_address: Option<String>,
    http: Option<HttpSinkConfig>,
    backends: Vec<(String, Arc<dyn Sink>)>,
    aggregator: AggregatorConfig,
    backend: BackendConfig,
    stats_prefix: String,
    reservoir_size: usize,
}

impl StatsdBuilder {
    /// Creates a new `StatsdBuilder` with the default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new `StatsdBuilder` from a configuration file's contents.
    ///
    /// # Errors
    ///
    /// If the configuration does not pass validation, an error is returned.
    pub fn from_config(mut config: Config) -> Result<Self, BuildError> {
        config.validate()?;

        let receiver_address = if config.is_local { None } else { Some(config.receiver_socket_addr()?) };
        let downstream_address = Some(config.downstream_address).filter(|addr| !addr.is_empty());

        Ok(Self {
            receiver_address,
            receiver_queue_capacity: config.receiver_queue_capacity,
            datapoint_queue_capacity: config.datapoint_queue_capacity,
            downstream_address,
            http: config.http.as_ref().map(|http| http.sink_config()),
            backends: Vec::new(),
            aggregator: AggregatorConfig {
                flush_interval: Duration::from_secs(config.aggregator_flush_interval_seconds),
                percentiles: parse_quantiles(&config.percentiles),
                rate_mode: config.rate_mode,
            },
            backend: BackendConfig {
                flush_interval: Duration::from_secs(config.backend_flush_interval_seconds),
                batch_size: config.backend_flush_batch_size,
                buffer_capacity: config.backend_buffer_capacity,
                flush_threshold: config.backend_flush_threshold,
            },
            stats_prefix: config.stats_prefix,
            reservoir_size: config.reservoir_size,
        })
    }

    /// Sets the address the UDP receiver listens on.
    ///
    /// Defaults to `0.0.0.0:8125`.
    #[must_use]
    pub fn with_receiver_address(mut self, addr: SocketAddr) -> Self {
        self.receiver_address = Some(addr);
        self
    }

    /// Disables the UDP receiver.
    ///
    /// Packets can still be fed in-process through [`Statsd::packet_sender`].
    #[must_use]
    pub fn local(mut self) -> Self {
        self.receiver_address = None;
        self
    }

    /// Sets the capacity of the packet queue between the receiver and the aggregator.
    ///
    /// When the queue is full, the receiver drops incoming datagrams.
    ///
    /// Defaults to 4,096 packets.
    #[must_use]
    pub fn with_receiver_queue_capacity(mut self, capacity: usize) -> Self {
        self.receiver_queue_capacity = capacity.max(1);
        self
    }

    /// Sets the capacity of the data point queue between the aggregator and the backend manager.
    ///
    /// When the queue is full, the aggregator waits for the backend manager to catch up.
    ///
    /// Defaults to 4,096 data points.
    #[must_use]
    pub fn with_datapoint_queue_capacity(mut self, capacity: usize) -> Self {
        self.datapoint_queue_capacity = capacity.max(1);
        self
    }

    /// Sets the Graphite server data points are forwarded to, in the format of `<host>:<port>`.
    ///
    /// Defaults to `127.0.0.1:2003`.
    #[must_use]
    pub fn with_downstream_address<A>(mut self, addr: A) -> Self
    where
        A: Into<String>,
    {
        self.downstream_address = Some(addr.into());
        self
    }

    /// Disables the Graphite backend.
    #[must_use]
    pub fn without_downstream(mut self) -> Self {
        self.downstream_address = None;
        self
    }

    /// Adds an HTTP backend.
    #[must_use]
    pub fn with_http_backend(mut self, config: HttpSinkConfig) -> Self {
        self.http = Some(config);
        self
    }

    /// Adds a custom backend under `id`.
    ///
    /// If several backends share the same id, only the first one is kept.
    #[must_use]
    pub fn with_backend<I>(mut self, id: I, sink: Arc<dyn Sink>) -> Self
    where
        I: Into<String>,
    {
        self.backends.push((id.into(), sink));
        self
    }

    /// Sets how often the aggregator turns the registry into data points.
    ///
    /// Counter rates are computed over this interval.
    ///
    /// Defaults to 10 seconds.
    #[must_use]
    pub fn with_aggregator_flush_interval(mut self, interval: Duration) -> Self {
        self.aggregator.flush_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Sets the percentiles reported for histograms and timers.
    ///
    /// Values are clamped between 0.0 and 1.0.
    ///
    /// Defaults to 0.5, 0.75, 0.95, 0.99 and 0.999.
    #[must_use]
    pub fn with_percentiles(mut self, percentiles: &[f64]) -> Self {
        self.aggregator.percentiles = parse_quantiles(percentiles);
        self
    }

    /// Sets how counter rates are computed.
    ///
    /// Defaults to [`RateMode::Truncated`].
    #[must_use]
    pub fn with_rate_mode(mut self, rate_mode: RateMode) -> Self {
        self.aggregator.rate_mode = rate_mode;
        self
    }

    /// Sets how often buffered data points are sent to the backends.
    ///
    /// Defaults to 10 seconds.
    #[must_use]
    pub fn with_backend_flush_interval(mut self, interval: Duration) -> Self {
        self.backend.flush_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Sets the maximum number of data points sent to the backends in a single batch.
    ///
    /// Defaults to 128.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.backend.batch_size = batch_size;
        self
    }

    /// Sets the maximum number of data points buffered while waiting for a flush.
    ///
    /// When the buffer is full, the oldest data points are dropped.
    ///
    /// Defaults to 8,192.
    #[must_use]
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.backend.buffer_capacity = capacity;
        self
    }

    /// Sets the number of buffered data points that triggers an immediate flush.
    ///
    /// Defaults to half the batch size.
    #[must_use]
    pub fn with_flush_threshold(mut self, threshold: usize) -> Self {
        self.backend.flush_threshold = Some(threshold);
        self
    }

    /// Sets the prefix of the collector's own metrics.
    ///
    /// Defaults to `statsd`.
    #[must_use]
    pub fn with_stats_prefix<P>(mut self, prefix: P) -> Self
    where
        P: Into<String>,
    {
        self.stats_prefix = prefix.into();
        self
    }

    /// Sets the number of samples kept per histogram and timer.
    ///
    /// Defaults to 1,028.
    #[must_use]
    pub fn with_reservoir_size(mut self, reservoir_size: usize) -> Self {
        self.reservoir_size = reservoir_size;
        self
    }

    /// Builds the collector.
    ///
    /// Nothing is started until [`Statsd::start_all`] is called.
    ///
    /// # Errors
    ///
    /// If one of the backends cannot be created, an error is returned.
    pub fn build(self) -> Result<Statsd, BuildError> {
        let registry = Arc::new(Registry::new(Storage::new(self.reservoir_size)));
        let stats = SelfStats::new(self.stats_prefix, Arc::clone(&registry));
        let aggregator = Arc::new(Aggregator::new(self.aggregator, Arc::clone(&registry), stats));

        let mut manager = BackendManager::new(self.backend);
        if let Some(addr) = &self.downstream_address {
            manager.register_graphite(addr)?;
        }
        if let Some(http) = self.http {
            manager.register_http(http)?;
        }
        for (id, sink) in self.backends {
            manager.register_backend(id, sink);
        }
        if manager.backend_count() == 0 {
            warn!("No backends registered, data points will be discarded.");
        }

        let (packets_tx, packets_rx) = bounded(self.receiver_queue_capacity);
        let (points_tx, points_rx) = bounded(self.datapoint_queue_capacity);

        let receiver = self.receiver_address.map(|addr| UdpReceiver::new(addr, packets_tx.clone()));

        Ok(Statsd {
            registry,
            packets: packets_tx,
            receiver,
            aggregator: AggregatorTask::new(aggregator, packets_rx, points_tx),
            backend: BackendTask::new(manager, points_rx),
        })
    }
}

impl Default for StatsdBuilder {
    fn default() -> Self {
        StatsdBuilder {
            receiver_address: Some(SocketAddr::from(([0, 0, 0, 0], 8125))),
            receiver_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            datapoint_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            downstream_address: Some("127.0.0.1:2003".to_owned()),
            http: None,
            backends: Vec::new(),
            aggregator: AggregatorConfig::default(),
            backend: BackendConfig::default(),
            stats_prefix: "statsd".to_owned(),
            reservoir_size: DEFAULT_RESERVOIR_SIZE,
        }
    }
}

/// A running StatsD collector.
///
/// Dropping the collector stops it, in the same order as [`Statsd::stop_all`].
pub struct Statsd {
    registry: Arc<Registry>,
    packets: Sender<Bytes>,
    receiver: Option<UdpReceiver>,
    aggregator: AggregatorTask,
    backend: BackendTask,
}

impl Statsd {
    /// Gets the registry holding every metric seen so far.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Gets the aggregator.
    pub fn aggregator(&self) -> &Arc<Aggregator> {
        self.aggregator.aggregator()
    }

    /// Gets a sender that feeds packets straight to the aggregator, bypassing the UDP receiver.
    pub fn packet_sender(&self) -> Sender<Bytes> {
        self.packets.clone()
    }

    /// Gets the address the UDP receiver is bound to, once started.
    pub fn receiver_addr(&self) -> Option<SocketAddr> {
        self.receiver.as_ref().and_then(UdpReceiver::local_addr)
    }

    /// Gets the number of registered backends, unless the backend manager is running.
    pub fn backend_count(&self) -> Option<usize> {
        self.backend.manager().map(BackendManager::backend_count)
    }

    /// Starts every component: the backend manager, then the aggregator, then the UDP receiver.
    ///
    /// Components that are already running are left alone.
    ///
    /// # Errors
    ///
    /// If a thread cannot be spawned or the receiver cannot be bound, an error is returned. Components started before
    /// the failure are left running.
    pub fn start_all(&mut self) -> Result<(), BuildError> {
        info!("Starting StatsD collector.");

        self.backend.start().map_err(|source| BuildError::Spawn { component: "backend", source })?;
        self.aggregator.start().map_err(|source| BuildError::Spawn { component: "aggregator", source })?;

        if let Some(receiver) = &mut self.receiver {
            receiver.start().map_err(|source| BuildError::Bind { addr: receiver_addr(receiver), source })?;
        }

        info!("StatsD collector started.");
        Ok(())
    }

    /// Stops every component: the UDP receiver, then the aggregator, then the backend manager.
    ///
    /// The backend manager sends everything already handed to it before stopping.
    pub fn stop_all(&mut self) {
        info!("Stopping StatsD collector.");

        if let Some(receiver) = &mut self.receiver {
            receiver.stop();
        }
        self.aggregator.stop();
        self.backend.stop();

        info!("StatsD collector stopped.");
    }
}

fn receiver_addr(receiver: &UdpReceiver) -> SocketAddr {
    receiver.local_addr().unwrap_or_else(|| receiver.configured_addr())
}

impl Drop for Statsd {
    fn drop(&mut self) {
        if self.aggregator.is_running() || self.backend.is_running() {
            self.stop_all();
        }
    }
}
