//! Buffering data points and fanning batches out to sinks.
use std::{io, sync::Arc, thread, time::Duration};

use crossbeam_channel::{select, tick, Receiver};
use indexmap::IndexMap;
use tracing::{debug, error, info, trace, warn};

use crate::{
    buffer::BoundedBuffer,
    datapoint::MetricDataPoint,
    sinks::{GraphiteSink, HttpSink, HttpSinkConfig, Sink, SinkError},
    worker::Worker,
};

/// Backend manager configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    /// How often buffered data points are flushed, regardless of how many there are.
    pub flush_interval: Duration,

    /// Maximum number of data points sent in a single batch.
    pub batch_size: usize,

    /// Maximum number of data points held while waiting for a flush.
    pub buffer_capacity: usize,

    /// Number of buffered data points that triggers an immediate flush.
    ///
    /// Defaults to half the batch size.
    pub flush_threshold: Option<usize>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self { flush_interval: Duration::from_secs(10), batch_size: 128, buffer_capacity: 8192, flush_threshold: None }
    }
}

/// Outcome of a single flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Number of data points in the batch.
    pub points: usize,

    /// Size of the batch, in bytes.
    pub bytes: usize,

    /// Number of sinks that accepted the batch.
    pub succeeded: usize,

    /// Number of sinks that failed to accept the batch.
    pub failed: usize,
}

/// Buffers data points and sends them in batches to every registered sink.
///
/// Each flush drains up to `batch_size` data points from the buffer and hands the same batch to every sink at once,
/// one thread per sink, waiting for all of them before returning. A sink failing only affects that sink: the error is
/// logged and the batch is not retried.
pub struct BackendManager {
    sinks: IndexMap<String, Arc<dyn Sink>>,
    buffer: BoundedBuffer,
    flush_interval: Duration,
    batch_size: usize,
    flush_threshold: usize,
    reported_drops: u64,
}

impl BackendManager {
    /// Creates a new `BackendManager` with no sinks.
    ///
    /// The batch size is raised to at least one, the buffer capacity to at least the batch size, and the flush
    /// threshold is clamped to the buffer capacity.
    pub fn new(config: BackendConfig) -> Self {
        let batch_size = config.batch_size.max(1);
        let buffer_capacity = config.buffer_capacity.max(batch_size);
        let flush_threshold = config.flush_threshold.unwrap_or(batch_size / 2).clamp(1, buffer_capacity);

        Self {
            sinks: IndexMap::new(),
            buffer: BoundedBuffer::new(buffer_capacity),
            flush_interval: config.flush_interval,
            batch_size,
            flush_threshold,
            reported_drops: 0,
        }
    }

    /// Registers `sink` under `id`.
    ///
    /// Returns `false`, leaving the existing sink in place, if a sink is already registered under `id`.
    pub fn register_backend<I>(&mut self, id: I, sink: Arc<dyn Sink>) -> bool
    where
        I: Into<String>,
    {
        let id = id.into();
        if self.sinks.contains_key(&id) {
            debug!(backend = %id, "Backend already registered.");
            return false;
        }

        info!(backend = %id, "Registered backend.");
        self.sinks.insert(id, sink);
        true
    }

    /// Registers a Graphite sink writing to `addr`, under the id `graphite:<addr>`.
    ///
    /// # Errors
    ///
    /// If the address cannot be resolved, an error is returned.
    pub fn register_graphite(&mut self, addr: &str) -> Result<bool, SinkError> {
        let id = format!("graphite:{}", addr);
        if self.sinks.contains_key(&id) {
            return Ok(false);
        }

        let sink = GraphiteSink::new(addr)?;
        Ok(self.register_backend(id, Arc::new(sink)))
    }

    /// Registers an HTTP sink, under the id `http:<url>`.
    ///
    /// # Errors
    ///
    /// If the sink cannot be created, an error is returned.
    pub fn register_http(&mut self, config: HttpSinkConfig) -> Result<bool, SinkError> {
        let id = format!("http:{}", config.url);
        if self.sinks.contains_key(&id) {
            return Ok(false);
        }

        let sink = HttpSink::new(config)?;
        Ok(self.register_backend(id, Arc::new(sink)))
    }

    /// Gets the number of registered sinks.
    pub fn backend_count(&self) -> usize {
        self.sinks.len()
    }

    /// Gets the ids of the registered sinks, in registration order.
    pub fn backend_ids(&self) -> impl Iterator<Item = &str> {
        self.sinks.keys().map(String::as_str)
    }

    /// Gets the buffer of pending data points.
    pub fn buffer(&self) -> &BoundedBuffer {
        &self.buffer
    }

    /// Gets the number of buffered data points that triggers an immediate flush.
    pub fn flush_threshold(&self) -> usize {
        self.flush_threshold
    }

    /// Buffers `point`, flushing right away if the buffer has reached the flush threshold.
    pub fn add(&mut self, point: &MetricDataPoint) -> Option<FlushReport> {
        trace!(name = point.name(), "Buffering data point.");
        self.buffer.add(point.to_bytes());

        if self.buffer.len() >= self.flush_threshold {
            Some(self.flush())
        } else {
            None
        }
    }

    /// Sends up to one batch of buffered data points to every sink.
    ///
    /// Nothing is sent when the buffer is empty.
    pub fn flush(&mut self) -> FlushReport {
        self.report_drops();

        let points = self.buffer.len().min(self.batch_size);
        let batch = self.buffer.batch(self.batch_size);
        if batch.is_empty() {
            trace!("Nothing to flush.");
            return FlushReport::default();
        }

        let mut report = FlushReport { points, bytes: batch.len(), ..FlushReport::default() };

        let results: Vec<(&str, Result<(), SinkError>)> = thread::scope(|scope| {
            let handles: Vec<_> = self
                .sinks
                .iter()
                .map(|(id, sink)| {
                    let batch = &batch[..];
                    let handle = thread::Builder::new()
                        .name(format!("statsd-sink-{}", id))
                        .spawn_scoped(scope, move || sink.flush(batch));
                    (id.as_str(), handle)
                })
                .collect();

            handles
                .into_iter()
                .map(|(id, handle)| {
                    let result = match handle {
                        Ok(handle) => handle
                            .join()
                            .unwrap_or_else(|_| Err(SinkError::Dispatch("sink panicked".to_owned()))),
                        Err(e) => Err(SinkError::Dispatch(e.to_string())),
                    };
                    (id, result)
                })
                .collect()
        });

        for (id, result) in results {
            match result {
                Ok(()) => report.succeeded += 1,
                Err(e) => {
                    error!(backend = %id, error = %e, "Failed to flush batch to backend.");
                    report.failed += 1;
                }
            }
        }

        debug!(
            points = report.points,
            bytes = report.bytes,
            succeeded = report.succeeded,
            failed = report.failed,
            "Flushed batch to backends."
        );
        report
    }

    fn report_drops(&mut self) {
        let drops = self.buffer.drops();
        if drops > self.reported_drops {
            warn!(
                dropped = drops - self.reported_drops,
                total_dropped = drops,
                "Backend buffer overflowed, oldest data points were dropped."
            );
            self.reported_drops = drops;
        }
    }

    // Drains everything that is already queued, then flushes until the buffer is empty.
    fn drain(&mut self, points: &Receiver<MetricDataPoint>) {
        for point in points.try_iter() {
            self.add(&point);
        }

        while !self.buffer.is_empty() {
            self.flush();
        }
    }
}

/// Runs a [`BackendManager`] on a dedicated thread.
///
/// While running, the thread owns the manager: sinks can only be registered while the task is stopped.
pub struct BackendTask {
    manager: Option<BackendManager>,
    points: Receiver<MetricDataPoint>,
    worker: Worker<Option<BackendManager>>,
}

impl BackendTask {
    /// Creates a new `BackendTask` consuming data points from `points`.
    pub fn new(manager: BackendManager, points: Receiver<MetricDataPoint>) -> Self {
        Self { manager: Some(manager), points, worker: Worker::new("statsd-backend") }
    }

    /// Gets the manager, unless the task is running.
    pub fn manager(&self) -> Option<&BackendManager> {
        self.manager.as_ref()
    }

    /// Gets the manager mutably, unless the task is running.
    pub fn manager_mut(&mut self) -> Option<&mut BackendManager> {
        self.manager.as_mut()
    }

    /// Returns `true` if the task thread is running.
    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    /// Starts the task thread.
    ///
    /// Does nothing if the task is already running.
    ///
    /// # Errors
    ///
    /// If the thread cannot be spawned, an error is returned.
    pub fn start(&mut self) -> io::Result<()> {
        let Some(manager) = self.manager.take() else {
            return Ok(());
        };

        let points = self.points.clone();
        let (manager_tx, manager_rx) = crossbeam_channel::bounded(1);
        let result = self
            .worker
            .start(move |shutdown| manager_rx.recv().ok().map(|manager| run(manager, &shutdown, &points)));

        match result {
            Ok(()) => {
                // The channel has room for exactly one manager, so this never blocks.
                let _ = manager_tx.send(manager);
                Ok(())
            }
            Err(e) => {
                self.manager = Some(manager);
                Err(e)
            }
        }
    }

    /// Stops the task thread, waiting for it to flush what it has buffered.
    pub fn stop(&mut self) {
        if let Some(Some(manager)) = self.worker.stop() {
            self.manager = Some(manager);
        }
    }
}

fn run(mut manager: BackendManager, shutdown: &Receiver<()>, points: &Receiver<MetricDataPoint>) -> BackendManager {
    let ticker = tick(manager.flush_interval);

    loop {
        select! {
            recv(shutdown) -> _ => {
                info!("Flushing buffered data points before shutdown.");
                manager.drain(points);
                break;
            },
            recv(ticker) -> _ => {
                manager.flush();
            },
            recv(points) -> msg => match msg {
                Ok(point) => {
                    manager.add(&point);
                }
                Err(_) => {
                    debug!("Data point channel disconnected.");
                    manager.drain(points);
                    break;
                }
            },
        }
    }

    manager
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use crossbeam_channel::bounded;
    use parking_lot::Mutex;

    use super::{BackendConfig, BackendManager, BackendTask, FlushReport};
    use crate::{
        datapoint::MetricDataPoint,
        sinks::{Sink, SinkError},
    };

    #[derive(Default)]
    struct CapturingSink {
        batches: Mutex<Vec<Vec<u8>>>,
    }

    impl CapturingSink {
        fn lines(&self) -> Vec<String> {
            self.batches
                .lock()
                .iter()
                .flat_map(|b| String::from_utf8_lossy(b).lines().map(str::to_owned).collect::<Vec<_>>())
                .collect()
        }
    }

    impl Sink for CapturingSink {
        fn flush(&self, batch: &[u8]) -> Result<(), SinkError> {
            self.batches.lock().push(batch.to_vec());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FailingSink {
        calls: AtomicUsize,
    }

    impl Sink for FailingSink {
        fn flush(&self, _batch: &[u8]) -> Result<(), SinkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(SinkError::Http("connection reset".to_owned()))
        }
    }

    fn point(n: i64) -> MetricDataPoint {
        MetricDataPoint::new(format!("m{}", n), n, 100)
    }

    fn config(batch_size: usize, buffer_capacity: usize, flush_threshold: Option<usize>) -> BackendConfig {
        BackendConfig { flush_interval: Duration::from_secs(3600), batch_size, buffer_capacity, flush_threshold }
    }

    #[test]
    fn duplicate_registration_is_a_no_op() {
        let mut manager = BackendManager::new(BackendConfig::default());
        let first = Arc::new(CapturingSink::default());
        let second = Arc::new(CapturingSink::default());

        assert!(manager.register_backend("capture", first.clone()));
        assert!(!manager.register_backend("capture", second.clone()));
        assert_eq!(manager.backend_count(), 1);

        manager.add(&point(1));
        manager.flush();
        assert_eq!(first.lines(), vec!["m1 1 100"]);
        assert!(second.lines().is_empty());
    }

    #[test]
    fn failing_sink_does_not_affect_others() {
        let mut manager = BackendManager::new(config(10, 100, Some(100)));
        let good = Arc::new(CapturingSink::default());
        let bad = Arc::new(FailingSink::default());
        manager.register_backend("bad", bad.clone());
        manager.register_backend("good", good.clone());

        manager.add(&point(1));
        manager.add(&point(2));
        let report = manager.flush();

        assert_eq!(report, FlushReport { points: 2, bytes: 18, succeeded: 1, failed: 1 });
        assert_eq!(good.lines(), vec!["m1 1 100", "m2 2 100"]);
        assert_eq!(bad.calls.load(Ordering::SeqCst), 1);

        // The failed batch is not retried.
        assert!(manager.buffer().is_empty());
    }

    #[test]
    fn empty_flush_is_not_dispatched() {
        let mut manager = BackendManager::new(BackendConfig::default());
        let sink = Arc::new(CapturingSink::default());
        manager.register_backend("capture", sink.clone());

        assert_eq!(manager.flush(), FlushReport::default());
        assert!(sink.batches.lock().is_empty());
    }

    #[test]
    fn threshold_triggers_flush() {
        let mut manager = BackendManager::new(config(4, 16, None));
        assert_eq!(manager.flush_threshold(), 2);
        let sink = Arc::new(CapturingSink::default());
        manager.register_backend("capture", sink.clone());

        assert!(manager.add(&point(1)).is_none());
        let report = manager.add(&point(2)).unwrap();
        assert_eq!(report.points, 2);
        assert_eq!(sink.lines(), vec!["m1 1 100", "m2 2 100"]);
    }

    #[test]
    fn flush_is_bounded_by_batch_size() {
        let mut manager = BackendManager::new(config(2, 16, Some(16)));
        let sink = Arc::new(CapturingSink::default());
        manager.register_backend("capture", sink.clone());

        for n in 0..5 {
            manager.add(&point(n));
        }

        assert_eq!(manager.flush().points, 2);
        assert_eq!(manager.buffer().len(), 3);
        assert_eq!(sink.batches.lock().len(), 1);
    }

    #[test]
    fn settings_are_clamped() {
        let manager = BackendManager::new(config(0, 0, Some(1000)));
        assert_eq!(manager.buffer().capacity(), 1);
        assert_eq!(manager.flush_threshold(), 1);

        let manager = BackendManager::new(config(128, 64, None));
        assert_eq!(manager.buffer().capacity(), 128);
        assert_eq!(manager.flush_threshold(), 64);
    }

    #[test]
    fn task_drains_on_stop() {
        let (points_tx, points_rx) = bounded(64);
        let mut manager = BackendManager::new(config(4, 64, Some(64)));
        let sink = Arc::new(CapturingSink::default());
        manager.register_backend("capture", sink.clone());

        let mut task = BackendTask::new(manager, points_rx);
        task.start().unwrap();
        assert!(task.is_running());
        assert!(task.manager().is_none());
        task.start().unwrap();

        for n in 0..10 {
            points_tx.send(point(n)).unwrap();
        }
        task.stop();

        assert!(!task.is_running());
        let lines = sink.lines();
        assert_eq!(lines.len(), 10);
        assert_eq!(lines[0], "m0 0 100");
        assert_eq!(lines[9], "m9 9 100");

        let manager = task.manager().unwrap();
        assert!(manager.buffer().is_empty());
        assert_eq!(manager.buffer().total(), 10);
    }
}
