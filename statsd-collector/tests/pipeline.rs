use std::{
    net::UdpSocket,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use bytes::Bytes;
use statsd_collector::{Sink, SinkError, Statsd, StatsdBuilder};

#[derive(Default)]
struct CapturingSink {
    lines: Mutex<Vec<String>>,
}

impl CapturingSink {
    fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    fn values_of(&self, name: &str) -> Vec<String> {
        self.lines()
            .iter()
            .filter_map(|line| {
                let mut fields = line.split(' ');
                (fields.next() == Some(name)).then(|| fields.next().unwrap_or_default().to_owned())
            })
            .collect()
    }
}

impl Sink for CapturingSink {
    fn flush(&self, batch: &[u8]) -> Result<(), SinkError> {
        let text = String::from_utf8_lossy(batch);
        self.lines.lock().unwrap().extend(text.lines().map(str::to_owned));
        Ok(())
    }
}

fn collector(sink: &Arc<CapturingSink>) -> StatsdBuilder {
    StatsdBuilder::new()
        .local()
        .without_downstream()
        .with_backend("capture", Arc::clone(sink) as Arc<dyn Sink>)
        .with_aggregator_flush_interval(Duration::from_millis(50))
        .with_backend_flush_interval(Duration::from_millis(50))
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

fn start(builder: StatsdBuilder) -> Statsd {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut statsd = builder.build().unwrap();
    statsd.start_all().unwrap();
    statsd
}

#[test]
fn timer_reaches_backend() {
    let sink = Arc::new(CapturingSink::default());
    let mut statsd = start(collector(&sink));

    statsd.packet_sender().send(Bytes::from_static(b"latency:120|ms\n")).unwrap();

    assert!(wait_until(|| !sink.values_of("latency.max").is_empty()));
    statsd.stop_all();

    assert_eq!(sink.values_of("latency.count")[0], "1");
    assert_eq!(sink.values_of("latency.min")[0], "120.0");
    assert_eq!(sink.values_of("latency.max")[0], "120.0");
    assert_eq!(sink.values_of("latency.mean")[0], "120.0");
    assert_eq!(sink.values_of("latency-percentile99")[0], "120.0");
    assert!(!sink.values_of("latency.mean-rate").is_empty());

    // Every line carries a timestamp.
    for line in sink.lines() {
        let fields: Vec<_> = line.split(' ').collect();
        assert_eq!(fields.len(), 3, "bad line: {}", line);
        assert!(fields[2].parse::<u64>().is_ok(), "bad timestamp: {}", line);
    }
}

#[test]
fn malformed_lines_do_not_stop_valid_ones() {
    let sink = Arc::new(CapturingSink::default());
    let mut statsd = start(collector(&sink));

    statsd.packet_sender().send(Bytes::from_static(b"broken\nqueue.depth:7|g\nhits:oops|c\n")).unwrap();

    assert!(wait_until(|| !sink.values_of("queue.depth.value").is_empty()));
    statsd.stop_all();

    assert_eq!(sink.values_of("queue.depth.value")[0], "7");
    assert!(sink.values_of("hits.count").is_empty());

    let stats = statsd.aggregator().stats();
    let tally = stats.error_tally("parse_errors").unwrap();
    assert_eq!(tally.count, 2);
    assert!(!tally.last_error.is_empty());
}

#[test]
fn counter_totals_survive_flushes() {
    const PACKETS: i64 = 500;

    let sink = Arc::new(CapturingSink::default());
    let mut statsd = start(collector(&sink));

    let packets = statsd.packet_sender();
    for i in 0..PACKETS {
        packets.send(Bytes::from(format!("hits:1|c\nbytes:{}|c", i))).unwrap();
        if i % 100 == 0 {
            thread::sleep(Duration::from_millis(20));
        }
    }

    let total = |name: &str| sink.values_of(name).iter().map(|v| v.parse::<i64>().unwrap()).sum::<i64>();
    assert!(wait_until(|| total("hits.count") == PACKETS));
    assert!(wait_until(|| total("bytes.count") == (0..PACKETS).sum::<i64>()));
    statsd.stop_all();

    assert_eq!(total("hits.count"), PACKETS);
}

#[test]
fn udp_datagrams_reach_backend() {
    let sink = Arc::new(CapturingSink::default());
    let builder = collector(&sink).with_receiver_address("127.0.0.1:0".parse().unwrap());
    let mut statsd = start(builder);

    let addr = statsd.receiver_addr().unwrap();
    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.send_to(b"temperature:21.5|g", addr).unwrap();

    assert!(wait_until(|| !sink.values_of("temperature.value").is_empty()));
    statsd.stop_all();

    assert_eq!(sink.values_of("temperature.value")[0], "21.5");
    assert!(statsd.receiver_addr().is_some());
}

#[test]
fn restart_keeps_registry() {
    let sink = Arc::new(CapturingSink::default());
    let mut statsd = start(collector(&sink));

    statsd.packet_sender().send(Bytes::from_static(b"jobs:3|g")).unwrap();
    assert!(wait_until(|| !sink.values_of("jobs.value").is_empty()));
    statsd.stop_all();
    assert_eq!(statsd.backend_count(), Some(1));

    statsd.start_all().unwrap();
    statsd.packet_sender().send(Bytes::from_static(b"jobs:-1|g")).unwrap();
    assert!(wait_until(|| sink.values_of("jobs.value").iter().any(|v| v == "-1")));
    statsd.stop_all();

    assert!(statsd.registry().get("jobs").is_some());
}
