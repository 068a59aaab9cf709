use std::{fmt::Write as _, io::Write as _, time::Duration};

use bytes::Bytes;
use flate2::{write::ZlibEncoder, Compression};
use http_body_util::{BodyExt as _, Collected, Full};
use hyper::{
    header::{ACCEPT, CONTENT_ENCODING, CONTENT_TYPE, USER_AGENT},
    Method, Request, Uri,
};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{
        connect::{proxy::Tunnel, HttpConnector},
        Client, ResponseFuture,
    },
    rt::TokioExecutor,
};
use serde::Serialize;
use tokio::runtime::{self, Runtime};
use tracing::{debug, trace};

use super::{Sink, SinkError};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const METRICS_PATH: &str = "/infrastructure/metrics";
const USER_AGENT_VALUE: &str = concat!("statsd-collector/", env!("CARGO_PKG_VERSION"));

/// HTTP sink configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSinkConfig {
    /// Base URL of the ingestion API, such as `https://api.example.com`.
    pub url: String,

    /// License key sent with every request.
    pub license_key: String,

    /// Timeout for a whole request, from connecting to reading the response status.
    pub timeout: Duration,

    /// Plain HTTP proxy that requests are tunneled through with `CONNECT`, such as `http://proxy.internal:3128`.
    pub proxy: Option<String>,
}

impl HttpSinkConfig {
    /// Creates a new `HttpSinkConfig` with the default timeout of 10 seconds.
    pub fn new<U, K>(url: U, license_key: K) -> Self
    where
        U: Into<String>,
        K: Into<String>,
    {
        Self { url: url.into(), license_key: license_key.into(), timeout: DEFAULT_TIMEOUT, proxy: None }
    }

    /// Sets the proxy requests are tunneled through.
    #[must_use]
    pub fn with_proxy<P>(mut self, proxy: P) -> Self
    where
        P: Into<String>,
    {
        self.proxy = Some(proxy.into());
        self
    }

    /// Gets the full endpoint URL, with the license key in the query string.
    pub fn endpoint(&self) -> String {
        let mut endpoint = String::with_capacity(self.url.len() + METRICS_PATH.len() + 16 + self.license_key.len());
        endpoint.push_str(self.url.trim_end_matches('/'));
        endpoint.push_str(METRICS_PATH);
        endpoint.push_str("?license_key=");
        encode_query_value(&self.license_key, &mut endpoint);
        endpoint
    }
}

// Percent-encodes everything but RFC 3986 unreserved characters.
fn encode_query_value(value: &str, out: &mut String) {
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            out.push(char::from(byte));
        } else {
            let _ = write!(out, "%{:02X}", byte);
        }
    }
}

#[derive(Serialize)]
struct Payload<'a> {
    series: Vec<Series<'a>>,
}

#[derive(Serialize)]
struct Series<'a> {
    metric: &'a str,
    points: [(u64, f64); 1],
    #[serde(rename = "type")]
    kind: &'static str,
}

/// Encodes a batch of plaintext lines into the zlib-compressed JSON body expected by the ingestion API.
///
/// Every line becomes one gauge series holding a single `[timestamp, value]` point. Lines that are not in the
/// `<name> <value> <timestamp>` format are skipped.
///
/// # Errors
///
/// If the payload cannot be serialized or compressed, an error is returned.
pub fn encode_payload(batch: &[u8]) -> Result<Vec<u8>, SinkError> {
    let text = String::from_utf8_lossy(batch);
    let series = text
        .lines()
        .filter_map(|line| {
            let series = parse_series(line);
            if series.is_none() {
                debug!(line, "Skipping malformed line in batch.");
            }
            series
        })
        .collect();

    let json = serde_json::to_vec(&Payload { series }).map_err(|e| SinkError::Encode(e.to_string()))?;

    let mut encoder = ZlibEncoder::new(Vec::with_capacity(json.len() / 2), Compression::default());
    encoder.write_all(&json).map_err(|e| SinkError::Encode(e.to_string()))?;
    encoder.finish().map_err(|e| SinkError::Encode(e.to_string()))
}

fn parse_series(line: &str) -> Option<Series<'_>> {
    let mut fields = line.split_whitespace();
    let metric = fields.next()?;
    let value = fields.next()?.parse::<f64>().ok()?;
    let timestamp = fields.next()?.parse::<u64>().ok()?;
    if fields.next().is_some() {
        return None;
    }

    Some(Series { metric, points: [(timestamp, value)], kind: "gauge" })
}

enum Transport {
    Direct(Client<HttpsConnector<HttpConnector>, Full<Bytes>>),
    Proxied(Client<HttpsConnector<Tunnel<HttpConnector>>, Full<Bytes>>),
}

impl Transport {
    fn request(&self, request: Request<Full<Bytes>>) -> ResponseFuture {
        match self {
            Transport::Direct(client) => client.request(request),
            Transport::Proxied(client) => client.request(request),
        }
    }
}

fn parse_proxy(proxy: &str) -> Result<Uri, SinkError> {
    let invalid = |reason: String| SinkError::InvalidAddress { addr: proxy.to_owned(), reason };

    let uri = proxy.parse::<Uri>().map_err(|e| invalid(e.to_string()))?;
    if uri.scheme_str() != Some("http") || uri.host().is_none() {
        return Err(invalid("expected 'http://<host>:<port>'".to_owned()));
    }

    Ok(uri)
}

/// Posts batches to an HTTP ingestion API.
///
/// The sink owns a small multi-threaded Tokio runtime that drives its HTTP client, so it can be called from plain
/// threads. Requests are made over HTTPS or plain HTTP, depending on the URL, optionally tunneled through a proxy.
pub struct HttpSink {
    endpoint: Uri,
    timeout: Duration,
    transport: Transport,
    runtime: Runtime,
}

impl HttpSink {
    /// Creates a new `HttpSink`.
    ///
    /// # Errors
    ///
    /// If the endpoint or the proxy is not a valid URL, if no native root certificates can be loaded, or if the runtime
    /// cannot be created, an error is returned.
    pub fn new(config: HttpSinkConfig) -> Result<Self, SinkError> {
        let endpoint = config
            .endpoint()
            .parse::<Uri>()
            .map_err(|e| SinkError::InvalidAddress { addr: config.url.clone(), reason: e.to_string() })?;
        let proxy = config.proxy.as_deref().map(parse_proxy).transpose()?;

        let runtime = runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("statsd-http-sink")
            .enable_all()
            .build()?;

        let https = hyper_rustls::HttpsConnectorBuilder::new().with_native_roots()?.https_or_http().enable_http1();

        let transport = {
            let _guard = runtime.enter();
            let mut builder = Client::builder(TokioExecutor::new());
            builder.pool_idle_timeout(Duration::from_secs(30));

            match proxy {
                Some(proxy) => {
                    debug!(%proxy, "Tunneling HTTP sink requests through proxy.");
                    let tunnel = Tunnel::new(proxy, HttpConnector::new());
                    Transport::Proxied(builder.build(https.wrap_connector(tunnel)))
                }
                None => Transport::Direct(builder.build(https.build())),
            }
        };

        Ok(Self { endpoint, timeout: config.timeout, transport, runtime })
    }

    /// Gets the endpoint batches are posted to.
    pub fn endpoint(&self) -> &Uri {
        &self.endpoint
    }

    async fn post(&self, body: Vec<u8>) -> Result<(), SinkError> {
        let request = Request::builder()
            .method(Method::POST)
            .uri(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_ENCODING, "deflate")
            .header(USER_AGENT, USER_AGENT_VALUE)
            .header(ACCEPT, "text/html, */*")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| SinkError::Http(e.to_string()))?;

        let response = self.transport.request(request).await.map_err(|e| SinkError::Http(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map(Collected::to_bytes)
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_else(|_| String::from("<failed to read response body>"));

        Err(SinkError::Status { status: status.as_u16(), body })
    }
}

impl Sink for HttpSink {
    fn flush(&self, batch: &[u8]) -> Result<(), SinkError> {
        let body = encode_payload(batch)?;
        let compressed_len = body.len();

        self.runtime.block_on(async {
            tokio::time::timeout(self.timeout, self.post(body)).await.map_err(|_| SinkError::Timeout(self.timeout))?
        })?;

        trace!(endpoint = %self.endpoint, bytes = compressed_len, "Posted batch.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read as _;

    use flate2::read::ZlibDecoder;
    use serde_json::{json, Value};

    use super::{encode_payload, HttpSink, HttpSinkConfig};
    use crate::sinks::SinkError;
    use crate::datapoint::MetricDataPoint;

    fn decode(body: &[u8]) -> Value {
        let mut json = String::new();
        ZlibDecoder::new(body).read_to_string(&mut json).unwrap();
        serde_json::from_str(&json).unwrap()
    }

    #[test]
    fn payload_is_compressed_series() {
        let body = encode_payload(b"requests.count 8 1700000000\nlatency.mean 120.5 1700000000\n").unwrap();

        assert_eq!(
            decode(&body),
            json!({
                "series": [
                    { "metric": "requests.count", "points": [[1700000000u64, 8.0]], "type": "gauge" },
                    { "metric": "latency.mean", "points": [[1700000000u64, 120.5]], "type": "gauge" },
                ]
            })
        );
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let body = encode_payload(b"just-a-name\nvalid 1 2\nbad value 3\ntoo many fields here\n").unwrap();
        assert_eq!(
            decode(&body),
            json!({ "series": [{ "metric": "valid", "points": [[2u64, 1.0]], "type": "gauge" }] })
        );
    }

    #[test]
    fn spaced_names_survive_encoding() {
        let point = MetricDataPoint::new("queue depth.value", 4_i64, 10);
        let body = encode_payload(&point.to_bytes()).unwrap();
        assert_eq!(
            decode(&body),
            json!({ "series": [{ "metric": "queue_depth.value", "points": [[10u64, 4.0]], "type": "gauge" }] })
        );
    }

    #[test]
    fn empty_batch() {
        let body = encode_payload(b"").unwrap();
        assert_eq!(decode(&body), json!({ "series": [] }));
    }

    #[test]
    fn proxy_must_be_plain_http() {
        for proxy in ["socks5://127.0.0.1:1080", "https://proxy.internal:3128", "not a url", "/relative"] {
            let config = HttpSinkConfig::new("https://api.example.com", "key").with_proxy(proxy);
            let result = HttpSink::new(config);
            assert!(
                matches!(&result, Err(SinkError::InvalidAddress { addr, .. }) if addr == proxy),
                "proxy '{}' was accepted",
                proxy
            );
        }
    }

    #[test]
    fn endpoint_carries_encoded_license_key() {
        let config = HttpSinkConfig::new("https://api.example.com/", "abc 123&x");
        assert_eq!(config.endpoint(), "https://api.example.com/infrastructure/metrics?license_key=abc%20123%26x");
    }
}
