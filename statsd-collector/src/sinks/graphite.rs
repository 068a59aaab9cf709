use std::{
    io::{self, BufWriter, Write as _},
    net::{SocketAddr, TcpStream, ToSocketAddrs as _},
    time::Duration,
};

use tracing::trace;

use super::{Sink, SinkError};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const MIN_TIMEOUT: Duration = Duration::from_millis(1);

/// Writes batches to a Graphite server over the plaintext protocol.
///
/// Every flush opens a fresh TCP connection, writes the whole batch and closes the connection again. No state is
/// shared between calls, so overlapping flushes are safe.
#[derive(Debug, Clone)]
pub struct GraphiteSink {
    addr: String,
    resolved: Vec<SocketAddr>,
    connect_timeout: Duration,
    write_timeout: Duration,
}

impl GraphiteSink {
    /// Creates a new `GraphiteSink` for `addr`, in the format of `<host>:<port>`.
    ///
    /// # Errors
    ///
    /// If the address cannot be resolved, an error is returned.
    pub fn new(addr: &str) -> Result<Self, SinkError> {
        let resolved: Vec<_> = addr
            .to_socket_addrs()
            .map_err(|e| SinkError::InvalidAddress { addr: addr.to_owned(), reason: e.to_string() })?
            .collect();
        if resolved.is_empty() {
            return Err(SinkError::InvalidAddress {
                addr: addr.to_owned(),
                reason: "address resolved to nothing".to_owned(),
            });
        }

        Ok(Self {
            addr: addr.to_owned(),
            resolved,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        })
    }

    /// Sets the connect and write timeouts.
    ///
    /// Defaults to 5 seconds to connect and 10 seconds to write.
    #[must_use]
    pub fn with_timeouts(mut self, connect_timeout: Duration, write_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout.max(MIN_TIMEOUT);
        self.write_timeout = write_timeout.max(MIN_TIMEOUT);
        self
    }

    /// Gets the address this sink writes to, as given.
    pub fn address(&self) -> &str {
        &self.addr
    }

    fn connect(&self) -> io::Result<TcpStream> {
        let mut last_error = None;
        for addr in &self.resolved {
            match TcpStream::connect_timeout(addr, self.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error.unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address to connect to")))
    }
}

impl Sink for GraphiteSink {
    fn flush(&self, batch: &[u8]) -> Result<(), SinkError> {
        let stream = self.connect()?;
        stream.set_write_timeout(Some(self.write_timeout))?;

        let mut writer = BufWriter::new(stream);
        writer.write_all(batch)?;
        writer.flush()?;

        trace!(addr = %self.addr, bytes = batch.len(), "Wrote batch to Graphite.");
        Ok(())
    }
}
