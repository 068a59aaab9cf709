//! Destinations for batches of serialized data points.
//!
//! A batch is the concatenation of one or more Graphite plaintext lines, `<name> <value> <timestamp>\n`. Each sink
//! decides how to deliver it.
use std::{io, time::Duration};

use thiserror::Error;

mod graphite;
pub use self::graphite::GraphiteSink;

mod http;
pub use self::http::{encode_payload, HttpSink, HttpSinkConfig};

/// Errors that could occur while delivering a batch.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The sink address could not be resolved.
    #[error("invalid backend address '{addr}': {reason}")]
    InvalidAddress {
        /// The address as given.
        addr: String,
        /// Details about the resolution failure.
        reason: String,
    },

    /// An I/O error occurred while talking to the backend.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The HTTP request could not be built or sent.
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// The backend answered with a non-success status.
    #[error("unexpected HTTP status {status}: {body}")]
    Status {
        /// Status code.
        status: u16,
        /// Response body, or a placeholder if it could not be read.
        body: String,
    },

    /// The backend did not answer in time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The batch could not be encoded into the backend's format.
    #[error("failed to encode batch: {0}")]
    Encode(String),

    /// The batch could not be handed to the sink.
    #[error("failed to dispatch batch: {0}")]
    Dispatch(String),
}

/// A destination for batches of data points.
///
/// Sinks are called concurrently with the same batch, one call per sink per flush. A failed call is logged by the
/// caller and the batch is not retried.
pub trait Sink: Send + Sync {
    /// Delivers `batch`.
    ///
    /// # Errors
    ///
    /// If the batch could not be delivered, an error is returned.
    fn flush(&self, batch: &[u8]) -> Result<(), SinkError>;
}
