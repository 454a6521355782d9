//! Error and Result types for the collector.

use std::{io, time::Duration};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Frame is shorter than its header or its declared name length.
    #[error("malformed frame: got {len} bytes, need {needed}")]
    MalformedFrame { len: usize, needed: usize },

    /// Metric names are limited to what fits in the one-byte length field.
    #[error("metric name is {0} bytes, at most 255 fit in a frame")]
    NameTooLong(usize),

    /// Reserved; recording a decoded sample cannot fail today.
    #[error("failed to record sample: {0}")]
    Record(String),

    /// Storage unreachable or the bulk insert was rejected.
    #[error("bulk write failed: {0}")]
    FlushTransport(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("bulk write timed out after {0:?}")]
    FlushTimeout(Duration),

    #[error("failed to bind {addr}: {source}")]
    ListenerBind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub(crate) fn transport(e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::FlushTransport(e.into())
    }

    pub(crate) fn bind(addr: &str, source: io::Error) -> Self {
        Self::ListenerBind {
            addr: addr.to_owned(),
            source,
        }
    }
}
