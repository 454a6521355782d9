pub mod accumulator;
pub mod codec;
pub mod config;
pub mod error;
pub mod flush;
pub mod ingest;
pub mod logging;
pub mod server;
pub mod sink;

use std::{borrow::Borrow, borrow::Cow, fmt};

pub use error::{Error, Result};

/// Nanoseconds since the Unix epoch.
pub type Time = i64;

/// Metric name exactly as it appeared on the wire.
///
/// Names are opaque bytes; two names are the same bucket only if their bytes
/// match. Text is only produced for display.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricKey(Vec<u8>);
impl MetricKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    pub fn to_str_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }
}
impl From<Vec<u8>> for MetricKey {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}
impl From<&[u8]> for MetricKey {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}
impl From<String> for MetricKey {
    fn from(name: String) -> Self {
        Self(name.into_bytes())
    }
}
impl From<&str> for MetricKey {
    fn from(name: &str) -> Self {
        Self(name.as_bytes().to_vec())
    }
}
impl Borrow<[u8]> for MetricKey {
    fn borrow(&self) -> &[u8] {
        &self.0
    }
}
impl AsRef<[u8]> for MetricKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
impl PartialEq<str> for MetricKey {
    fn eq(&self, other: &str) -> bool {
        self.0 == other.as_bytes()
    }
}
impl PartialEq<&str> for MetricKey {
    fn eq(&self, other: &&str) -> bool {
        self.0 == other.as_bytes()
    }
}
impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_str_lossy())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub time: Time,
    pub name: MetricKey,
    pub value: f64,
}
impl Sample {
    pub fn new(time: Time, name: impl Into<MetricKey>, value: f64) -> Self {
        Self {
            time,
            name: name.into(),
            value,
        }
    }
}
