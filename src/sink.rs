//! Bulk writers the flush cycle hands drained rows to.

use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use crate::{Error, Result, Sample};

pub const COLUMNS: [&str; 3] = ["timestamp", "name", "value"];

/// A store that accepts many rows in one call.
pub trait BulkWriter: Send + Sync + 'static {
    /// Inserts `rows` into `table` as a single bulk operation and returns the
    /// number of rows the store accepted.
    fn copy_from(
        &self,
        table: &str,
        columns: &[&str],
        rows: &[Sample],
    ) -> impl Future<Output = Result<u64>> + Send;
}
impl<W: BulkWriter> BulkWriter for Arc<W> {
    fn copy_from(
        &self,
        table: &str,
        columns: &[&str],
        rows: &[Sample],
    ) -> impl Future<Output = Result<u64>> + Send {
        (**self).copy_from(table, columns, rows)
    }
}

/// Inserts rows through the ClickHouse HTTP interface.
///
/// Each batch is one `POST {url}?query=INSERT INTO {table} (..) FORMAT TabSeparated`
/// with one line per row in the body. The timestamp column is sent as
/// decimal Unix seconds with nine fractional digits, which a `DateTime64(9)`
/// column parses without losing precision.
#[derive(Debug, Clone)]
pub struct ClickHouseWriter {
    client: ureq::Agent,
    url: String,
}
impl ClickHouseWriter {
    /// `flush_timeout` is the bound the flush cycle puts on one bulk write.
    /// The request itself gives up a little earlier so that a write abandoned
    /// by the flush cycle cannot still commit after its rows were requeued.
    pub fn new(url: String, flush_timeout: Duration) -> Self {
        let client = ureq::AgentBuilder::new()
            .timeout(request_timeout(flush_timeout))
            .build();
        Self { client, url }
    }
}
impl BulkWriter for ClickHouseWriter {
    async fn copy_from(&self, table: &str, columns: &[&str], rows: &[Sample]) -> Result<u64> {
        let mut body = Vec::new();
        encode_tab_separated(&mut body, rows);
        let request = self
            .client
            .post(&self.url)
            .query("query", &insert_query(table, columns))
            .set("Content-Type", "text/tab-separated-values");
        // ureq blocks
        let resp = tokio::task::spawn_blocking(move || request.send_bytes(&body))
            .await
            .map_err(Error::transport)?
            .map_err(Error::transport)?;
        tracing::trace!(status = resp.status(), rows = rows.len(), "bulk insert accepted");
        Ok(rows.len() as u64)
    }
}

/// Timeout for a single HTTP request, strictly below `flush_timeout`.
pub fn request_timeout(flush_timeout: Duration) -> Duration {
    let margin = (flush_timeout / 5).min(Duration::from_secs(1));
    flush_timeout.saturating_sub(margin)
}

pub fn insert_query(table: &str, columns: &[&str]) -> String {
    format!(
        "INSERT INTO {table} ({}) FORMAT TabSeparated",
        columns.join(", ")
    )
}

/// Appends `rows` to `out` in `TabSeparated` format.
///
/// Names are written as their raw bytes with `\\`, tab, newline, carriage
/// return and NUL escaped.
pub fn encode_tab_separated(out: &mut Vec<u8>, rows: &[Sample]) {
    use std::io::Write;

    for row in rows {
        // writing into a Vec cannot fail
        let _ = write!(out, "{}\t", UnixSeconds(row.time));
        for &b in row.name.as_bytes() {
            match b {
                b'\\' => out.extend_from_slice(b"\\\\"),
                b'\t' => out.extend_from_slice(b"\\t"),
                b'\n' => out.extend_from_slice(b"\\n"),
                b'\r' => out.extend_from_slice(b"\\r"),
                0 => out.extend_from_slice(b"\\0"),
                b => out.push(b),
            }
        }
        let _ = writeln!(out, "\t{}", FloatText(row.value));
    }
}

/// Nanosecond timestamp as `seconds.nanoseconds`.
struct UnixSeconds(i64);
impl std::fmt::Display for UnixSeconds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:09}", abs / 1_000_000_000, abs % 1_000_000_000)
    }
}

struct FloatText(f64);
impl std::fmt::Display for FloatText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let v = self.0;
        if v.is_nan() {
            f.write_str("nan")
        } else if v.is_infinite() {
            f.write_str(if v > 0.0 { "inf" } else { "-inf" })
        } else {
            write!(f, "{v}")
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub table: String,
    pub columns: Vec<String>,
    pub rows: Vec<Sample>,
}

/// Keeps every batch in memory.
#[derive(Debug, Default)]
pub struct MemoryWriter {
    batches: Mutex<Vec<Batch>>,
}
impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<Batch> {
        self.lock().clone()
    }
    pub fn calls(&self) -> usize {
        self.lock().len()
    }
    pub fn rows(&self) -> Vec<Sample> {
        self.lock()
            .iter()
            .flat_map(|batch| batch.rows.iter().cloned())
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Batch>> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
impl BulkWriter for MemoryWriter {
    async fn copy_from(&self, table: &str, columns: &[&str], rows: &[Sample]) -> Result<u64> {
        self.lock().push(Batch {
            table: table.to_owned(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: rows.to_vec(),
        });
        Ok(rows.len() as u64)
    }
}
